// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! alived - liveness registry daemon
//!
//! # Usage
//!
//! ```bash
//! # Defaults (ports 5678/5679/5680, state under /var/lib/alived)
//! alived
//!
//! # Configuration file, with a port override
//! alived --config /etc/alived.json --heartbeat-port 6000
//!
//! # Scratch instance for testing
//! alived --state-dir /tmp/alived/state --control-socket /tmp/alived.sock --log-level debug
//! ```

use alived::{AliveServer, ServerConfig};
use anyhow::Context;
use clap::Parser;
use std::fs::OpenOptions;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Liveness registry and failure notification daemon
#[derive(Parser, Debug)]
#[command(name = "alived")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address for every endpoint
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// UDP heartbeat port
    #[arg(long)]
    heartbeat_port: Option<u16>,

    /// TCP query port
    #[arg(long)]
    query_port: Option<u16>,

    /// UDP subscription port
    #[arg(long)]
    subscription_port: Option<u16>,

    /// Directory of per-unit state files
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Control channel socket path
    #[arg(long)]
    control_socket: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error or a RUST_LOG directive)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write diagnostics to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(port) = self.heartbeat_port {
            config.heartbeat_port = port;
        }
        if let Some(port) = self.query_port {
            config.query_port = port;
        }
        if let Some(port) = self.subscription_port {
            config.subscription_port = port;
        }
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        if let Some(path) = &self.control_socket {
            config.control_socket = path.clone();
        }
        if let Some(path) = &self.log_file {
            config.log_file = Some(path.clone());
        }
    }
}

fn init_logging(level: &str, log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {:?}", path))?;
            let subscriber = builder.with_ansi(false).with_writer(Mutex::new(file)).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => tracing::subscriber::set_global_default(builder.finish())?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load or create config
    let (mut config, source) = match &args.config {
        Some(path) => (
            ServerConfig::from_file(path)?,
            path.display().to_string(),
        ),
        None => (ServerConfig::default(), "defaults".to_string()),
    };
    args.apply(&mut config);

    init_logging(&args.log_level, config.log_file.as_ref())?;

    info!("+----------------------------------------------------+");
    info!(
        "|       alived v{}                                |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!("|  Config:       {:35} |", source);
    info!("|  Heartbeats:   {:35} |", format!("udp/{}", config.heartbeat_port));
    info!("|  Queries:      {:35} |", format!("tcp/{}", config.query_port));
    info!(
        "|  Subscribers:  {:35} |",
        format!("udp/{}", config.subscription_port)
    );
    info!("|  State:        {:35} |", config.state_dir.display().to_string());
    info!("|  Control:      {:35} |", config.control_socket.display().to_string());
    info!(
        "|  Failure:      {:35} |",
        format!("{} missed beats", config.fail_number_heartbeats)
    );
    info!("+----------------------------------------------------+");

    let server = AliveServer::new(config)
        .await
        .context("cannot start server")?
        .with_config_source(source);

    // Handle shutdown signals
    let server_handle = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping server...");
        server_handle.shutdown().await;
    });

    server.run().await?;

    info!("alived stopped");
    Ok(())
}
