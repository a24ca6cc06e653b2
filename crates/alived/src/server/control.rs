// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local administrative channel.
//!
//! One text command per connection, read to EOF. The reply is written and
//! the connection closed. Commands are served one at a time.

use super::AliveServer;
use crate::clock;
use crate::registry::env::{EnvironmentSnapshot, OsInfo};
use crate::registry::unit::Incarnation;
use crate::store::write_archive;
use std::fmt::Write as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Longest command accepted; anything beyond is ignored.
pub const MAX_COMMAND_LEN: usize = 4032;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    Version,
    Ping,
    Stats,
    Configuration,
    List,
    Subscribers,
    Info(String),
    Delete(String),
    Archive(String),
    TreeDump(String),
    Unknown(String),
}

impl Command {
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let (word, arg) = match text.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (text, ""),
        };
        match (word, arg.is_empty()) {
            ("quit", true) => Self::Quit,
            ("version", true) => Self::Version,
            ("ping", true) => Self::Ping,
            ("stats", true) => Self::Stats,
            ("configuration", true) => Self::Configuration,
            ("list", true) => Self::List,
            ("subscribers", true) => Self::Subscribers,
            ("info", false) => Self::Info(arg.to_string()),
            ("delete", false) => Self::Delete(arg.to_string()),
            ("archive", false) => Self::Archive(arg.to_string()),
            ("tree_dump", false) => Self::TreeDump(arg.to_string()),
            _ => Self::Unknown(text.to_string()),
        }
    }
}

pub(crate) async fn run(listener: UnixListener, server: AliveServer) {
    let stop = server.shutdown.wait();
    tokio::pin!(stop);

    info!("control channel listening on {:?}", server.config.control_socket);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    if handle(stream, &server).await {
                        info!("quit requested over control channel");
                        server.shutdown().await;
                        break;
                    }
                }
                Err(e) => warn!("control accept error: {}", e),
            },
            _ = &mut stop => {
                debug!("control channel shutting down");
                break;
            }
        }
    }
}

/// Serve one connection; returns whether the command was `quit`.
async fn handle(mut stream: UnixStream, server: &AliveServer) -> bool {
    let mut buf = Vec::with_capacity(128);
    let mut limited = (&mut stream).take(MAX_COMMAND_LEN as u64);
    let read = limited.read_to_end(&mut buf);
    match tokio::time::timeout(server.config.query_timeout(), read).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            debug!("control read error: {}", e);
            return false;
        }
        Err(_) => {
            debug!("control client timed out");
            return false;
        }
    }

    let command = Command::parse(&String::from_utf8_lossy(&buf));
    debug!("control command {:?}", command);
    let reply = execute(server, &command, clock::now());
    if let Err(e) = stream.write_all(reply.as_bytes()).await {
        debug!("control reply error: {}", e);
    }
    let _ = stream.shutdown().await;
    command == Command::Quit
}

/// Reply text for `command`. `Quit` only produces the reply; stopping the
/// server is left to the caller.
pub fn execute(server: &AliveServer, command: &Command, now: u32) -> String {
    let registry = server.registry();
    match command {
        Command::Quit => "shutting down\n".to_string(),
        Command::Version => format!("version {}\n", env!("CARGO_PKG_VERSION")),
        Command::Ping => "hello\n".to_string(),
        Command::Stats => format!("{} units\n", registry.count()),
        Command::Configuration => {
            let mut out = format!("configuration from {}\n", server.config_source());
            for (key, value) in server.config().entries() {
                let _ = writeln!(out, "  {} = {}", key, value);
            }
            out
        }
        Command::List => registry.names().into_iter().fold(String::new(), |mut out, name| {
            out.push_str(&name);
            out.push('\n');
            out
        }),
        Command::Subscribers => {
            let mut out = String::new();
            for addr in server.notifier().subscribers() {
                let _ = writeln!(out, "{} - {}", addr.ip(), addr.port());
            }
            out
        }
        Command::Info(name) => info_text(server, name, now),
        Command::Delete(name) => {
            if !valid_name(name) {
                return "invalid name\n".to_string();
            }
            match registry.remove(name) {
                Ok(true) => format!("'{}' deleted\n", name),
                Ok(false) => format!("'{}' not found\n", name),
                Err(e) => {
                    warn!("delete {}: {}", name, e);
                    format!("'{}' deleted, cleanup failed: {}\n", name, e)
                }
            }
        }
        Command::Archive(prefix) => match write_archive(prefix, &registry.summaries(), now) {
            Ok(n) => {
                info!("archived {} units to {}*", n, prefix);
                format!("archived {} units\n", n)
            }
            Err(e) => format!("archive failed: {}\n", e),
        },
        Command::TreeDump(path) => {
            let mut dump = registry.dump_tree();
            dump.push('\n');
            match std::fs::write(path, dump) {
                Ok(()) => "dumped\n".to_string(),
                Err(e) => format!("dump failed: {}\n", e),
            }
        }
        Command::Unknown(text) => format!("Unknown command: \"{}\".\n", text),
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b':' | b'-'))
}

fn info_text(server: &AliveServer, name: &str, now: u32) -> String {
    let Some(detail) = server.registry().detail(name) else {
        return format!("'{}' not found\n", name);
    };
    let summary = &detail.summary;
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}: {} at {}",
        summary.name,
        summary.status.as_str(),
        if summary.time == 0 {
            "unknown time".to_string()
        } else {
            clock::format_time(summary.time)
        }
    );
    for (i, inc) in detail.instances.iter().enumerate() {
        describe_instance(&mut out, i, inc, now);
    }
    out
}

fn describe_instance(out: &mut String, index: usize, inc: &Incarnation, now: u32) {
    let p = &inc.ping;
    let _ = writeln!(
        out,
        "  [{}] {} {}:{} incarnation {}",
        index,
        inc.status.as_str(),
        p.address,
        p.origin_port,
        p.incarnation
    );
    let _ = writeln!(
        out,
        "      booted {} (up {})",
        clock::format_time(p.boot_time),
        clock::format_duration(now.saturating_sub(p.boot_time))
    );
    if p.timestamp != 0 {
        let _ = writeln!(
            out,
            "      last heartbeat #{} at {} ({} ago), period {}s",
            p.heartbeat,
            clock::format_time(p.timestamp),
            clock::format_duration(now.saturating_sub(p.timestamp)),
            p.period
        );
    }
    let _ = writeln!(out, "      reply port {}, message {}", p.reply_port, p.user_msg);
    match &inc.env {
        Some(env) => describe_env(out, env),
        None => out.push_str("      no metadata\n"),
    }
}

fn describe_env(out: &mut String, env: &EnvironmentSnapshot) {
    let _ = match &env.os {
        OsInfo::Generic => writeln!(out, "      os generic"),
        OsInfo::VxWorks(vx) => writeln!(
            out,
            "      os vxworks target {} boot host {} ({}) file {}",
            vx.target_name, vx.boot_host_name, vx.boot_host_address, vx.boot_file
        ),
        OsInfo::Linux(u) | OsInfo::Darwin(u) => writeln!(
            out,
            "      os {} user {} group {} host {}",
            env.os.name(),
            u.user,
            u.group,
            u.hostname
        ),
        OsInfo::Windows(w) => writeln!(out, "      os windows user {} machine {}", w.user, w.machine),
    };
    for (key, value) in &env.vars {
        let _ = writeln!(out, "      {}={}", key, value);
    }
}
