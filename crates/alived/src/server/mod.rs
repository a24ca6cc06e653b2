// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Daemon lifecycle: endpoint binding and the long-lived service loops.

use crate::clock;
use crate::config::{ConfigError, ServerConfig};
use crate::notify::NotificationEngine;
use crate::registry::UnitRegistry;
use crate::store::{Storage, StoreError};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket, UnixListener};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub mod control;
pub mod heartbeat;
pub mod query;
pub mod subscription;
pub mod sweep;

/// Liveness daemon: heartbeat intake, failure sweeps, subscriber
/// notification, queries and the control channel.
#[derive(Clone)]
pub struct AliveServer {
    config: Arc<ServerConfig>,
    config_source: Arc<str>,
    registry: Arc<UnitRegistry>,
    notifier: Arc<NotificationEngine>,
    shutdown: Arc<StopSignal>,
    running: Arc<AtomicBool>,
}

/// Sockets bound by [`AliveServer::bind`].
pub struct Endpoints {
    pub heartbeat: UdpSocket,
    pub query: TcpListener,
    pub subscription: UdpSocket,
    pub control: UnixListener,
    control_path: PathBuf,
}

impl Endpoints {
    pub fn heartbeat_addr(&self) -> io::Result<SocketAddr> {
        self.heartbeat.local_addr()
    }

    pub fn query_addr(&self) -> io::Result<SocketAddr> {
        self.query.local_addr()
    }

    pub fn subscription_addr(&self) -> io::Result<SocketAddr> {
        self.subscription.local_addr()
    }
}

impl AliveServer {
    /// Validate `config`, open storage and build the registry.
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let notifier = Arc::new(NotificationEngine::new(config.subscriber_stale_secs));
        let registry = Arc::new(UnitRegistry::new(
            config.sweep_policy(),
            notifier.clone(),
            Some(storage),
            clock::now(),
        ));

        Ok(Self {
            config: Arc::new(config),
            config_source: Arc::from("defaults"),
            registry,
            notifier,
            shutdown: Arc::new(StopSignal::default()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Where the configuration came from, as reported by `configuration`.
    pub fn with_config_source(mut self, source: impl Into<String>) -> Self {
        self.config_source = Arc::from(source.into());
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn config_source(&self) -> &str {
        &self.config_source
    }

    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    pub fn notifier(&self) -> &Arc<NotificationEngine> {
        &self.notifier
    }

    /// Bind every endpoint named in the configuration.
    pub async fn bind(&self) -> Result<Endpoints, ServerError> {
        let config = &self.config;
        let ip = config.bind_address;

        let addr = SocketAddr::new(ip, config.heartbeat_port);
        let heartbeat = UdpSocket::bind(addr)
            .await
            .map_err(|e| ServerError::bind("heartbeat", addr, e))?;

        let addr = SocketAddr::new(ip, config.query_port);
        let query = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::bind("query", addr, e))?;

        let addr = SocketAddr::new(ip, config.subscription_port);
        let subscription = UdpSocket::bind(addr)
            .await
            .map_err(|e| ServerError::bind("subscription", addr, e))?;

        let control_path = config.control_socket.clone();
        if let Some(dir) = control_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        // A previous instance may have left its socket behind.
        match std::fs::remove_file(&control_path) {
            Ok(()) => debug!("removed stale control socket {:?}", control_path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let control = UnixListener::bind(&control_path).map_err(|e| ServerError::Bind {
            endpoint: "control",
            addr: control_path.display().to_string(),
            source: e,
        })?;

        Ok(Endpoints {
            heartbeat,
            query,
            subscription,
            control,
            control_path,
        })
    }

    /// Bind, then serve until shut down.
    pub async fn run(&self) -> Result<(), ServerError> {
        let endpoints = self.bind().await?;
        self.serve(endpoints).await
    }

    /// Serve on already-bound endpoints until `quit`, a signal or
    /// [`shutdown`](Self::shutdown).
    pub async fn serve(&self, endpoints: Endpoints) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let result = self.serve_inner(endpoints).await;
        self.shutdown.reset();
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn serve_inner(&self, endpoints: Endpoints) -> Result<(), ServerError> {
        let Endpoints {
            heartbeat,
            query,
            subscription,
            control,
            control_path,
        } = endpoints;

        self.registry.load_persisted()?;

        let config = &self.config;
        let tasks = vec![
            tokio::spawn(heartbeat::run(
                heartbeat,
                self.registry.clone(),
                config.fetch_timeout(),
                self.shutdown.clone(),
            )),
            tokio::spawn(sweep::run(
                self.registry.clone(),
                config.grace_period(),
                config.sweep_interval(),
                self.shutdown.clone(),
            )),
            tokio::spawn(subscription::run(
                subscription,
                self.notifier.clone(),
                config.notify_tick(),
                self.shutdown.clone(),
            )),
            tokio::spawn(query::run(
                query,
                self.registry.clone(),
                config.query_timeout(),
                self.shutdown.clone(),
            )),
        ];

        control::run(control, self.clone()).await;

        for task in tasks {
            if let Err(e) = task.await {
                warn!("service task ended abnormally: {}", e);
            }
        }
        if let Err(e) = std::fs::remove_file(&control_path) {
            debug!("control socket cleanup: {}", e);
        }
        info!("all service loops stopped");
        Ok(())
    }

    /// Signal every loop to stop. A request made before [`serve`](Self::serve)
    /// has started its loops is kept, and that `serve` returns at once.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Latched stop request shared by the service loops.
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    notify: Notify,
    requested: AtomicBool,
}

impl StopSignal {
    pub(crate) fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn reset(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once [`trigger`](Self::trigger) has been called, including
    /// before this future was created.
    pub(crate) async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Registered before the flag is read, so a trigger in between wakes it.
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot bind {endpoint} endpoint on {addr}: {source}")]
    Bind {
        endpoint: &'static str,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("server already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl ServerError {
    fn bind(endpoint: &'static str, addr: SocketAddr, source: io::Error) -> Self {
        Self::Bind {
            endpoint,
            addr: addr.to_string(),
            source,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Configuration rooted in `tmp`, on loopback, with the given ports.
    pub(crate) fn test_config(tmp: &TempDir) -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            state_dir: tmp.path().join("state"),
            event_dir: tmp.path().join("events"),
            event_file: tmp.path().join("events.txt"),
            info_file: tmp.path().join("info.log"),
            control_socket: tmp.path().join("control.sock"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = ServerConfig {
            fail_number_heartbeats: 0,
            ..test_config(&tmp)
        };
        assert!(matches!(
            AliveServer::new(config).await,
            Err(ServerError::Config(_))
        ));
    }

    fn free_port() -> u16 {
        let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = udp.local_addr().unwrap().port();
        match std::net::TcpListener::bind(("127.0.0.1", port)) {
            Ok(_) => port,
            Err(_) => free_port(),
        }
    }

    #[tokio::test]
    async fn test_stop_signal_is_latched() {
        let signal = StopSignal::default();
        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();

        signal.reset();
        assert!(tokio::time::timeout(Duration::from_millis(50), signal.wait())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_shutdown_before_serve_is_kept() {
        let tmp = TempDir::new().unwrap();
        let config = ServerConfig {
            heartbeat_port: free_port(),
            query_port: free_port(),
            subscription_port: free_port(),
            ..test_config(&tmp)
        };
        let server = AliveServer::new(config).await.unwrap();
        let endpoints = server.bind().await.unwrap();

        // Arrives before any loop exists, like an early ctrl-c.
        server.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), server.serve(endpoints))
            .await
            .expect("serve returns after an early shutdown")
            .unwrap();
        assert!(!server.is_running());
        assert!(!tmp.path().join("control.sock").exists());
    }

    #[tokio::test]
    async fn test_new_creates_storage_dirs() {
        let tmp = TempDir::new().unwrap();
        let server = AliveServer::new(test_config(&tmp))
            .await
            .unwrap()
            .with_config_source("test");
        assert!(tmp.path().join("state").is_dir());
        assert!(tmp.path().join("events").is_dir());
        assert_eq!(server.config_source(), "test");
        assert!(!server.is_running());
    }
}
