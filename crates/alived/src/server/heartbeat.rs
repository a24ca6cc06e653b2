// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Heartbeat intake.

use super::StopSignal;
use crate::clock;
use crate::registry::fetch::fetch_metadata;
use crate::registry::heartbeat::Heartbeat;
use crate::registry::UnitRegistry;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

const RECV_BUFFER_LEN: usize = 1500;

pub(crate) async fn run(
    socket: UdpSocket,
    registry: Arc<UnitRegistry>,
    fetch_timeout: Duration,
    shutdown: Arc<StopSignal>,
) {
    let stop = shutdown.wait();
    tokio::pin!(stop);

    if let Ok(addr) = socket.local_addr() {
        info!("heartbeat receiver listening on {}", addr);
    }
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => accept(&registry, &buf[..len], from, fetch_timeout),
                Err(e) => debug!("heartbeat receive error: {}", e),
            },
            _ = &mut stop => {
                debug!("heartbeat receiver shutting down");
                break;
            }
        }
    }
}

/// Decode and apply one datagram; a requested metadata fetch runs in its
/// own task so the receiver never blocks on a unit.
pub(crate) fn accept(
    registry: &Arc<UnitRegistry>,
    datagram: &[u8],
    from: SocketAddr,
    fetch_timeout: Duration,
) {
    let SocketAddr::V4(source) = from else {
        debug!("ignoring heartbeat from non-IPv4 source {}", from);
        return;
    };
    let now = clock::now();
    let hb = match Heartbeat::decode(datagram, source, now) {
        Ok(hb) => hb,
        Err(e) => {
            debug!("dropping heartbeat from {}: {}", from, e);
            return;
        }
    };
    let Some(followup) = registry.ingest(&hb) else {
        return;
    };
    if !followup.fetch {
        registry.complete(&followup, None, now);
        return;
    }

    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        let target = SocketAddrV4::new(followup.ping.address, followup.ping.reply_port);
        let env = match fetch_metadata(target, fetch_timeout).await {
            Ok(env) => Some(env),
            Err(e) => {
                warn!("{}: metadata fetch failed: {}", followup.name, e);
                None
            }
        };
        registry.complete(&followup, env, clock::now());
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::event::testing::RecordingSink;
    use crate::registry::event::EventKind;
    use crate::registry::heartbeat::HeartbeatPacket;
    use crate::registry::unit::SweepPolicy;
    use crate::registry::unit::OverallStatus;

    fn registry(sink: Arc<RecordingSink>) -> Arc<UnitRegistry> {
        let policy = SweepPolicy {
            missed_beats: 5,
            retain_secs: 3600,
        };
        Arc::new(UnitRegistry::new(policy, sink, None, clock::now()))
    }

    fn datagram(name: &str, flags: u16) -> Vec<u8> {
        let now = clock::now();
        HeartbeatPacket {
            version: 5,
            incarnation: now - 100,
            sender_clock: now,
            heartbeat: 1,
            period: 15,
            flags,
            reply_port: 0,
            user_msg: 0,
            name: name.into(),
        }
        .encode()
    }

    #[tokio::test]
    async fn test_no_fetch_boot_is_completed_inline() {
        let sink = Arc::new(RecordingSink::default());
        let registry = registry(sink.clone());
        let from: SocketAddr = "127.0.0.1:4000".parse().unwrap();

        accept(&registry, &datagram("ioc1", 0x0002), from, Duration::from_millis(50));
        assert_eq!(sink.kinds(), vec![EventKind::Boot]);
        let summary = registry.summary("ioc1").unwrap();
        assert_eq!(summary.status, OverallStatus::Up);
        assert!(summary.env.is_none());
    }

    #[tokio::test]
    async fn test_failed_fetch_still_emits_boot() {
        let sink = Arc::new(RecordingSink::default());
        let registry = registry(sink.clone());
        let from: SocketAddr = "127.0.0.1:4001".parse().unwrap();

        // Reply port 0 refuses the connection.
        accept(&registry, &datagram("ioc2", 0), from, Duration::from_millis(200));
        for _ in 0..50 {
            if !sink.kinds().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(sink.kinds(), vec![EventKind::Boot]);
    }

    #[tokio::test]
    async fn test_garbage_and_ipv6_are_ignored() {
        let sink = Arc::new(RecordingSink::default());
        let registry = registry(sink.clone());
        let v4: SocketAddr = "127.0.0.1:4002".parse().unwrap();
        let v6: SocketAddr = "[::1]:4002".parse().unwrap();

        accept(&registry, b"not a heartbeat", v4, Duration::from_millis(50));
        accept(&registry, &datagram("ioc3", 0x0002), v6, Duration::from_millis(50));
        assert_eq!(registry.count(), 0);
        assert!(sink.kinds().is_empty());
    }
}
