// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription endpoint: request handling and the delivery tick.

use super::StopSignal;
use crate::clock;
use crate::notify::protocol::Request;
use crate::notify::NotificationEngine;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const RECV_BUFFER_LEN: usize = 512;

pub(crate) async fn run(
    socket: UdpSocket,
    engine: Arc<NotificationEngine>,
    tick: Duration,
    shutdown: Arc<StopSignal>,
) {
    let stop = shutdown.wait();
    tokio::pin!(stop);

    if let Ok(addr) = socket.local_addr() {
        info!("subscription endpoint listening on {}", addr);
    }
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = vec![0u8; RECV_BUFFER_LEN];
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for out in engine.tick(clock::now()) {
                    if let Err(e) = socket.send_to(&out.payload, out.to).await {
                        debug!("send to subscriber {}: {}", out.to, e);
                    }
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => serve(&socket, &engine, &buf[..len], from).await,
                // ICMP errors from earlier sends surface here on some platforms.
                Err(e) => debug!("subscription receive error: {}", e),
            },
            _ = &mut stop => {
                debug!("subscription endpoint shutting down");
                break;
            }
        }
    }
}

async fn serve(socket: &UdpSocket, engine: &NotificationEngine, datagram: &[u8], from: SocketAddr) {
    let request = match Request::decode(datagram) {
        Ok(request) => request,
        Err(e) => {
            debug!("dropping subscription request from {}: {}", from, e);
            return;
        }
    };
    let Some(reply) = engine.handle(request, from, clock::now()) else {
        return;
    };
    match socket.send_to(&reply, from).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            if let Request::EventAck { incarnation, .. } = request {
                if engine.evict(from, incarnation) {
                    warn!("subscriber {} unreachable, evicted", from);
                }
            }
        }
        Err(e) => debug!("reply to {}: {}", from, e),
    }
}
