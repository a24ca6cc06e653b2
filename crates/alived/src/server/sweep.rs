// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic failure detection.

use super::StopSignal;
use crate::clock;
use crate::registry::UnitRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Wait out the grace period, settle restored state, then sweep every
/// `interval` until shut down.
///
/// The grace period lets restored units heartbeat again before they can be
/// declared failed.
pub(crate) async fn run(
    registry: Arc<UnitRegistry>,
    grace: Duration,
    interval: Duration,
    shutdown: Arc<StopSignal>,
) {
    let stop = shutdown.wait();
    tokio::pin!(stop);

    debug!("first sweep in {:?}", grace);
    tokio::select! {
        _ = tokio::time::sleep(grace) => {}
        _ = &mut stop => return,
    }
    registry.settle_restored();
    info!("grace period over, sweeping every {:?}", interval);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => registry.sweep(clock::now()),
            _ = &mut stop => {
                debug!("sweeper shutting down");
                break;
            }
        }
    }
}
