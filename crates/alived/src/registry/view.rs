// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Owned snapshots of unit state handed to readers outside the map lock.

use super::env::EnvironmentSnapshot;
use super::unit::{Incarnation, OverallStatus, Ping, Unit};
use std::sync::Arc;

/// What clients see for one unit.
#[derive(Debug, Clone)]
pub struct UnitSummary {
    pub name: String,
    pub status: OverallStatus,
    /// Boot time when up or conflicted, failure time when down, else 0.
    pub time: u32,
    /// Last heartbeat of the primary incarnation.
    pub ping: Ping,
    pub env: Option<Arc<EnvironmentSnapshot>>,
}

impl UnitSummary {
    /// `None` only for a unit without incarnations, which the registry never
    /// stores.
    pub fn of(unit: &Unit) -> Option<Self> {
        let primary = unit.primary()?;
        let (status, time) = unit.overall();
        Some(Self {
            name: unit.name().to_string(),
            status,
            time,
            ping: primary.ping,
            env: primary.env.clone(),
        })
    }
}

/// Summary plus a list of incarnations.
#[derive(Debug, Clone)]
pub struct UnitDetail {
    pub summary: UnitSummary,
    pub instances: Vec<Incarnation>,
}

impl UnitDetail {
    /// Every incarnation, up list first.
    pub fn full(unit: &Unit) -> Option<Self> {
        Some(Self {
            summary: UnitSummary::of(unit)?,
            instances: unit.instances().cloned().collect(),
        })
    }

    /// The primary and the incarnations conflicting with it.
    pub fn conflict(unit: &Unit) -> Option<Self> {
        Some(Self {
            summary: UnitSummary::of(unit)?,
            instances: unit.conflicting().into_iter().cloned().collect(),
        })
    }
}
