// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Unit registry.
//!
//! One [`OrderedMap`] keyed by unit name. Heartbeats update an entry under
//! its own lock; their persistence and events follow in
//! [`UnitRegistry::complete`], outside any map lock. Sweep transitions are
//! persisted and emitted under the entry lock.

pub mod env;
pub mod event;
pub mod fetch;
pub mod heartbeat;
pub mod unit;
pub mod view;

use crate::ordmap::OrderedMap;
use crate::store::{Storage, StoreError};
use env::EnvironmentSnapshot;
use event::{EventKind, EventSink, UnitEvent};
use heartbeat::Heartbeat;
use std::sync::Arc;
use tracing::{debug, info, warn};
use unit::{Followup, Incarnation, InstanceStatus, Ping, SweepAction, SweepPolicy, Unit};
use view::{UnitDetail, UnitSummary};

pub struct UnitRegistry {
    units: OrderedMap<String, Unit>,
    policy: SweepPolicy,
    sink: Arc<dyn EventSink>,
    storage: Option<Arc<Storage>>,
    started: u32,
}

impl UnitRegistry {
    pub fn new(
        policy: SweepPolicy,
        sink: Arc<dyn EventSink>,
        storage: Option<Arc<Storage>>,
        started: u32,
    ) -> Self {
        Self {
            units: OrderedMap::new(),
            policy,
            sink,
            storage,
            started,
        }
    }

    /// Daemon start time reported to query clients.
    pub fn started(&self) -> u32 {
        self.started
    }

    pub fn policy(&self) -> SweepPolicy {
        self.policy
    }

    pub fn storage(&self) -> Option<&Arc<Storage>> {
        self.storage.as_ref()
    }

    /// Apply one decoded heartbeat.
    ///
    /// Known units are updated under the shared structural lock; only a
    /// first heartbeat takes the exclusive one. The returned followup must be
    /// passed to [`complete`](Self::complete), after a metadata fetch when
    /// `followup.fetch` is set.
    pub fn ingest(&self, hb: &Heartbeat) -> Option<Followup> {
        if let Some(followup) = self.units.find(&hb.name, |unit| unit.apply(hb)) {
            return followup;
        }
        let result = self.units.insert_or_update(
            &hb.name,
            || {
                let (unit, followup) = Unit::from_heartbeat(hb);
                Some((unit, Some(followup)))
            },
            |unit| unit.apply(hb),
        );
        match result {
            Ok(followup) => followup,
            Err(e) => {
                warn!("heartbeat from {} dropped: {}", hb.name, e);
                None
            }
        }
    }

    /// Finish a followup: install fetched metadata, persist, then emit.
    ///
    /// `env` is the fetched snapshot, or `None` when the fetch failed or was
    /// not requested.
    pub fn complete(&self, followup: &Followup, env: Option<EnvironmentSnapshot>, now: u32) {
        let fetched = env.map(Arc::new);
        let found = self.units.find(&followup.name, |unit| {
            if let Some(env) = &fetched {
                if !unit.install_env(&followup.ping, Arc::clone(env)) {
                    debug!("{}: metadata arrived for an incarnation no longer up", unit.name());
                }
            }
            let current = unit
                .up()
                .iter()
                .find(|i| i.ping.same_identity(&followup.ping))
                .cloned();
            let primary_env = unit.primary().and_then(|p| p.env.clone());
            (current, primary_env)
        });
        let Some((current, primary_env)) = found else {
            debug!("{} was deleted before its followup completed", followup.name);
            return;
        };

        let name = &followup.name;
        if followup.fetch {
            if let Some(storage) = &self.storage {
                if let Err(e) = storage
                    .info
                    .append(name, &followup.ping, fetched.as_deref(), now)
                {
                    warn!("info log: {}", e);
                }
            }
            if let Some(inc) = &current {
                self.persist_full(name, inc);
            }
        } else {
            match (followup.event, &current) {
                (Some(EventKind::Boot), Some(inc)) => self.persist_full(name, inc),
                (Some(EventKind::Recover), Some(inc)) => self.persist_status(name, inc),
                _ => {}
            }
        }

        if let Some(kind) = followup.event {
            let env = if followup.fetch { fetched } else { primary_env };
            self.emit(name, kind, followup.ping, env, now);
        }
    }

    /// Seed the registry from the state directory.
    ///
    /// Returns the number of units restored.
    pub fn load_persisted(&self) -> Result<usize, StoreError> {
        let Some(storage) = &self.storage else {
            return Ok(0);
        };
        let mut restored = 0;
        for (name, inc) in storage.state.load_all()? {
            let inserted = self.units.insert_or_update(
                &name,
                || Some((Unit::restored(name.clone(), inc), true)),
                |_| false,
            );
            if matches!(inserted, Ok(true)) {
                restored += 1;
            }
        }
        info!("restored {} units from {:?}", restored, storage.state.dir());
        Ok(restored)
    }

    /// First sweep after startup: settle restored down records silently.
    pub fn settle_restored(&self) {
        let mut settled = 0;
        self.units.walk(|name, unit| {
            if let Some(status) = unit.settle_restored() {
                self.write_status(name, status);
                settled += 1;
            }
        });
        debug!("settled {} restored units", settled);
    }

    /// Failure detection, conflict bookkeeping and history pruning.
    ///
    /// Each unit's actions are persisted and emitted while its entry is still
    /// locked, so a heartbeat for that unit is ordered entirely before or
    /// after them.
    pub fn sweep(&self, now: u32) {
        let policy = self.policy;
        self.units.walk(|name, unit| {
            for action in unit.sweep(now, &policy) {
                match action {
                    SweepAction::PersistStatus(status) => self.write_status(name, status),
                    SweepAction::PersistFull(inc) => self.persist_full(name, &inc),
                    SweepAction::Emit { kind, ping, env } => self.emit(name, kind, ping, env, now),
                }
            }
        });
    }

    fn write_status(&self, name: &str, status: InstanceStatus) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.state.write_status(name, status) {
                warn!("state of {}: {}", name, e);
            }
        }
    }

    fn persist_full(&self, name: &str, inc: &Incarnation) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.state.write_full(name, inc) {
                warn!("state of {}: {}", name, e);
            }
        }
    }

    /// Rewrite the status byte, writing the whole record if there is none.
    fn persist_status(&self, name: &str, inc: &Incarnation) {
        if let Some(storage) = &self.storage {
            if storage.state.write_status(name, inc.status).is_err() {
                self.persist_full(name, inc);
            }
        }
    }

    fn emit(
        &self,
        name: &str,
        kind: EventKind,
        ping: Ping,
        env: Option<Arc<EnvironmentSnapshot>>,
        now: u32,
    ) {
        let event = UnitEvent {
            name: name.to_string(),
            kind,
            ping,
            env,
            time: now,
        };
        info!("{} {} from {}:{}", name, kind, ping.address, ping.origin_port);
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.events.append(&event) {
                warn!("event log: {}", e);
            }
        }
        self.sink.report(&event);
    }

    /// Summaries of every unit, in name order.
    pub fn summaries(&self) -> Vec<UnitSummary> {
        let mut out = Vec::with_capacity(self.units.count());
        self.units.walk(|_, unit| out.extend(UnitSummary::of(unit)));
        out
    }

    /// Summaries of the named units that exist, in name order.
    pub fn summaries_of(&self, names: &[String]) -> Vec<UnitSummary> {
        let mut out = Vec::with_capacity(names.len());
        self.units
            .batch_find(names, |_, unit| out.extend(UnitSummary::of(unit)));
        out
    }

    pub fn summary(&self, name: &str) -> Option<UnitSummary> {
        self.units
            .find(&name.to_string(), |unit| UnitSummary::of(unit))
            .flatten()
    }

    pub fn detail(&self, name: &str) -> Option<UnitDetail> {
        self.units
            .find(&name.to_string(), |unit| UnitDetail::full(unit))
            .flatten()
    }

    pub fn conflict_detail(&self, name: &str) -> Option<UnitDetail> {
        self.units
            .find(&name.to_string(), |unit| UnitDetail::conflict(unit))
            .flatten()
    }

    /// Every incarnation status of `name`; test and operator helper.
    pub fn statuses(&self, name: &str) -> Option<Vec<InstanceStatus>> {
        self.units
            .find(&name.to_string(), |unit| unit.instances().map(|i| i.status).collect())
    }

    pub fn names(&self) -> Vec<String> {
        self.units.keys()
    }

    pub fn count(&self) -> usize {
        self.units.count()
    }

    /// Delete a unit and its persisted artifacts.
    pub fn remove(&self, name: &str) -> Result<bool, StoreError> {
        if self.units.remove(&name.to_string()).is_none() {
            return Ok(false);
        }
        if let Some(storage) = &self.storage {
            storage.forget(name)?;
        }
        info!("{} deleted", name);
        Ok(true)
    }

    /// Tree shape as `(key B|R)[left][right]`.
    pub fn dump_tree(&self) -> String {
        self.units.dump()
    }
}
