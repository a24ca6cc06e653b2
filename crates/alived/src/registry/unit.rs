// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-unit liveness state and its transitions.
//!
//! A unit keeps two ordered lists of incarnations. The head of the up list
//! is the primary; the down list holds recently failed incarnations, newest
//! first. Transitions here are pure: they take the current time and report
//! what has to be persisted or emitted, and the registry performs that work
//! outside the entry lock.

use super::env::EnvironmentSnapshot;
use super::event::EventKind;
use super::heartbeat::Heartbeat;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Extra seconds of silence tolerated on top of the missed-beat budget.
pub const FAIL_SLACK_SECS: u64 = 1;

/// Last heartbeat seen from one incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub address: Ipv4Addr,
    pub origin_port: u16,
    pub version: u16,
    pub heartbeat: u32,
    pub period: u16,
    pub incarnation: u32,
    /// Local estimate of when this incarnation booted.
    pub boot_time: u32,
    /// Local receive time of the last accepted heartbeat.
    pub timestamp: u32,
    /// TCP port serving metadata.
    pub reply_port: u16,
    pub user_msg: u32,
}

impl Ping {
    /// Same (address, origin port, incarnation).
    pub fn same_identity(&self, other: &Ping) -> bool {
        self.address == other.address
            && self.origin_port == other.origin_port
            && self.incarnation == other.incarnation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InstanceStatus {
    Up = 0,
    Down = 1,
    /// Failed without a known last-seen time.
    UntimedDown = 2,
    /// Restored from disk as up; not yet confirmed.
    MaybeUp = 3,
    /// Restored from disk as down; not yet settled.
    MaybeDown = 4,
}

impl InstanceStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Up,
            1 => Self::Down,
            2 => Self::UntimedDown,
            3 => Self::MaybeUp,
            4 => Self::MaybeDown,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::UntimedDown => "UNTIMED_DOWN",
            Self::MaybeUp => "MAYBE_UP",
            Self::MaybeDown => "MAYBE_DOWN",
        }
    }

    pub fn is_up_like(self) -> bool {
        matches!(self, Self::Up | Self::MaybeUp)
    }
}

/// One boot generation of a unit.
#[derive(Debug, Clone)]
pub struct Incarnation {
    pub status: InstanceStatus,
    pub ping: Ping,
    pub env: Option<Arc<EnvironmentSnapshot>>,
}

/// Failure-detection and retention parameters.
#[derive(Debug, Clone, Copy)]
pub struct SweepPolicy {
    pub missed_beats: u32,
    pub retain_secs: u32,
}

impl SweepPolicy {
    fn expired(&self, ping: &Ping, now: u32) -> bool {
        let silence = u64::from(now.saturating_sub(ping.timestamp));
        silence >= u64::from(self.missed_beats) * u64::from(ping.period) + FAIL_SLACK_SECS
    }
}

/// Work left after a heartbeat was applied.
#[derive(Debug, Clone)]
pub struct Followup {
    pub name: String,
    pub ping: Ping,
    pub event: Option<EventKind>,
    /// Metadata has to be fetched from the unit.
    pub fetch: bool,
}

/// Side effects requested by a sweep.
#[derive(Debug, Clone)]
pub enum SweepAction {
    /// Rewrite only the status of the persisted record.
    PersistStatus(InstanceStatus),
    /// Rewrite the whole persisted record.
    PersistFull(Incarnation),
    Emit {
        kind: EventKind,
        ping: Ping,
        env: Option<Arc<EnvironmentSnapshot>>,
    },
}

/// Overall state reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OverallStatus {
    Unknown = 0,
    DownUnknown = 1,
    Down = 2,
    Up = 3,
    Conflict = 4,
}

impl OverallStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::DownUnknown => "DOWN (unknown time)",
            Self::Down => "DOWN",
            Self::Up => "UP",
            Self::Conflict => "CONFLICT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Unit {
    pub(crate) name: String,
    pub(crate) conflict: bool,
    pub(crate) up: VecDeque<Incarnation>,
    pub(crate) down: VecDeque<Incarnation>,
}

impl Unit {
    /// First heartbeat from a unit never seen before.
    ///
    /// Returns the unit and the boot followup.
    pub fn from_heartbeat(hb: &Heartbeat) -> (Self, Followup) {
        let mut up = VecDeque::with_capacity(1);
        up.push_back(Incarnation {
            status: InstanceStatus::Up,
            ping: hb.ping,
            env: None,
        });
        let unit = Self {
            name: hb.name.clone(),
            conflict: false,
            up,
            down: VecDeque::new(),
        };
        let followup = Followup {
            name: hb.name.clone(),
            ping: hb.ping,
            event: Some(EventKind::Boot),
            fetch: !hb.flags.no_fetch,
        };
        (unit, followup)
    }

    /// Unit restored from disk.
    pub fn restored(name: String, incarnation: Incarnation) -> Self {
        let mut unit = Self {
            name,
            conflict: false,
            up: VecDeque::new(),
            down: VecDeque::new(),
        };
        if incarnation.status.is_up_like() {
            unit.up.push_back(Incarnation {
                status: InstanceStatus::MaybeUp,
                ..incarnation
            });
        } else {
            unit.down.push_back(Incarnation {
                status: InstanceStatus::MaybeDown,
                ..incarnation
            });
        }
        unit
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_conflict(&self) -> bool {
        self.conflict
    }

    pub fn up(&self) -> &VecDeque<Incarnation> {
        &self.up
    }

    pub fn down(&self) -> &VecDeque<Incarnation> {
        &self.down
    }

    /// The record that represents the unit: the up head, else the down head.
    pub fn primary(&self) -> Option<&Incarnation> {
        self.up.front().or_else(|| self.down.front())
    }

    /// Apply a heartbeat for this unit.
    ///
    /// Returns `None` when the packet was stale or changed nothing that needs
    /// follow-up work.
    pub fn apply(&mut self, hb: &Heartbeat) -> Option<Followup> {
        let ping = &hb.ping;
        let mut event = None;

        let mut found = false;
        if let Some(pos) = self.up.iter().position(|i| i.ping.same_identity(ping)) {
            if ping.heartbeat <= self.up[pos].ping.heartbeat {
                return None;
            }
            if pos > 0 {
                if !self.conflict {
                    event = Some(EventKind::ConflictStart);
                }
                self.conflict = true;
                if let Some(inc) = self.up.remove(pos) {
                    self.up.push_front(inc);
                }
            }
            found = true;
        } else if let Some(pos) = self.down.iter().position(|i| i.ping.same_identity(ping)) {
            if ping.heartbeat <= self.down[pos].ping.heartbeat {
                return None;
            }
            if self.up.is_empty() {
                event = Some(EventKind::Recover);
            } else {
                if !self.conflict {
                    event = Some(EventKind::ConflictStart);
                }
                self.conflict = true;
            }
            if let Some(inc) = self.down.remove(pos) {
                self.up.push_front(inc);
            }
            found = true;
        }

        if !found {
            event = Some(EventKind::Boot);
            self.up.push_front(Incarnation {
                status: InstanceStatus::Up,
                ping: *ping,
                env: None,
            });
        }

        let head = self.up.front_mut()?;
        head.status = InstanceStatus::Up;

        let mut fetch = false;
        if event == Some(EventKind::Boot)
            || hb.flags.distrust_env
            || ping.reply_port != head.ping.reply_port
        {
            head.env = None;
            fetch = !hb.flags.no_fetch;
        }
        if event.is_none() && ping.user_msg != head.ping.user_msg {
            event = Some(EventKind::Message);
        }
        head.ping = *ping;

        if event.is_none() && !fetch {
            return None;
        }
        Some(Followup {
            name: self.name.clone(),
            ping: *ping,
            event,
            fetch,
        })
    }

    /// Install fetched metadata on the up incarnation with `ping`'s identity.
    ///
    /// Returns false if that incarnation is no longer up.
    pub fn install_env(&mut self, ping: &Ping, env: Arc<EnvironmentSnapshot>) -> bool {
        match self.up.iter_mut().find(|i| i.ping.same_identity(ping)) {
            Some(inc) => {
                inc.env = Some(env);
                true
            }
            None => false,
        }
    }

    /// First sweep after startup: restored down records lose their "maybe".
    ///
    /// Returns the status to persist when the primary changed.
    pub fn settle_restored(&mut self) -> Option<InstanceStatus> {
        let mut changed = false;
        for inc in self.down.iter_mut() {
            if inc.status == InstanceStatus::MaybeDown {
                inc.status = InstanceStatus::UntimedDown;
                changed = true;
            }
        }
        if changed && self.up.is_empty() {
            self.down.front().map(|i| i.status)
        } else {
            None
        }
    }

    /// Failure detection, conflict bookkeeping and history pruning.
    pub fn sweep(&mut self, now: u32, policy: &SweepPolicy) -> Vec<SweepAction> {
        let mut actions = Vec::new();

        let mut alive = VecDeque::with_capacity(self.up.len());
        let mut failed = Vec::new();
        for mut inc in self.up.drain(..) {
            if !policy.expired(&inc.ping, now) {
                alive.push_back(inc);
                continue;
            }
            inc.status = if inc.status == InstanceStatus::Up {
                InstanceStatus::Down
            } else {
                InstanceStatus::UntimedDown
            };
            // Nothing ahead of it survived, so it is the current primary.
            if alive.is_empty() {
                actions.push(SweepAction::PersistStatus(inc.status));
                if !self.conflict {
                    actions.push(SweepAction::Emit {
                        kind: EventKind::Fail,
                        ping: inc.ping,
                        env: inc.env.clone(),
                    });
                }
            }
            failed.push(inc);
        }
        self.up = alive;
        for inc in failed.into_iter().rev() {
            self.down.push_front(inc);
        }

        let conflict = match self.up.front() {
            Some(head) => self
                .up
                .iter()
                .skip(1)
                .any(|i| i.ping.timestamp > head.ping.boot_time),
            None => false,
        };
        if self.conflict && !conflict {
            self.conflict = false;
            if let Some(primary) = self.primary().cloned() {
                actions.push(SweepAction::Emit {
                    kind: EventKind::ConflictStop,
                    ping: primary.ping,
                    env: primary.env.clone(),
                });
                actions.push(SweepAction::PersistFull(primary));
            }
        } else if !self.conflict && conflict {
            self.conflict = true;
            if let Some(head) = self.up.front() {
                actions.push(SweepAction::Emit {
                    kind: EventKind::ConflictStart,
                    ping: head.ping,
                    env: head.env.clone(),
                });
            }
        }

        let keep_first = self.up.is_empty();
        let mut index = 0;
        self.down.retain(|inc| {
            let protected = keep_first && index == 0;
            index += 1;
            protected || now.saturating_sub(inc.ping.timestamp) <= policy.retain_secs
        });

        actions
    }

    /// Status and time value shown to clients.
    ///
    /// The time is a boot time for up states and a failure time for `Down`.
    pub fn overall(&self) -> (OverallStatus, u32) {
        if self.conflict {
            let latest = self.up.iter().map(|i| i.ping.boot_time).max().unwrap_or(0);
            return (OverallStatus::Conflict, latest);
        }
        if let Some(head) = self.up.front() {
            return match head.status {
                InstanceStatus::Up => (OverallStatus::Up, head.ping.boot_time),
                _ => (OverallStatus::Unknown, 0),
            };
        }
        match self.down.front() {
            Some(inc) => match inc.status {
                InstanceStatus::Down => (OverallStatus::Down, inc.ping.timestamp),
                InstanceStatus::UntimedDown => (OverallStatus::DownUnknown, 0),
                _ => (OverallStatus::Unknown, 0),
            },
            None => (OverallStatus::Unknown, 0),
        }
    }

    /// Every incarnation, up list first.
    pub fn instances(&self) -> impl Iterator<Item = &Incarnation> {
        self.up.iter().chain(self.down.iter())
    }

    /// The primary and every other up incarnation seen after it booted.
    pub fn conflicting(&self) -> Vec<&Incarnation> {
        let Some(head) = self.up.front() else {
            return Vec::new();
        };
        std::iter::once(head)
            .chain(
                self.up
                    .iter()
                    .skip(1)
                    .filter(|i| i.ping.timestamp > head.ping.boot_time),
            )
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::heartbeat::HeartbeatFlags;

    const T0: u32 = 1_800_000_000;

    fn policy() -> SweepPolicy {
        SweepPolicy {
            missed_beats: 3,
            retain_secs: 600,
        }
    }

    fn hb(port: u16, incarnation: u32, counter: u32, now: u32) -> Heartbeat {
        Heartbeat {
            name: "ioc1".into(),
            ping: Ping {
                address: Ipv4Addr::new(10, 0, 0, 5),
                origin_port: port,
                version: 5,
                heartbeat: counter,
                period: 5,
                incarnation,
                boot_time: incarnation,
                timestamp: now,
                reply_port: 7000,
                user_msg: 0,
            },
            flags: HeartbeatFlags::default(),
        }
    }

    fn emitted(actions: &[SweepAction]) -> Vec<EventKind> {
        actions
            .iter()
            .filter_map(|a| match a {
                SweepAction::Emit { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    fn with_env(unit: &mut Unit, ping: &Ping) {
        assert!(unit.install_env(ping, Arc::new(EnvironmentSnapshot::default())));
    }

    #[test]
    fn test_first_heartbeat_boots() {
        let (unit, follow) = Unit::from_heartbeat(&hb(1, T0, 1, T0));
        assert_eq!(follow.event, Some(EventKind::Boot));
        assert!(follow.fetch);
        assert_eq!(unit.overall(), (OverallStatus::Up, T0));
    }

    #[test]
    fn test_monotonic_heartbeats_keep_boot_time() {
        let first = hb(1, T0 - 100, 1, T0);
        let (mut unit, _) = Unit::from_heartbeat(&first);
        with_env(&mut unit, &first.ping);
        for i in 2..20 {
            assert!(unit.apply(&hb(1, T0 - 100, i, T0 + i * 5)).is_none());
        }
        let head = unit.up.front().unwrap();
        assert_eq!(head.status, InstanceStatus::Up);
        assert_eq!(head.ping.heartbeat, 19);
        assert_eq!(unit.overall(), (OverallStatus::Up, T0 - 100));
    }

    #[test]
    fn test_stale_counter_is_ignored() {
        let (mut unit, _) = Unit::from_heartbeat(&hb(1, T0, 5, T0));
        let before = unit.up.front().unwrap().ping;
        let mut replay = hb(1, T0, 5, T0 + 10);
        replay.ping.user_msg = 9;
        assert!(unit.apply(&replay).is_none());
        assert!(unit.apply(&hb(1, T0, 4, T0 + 11)).is_none());
        assert_eq!(unit.up.front().unwrap().ping, before);
    }

    #[test]
    fn test_message_event_on_user_msg_change() {
        let first = hb(1, T0, 1, T0);
        let (mut unit, _) = Unit::from_heartbeat(&first);
        with_env(&mut unit, &first.ping);
        let mut next = hb(1, T0, 2, T0 + 5);
        next.ping.user_msg = 1;
        let follow = unit.apply(&next).unwrap();
        assert_eq!(follow.event, Some(EventKind::Message));
        assert!(!follow.fetch);
    }

    #[test]
    fn test_reply_port_change_or_distrust_drops_env() {
        let first = hb(1, T0, 1, T0);
        let (mut unit, _) = Unit::from_heartbeat(&first);
        with_env(&mut unit, &first.ping);

        let mut moved = hb(1, T0, 2, T0 + 5);
        moved.ping.reply_port = 7001;
        let follow = unit.apply(&moved).unwrap();
        assert_eq!(follow.event, None);
        assert!(follow.fetch);
        assert!(unit.up.front().unwrap().env.is_none());

        with_env(&mut unit, &moved.ping);
        let mut distrust = hb(1, T0, 3, T0 + 10);
        distrust.ping.reply_port = 7001;
        distrust.flags.distrust_env = true;
        distrust.flags.no_fetch = true;
        // Dropped, but the sender asked not to be queried.
        assert!(unit.apply(&distrust).is_none());
        assert!(unit.up.front().unwrap().env.is_none());
    }

    #[test]
    fn test_fail_then_recover_on_new_incarnation() {
        let (mut unit, _) = Unit::from_heartbeat(&hb(1, T0, 1, T0));

        let actions = unit.sweep(T0 + 15, &policy());
        assert!(emitted(&actions).is_empty());

        let actions = unit.sweep(T0 + 16, &policy());
        assert_eq!(emitted(&actions), vec![EventKind::Fail]);
        assert!(matches!(
            actions[0],
            SweepAction::PersistStatus(InstanceStatus::Down)
        ));
        assert_eq!(unit.overall(), (OverallStatus::Down, T0));

        // A new boot on the same address is a new identity: it boots.
        let follow = unit.apply(&hb(1, T0 + 100, 1, T0 + 100)).unwrap();
        assert_eq!(follow.event, Some(EventKind::Boot));
        assert_eq!(unit.down.len(), 1);
        assert_eq!(unit.overall(), (OverallStatus::Up, T0 + 100));
    }

    #[test]
    fn test_returning_incarnation_recovers() {
        let (mut unit, _) = Unit::from_heartbeat(&hb(1, T0, 1, T0));
        unit.sweep(T0 + 100, &policy());
        assert!(unit.up.is_empty());

        let follow = unit.apply(&hb(1, T0, 2, T0 + 101)).unwrap();
        assert_eq!(follow.event, Some(EventKind::Recover));
        assert!(unit.down.is_empty());
        assert_eq!(unit.up.front().unwrap().status, InstanceStatus::Up);
    }

    #[test]
    fn test_duplicate_identities_conflict_and_resolve() {
        let (mut unit, _) = Unit::from_heartbeat(&hb(1, T0, 1, T0));
        let follow = unit.apply(&hb(2, T0 + 3, 1, T0 + 3)).unwrap();
        // A second boot under the same name takes over the head.
        assert_eq!(follow.event, Some(EventKind::Boot));

        // The first one keeps talking after the second booted.
        let follow = unit.apply(&hb(1, T0, 2, T0 + 5)).unwrap();
        assert_eq!(follow.event, Some(EventKind::ConflictStart));
        assert!(unit.in_conflict());

        // Further alternation does not re-announce.
        let next = unit.apply(&hb(2, T0 + 3, 2, T0 + 6));
        assert!(next.map_or(true, |f| f.event != Some(EventKind::ConflictStart)));
        assert_eq!(unit.overall().0, OverallStatus::Conflict);
        assert_eq!(unit.conflicting().len(), 2);

        // Port 1 goes silent: conflict stops exactly once.
        let mut stops = 0;
        for t in [T0 + 12, T0 + 20, T0 + 25] {
            let _ = unit.apply(&hb(2, T0 + 3, t, t));
            let actions = unit.sweep(t, &policy());
            stops += emitted(&actions)
                .iter()
                .filter(|k| **k == EventKind::ConflictStop)
                .count();
            assert!(!emitted(&actions).contains(&EventKind::Fail));
        }
        assert_eq!(stops, 1);
        assert!(!unit.in_conflict());
        assert_eq!(unit.up.len(), 1);
        assert_eq!(unit.overall().0, OverallStatus::Up);
    }

    #[test]
    fn test_sweep_flags_conflict_from_timestamps() {
        let (mut unit, _) = Unit::from_heartbeat(&hb(1, T0, 1, T0));
        // Insert a second up incarnation directly behind the head.
        let mut other = hb(2, T0 - 50, 1, T0 + 2).ping;
        other.boot_time = T0 - 50;
        unit.up.push_back(Incarnation {
            status: InstanceStatus::Up,
            ping: other,
            env: None,
        });
        let actions = unit.sweep(T0 + 3, &policy());
        assert_eq!(emitted(&actions), vec![EventKind::ConflictStart]);
        assert!(unit.in_conflict());
    }

    #[test]
    fn test_retention_keeps_last_record_when_nothing_is_up() {
        let (mut unit, _) = Unit::from_heartbeat(&hb(1, T0, 1, T0));
        unit.sweep(T0 + 20, &policy());
        let _ = unit.apply(&hb(2, T0 + 30, 1, T0 + 30));
        unit.sweep(T0 + 60, &policy());
        assert!(unit.up.is_empty());
        assert_eq!(unit.down.len(), 2);

        unit.sweep(T0 + 10_000, &policy());
        assert_eq!(unit.down.len(), 1);
        assert_eq!(unit.down[0].ping.origin_port, 2);
    }

    #[test]
    fn test_retention_purges_all_down_when_up() {
        let (mut unit, _) = Unit::from_heartbeat(&hb(1, T0, 1, T0));
        unit.sweep(T0 + 20, &policy());
        let _ = unit.apply(&hb(2, T0 + 9_000, 1, T0 + 9_000));
        unit.sweep(T0 + 9_001, &policy());
        assert!(unit.down.is_empty());
        assert_eq!(unit.up.len(), 1);
    }

    #[test]
    fn test_restored_units_settle() {
        let ping = hb(1, T0, 0, 0).ping;
        let mut down = Unit::restored(
            "a".into(),
            Incarnation {
                status: InstanceStatus::Down,
                ping,
                env: None,
            },
        );
        assert_eq!(down.down[0].status, InstanceStatus::MaybeDown);
        assert_eq!(down.overall().0, OverallStatus::Unknown);
        assert_eq!(down.settle_restored(), Some(InstanceStatus::UntimedDown));
        assert_eq!(down.overall().0, OverallStatus::DownUnknown);

        let mut up = Unit::restored(
            "b".into(),
            Incarnation {
                status: InstanceStatus::Up,
                ping,
                env: None,
            },
        );
        assert_eq!(up.up[0].status, InstanceStatus::MaybeUp);
        assert_eq!(up.overall().0, OverallStatus::Unknown);
        assert_eq!(up.settle_restored(), None);

        // Unconfirmed by a heartbeat, it times out as untimed.
        let actions = up.sweep(T0, &policy());
        assert!(matches!(
            actions[0],
            SweepAction::PersistStatus(InstanceStatus::UntimedDown)
        ));
    }

    #[test]
    fn test_restored_up_confirmed_by_heartbeat() {
        let mut ping = hb(1, T0, 0, 0).ping;
        ping.heartbeat = 0;
        let mut unit = Unit::restored(
            "ioc1".into(),
            Incarnation {
                status: InstanceStatus::Up,
                ping,
                env: Some(Arc::new(EnvironmentSnapshot::default())),
            },
        );
        assert!(unit.apply(&hb(1, T0, 1, T0 + 40)).is_none());
        assert_eq!(unit.overall(), (OverallStatus::Up, T0));
    }
}
