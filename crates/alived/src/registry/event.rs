// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Unit lifecycle events and the sink they are delivered to.

use super::env::EnvironmentSnapshot;
use super::unit::Ping;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    Fail = 1,
    Boot = 2,
    Recover = 3,
    Message = 4,
    ConflictStart = 5,
    ConflictStop = 6,
}

impl EventKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => EventKind::Fail,
            2 => EventKind::Boot,
            3 => EventKind::Recover,
            4 => EventKind::Message,
            5 => EventKind::ConflictStart,
            6 => EventKind::ConflictStop,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Fail => "FAIL",
            EventKind::Boot => "BOOT",
            EventKind::Recover => "RECOVER",
            EventKind::Message => "MESSAGE",
            EventKind::ConflictStart => "CONFLICT_START",
            EventKind::ConflictStop => "CONFLICT_STOP",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One emitted lifecycle event, carrying the incarnation it concerns.
#[derive(Debug, Clone)]
pub struct UnitEvent {
    pub name: String,
    pub kind: EventKind,
    pub ping: Ping,
    pub env: Option<Arc<EnvironmentSnapshot>>,
    /// Time of emission (Unix seconds).
    pub time: u32,
}

/// Receiver of registry events.
pub trait EventSink: Send + Sync {
    fn report(&self, event: &UnitEvent);
}

/// Sink that drops everything; used when nothing subscribes.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn report(&self, _event: &UnitEvent) {}
}
