// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Liveness registry and failure notification for rebooting units
//!
//! Units announce themselves with periodic UDP heartbeats. The daemon keeps
//! one record per unit name with every incarnation (boot generation) it has
//! seen, declares units failed after missed beats, and pushes lifecycle
//! events to subscribers with at-least-once delivery:
//! - `Boot`, `Fail`, `Recover` and `Message` per unit
//! - `ConflictStart` / `ConflictStop` when two incarnations claim one name
//!
//! # Quick Start
//!
//! ```bash
//! # Defaults: heartbeats on 5678, queries on 5679, subscriptions on 5680
//! alived --config /etc/alived.json
//!
//! # Talk to the running daemon
//! alivectl send info ioc1
//! alivectl send archive /tmp/units
//! ```
//!
//! # Endpoints
//!
//! | Endpoint | Transport | Purpose |
//! |----------|-----------|---------|
//! | heartbeat | UDP | unit heartbeats |
//! | query | TCP | unit state for monitoring clients |
//! | subscription | UDP | event delivery and acknowledgment |
//! | control | UNIX stream | administrative commands |

pub mod clock;
pub mod config;
pub mod notify;
pub mod ordmap;
pub mod registry;
pub mod server;
pub mod shared_lock;
pub mod store;
pub mod wire;

pub use config::{ConfigError, ServerConfig};
pub use notify::{NotificationEngine, Outbound};
pub use ordmap::OrderedMap;
pub use registry::event::{EventKind, EventSink, UnitEvent};
pub use registry::UnitRegistry;
pub use server::{AliveServer, ServerError};
pub use store::{Storage, StoreError};
pub use wire::ProtocolError;
