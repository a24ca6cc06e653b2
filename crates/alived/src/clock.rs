// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wall-clock helpers. Protocol times are `u32` Unix seconds.

use chrono::{Local, TimeZone};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between 1970-01-01 and 1990-01-01, the epoch of heartbeat clocks.
pub const SENDER_EPOCH_OFFSET: u32 = 631_152_000;

/// Current time in Unix seconds.
pub fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Local time formatted for logs and operator output.
pub fn format_time(secs: u32) -> String {
    match Local.timestamp_opt(i64::from(secs), 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => secs.to_string(),
    }
}

/// `1d 02:03:04` style duration.
pub fn format_duration(secs: u32) -> String {
    let days = secs / 86_400;
    let rem = secs % 86_400;
    format!(
        "{}d {:02}:{:02}:{:02}",
        days,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}
