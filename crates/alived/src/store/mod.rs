// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! On-disk artifacts: per-unit state files, event logs, the info log and
//! CSV archives.

pub mod archive;
pub mod event_log;
pub mod info_log;
pub mod state;

pub use archive::write_archive;
pub use event_log::{EventLog, EventRecord, EVENT_RECORD_LEN};
pub use info_log::InfoLog;
pub use state::StateStore;

use crate::config::ServerConfig;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt record in {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

pub(crate) fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// File name for a unit.
///
/// Unit names arrive from the network; anything outside `[A-Za-z0-9_.:-]`
/// is percent-escaped and a leading dot is escaped too, so a name can never
/// leave its directory.
pub fn file_name_for(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, b) in name.bytes().enumerate() {
        let plain = b.is_ascii_alphanumeric() || matches!(b, b'_' | b':' | b'-' | b'.');
        if plain && !(i == 0 && b == b'.') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Everything the registry writes to disk.
#[derive(Debug)]
pub struct Storage {
    pub state: StateStore,
    pub events: EventLog,
    pub info: InfoLog,
}

impl Storage {
    /// Open (creating directories as needed) the locations named in `config`.
    pub fn open(config: &ServerConfig) -> Result<Self, StoreError> {
        Ok(Self {
            state: StateStore::open(&config.state_dir)?,
            events: EventLog::open(&config.event_dir, &config.event_file)?,
            info: InfoLog::open(&config.info_file)?,
        })
    }

    /// Drop every artifact belonging to `name`.
    pub fn forget(&self, name: &str) -> Result<(), StoreError> {
        self.state.remove(name)?;
        self.events.remove(name)?;
        Ok(())
    }
}
