// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Text log of completed metadata fetches.

use super::{io_error, StoreError};
use crate::clock;
use crate::registry::env::EnvironmentSnapshot;
use crate::registry::unit::Ping;
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct InfoLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl InfoLog {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One line: time, name, address:reply port, then what was learned.
    pub fn append(
        &self,
        name: &str,
        ping: &Ping,
        env: Option<&EnvironmentSnapshot>,
        now: u32,
    ) -> Result<(), StoreError> {
        let detail = match env {
            Some(env) => format!("{} vars os={}", env.vars.len(), env.os.name()),
            None => "no metadata".to_string(),
        };
        let line = format!(
            "{} {} {}:{} {}\n",
            clock::format_time(now),
            name,
            ping.address,
            ping.reply_port,
            detail
        );

        let _guard = self.lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_error(&self.path))?;
        file.write_all(line.as_bytes()).map_err(io_error(&self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    #[test]
    fn test_append_lines() {
        let tmp = TempDir::new().unwrap();
        let log = InfoLog::open(&tmp.path().join("sub/info.log")).unwrap();
        let ping = Ping {
            address: Ipv4Addr::new(10, 0, 0, 9),
            origin_port: 1,
            version: 5,
            heartbeat: 1,
            period: 15,
            incarnation: 1,
            boot_time: 1,
            timestamp: 1,
            reply_port: 7011,
            user_msg: 0,
        };
        log.append("ioc9", &ping, None, 1_800_000_000).unwrap();
        log.append("ioc9", &ping, Some(&EnvironmentSnapshot::default()), 1_800_000_001)
            .unwrap();

        let text = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("ioc9 10.0.0.9:7011 no metadata"));
        assert!(lines[1].ends_with("0 vars os=generic"));
    }
}
