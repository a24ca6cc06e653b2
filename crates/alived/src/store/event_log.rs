// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event history.
//!
//! Each unit gets an append-only file of fixed 16-byte records
//! (time, address, user message, event code; little-endian `u32`s).
//! All events also go to one shared text log, one line each.

use super::{file_name_for, io_error, StoreError};
use crate::clock;
use crate::registry::event::UnitEvent;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

pub const EVENT_RECORD_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub time: u32,
    pub address: Ipv4Addr,
    pub user_msg: u32,
    /// Event kind code; see `EventKind::from_code`.
    pub kind: u32,
}

impl EventRecord {
    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.time)?;
        w.write_u32::<LittleEndian>(u32::from(self.address))?;
        w.write_u32::<LittleEndian>(self.user_msg)?;
        w.write_u32::<LittleEndian>(self.kind)
    }

    pub fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            time: r.read_u32::<LittleEndian>()?,
            address: Ipv4Addr::from(r.read_u32::<LittleEndian>()?),
            user_msg: r.read_u32::<LittleEndian>()?,
            kind: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// Read every complete record of a per-unit event file.
pub fn read_records(path: &Path) -> Result<Vec<EventRecord>, StoreError> {
    let file = File::open(path).map_err(io_error(path))?;
    let len = file.metadata().map_err(io_error(path))?.len() as usize;
    let mut reader = BufReader::new(file);
    let mut records = Vec::with_capacity(len / EVENT_RECORD_LEN);
    for _ in 0..len / EVENT_RECORD_LEN {
        records.push(EventRecord::read(&mut reader).map_err(io_error(path))?);
    }
    Ok(records)
}

#[derive(Debug)]
pub struct EventLog {
    dir: PathBuf,
    text_path: PathBuf,
    // Serialises appends so that text lines never interleave.
    lock: Mutex<()>,
}

impl EventLog {
    pub fn open(dir: &Path, text_path: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(io_error(dir))?;
        if let Some(parent) = text_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            text_path: text_path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(file_name_for(name))
    }

    pub fn text_path(&self) -> &Path {
        &self.text_path
    }

    pub fn append(&self, event: &UnitEvent) -> Result<(), StoreError> {
        let record = EventRecord {
            time: event.time,
            address: event.ping.address,
            user_msg: event.ping.user_msg,
            kind: u32::from(event.kind.code()),
        };
        let line = format!(
            "{} {} {} {} {}\n",
            clock::format_time(event.time),
            event.name,
            event.kind,
            event.ping.address,
            event.ping.user_msg
        );

        let _guard = self.lock.lock();

        let path = self.path_for(&event.name);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_error(&path))?;
        let mut buf = Vec::with_capacity(EVENT_RECORD_LEN);
        record.write(&mut buf).map_err(io_error(&path))?;
        file.write_all(&buf).map_err(io_error(&path))?;

        let mut text = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.text_path)
            .map_err(io_error(&self.text_path))?;
        text.write_all(line.as_bytes())
            .map_err(io_error(&self.text_path))?;
        Ok(())
    }

    pub fn records(&self, name: &str) -> Result<Vec<EventRecord>, StoreError> {
        read_records(&self.path_for(name))
    }

    /// Raw contents of the shared text log; empty if it does not exist yet.
    pub fn text_contents(&self) -> Result<Vec<u8>, StoreError> {
        let _guard = self.lock.lock();
        match fs::read(&self.text_path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(io_error(&self.text_path)(e)),
        }
    }

    pub fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.path_for(name);
        let _guard = self.lock.lock();
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path)(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::event::EventKind;
    use crate::registry::unit::Ping;
    use tempfile::TempDir;

    fn event(kind: EventKind, time: u32) -> UnitEvent {
        UnitEvent {
            name: "ioc1".into(),
            kind,
            ping: Ping {
                address: Ipv4Addr::new(10, 1, 2, 3),
                origin_port: 5000,
                version: 5,
                heartbeat: 1,
                period: 15,
                incarnation: 1,
                boot_time: 1,
                timestamp: time,
                reply_port: 0,
                user_msg: 4,
            },
            env: None,
            time,
        }
    }

    #[test]
    fn test_append_writes_records_and_text() {
        let tmp = TempDir::new().unwrap();
        let log = EventLog::open(&tmp.path().join("events"), &tmp.path().join("events.txt"))
            .unwrap();

        log.append(&event(EventKind::Boot, 1_800_000_000)).unwrap();
        log.append(&event(EventKind::Fail, 1_800_000_100)).unwrap();

        let raw = fs::read(log.path_for("ioc1")).unwrap();
        assert_eq!(raw.len(), 2 * EVENT_RECORD_LEN);

        let records = log.records("ioc1").unwrap();
        assert_eq!(records[0].kind, u32::from(EventKind::Boot.code()));
        assert_eq!(records[1].time, 1_800_000_100);
        assert_eq!(records[1].address, Ipv4Addr::new(10, 1, 2, 3));

        let text = String::from_utf8(log.text_contents().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("ioc1 BOOT 10.1.2.3 4"));
        assert!(lines[1].contains(" FAIL "));
    }

    #[test]
    fn test_partial_trailing_record_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let log = EventLog::open(tmp.path(), &tmp.path().join("t.txt")).unwrap();
        log.append(&event(EventKind::Boot, 5)).unwrap();
        let mut f = OpenOptions::new()
            .append(true)
            .open(log.path_for("ioc1"))
            .unwrap();
        f.write_all(&[1, 2, 3]).unwrap();
        assert_eq!(log.records("ioc1").unwrap().len(), 1);
    }

    #[test]
    fn test_missing_text_log_reads_empty() {
        let tmp = TempDir::new().unwrap();
        let log = EventLog::open(tmp.path(), &tmp.path().join("none.txt")).unwrap();
        assert!(log.text_contents().unwrap().is_empty());
        assert!(!log.remove("nobody").unwrap());
    }
}
