// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-unit state files.
//!
//! ```text
//! +------------+--------------+-----------------+------------+
//! | status (1) | reserved (3) | name (1+n)      | period (2) |
//! +------------+--------------+-----------------+------------+
//! | address (4) | origin port (2) | incarnation (4) | boot (4) |
//! +-------------+-----------------+-----------------+----------+
//! | reply port (2) | env block (1 + ...) |
//! +----------------+---------------------+
//! ```
//!
//! Little-endian. The status byte sits at offset 0 so that a status change
//! rewrites a single byte in place.

use super::{file_name_for, io_error, StoreError};
use crate::registry::env::{read_env_block, write_env_block, EnvForm};
use crate::registry::unit::{Incarnation, InstanceStatus, Ping};
use crate::wire::{ReadStrExt, WriteStrExt};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, OpenOptions};
use std::io::{self, Cursor, Seek, SeekFrom, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

/// Serialize one state record.
pub fn encode_record(name: &str, inc: &Incarnation) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    buf.write_u8(inc.status.code())?;
    buf.write_all(&[0u8; 3])?;
    buf.write_str8(name)?;
    buf.write_u16::<LittleEndian>(inc.ping.period)?;
    buf.write_u32::<LittleEndian>(u32::from(inc.ping.address))?;
    buf.write_u16::<LittleEndian>(inc.ping.origin_port)?;
    buf.write_u32::<LittleEndian>(inc.ping.incarnation)?;
    buf.write_u32::<LittleEndian>(inc.ping.boot_time)?;
    buf.write_u16::<LittleEndian>(inc.ping.reply_port)?;
    write_env_block::<LittleEndian, _>(&mut buf, inc.env.as_deref(), EnvForm::Storage)?;
    Ok(buf)
}

/// Parse one state record. Counters and timestamps are not stored and
/// come back as zero.
pub fn decode_record(bytes: &[u8]) -> io::Result<(String, Incarnation)> {
    let mut r = Cursor::new(bytes);
    let code = r.read_u8()?;
    let status = InstanceStatus::from_code(code).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, format!("bad status {}", code))
    })?;
    let mut reserved = [0u8; 3];
    io::Read::read_exact(&mut r, &mut reserved)?;
    let name = r.read_str8()?;
    let period = r.read_u16::<LittleEndian>()?;
    let address = Ipv4Addr::from(r.read_u32::<LittleEndian>()?);
    let origin_port = r.read_u16::<LittleEndian>()?;
    let incarnation = r.read_u32::<LittleEndian>()?;
    let boot_time = r.read_u32::<LittleEndian>()?;
    let reply_port = r.read_u16::<LittleEndian>()?;
    let env = read_env_block::<LittleEndian, _>(&mut r, EnvForm::Storage)?;

    Ok((
        name,
        Incarnation {
            status,
            ping: Ping {
                address,
                origin_port,
                version: 0,
                heartbeat: 0,
                period,
                incarnation,
                boot_time,
                timestamp: 0,
                reply_port,
                user_msg: 0,
            },
            env: env.map(Arc::new),
        },
    ))
}

impl StateStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir).map_err(io_error(dir))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(file_name_for(name))
    }

    /// Replace the whole record for `name`.
    pub fn write_full(&self, name: &str, inc: &Incarnation) -> Result<(), StoreError> {
        let path = self.path_for(name);
        let bytes = encode_record(name, inc).map_err(io_error(&path))?;
        let tmp = self.dir.join(format!(".{}.tmp", file_name_for(name)));
        fs::write(&tmp, &bytes).map_err(io_error(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_error(&path))?;
        debug!("state of {} written ({} bytes)", name, bytes.len());
        Ok(())
    }

    /// Rewrite only the status byte of an existing record.
    pub fn write_status(&self, name: &str, status: InstanceStatus) -> Result<(), StoreError> {
        let path = self.path_for(name);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(io_error(&path))?;
        file.seek(SeekFrom::Start(0)).map_err(io_error(&path))?;
        file.write_all(&[status.code()]).map_err(io_error(&path))?;
        Ok(())
    }

    pub fn read(&self, name: &str) -> Result<(String, Incarnation), StoreError> {
        let path = self.path_for(name);
        let bytes = fs::read(&path).map_err(io_error(&path))?;
        decode_record(&bytes).map_err(|e| StoreError::Corrupt {
            path,
            reason: e.to_string(),
        })
    }

    /// Returns whether a file was removed.
    pub fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.path_for(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    /// Every readable record in the directory. Hidden files (including
    /// in-progress writes) are skipped; corrupt ones are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<(String, Incarnation)>, StoreError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_error(&self.dir))? {
            let entry = entry.map_err(io_error(&self.dir))?;
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if hidden || !path.is_file() {
                continue;
            }
            match fs::read(&path).map(|bytes| decode_record(&bytes)) {
                Ok(Ok(record)) => records.push(record),
                Ok(Err(e)) => warn!("skipping corrupt state file {:?}: {}", path, e),
                Err(e) => warn!("cannot read state file {:?}: {}", path, e),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::env::{EnvironmentSnapshot, OsInfo, UnixInfo};
    use tempfile::TempDir;

    fn incarnation() -> Incarnation {
        Incarnation {
            status: InstanceStatus::Up,
            ping: Ping {
                address: Ipv4Addr::new(192, 168, 1, 20),
                origin_port: 5065,
                version: 5,
                heartbeat: 77,
                period: 15,
                incarnation: 1_700_000_000,
                boot_time: 1_700_000_010,
                timestamp: 1_700_001_000,
                reply_port: 40000,
                user_msg: 2,
            },
            env: Some(Arc::new(EnvironmentSnapshot {
                vars: vec![("ARCH".into(), "linux-x86_64".into())],
                os: OsInfo::Linux(UnixInfo {
                    user: "softioc".into(),
                    group: "epics".into(),
                    hostname: "srv7".into(),
                }),
            })),
        }
    }

    #[test]
    fn test_write_and_reload() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        store.write_full("ioc1", &incarnation()).unwrap();

        let records = store.load_all().unwrap();
        assert_eq!(records.len(), 1);
        let (name, inc) = &records[0];
        assert_eq!(name, "ioc1");
        assert_eq!(inc.status, InstanceStatus::Up);
        assert_eq!(inc.ping.address, Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(inc.ping.boot_time, 1_700_000_010);
        assert_eq!(inc.ping.heartbeat, 0);
        assert_eq!(inc.ping.timestamp, 0);
        assert_eq!(inc.env.as_deref(), incarnation().env.as_deref());
    }

    #[test]
    fn test_status_rewrite_touches_first_byte_only() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        store.write_full("ioc1", &incarnation()).unwrap();
        let before = fs::read(store.path_for("ioc1")).unwrap();

        store.write_status("ioc1", InstanceStatus::Down).unwrap();
        let after = fs::read(store.path_for("ioc1")).unwrap();
        assert_eq!(after[0], InstanceStatus::Down.code());
        assert_eq!(before[1..], after[1..]);

        let (_, inc) = store.read("ioc1").unwrap();
        assert_eq!(inc.status, InstanceStatus::Down);
    }

    #[test]
    fn test_status_rewrite_of_missing_record_fails() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        assert!(matches!(
            store.write_status("ghost", InstanceStatus::Down),
            Err(StoreError::Io { .. })
        ));
    }

    #[test]
    fn test_corrupt_files_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        store.write_full("good", &incarnation()).unwrap();
        fs::write(tmp.path().join("bad"), [9u8, 0, 0]).unwrap();
        fs::write(tmp.path().join(".hidden"), b"x").unwrap();

        let records = store.load_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "good");
    }

    #[test]
    fn test_remove() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        store.write_full("ioc1", &incarnation()).unwrap();
        assert!(store.remove("ioc1").unwrap());
        assert!(!store.remove("ioc1").unwrap());
    }
}
