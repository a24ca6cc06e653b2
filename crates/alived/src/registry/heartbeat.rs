// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Heartbeat datagram codec.
//!
//! ```text
//! +-------------+-------------+-----------------+-----------------+
//! | magic (4)   | version (2) | incarnation (4) | sender clock (4)|
//! +-------------+-------------+-----------------+-----------------+
//! | heartbeat (4) | [period (2), v5+] | flags (2) | reply port (2) |
//! +---------------+-------------------+-----------+----------------+
//! | user message (4) | name ... NUL |
//! +------------------+--------------+
//! ```
//!
//! Big-endian throughout. Clock fields count seconds from 1990-01-01.

use super::unit::Ping;
use crate::clock::SENDER_EPOCH_OFFSET;
use crate::wire::ProtocolError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::net::SocketAddrV4;

pub const HEARTBEAT_MAGIC: u32 = 0x1234_5678;
pub const MIN_VERSION: u16 = 4;
pub const MAX_VERSION: u16 = 5;
/// Period assumed for senders older than version 5.
pub const DEFAULT_PERIOD: u16 = 15;
pub const MAX_NAME_LEN: usize = 63;

const FLAG_DISTRUST_ENV: u16 = 0x0001;
const FLAG_NO_FETCH: u16 = 0x0002;

fn header_len(version: u16) -> usize {
    if version >= 5 {
        28
    } else {
        26
    }
}

/// Heartbeat fields as sent, before interpretation against the local clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatPacket {
    pub version: u16,
    /// Boot generation id, Unix seconds.
    pub incarnation: u32,
    /// Sender's clock at transmission, Unix seconds.
    pub sender_clock: u32,
    pub heartbeat: u32,
    pub period: u16,
    pub flags: u16,
    pub reply_port: u16,
    pub user_msg: u32,
    pub name: String,
}

/// Behaviour requested by the sender through the flags word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatFlags {
    /// Cached metadata must be discarded.
    pub distrust_env: bool,
    /// Metadata must not be fetched.
    pub no_fetch: bool,
}

/// A heartbeat resolved against its source address and the receive time.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub name: String,
    pub ping: Ping,
    pub flags: HeartbeatFlags,
}

impl HeartbeatPacket {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Cursor::new(buf);
        let magic = r.read_u32::<BigEndian>()?;
        if magic != HEARTBEAT_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        let version = r.read_u16::<BigEndian>()?;
        if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
            return Err(ProtocolError::BadVersion(version));
        }

        let header = header_len(version);
        if buf.len() < header + 2 {
            return Err(ProtocolError::Truncated);
        }
        if buf.last() != Some(&0) {
            return Err(ProtocolError::Malformed("name is not NUL-terminated".into()));
        }

        let incarnation = r.read_u32::<BigEndian>()?.wrapping_add(SENDER_EPOCH_OFFSET);
        let sender_clock = r.read_u32::<BigEndian>()?.wrapping_add(SENDER_EPOCH_OFFSET);
        let heartbeat = r.read_u32::<BigEndian>()?;
        let period = if version >= 5 {
            r.read_u16::<BigEndian>()?
        } else {
            DEFAULT_PERIOD
        };
        let flags = r.read_u16::<BigEndian>()?;
        let reply_port = r.read_u16::<BigEndian>()?;
        let user_msg = r.read_u32::<BigEndian>()?;

        let raw = &buf[header..];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        let raw = &raw[..end.min(MAX_NAME_LEN)];
        if raw.is_empty() {
            return Err(ProtocolError::Malformed("empty unit name".into()));
        }

        Ok(Self {
            version,
            incarnation,
            sender_clock,
            heartbeat,
            period,
            flags,
            reply_port,
            user_msg,
            name: String::from_utf8_lossy(raw).into_owned(),
        })
    }

    /// Encode as a sender would.
    pub fn encode(&self) -> Vec<u8> {
        let name = &self.name.as_bytes()[..self.name.len().min(MAX_NAME_LEN)];
        let mut buf = Vec::with_capacity(header_len(self.version) + name.len() + 1);
        // Writes into a Vec cannot fail.
        let _ = self.write_header(&mut buf);
        buf.extend_from_slice(name);
        buf.push(0);
        buf
    }

    fn write_header(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_u32::<BigEndian>(HEARTBEAT_MAGIC)?;
        buf.write_u16::<BigEndian>(self.version)?;
        buf.write_u32::<BigEndian>(self.incarnation.wrapping_sub(SENDER_EPOCH_OFFSET))?;
        buf.write_u32::<BigEndian>(self.sender_clock.wrapping_sub(SENDER_EPOCH_OFFSET))?;
        buf.write_u32::<BigEndian>(self.heartbeat)?;
        if self.version >= 5 {
            buf.write_u16::<BigEndian>(self.period)?;
        }
        buf.write_u16::<BigEndian>(self.flags)?;
        buf.write_u16::<BigEndian>(self.reply_port)?;
        buf.write_u32::<BigEndian>(self.user_msg)
    }

    pub fn flags(&self) -> HeartbeatFlags {
        HeartbeatFlags {
            distrust_env: self.flags & FLAG_DISTRUST_ENV != 0,
            no_fetch: self.flags & FLAG_NO_FETCH != 0,
        }
    }

    /// Resolve against the source address and local receive time.
    ///
    /// Boot time is the local clock minus the sender's reported uptime.
    pub fn into_heartbeat(self, source: SocketAddrV4, now: u32) -> Heartbeat {
        let uptime = self.sender_clock.wrapping_sub(self.incarnation);
        let flags = self.flags();
        Heartbeat {
            ping: Ping {
                address: *source.ip(),
                origin_port: source.port(),
                version: self.version,
                heartbeat: self.heartbeat,
                period: self.period,
                incarnation: self.incarnation,
                boot_time: now.wrapping_sub(uptime),
                timestamp: now,
                reply_port: self.reply_port,
                user_msg: self.user_msg,
            },
            name: self.name,
            flags,
        }
    }
}

impl Heartbeat {
    pub fn decode(buf: &[u8], source: SocketAddrV4, now: u32) -> Result<Self, ProtocolError> {
        HeartbeatPacket::decode(buf).map(|p| p.into_heartbeat(source, now))
    }
}
