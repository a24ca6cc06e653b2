// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscription wire format.
//!
//! Every datagram starts with the same big-endian envelope:
//!
//! ```text
//! +-----------+-------------+----------+-----------------+---------
//! | magic u32 | version u16 | code u16 | incarnation u32 | body ...
//! +-----------+-------------+----------+-----------------+---------
//! ```
//!
//! The incarnation is always the subscriber's own; outbound events are
//! stamped per subscriber at [`INCARNATION_OFFSET`].

use crate::registry::env::{read_env_block, write_env_block, EnvForm, EnvironmentSnapshot};
use crate::registry::event::{EventKind, UnitEvent};
use crate::wire::{ProtocolError, ReadStrExt, WriteStrExt};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor};
use std::net::Ipv4Addr;

pub const SUBSCRIPTION_MAGIC: u32 = 0x0867_5309;
pub const PROTOCOL_VERSION: u16 = 1;

pub const CODE_SUBSCRIBE: u16 = 1;
pub const CODE_SUBSCRIBE_ACK: u16 = 2;
pub const CODE_CONFIRM: u16 = 3;
pub const CODE_EVENT: u16 = 6;
pub const CODE_EVENT_ACK: u16 = 7;
pub const CODE_EVENT_ACK_REPLY: u16 = 8;
pub const CODE_HEARTBEAT_ACK: u16 = 11;
pub const CODE_HEARTBEAT_ACK_REPLY: u16 = 12;

pub const ENVELOPE_LEN: usize = 12;
pub const INCARNATION_OFFSET: usize = 8;

/// Inbound subscriber request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Subscribe { incarnation: u32 },
    Confirm { incarnation: u32 },
    EventAck { incarnation: u32, event_id: u32 },
    HeartbeatAck { incarnation: u32 },
}

/// Decoded envelope of any datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub code: u16,
    pub incarnation: u32,
}

impl Envelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENVELOPE_LEN);
        buf.extend_from_slice(&SUBSCRIPTION_MAGIC.to_be_bytes());
        buf.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        buf.extend_from_slice(&self.code.to_be_bytes());
        buf.extend_from_slice(&self.incarnation.to_be_bytes());
        buf
    }

    /// Check magic and version; returns the envelope and the body.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if buf.len() < ENVELOPE_LEN {
            return Err(ProtocolError::Truncated);
        }
        let magic = BigEndian::read_u32(&buf[0..4]);
        if magic != SUBSCRIPTION_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        let version = BigEndian::read_u16(&buf[4..6]);
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::BadVersion(version));
        }
        let envelope = Self {
            code: BigEndian::read_u16(&buf[6..8]),
            incarnation: BigEndian::read_u32(&buf[8..12]),
        };
        Ok((envelope, &buf[ENVELOPE_LEN..]))
    }
}

impl Request {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (env, body) = Envelope::decode(buf)?;
        let incarnation = env.incarnation;
        Ok(match env.code {
            CODE_SUBSCRIBE => Request::Subscribe { incarnation },
            CODE_CONFIRM => Request::Confirm { incarnation },
            CODE_EVENT_ACK => {
                if body.len() < 4 {
                    return Err(ProtocolError::Truncated);
                }
                Request::EventAck {
                    incarnation,
                    event_id: BigEndian::read_u32(&body[..4]),
                }
            }
            CODE_HEARTBEAT_ACK => Request::HeartbeatAck { incarnation },
            other => return Err(ProtocolError::UnknownRequest(other)),
        })
    }

    /// Encode as a subscriber would.
    pub fn encode(&self) -> Vec<u8> {
        let (code, incarnation, event_id) = match *self {
            Request::Subscribe { incarnation } => (CODE_SUBSCRIBE, incarnation, None),
            Request::Confirm { incarnation } => (CODE_CONFIRM, incarnation, None),
            Request::EventAck {
                incarnation,
                event_id,
            } => (CODE_EVENT_ACK, incarnation, Some(event_id)),
            Request::HeartbeatAck { incarnation } => (CODE_HEARTBEAT_ACK, incarnation, None),
        };
        let mut buf = Envelope { code, incarnation }.encode();
        if let Some(id) = event_id {
            buf.extend_from_slice(&id.to_be_bytes());
        }
        buf
    }

    pub fn incarnation(&self) -> u32 {
        match *self {
            Request::Subscribe { incarnation }
            | Request::Confirm { incarnation }
            | Request::EventAck { incarnation, .. }
            | Request::HeartbeatAck { incarnation } => incarnation,
        }
    }
}

pub fn subscribe_ack(incarnation: u32) -> Vec<u8> {
    Envelope {
        code: CODE_SUBSCRIBE_ACK,
        incarnation,
    }
    .encode()
}

pub fn event_ack_reply(incarnation: u32, event_id: u32) -> Vec<u8> {
    let mut buf = Envelope {
        code: CODE_EVENT_ACK_REPLY,
        incarnation,
    }
    .encode();
    buf.extend_from_slice(&event_id.to_be_bytes());
    buf
}

pub fn heartbeat_ack_reply(incarnation: u32) -> Vec<u8> {
    Envelope {
        code: CODE_HEARTBEAT_ACK_REPLY,
        incarnation,
    }
    .encode()
}

/// Event datagram with a zero incarnation, to be stamped per subscriber.
pub fn encode_event(event_id: u32, event: &UnitEvent) -> io::Result<Vec<u8>> {
    let mut buf = Envelope {
        code: CODE_EVENT,
        incarnation: 0,
    }
    .encode();
    buf.write_u32::<BigEndian>(event_id)?;
    buf.write_u8(event.kind.code())?;
    buf.write_str8(&event.name)?;
    buf.write_u32::<BigEndian>(u32::from(event.ping.address))?;
    buf.write_u32::<BigEndian>(event.ping.user_msg)?;
    buf.write_u32::<BigEndian>(event.time)?;
    write_env_block::<BigEndian, _>(&mut buf, event.env.as_deref(), EnvForm::Wire)?;
    Ok(buf)
}

pub fn stamp(payload: &mut [u8], incarnation: u32) {
    if payload.len() >= ENVELOPE_LEN {
        BigEndian::write_u32(
            &mut payload[INCARNATION_OFFSET..INCARNATION_OFFSET + 4],
            incarnation,
        );
    }
}

/// Event as seen by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNotice {
    pub incarnation: u32,
    pub event_id: u32,
    pub kind: EventKind,
    pub name: String,
    pub address: Ipv4Addr,
    pub user_msg: u32,
    pub time: u32,
    pub env: Option<EnvironmentSnapshot>,
}

impl EventNotice {
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let (env, body) = Envelope::decode(buf)?;
        if env.code != CODE_EVENT {
            return Err(ProtocolError::UnknownRequest(env.code));
        }
        let mut r = Cursor::new(body);
        let event_id = r.read_u32::<BigEndian>()?;
        let code = r.read_u8()?;
        let kind = EventKind::from_code(u32::from(code))
            .ok_or_else(|| ProtocolError::Malformed(format!("event kind {}", code)))?;
        Ok(Self {
            incarnation: env.incarnation,
            event_id,
            kind,
            name: r.read_str8()?,
            address: Ipv4Addr::from(r.read_u32::<BigEndian>()?),
            user_msg: r.read_u32::<BigEndian>()?,
            time: r.read_u32::<BigEndian>()?,
            env: read_env_block::<BigEndian, _>(&mut r, EnvForm::Wire)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::env::{OsInfo, VxWorksInfo};
    use crate::registry::unit::Ping;
    use std::sync::Arc;

    #[test]
    fn test_request_decoding() {
        let sub = Request::Subscribe { incarnation: 77 }.encode();
        assert_eq!(sub.len(), 12);
        assert_eq!(&sub[..4], &[0x08, 0x67, 0x53, 0x09]);
        assert_eq!(Request::decode(&sub).unwrap(), Request::Subscribe { incarnation: 77 });

        let ack = Request::EventAck {
            incarnation: 77,
            event_id: 9,
        }
        .encode();
        assert_eq!(ack.len(), 16);
        assert_eq!(
            Request::decode(&ack).unwrap(),
            Request::EventAck {
                incarnation: 77,
                event_id: 9
            }
        );
        assert!(matches!(
            Request::decode(&ack[..12]),
            Err(ProtocolError::Truncated)
        ));
    }

    #[test]
    fn test_request_rejections() {
        let mut bad = Request::Confirm { incarnation: 1 }.encode();
        bad[0] = 0;
        assert!(matches!(Request::decode(&bad), Err(ProtocolError::BadMagic(_))));

        let mut old = Request::Confirm { incarnation: 1 }.encode();
        old[5] = 2;
        assert!(matches!(Request::decode(&old), Err(ProtocolError::BadVersion(2))));

        let odd = Envelope {
            code: 99,
            incarnation: 1,
        }
        .encode();
        assert!(matches!(
            Request::decode(&odd),
            Err(ProtocolError::UnknownRequest(99))
        ));
        assert!(matches!(Request::decode(&[0; 11]), Err(ProtocolError::Truncated)));
    }

    #[test]
    fn test_event_payload_layout() {
        let event = UnitEvent {
            name: "ioc1".into(),
            kind: EventKind::Fail,
            ping: Ping {
                address: Ipv4Addr::new(192, 168, 0, 4),
                origin_port: 1,
                version: 5,
                heartbeat: 3,
                period: 15,
                incarnation: 1,
                boot_time: 1,
                timestamp: 1,
                reply_port: 0,
                user_msg: 12,
            },
            env: Some(Arc::new(EnvironmentSnapshot {
                vars: vec![],
                os: OsInfo::VxWorks(VxWorksInfo {
                    boot_host_password: "pw".into(),
                    ..Default::default()
                }),
            })),
            time: 1_800_000_000,
        };
        let mut payload = encode_event(41, &event).unwrap();
        assert_eq!(BigEndian::read_u16(&payload[6..8]), CODE_EVENT);
        assert_eq!(&payload[17..22], b"\x04ioc1");
        assert_eq!(&payload[22..26], &[192, 168, 0, 4]);

        stamp(&mut payload, 0xAABB_CCDD);
        let notice = EventNotice::decode(&payload).unwrap();
        assert_eq!(notice.incarnation, 0xAABB_CCDD);
        assert_eq!(notice.event_id, 41);
        assert_eq!(notice.kind, EventKind::Fail);
        assert_eq!(notice.name, "ioc1");
        assert_eq!(notice.user_msg, 12);
        assert_eq!(notice.time, 1_800_000_000);
        match notice.env.unwrap().os {
            OsInfo::VxWorks(vx) => assert!(vx.boot_host_password.is_empty()),
            other => panic!("unexpected os {:?}", other),
        }
    }

    #[test]
    fn test_replies() {
        assert_eq!(subscribe_ack(5).len(), 12);
        assert_eq!(heartbeat_ack_reply(5)[7], 12);
        let reply = event_ack_reply(5, 300);
        assert_eq!(reply.len(), 16);
        assert_eq!(BigEndian::read_u32(&reply[12..]), 300);
    }
}
