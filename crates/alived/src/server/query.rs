// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP query endpoint.
//!
//! One request per connection. The request is a big-endian `u16` type code
//! followed by its arguments; the reply starts with a header and ends when
//! the server closes the connection.
//!
//! ```text
//! request:  type u16 | args ...
//! reply:    version u16 | now u32 | started u32 | body ...
//! ```
//!
//! Unit-targeted bodies are always a `u16` count followed by that many
//! records, so an unknown unit yields an empty list. Requests are served one
//! at a time.

use super::StopSignal;
use crate::clock;
use crate::registry::env::{read_env_block, write_env_block, EnvForm, EnvironmentSnapshot};
use crate::registry::unit::Incarnation;
use crate::registry::view::{UnitDetail, UnitSummary};
use crate::registry::UnitRegistry;
use crate::store::StoreError;
use crate::wire::{ProtocolError, ReadStrExt, WriteStrExt};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

pub const QUERY_VERSION: u16 = 4;

pub const QUERY_ALL: u16 = 1;
pub const QUERY_SUBSET: u16 = 2;
pub const QUERY_SINGLE: u16 = 3;
pub const QUERY_EVENT_LOG: u16 = 15;
pub const QUERY_DETAIL: u16 = 21;
pub const QUERY_CONFLICT: u16 = 22;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query timed out")]
    Timeout,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryRequest {
    All,
    Subset(Vec<String>),
    Single(String),
    EventLog,
    Detail(String),
    Conflict(String),
}

impl QueryRequest {
    pub fn code(&self) -> u16 {
        match self {
            Self::All => QUERY_ALL,
            Self::Subset(_) => QUERY_SUBSET,
            Self::Single(_) => QUERY_SINGLE,
            Self::EventLog => QUERY_EVENT_LOG,
            Self::Detail(_) => QUERY_DETAIL,
            Self::Conflict(_) => QUERY_CONFLICT,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        // Writes into a Vec cannot fail.
        let _ = self.write(&mut buf);
        buf
    }

    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u16::<BigEndian>(self.code())?;
        match self {
            Self::All | Self::EventLog => Ok(()),
            Self::Subset(names) => {
                w.write_u16::<BigEndian>(names.len().min(u16::MAX as usize) as u16)?;
                for name in names.iter().take(u16::MAX as usize) {
                    w.write_str8(name)?;
                }
                Ok(())
            }
            Self::Single(name) | Self::Detail(name) | Self::Conflict(name) => w.write_str8(name),
        }
    }

    /// Read one request from a client stream.
    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, ProtocolError> {
        use tokio::io::AsyncReadExt;

        let code = r.read_u16().await?;
        Ok(match code {
            QUERY_ALL => Self::All,
            QUERY_SUBSET => {
                let count = r.read_u16().await?;
                let mut names = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    names.push(read_name(r).await?);
                }
                Self::Subset(names)
            }
            QUERY_SINGLE => Self::Single(read_name(r).await?),
            QUERY_EVENT_LOG => Self::EventLog,
            QUERY_DETAIL => Self::Detail(read_name(r).await?),
            QUERY_CONFLICT => Self::Conflict(read_name(r).await?),
            other => return Err(ProtocolError::UnknownRequest(other)),
        })
    }
}

async fn read_name<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, ProtocolError> {
    use tokio::io::AsyncReadExt;

    let len = r.read_u8().await?;
    let mut bytes = vec![0u8; len as usize];
    r.read_exact(&mut bytes).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub(crate) async fn run(
    listener: TcpListener,
    registry: Arc<UnitRegistry>,
    timeout: Duration,
    shutdown: Arc<StopSignal>,
) {
    let stop = shutdown.wait();
    tokio::pin!(stop);

    if let Ok(addr) = listener.local_addr() {
        info!("query endpoint listening on {}", addr);
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = serve(stream, &registry, timeout).await {
                        debug!("query from {}: {}", peer, e);
                    }
                }
                Err(e) => debug!("query accept error: {}", e),
            },
            _ = &mut stop => {
                debug!("query endpoint shutting down");
                break;
            }
        }
    }
}

async fn serve(
    mut stream: TcpStream,
    registry: &UnitRegistry,
    timeout: Duration,
) -> Result<(), QueryError> {
    use tokio::io::AsyncWriteExt;

    let request = tokio::time::timeout(timeout, QueryRequest::read(&mut stream))
        .await
        .map_err(|_| QueryError::Timeout)??;
    let reply = encode_reply(registry, &request, clock::now())?;
    tokio::time::timeout(timeout, stream.write_all(&reply))
        .await
        .map_err(|_| QueryError::Timeout)??;
    stream.shutdown().await?;
    Ok(())
}

/// Build the full reply to `request`.
pub fn encode_reply(
    registry: &UnitRegistry,
    request: &QueryRequest,
    now: u32,
) -> Result<Vec<u8>, QueryError> {
    let mut buf = Vec::with_capacity(256);
    buf.write_u16::<BigEndian>(QUERY_VERSION)?;
    buf.write_u32::<BigEndian>(now)?;
    buf.write_u32::<BigEndian>(registry.started())?;

    match request {
        QueryRequest::All => write_summaries(&mut buf, &registry.summaries())?,
        QueryRequest::Subset(names) => write_summaries(&mut buf, &registry.summaries_of(names))?,
        QueryRequest::Single(name) => {
            let found: Vec<UnitSummary> = registry.summary(name).into_iter().collect();
            write_summaries(&mut buf, &found)?;
        }
        QueryRequest::EventLog => {
            if let Some(storage) = registry.storage() {
                buf.extend_from_slice(&storage.events.text_contents()?);
            }
        }
        QueryRequest::Detail(name) => {
            let found: Vec<UnitDetail> = registry.detail(name).into_iter().collect();
            write_details(&mut buf, &found)?;
        }
        QueryRequest::Conflict(name) => {
            let found: Vec<UnitDetail> = registry.conflict_detail(name).into_iter().collect();
            write_details(&mut buf, &found)?;
        }
    }
    Ok(buf)
}

fn write_count<W: Write>(w: &mut W, n: usize) -> io::Result<()> {
    w.write_u16::<BigEndian>(n.min(u16::MAX as usize) as u16)
}

fn write_summary<W: Write>(w: &mut W, s: &UnitSummary) -> io::Result<()> {
    w.write_str8(&s.name)?;
    w.write_u8(s.status.code())?;
    w.write_u32::<BigEndian>(s.time)?;
    w.write_u32::<BigEndian>(u32::from(s.ping.address))?;
    w.write_u32::<BigEndian>(s.ping.user_msg)?;
    write_env_block::<BigEndian, _>(w, s.env.as_deref(), EnvForm::Wire)
}

fn write_summaries<W: Write>(w: &mut W, list: &[UnitSummary]) -> io::Result<()> {
    write_count(w, list.len())?;
    for s in list.iter().take(u16::MAX as usize) {
        write_summary(w, s)?;
    }
    Ok(())
}

fn write_instance<W: Write>(w: &mut W, inc: &Incarnation) -> io::Result<()> {
    let p = &inc.ping;
    w.write_u8(inc.status.code())?;
    w.write_u32::<BigEndian>(u32::from(p.address))?;
    w.write_u16::<BigEndian>(p.origin_port)?;
    w.write_u32::<BigEndian>(p.heartbeat)?;
    w.write_u16::<BigEndian>(p.period)?;
    w.write_u32::<BigEndian>(p.incarnation)?;
    w.write_u32::<BigEndian>(p.boot_time)?;
    w.write_u32::<BigEndian>(p.timestamp)?;
    w.write_u16::<BigEndian>(p.reply_port)?;
    w.write_u32::<BigEndian>(p.user_msg)?;
    write_env_block::<BigEndian, _>(w, inc.env.as_deref(), EnvForm::Wire)
}

fn write_details<W: Write>(w: &mut W, list: &[UnitDetail]) -> io::Result<()> {
    write_count(w, list.len())?;
    for d in list.iter().take(u16::MAX as usize) {
        write_summary(w, &d.summary)?;
        w.write_u32::<BigEndian>(d.instances.len() as u32)?;
        for inc in &d.instances {
            write_instance(w, inc)?;
        }
    }
    Ok(())
}

/// Reply header as decoded by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub version: u16,
    pub now: u32,
    pub started: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryRecord {
    pub name: String,
    pub status: u8,
    pub time: u32,
    pub address: Ipv4Addr,
    pub user_msg: u32,
    pub env: Option<EnvironmentSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub status: u8,
    pub address: Ipv4Addr,
    pub origin_port: u16,
    pub heartbeat: u32,
    pub period: u16,
    pub incarnation: u32,
    pub boot_time: u32,
    pub timestamp: u32,
    pub reply_port: u16,
    pub user_msg: u32,
    pub env: Option<EnvironmentSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Summaries(Vec<SummaryRecord>),
    Details(Vec<(SummaryRecord, Vec<InstanceRecord>)>),
    EventLog(Vec<u8>),
}

/// Decode a complete reply to `request`.
pub fn decode_reply(
    request: &QueryRequest,
    buf: &[u8],
) -> Result<(ReplyHeader, ReplyBody), ProtocolError> {
    let mut r = Cursor::new(buf);
    let header = ReplyHeader {
        version: r.read_u16::<BigEndian>()?,
        now: r.read_u32::<BigEndian>()?,
        started: r.read_u32::<BigEndian>()?,
    };
    if header.version != QUERY_VERSION {
        return Err(ProtocolError::BadVersion(header.version));
    }

    let body = match request {
        QueryRequest::All | QueryRequest::Subset(_) | QueryRequest::Single(_) => {
            let count = r.read_u16::<BigEndian>()?;
            let mut list = Vec::with_capacity(count as usize);
            for _ in 0..count {
                list.push(read_summary(&mut r)?);
            }
            ReplyBody::Summaries(list)
        }
        QueryRequest::EventLog => {
            let mut text = Vec::new();
            r.read_to_end(&mut text)?;
            ReplyBody::EventLog(text)
        }
        QueryRequest::Detail(_) | QueryRequest::Conflict(_) => {
            let count = r.read_u16::<BigEndian>()?;
            let mut list = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let summary = read_summary(&mut r)?;
                let n = r.read_u32::<BigEndian>()?;
                let mut instances = Vec::new();
                for _ in 0..n {
                    instances.push(read_instance(&mut r)?);
                }
                list.push((summary, instances));
            }
            ReplyBody::Details(list)
        }
    };
    Ok((header, body))
}

fn read_summary<R: Read>(r: &mut R) -> io::Result<SummaryRecord> {
    Ok(SummaryRecord {
        name: r.read_str8()?,
        status: r.read_u8()?,
        time: r.read_u32::<BigEndian>()?,
        address: Ipv4Addr::from(r.read_u32::<BigEndian>()?),
        user_msg: r.read_u32::<BigEndian>()?,
        env: read_env_block::<BigEndian, _>(r, EnvForm::Wire)?,
    })
}

fn read_instance<R: Read>(r: &mut R) -> io::Result<InstanceRecord> {
    Ok(InstanceRecord {
        status: r.read_u8()?,
        address: Ipv4Addr::from(r.read_u32::<BigEndian>()?),
        origin_port: r.read_u16::<BigEndian>()?,
        heartbeat: r.read_u32::<BigEndian>()?,
        period: r.read_u16::<BigEndian>()?,
        incarnation: r.read_u32::<BigEndian>()?,
        boot_time: r.read_u32::<BigEndian>()?,
        timestamp: r.read_u32::<BigEndian>()?,
        reply_port: r.read_u16::<BigEndian>()?,
        user_msg: r.read_u32::<BigEndian>()?,
        env: read_env_block::<BigEndian, _>(r, EnvForm::Wire)?,
    })
}
