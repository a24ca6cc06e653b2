// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Metadata fetch from a unit's reply port.
//!
//! The unit accepts a TCP connection, writes one reply and closes:
//!
//! ```text
//! +-------------+-------------+------------+----------------+-----------+
//! | version u16 | os type u16 | length u32 | attributes ... | os fields |
//! +-------------+-------------+------------+----------------+-----------+
//! ```
//!
//! Big-endian; `length` covers the whole reply.

use super::env::{read_vars, EnvForm, EnvironmentSnapshot, OsInfo};
use crate::wire::ProtocolError;
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;
use std::net::SocketAddrV4;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

/// Largest reply accepted; anything longer is rejected as oversized.
pub const MAX_REPLY_LEN: usize = 10_000;

/// Header plus an empty attribute list.
const MIN_REPLY_LEN: usize = 10;
const MIN_VERSION: u16 = 4;
const MAX_VERSION: u16 = 5;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddrV4,
        #[source]
        source: std::io::Error,
    },

    #[error("read from {0} failed: {1}")]
    Read(SocketAddrV4, #[source] std::io::Error),

    #[error("no complete reply from {0} within the timeout")]
    Timeout(SocketAddrV4),

    #[error("reply of {0} bytes exceeds the limit")]
    Oversized(usize),

    #[error("reply length field {declared} does not match {actual} bytes read")]
    LengthMismatch { declared: u32, actual: usize },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Connect to `addr`, read the reply to EOF and decode it.
pub async fn fetch_metadata(
    addr: SocketAddrV4,
    timeout: Duration,
) -> Result<EnvironmentSnapshot, FetchError> {
    use tokio::io::AsyncReadExt;

    let exchange = async {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| FetchError::Connect { addr, source })?;
        let mut buf = Vec::with_capacity(1024);
        stream
            .take(MAX_REPLY_LEN as u64 + 1)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| FetchError::Read(addr, e))?;
        Ok::<_, FetchError>(buf)
    };
    let buf = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| FetchError::Timeout(addr))??;
    decode_metadata(&buf)
}

/// Decode a complete reply.
pub fn decode_metadata(buf: &[u8]) -> Result<EnvironmentSnapshot, FetchError> {
    if buf.len() > MAX_REPLY_LEN {
        return Err(FetchError::Oversized(buf.len()));
    }
    if buf.len() < MIN_REPLY_LEN {
        return Err(ProtocolError::Truncated.into());
    }
    let mut r = Cursor::new(buf);
    let version = r.read_u16::<BigEndian>().map_err(ProtocolError::from)?;
    if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
        return Err(ProtocolError::BadVersion(version).into());
    }
    let os_type = r.read_u16::<BigEndian>().map_err(ProtocolError::from)?;
    let declared = r.read_u32::<BigEndian>().map_err(ProtocolError::from)?;
    if declared as usize != buf.len() {
        return Err(FetchError::LengthMismatch {
            declared,
            actual: buf.len(),
        });
    }

    let vars = read_vars::<BigEndian, _>(&mut r).map_err(ProtocolError::from)?;
    let os = OsInfo::read::<BigEndian, _>(&mut r, os_type, EnvForm::Storage)
        .map_err(ProtocolError::from)?;
    Ok(EnvironmentSnapshot { vars, os })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::env::{write_vars, UnixInfo, OS_LINUX};
    use byteorder::WriteBytesExt;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    /// Reply as a unit would send it.
    pub(crate) fn encode_reply(version: u16, env: &EnvironmentSnapshot) -> Vec<u8> {
        let mut body = Vec::new();
        write_vars::<BigEndian, _>(&mut body, &env.vars).unwrap();
        env.os
            .write::<BigEndian, _>(&mut body, EnvForm::Storage)
            .unwrap();

        let mut buf = Vec::new();
        buf.write_u16::<BigEndian>(version).unwrap();
        buf.write_u16::<BigEndian>(env.os.type_code()).unwrap();
        buf.write_u32::<BigEndian>((8 + body.len()) as u32).unwrap();
        buf.extend_from_slice(&body);
        buf
    }

    fn linux_env() -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            vars: vec![
                ("ARCH".into(), "linux-x86_64".into()),
                ("TOP".into(), "/opt/ioc".into()),
            ],
            os: OsInfo::Linux(UnixInfo {
                user: "softioc".into(),
                group: "ops".into(),
                hostname: "srv1".into(),
            }),
        }
    }

    #[test]
    fn test_decode_reply() {
        let env = decode_metadata(&encode_reply(5, &linux_env())).unwrap();
        assert_eq!(env, linux_env());
        assert_eq!(env.os.type_code(), OS_LINUX);
        assert_eq!(env.get("TOP"), Some("/opt/ioc"));
    }

    #[test]
    fn test_decode_rejects_bad_headers() {
        assert!(matches!(
            decode_metadata(&encode_reply(3, &linux_env())),
            Err(FetchError::Protocol(ProtocolError::BadVersion(3)))
        ));

        let mut long = encode_reply(4, &linux_env());
        long.push(0);
        assert!(matches!(
            decode_metadata(&long),
            Err(FetchError::LengthMismatch { .. })
        ));

        assert!(matches!(
            decode_metadata(&[0, 4, 0]),
            Err(FetchError::Protocol(ProtocolError::Truncated))
        ));
        assert!(matches!(
            decode_metadata(&vec![0u8; MAX_REPLY_LEN + 1]),
            Err(FetchError::Oversized(_))
        ));
    }

    #[test]
    fn test_decode_unknown_os_is_generic() {
        let mut buf = encode_reply(5, &EnvironmentSnapshot::default());
        buf[3] = 42;
        let env = decode_metadata(&buf).unwrap();
        assert_eq!(env.os, OsInfo::Generic);
    }

    #[tokio::test]
    async fn test_fetch_over_loopback() {
        use tokio::io::AsyncWriteExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let reply = encode_reply(5, &linux_env());
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(&reply).await.unwrap();
        });

        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        let env = fetch_metadata(addr, Duration::from_secs(2)).await.unwrap();
        assert_eq!(env, linux_env());
    }

    #[tokio::test]
    async fn test_fetch_times_out_on_silent_unit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        let result = fetch_metadata(addr, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(FetchError::Timeout(_))));
    }
}
