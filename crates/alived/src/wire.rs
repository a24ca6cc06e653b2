// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefixed string helpers shared by the wire and disk codecs.
//!
//! Strings carry a 1-byte or 2-byte length prefix; longer input is truncated
//! at a character boundary. Decoding is lossy on invalid UTF-8.

use byteorder::{ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Decode failures for inbound packets and replies.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet truncated")]
    Truncated,

    #[error("bad magic number 0x{0:08x}")]
    BadMagic(u32),

    #[error("unsupported protocol version {0}")]
    BadVersion(u16),

    #[error("unknown request code {0}")]
    UnknownRequest(u16),

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(e)
        }
    }
}

fn truncated(s: &str, max: usize) -> &[u8] {
    if s.len() <= max {
        return s.as_bytes();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s.as_bytes()[..end]
}

pub trait WriteStrExt: Write {
    /// `u8` length + bytes.
    fn write_str8(&mut self, s: &str) -> io::Result<()> {
        let bytes = truncated(s, u8::MAX as usize);
        self.write_u8(bytes.len() as u8)?;
        self.write_all(bytes)
    }

    /// `u16` length + bytes.
    fn write_str16<B: ByteOrder>(&mut self, s: &str) -> io::Result<()> {
        let bytes = truncated(s, u16::MAX as usize);
        self.write_u16::<B>(bytes.len() as u16)?;
        self.write_all(bytes)
    }
}

impl<W: Write + ?Sized> WriteStrExt for W {}

pub trait ReadStrExt: Read {
    fn read_str8(&mut self) -> io::Result<String> {
        let len = self.read_u8()? as usize;
        read_string(self, len)
    }

    fn read_str16<B: ByteOrder>(&mut self) -> io::Result<String> {
        let len = self.read_u16::<B>()? as usize;
        read_string(self, len)
    }
}

impl<R: Read + ?Sized> ReadStrExt for R {}

fn read_string<R: Read + ?Sized>(r: &mut R, len: usize) -> io::Result<String> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::BigEndian;
    use std::io::Cursor;

    #[test]
    fn test_str8_truncates_long_input() {
        let long = "x".repeat(300);
        let mut buf = Vec::new();
        buf.write_str8(&long).unwrap();
        assert_eq!(buf[0], 255);
        assert_eq!(buf.len(), 256);
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        let s = format!("{}é", "a".repeat(254));
        let mut buf = Vec::new();
        buf.write_str8(&s).unwrap();
        assert_eq!(buf[0], 254);
    }

    #[test]
    fn test_short_read_is_eof() {
        let mut cur = Cursor::new(vec![0u8, 5, b'a', b'b']);
        let err = cur.read_str16::<BigEndian>().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
