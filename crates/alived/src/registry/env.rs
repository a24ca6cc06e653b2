// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Unit metadata fetched from the unit itself.
//!
//! A snapshot is immutable once built and shared as `Arc<EnvironmentSnapshot>`
//! between the registry, queued events and query replies.

use crate::wire::{ReadStrExt, WriteStrExt};
use byteorder::{ByteOrder, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// OS type codes on the wire.
pub const OS_GENERIC: u16 = 0;
pub const OS_VXWORKS: u16 = 1;
pub const OS_LINUX: u16 = 2;
pub const OS_DARWIN: u16 = 3;
pub const OS_WINDOWS: u16 = 4;

/// Which encoding of a snapshot is being produced or consumed.
///
/// The wire form never carries boot host credentials; the storage form does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvForm {
    Wire,
    Storage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    /// Arbitrary key/value attributes, in the order the unit sent them.
    pub vars: Vec<(String, String)>,
    pub os: OsInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OsInfo {
    #[default]
    Generic,
    VxWorks(VxWorksInfo),
    Linux(UnixInfo),
    Darwin(UnixInfo),
    Windows(WindowsInfo),
}

/// Boot parameters of a legacy embedded target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VxWorksInfo {
    pub boot_device: String,
    pub unit_number: u32,
    pub processor_number: u32,
    pub boot_host_name: String,
    pub boot_file: String,
    pub address: String,
    pub backplane_address: String,
    pub boot_host_address: String,
    pub gateway_address: String,
    pub boot_host_user: String,
    pub boot_host_password: String,
    pub flags: u32,
    pub target_name: String,
    pub startup_script: String,
    pub other: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnixInfo {
    pub user: String,
    pub group: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowsInfo {
    pub user: String,
    pub machine: String,
}

impl OsInfo {
    pub fn type_code(&self) -> u16 {
        match self {
            OsInfo::Generic => OS_GENERIC,
            OsInfo::VxWorks(_) => OS_VXWORKS,
            OsInfo::Linux(_) => OS_LINUX,
            OsInfo::Darwin(_) => OS_DARWIN,
            OsInfo::Windows(_) => OS_WINDOWS,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OsInfo::Generic => "generic",
            OsInfo::VxWorks(_) => "vxworks",
            OsInfo::Linux(_) => "linux",
            OsInfo::Darwin(_) => "darwin",
            OsInfo::Windows(_) => "windows",
        }
    }

    /// Decode the OS-specific fields for `type_code`. Unknown codes are generic.
    pub fn read<B: ByteOrder, R: Read>(r: &mut R, type_code: u16, form: EnvForm) -> io::Result<Self> {
        Ok(match type_code {
            OS_VXWORKS => {
                let boot_device = r.read_str8()?;
                let unit_number = r.read_u32::<B>()?;
                let processor_number = r.read_u32::<B>()?;
                let boot_host_name = r.read_str8()?;
                let boot_file = r.read_str8()?;
                let address = r.read_str8()?;
                let backplane_address = r.read_str8()?;
                let boot_host_address = r.read_str8()?;
                let gateway_address = r.read_str8()?;
                let (boot_host_user, boot_host_password) = match form {
                    EnvForm::Storage => (r.read_str8()?, r.read_str8()?),
                    EnvForm::Wire => (String::new(), String::new()),
                };
                OsInfo::VxWorks(VxWorksInfo {
                    boot_device,
                    unit_number,
                    processor_number,
                    boot_host_name,
                    boot_file,
                    address,
                    backplane_address,
                    boot_host_address,
                    gateway_address,
                    boot_host_user,
                    boot_host_password,
                    flags: r.read_u32::<B>()?,
                    target_name: r.read_str8()?,
                    startup_script: r.read_str8()?,
                    other: r.read_str8()?,
                })
            }
            OS_LINUX | OS_DARWIN => {
                let info = UnixInfo {
                    user: r.read_str8()?,
                    group: r.read_str8()?,
                    hostname: r.read_str8()?,
                };
                if type_code == OS_LINUX {
                    OsInfo::Linux(info)
                } else {
                    OsInfo::Darwin(info)
                }
            }
            OS_WINDOWS => OsInfo::Windows(WindowsInfo {
                user: r.read_str8()?,
                machine: r.read_str8()?,
            }),
            _ => OsInfo::Generic,
        })
    }

    /// Encode the OS-specific fields (the type code is written by the caller).
    pub fn write<B: ByteOrder, W: Write>(&self, w: &mut W, form: EnvForm) -> io::Result<()> {
        match self {
            OsInfo::Generic => {}
            OsInfo::VxWorks(v) => {
                w.write_str8(&v.boot_device)?;
                w.write_u32::<B>(v.unit_number)?;
                w.write_u32::<B>(v.processor_number)?;
                w.write_str8(&v.boot_host_name)?;
                w.write_str8(&v.boot_file)?;
                w.write_str8(&v.address)?;
                w.write_str8(&v.backplane_address)?;
                w.write_str8(&v.boot_host_address)?;
                w.write_str8(&v.gateway_address)?;
                if form == EnvForm::Storage {
                    w.write_str8(&v.boot_host_user)?;
                    w.write_str8(&v.boot_host_password)?;
                }
                w.write_u32::<B>(v.flags)?;
                w.write_str8(&v.target_name)?;
                w.write_str8(&v.startup_script)?;
                w.write_str8(&v.other)?;
            }
            OsInfo::Linux(u) | OsInfo::Darwin(u) => {
                w.write_str8(&u.user)?;
                w.write_str8(&u.group)?;
                w.write_str8(&u.hostname)?;
            }
            OsInfo::Windows(win) => {
                w.write_str8(&win.user)?;
                w.write_str8(&win.machine)?;
            }
        }
        Ok(())
    }
}

/// `u16` count, then key (`u8` length) / value (`u16` length) pairs.
pub fn read_vars<B: ByteOrder, R: Read>(r: &mut R) -> io::Result<Vec<(String, String)>> {
    let count = r.read_u16::<B>()?;
    let mut vars = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key = r.read_str8()?;
        let value = r.read_str16::<B>()?;
        vars.push((key, value));
    }
    Ok(vars)
}

pub fn write_vars<B: ByteOrder, W: Write>(w: &mut W, vars: &[(String, String)]) -> io::Result<()> {
    let count = vars.len().min(u16::MAX as usize);
    w.write_u16::<B>(count as u16)?;
    for (key, value) in &vars[..count] {
        w.write_str8(key)?;
        w.write_str16::<B>(value)?;
    }
    Ok(())
}

impl EnvironmentSnapshot {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Attributes, OS type code, OS fields.
    pub fn write_body<B: ByteOrder, W: Write>(&self, w: &mut W, form: EnvForm) -> io::Result<()> {
        write_vars::<B, W>(w, &self.vars)?;
        w.write_u16::<B>(self.os.type_code())?;
        self.os.write::<B, W>(w, form)
    }

    pub fn read_body<B: ByteOrder, R: Read>(r: &mut R, form: EnvForm) -> io::Result<Self> {
        let vars = read_vars::<B, R>(r)?;
        let type_code = r.read_u16::<B>()?;
        let os = OsInfo::read::<B, R>(r, type_code, form)?;
        Ok(Self { vars, os })
    }
}

/// Presence byte followed by the snapshot body when present.
pub fn write_env_block<B: ByteOrder, W: Write>(
    w: &mut W,
    env: Option<&EnvironmentSnapshot>,
    form: EnvForm,
) -> io::Result<()> {
    match env {
        Some(env) => {
            w.write_u8(1)?;
            env.write_body::<B, W>(w, form)
        }
        None => w.write_u8(0),
    }
}

pub fn read_env_block<B: ByteOrder, R: Read>(
    r: &mut R,
    form: EnvForm,
) -> io::Result<Option<EnvironmentSnapshot>> {
    if r.read_u8()? == 0 {
        return Ok(None);
    }
    EnvironmentSnapshot::read_body::<B, R>(r, form).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{BigEndian, LittleEndian};
    use std::io::Cursor;

    fn vxworks() -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            vars: vec![("EPICS_CA_ADDR_LIST".into(), "10.0.0.255".into())],
            os: OsInfo::VxWorks(VxWorksInfo {
                boot_device: "motfcc".into(),
                unit_number: 1,
                processor_number: 0,
                boot_host_name: "bootsrv".into(),
                boot_file: "/boot/vxWorks".into(),
                address: "10.0.0.5:ffffff00".into(),
                boot_host_user: "ioc".into(),
                boot_host_password: "secret".into(),
                flags: 0x20,
                target_name: "ioc1".into(),
                startup_script: "st.cmd".into(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_storage_form_keeps_credentials() {
        let env = vxworks();
        let mut buf = Vec::new();
        write_env_block::<LittleEndian, _>(&mut buf, Some(&env), EnvForm::Storage).unwrap();
        let back = read_env_block::<LittleEndian, _>(&mut Cursor::new(buf), EnvForm::Storage)
            .unwrap()
            .unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_wire_form_drops_credentials() {
        let env = vxworks();
        let mut buf = Vec::new();
        write_env_block::<BigEndian, _>(&mut buf, Some(&env), EnvForm::Wire).unwrap();
        assert!(!buf.windows(6).any(|w| w == b"secret"));

        let back = read_env_block::<BigEndian, _>(&mut Cursor::new(buf), EnvForm::Wire)
            .unwrap()
            .unwrap();
        match &back.os {
            OsInfo::VxWorks(v) => {
                assert!(v.boot_host_password.is_empty());
                assert_eq!(v.target_name, "ioc1");
                assert_eq!(v.flags, 0x20);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(back.get("EPICS_CA_ADDR_LIST"), Some("10.0.0.255"));
    }

    #[test]
    fn test_absent_block_is_one_byte() {
        let mut buf = Vec::new();
        write_env_block::<BigEndian, _>(&mut buf, None, EnvForm::Wire).unwrap();
        assert_eq!(buf, vec![0]);
    }

    #[test]
    fn test_unknown_os_type_is_generic() {
        let mut cur = Cursor::new(Vec::<u8>::new());
        let os = OsInfo::read::<BigEndian, _>(&mut cur, 99, EnvForm::Wire).unwrap();
        assert_eq!(os, OsInfo::Generic);
    }
}
