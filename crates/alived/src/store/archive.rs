// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CSV snapshot of the registry.
//!
//! Six `;`-separated files share an `entry` column: one row per unit in
//! `<prefix>.csv`, attribute rows in `_envvars.csv`, and one file per OS
//! family for the OS-specific fields.

use super::{io_error, StoreError};
use crate::clock;
use crate::registry::env::OsInfo;
use crate::registry::unit::OverallStatus;
use crate::registry::view::UnitSummary;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

const SUFFIXES: [&str; 6] = [
    ".csv",
    "_envvars.csv",
    "_vxworks.csv",
    "_linux.csv",
    "_darwin.csv",
    "_windows.csv",
];

const HEADERS: [&str; 6] = [
    "entry;unit;status;time;protocol;ipaddress;originport;boottime;incarnation;replyport;period;usermsg;ostype",
    "entry;variable;value",
    "entry;bootdev;unitnum;procnum;hostname;bootfile;ipaddress;backplane_address;boothost_address;gateway_address;user;flags;target_name;startup_script;other",
    "entry;user;group;host",
    "entry;user;group;host",
    "entry;user;machine",
];

const UNITS: usize = 0;
const VARS: usize = 1;
const VXWORKS: usize = 2;
const LINUX: usize = 3;
const DARWIN: usize = 4;
const WINDOWS: usize = 5;

/// Quote a field if it contains the separator, a quote or a line break.
fn field(s: &str) -> String {
    if s.contains([';', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn status_label(status: OverallStatus) -> &'static str {
    match status {
        OverallStatus::Unknown => "unknown",
        OverallStatus::DownUnknown | OverallStatus::Down => "down",
        OverallStatus::Up => "up",
        OverallStatus::Conflict => "conflict",
    }
}

fn write_unit(out: &mut [BufWriter<File>], entry: usize, unit: &UnitSummary) -> io::Result<()> {
    let ping = &unit.ping;
    writeln!(
        out[UNITS],
        "{};{};{};{};{};{};{};{};{};{};{};{};{}",
        entry,
        field(&unit.name),
        status_label(unit.status),
        clock::format_time(ping.timestamp),
        ping.version,
        ping.address,
        ping.origin_port,
        clock::format_time(ping.boot_time),
        clock::format_time(ping.incarnation),
        ping.reply_port,
        ping.period,
        ping.user_msg,
        unit.env.as_ref().map(|e| e.os.name()).unwrap_or("")
    )?;

    let Some(env) = unit.env.as_deref() else {
        return Ok(());
    };
    for (key, value) in &env.vars {
        writeln!(out[VARS], "{};{};{}", entry, field(key), field(value))?;
    }
    match &env.os {
        OsInfo::Generic => {}
        // Boot host password is never exported.
        OsInfo::VxWorks(vx) => writeln!(
            out[VXWORKS],
            "{};{};{};{};{};{};{};{};{};{};{};{};{};{};{}",
            entry,
            field(&vx.boot_device),
            vx.unit_number,
            vx.processor_number,
            field(&vx.boot_host_name),
            field(&vx.boot_file),
            field(&vx.address),
            field(&vx.backplane_address),
            field(&vx.boot_host_address),
            field(&vx.gateway_address),
            field(&vx.boot_host_user),
            vx.flags,
            field(&vx.target_name),
            field(&vx.startup_script),
            field(&vx.other)
        )?,
        OsInfo::Linux(u) => writeln!(
            out[LINUX],
            "{};{};{};{}",
            entry,
            field(&u.user),
            field(&u.group),
            field(&u.hostname)
        )?,
        OsInfo::Darwin(u) => writeln!(
            out[DARWIN],
            "{};{};{};{}",
            entry,
            field(&u.user),
            field(&u.group),
            field(&u.hostname)
        )?,
        OsInfo::Windows(w) => writeln!(
            out[WINDOWS],
            "{};{};{}",
            entry,
            field(&w.user),
            field(&w.machine)
        )?,
    }
    Ok(())
}

/// Paths written for `prefix`, in the order of [`write_archive`]'s files.
pub fn archive_paths(prefix: &str) -> Vec<PathBuf> {
    SUFFIXES
        .iter()
        .map(|suffix| PathBuf::from(format!("{}{}", prefix, suffix)))
        .collect()
}

/// Write the six CSV files for `units` under `prefix`.
///
/// Returns the number of units written.
pub fn write_archive(prefix: &str, units: &[UnitSummary], now: u32) -> Result<usize, StoreError> {
    let paths = archive_paths(prefix);
    let mut out = Vec::with_capacity(paths.len());
    for path in &paths {
        let file = File::create(path).map_err(io_error(path))?;
        out.push(BufWriter::new(file));
    }

    let first = paths[UNITS].as_path();
    writeln!(out[UNITS], "# {}", clock::format_time(now)).map_err(io_error(first))?;
    for (writer, (header, path)) in out.iter_mut().zip(HEADERS.iter().zip(&paths)) {
        writeln!(writer, "{}", header).map_err(io_error(path))?;
    }

    for (i, unit) in units.iter().enumerate() {
        write_unit(&mut out, i + 1, unit).map_err(io_error(first))?;
    }

    for (writer, path) in out.iter_mut().zip(&paths) {
        writer.flush().map_err(io_error(path))?;
    }
    Ok(units.len())
}
