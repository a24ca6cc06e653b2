// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! alivectl - operator tool for alived
//!
//! ```bash
//! alivectl send stats
//! alivectl send info ioc1
//! alivectl status --server 10.0.0.1:5679
//! alivectl events /var/lib/alived/events/ioc1
//! alivectl watch --server 10.0.0.1:5680
//! ```

use alived::clock::{self, format_time};
use alived::notify::protocol::{Envelope, EventNotice, Request, CODE_EVENT};
use alived::registry::event::EventKind;
use alived::server::query::{decode_reply, QueryRequest, ReplyBody, SummaryRecord};
use alived::store::event_log::{read_records, EventRecord};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Operator tool for the alived liveness daemon
#[derive(Parser, Debug)]
#[command(name = "alivectl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one command over the control socket and print the reply
    Send {
        /// Control socket path
        #[arg(short, long, default_value = "/run/alived/control.sock")]
        socket: PathBuf,

        /// Command words, e.g. `info ioc1`
        #[arg(required = true, trailing_var_arg = true)]
        words: Vec<String>,
    },

    /// Decode a per-unit binary event log
    Events {
        /// Event log file
        file: PathBuf,
    },

    /// Query unit state over TCP
    Status {
        /// Query endpoint
        #[arg(short, long, default_value = "127.0.0.1:5679")]
        server: SocketAddr,

        /// Units to show (all when empty)
        names: Vec<String>,
    },

    /// Subscribe to events and print them as they arrive
    Watch {
        /// Subscription endpoint
        #[arg(short, long, default_value = "127.0.0.1:5680")]
        server: SocketAddr,

        /// Contact ping interval in seconds
        #[arg(long, default_value = "60")]
        ping: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Send { socket, words } => cmd_send(&socket, &words.join(" ")),
        Command::Events { file } => cmd_events(&file),
        Command::Status { server, names } => cmd_status(server, names),
        Command::Watch { server, ping } => cmd_watch(server, Duration::from_secs(ping)),
    }
}

fn cmd_send(socket: &PathBuf, command: &str) -> Result<()> {
    let mut stream = UnixStream::connect(socket)
        .with_context(|| format!("cannot connect to {:?}", socket))?;
    stream.write_all(command.as_bytes())?;
    stream.shutdown(Shutdown::Write)?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply)?;
    print!("{}", reply);
    Ok(())
}

fn cmd_events(file: &PathBuf) -> Result<()> {
    let records = read_records(file).with_context(|| format!("cannot read {:?}", file))?;
    for record in &records {
        println!("{}", record_line(record));
    }
    println!("{} records", records.len());
    Ok(())
}

fn record_line(record: &EventRecord) -> String {
    let kind = EventKind::from_code(record.kind)
        .map(|k| k.as_str().to_string())
        .unwrap_or_else(|| format!("EVENT_{}", record.kind));
    format!(
        "{}  {:<14} {:<15} {}",
        format_time(record.time),
        kind,
        record.address,
        record.user_msg
    )
}

fn cmd_status(server: SocketAddr, names: Vec<String>) -> Result<()> {
    let request = status_request(names);
    let mut stream = TcpStream::connect_timeout(&server, Duration::from_secs(5))
        .with_context(|| format!("cannot connect to {}", server))?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    stream.write_all(&request.encode())?;
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply)?;

    let (header, body) = decode_reply(&request, &reply)?;
    let ReplyBody::Summaries(units) = body else {
        bail!("unexpected reply body");
    };
    println!(
        "server up since {} ({} units)",
        format_time(header.started),
        units.len()
    );
    for unit in &units {
        println!("{}", summary_line(unit));
    }
    Ok(())
}

fn status_request(mut names: Vec<String>) -> QueryRequest {
    match names.len() {
        0 => QueryRequest::All,
        1 => QueryRequest::Single(names.remove(0)),
        _ => QueryRequest::Subset(names),
    }
}

fn status_label(code: u8) -> &'static str {
    match code {
        1 => "DOWN?",
        2 => "DOWN",
        3 => "UP",
        4 => "CONFLICT",
        _ => "UNKNOWN",
    }
}

fn summary_line(unit: &SummaryRecord) -> String {
    let when = if unit.time == 0 {
        "-".to_string()
    } else {
        format_time(unit.time)
    };
    let os = unit.env.as_ref().map(|e| e.os.name()).unwrap_or("-");
    format!(
        "{:<24} {:<9} {:<20} {:<15} {:<8} msg {}",
        unit.name,
        status_label(unit.status),
        when,
        unit.address,
        os,
        unit.user_msg
    )
}

fn notice_line(notice: &EventNotice) -> String {
    format!(
        "{}  {:<14} {:<24} {:<15} msg {}",
        format_time(notice.time),
        notice.kind.as_str(),
        notice.name,
        notice.address,
        notice.user_msg
    )
}

fn cmd_watch(server: SocketAddr, ping: Duration) -> Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(server)?;
    socket.set_read_timeout(Some(Duration::from_secs(1)))?;

    let incarnation = clock::now();
    let mut buf = [0u8; 2048];
    socket.send(&Request::Subscribe { incarnation }.encode())?;
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if Instant::now() > deadline {
            bail!("no subscription acknowledgment from {}", server);
        }
        match socket.recv(&mut buf) {
            Ok(n) => {
                if matches!(Envelope::decode(&buf[..n]), Ok((env, _)) if env.incarnation == incarnation)
                {
                    break;
                }
            }
            Err(e) if is_timeout(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    socket.send(&Request::Confirm { incarnation }.encode())?;
    println!("subscribed to {}", server);

    let mut last_ping = Instant::now();
    loop {
        if last_ping.elapsed() >= ping {
            socket.send(&Request::HeartbeatAck { incarnation }.encode())?;
            last_ping = Instant::now();
        }
        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => return Err(e.into()),
        };
        let Ok((envelope, _)) = Envelope::decode(&buf[..n]) else {
            continue;
        };
        if envelope.code != CODE_EVENT {
            continue;
        }
        match EventNotice::decode(&buf[..n]) {
            Ok(notice) => {
                println!("{}", notice_line(&notice));
                let ack = Request::EventAck {
                    incarnation,
                    event_id: notice.event_id,
                };
                socket.send(&ack.encode())?;
            }
            Err(e) => eprintln!("bad event datagram: {}", e),
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
