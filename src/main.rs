/*
 * Copyright (C) 2021 Evtech Solutions, Ltd., dba 3D-P
 * Copyright (C) 2021 Neil Tallim <neiltallim@3d-p.com>
 *
 * This file is part of tperf.
 *
 * tperf is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * tperf is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with tperf.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

use clap::Parser;
use tperf::args::Args;
use tperf::client::{self, SessionHandle};
use tperf::report::{FinalReport, IntervalRecord, IntervalReport};
use tperf::{server, BoxResult};

fn format_record(label: &str, record: &IntervalRecord) -> String {
    let mut line = format!(
        "{:>6} {:6.2}-{:6.2} sec {:>12} bytes {:>14.0} bits/sec",
        label, record.interval_start, record.interval_end, record.bytes, record.bits_per_second
    );
    if let Some(retransmits) = record.retransmits {
        line.push_str(&format!(" {:>6} retr", retransmits));
    }
    if let Some(jitter_ms) = record.jitter_ms {
        line.push_str(&format!(" {:8.3} ms", jitter_ms));
    }
    if let (Some(lost), Some(percent)) = (record.lost_packets, record.lost_percent()) {
        line.push_str(&format!(" {:>6} lost ({:.2}%)", lost, percent));
    }
    line
}

fn print_interval(report: &IntervalReport) {
    for stream in report.streams.iter() {
        println!("{}", format_record(&format!("[{}]", stream.stream_idx), &stream.record));
    }
    if report.streams.len() > 1 {
        println!("{}", format_record("[SUM]", &report.sum));
    }
}

fn print_final(report: &FinalReport) {
    println!("- - - - - - - - - - - - - - - - - - - - - - - - -");
    for stream in report.streams.iter() {
        let side = if stream.sending { "sender" } else { "receiver" };
        println!("{} {}", format_record(&format!("[{}]", stream.stream_idx), &stream.cumulative), side);
        if let Some(peer) = &stream.peer {
            let side = if stream.sending { "receiver" } else { "sender" };
            println!("{} {}", format_record(&format!("[{}]", stream.stream_idx), peer), side);
        }
    }
    if report.streams.len() > 1 {
        println!("{}", format_record("[SUM]", &report.sum));
        if let Some(sum_peer) = &report.sum_peer {
            println!("{} peer", format_record("[SUM]", sum_peer));
        }
    }
    println!("test {:?}, started {}", report.outcome, report.started);
}

fn resolve(host: &str, port: u16) -> BoxResult<SocketAddr> {
    let address = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| format!("unable to resolve {}", host))?;
    Ok(address)
}

fn run_client(args: &Args, host: &str) -> BoxResult<()> {
    let server_address = resolve(host, args.port)?;
    let mut handle = client::start(args.to_settings(), server_address)?;

    // the first signal aborts the test; the session still yields what it measured
    let reports = handle.interval_reports();
    let handle: Arc<Mutex<Option<SessionHandle>>> = Arc::new(Mutex::new(Some(handle)));
    let c_handle = handle.clone();
    ctrlc2::set_handler(move || {
        if let Ok(guard) = c_handle.lock() {
            if let Some(handle) = guard.as_ref() {
                log::warn!("stopping the test early");
                handle.abort();
            }
        }
        true
    })?;

    if let Some(reports) = reports {
        for report in reports.iter() {
            if !args.json {
                print_interval(&report);
            }
        }
    }

    let handle = handle
        .lock()
        .map_err(|_| "session handle poisoned")?
        .take()
        .ok_or("session handle already consumed")?;
    let report = handle.wait()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_final(&report);
    }
    Ok(())
}

fn main() -> BoxResult<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::init_from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, default_level));

    if args.server {
        log::debug!("registering SIGINT handler...");
        ctrlc2::set_handler(move || {
            if server::kill() {
                log::warn!("shutdown requested; please allow a moment for any in-progress tests to stop");
            } else {
                log::warn!("forcing shutdown immediately");
                std::process::exit(3);
            }
            true
        })?;

        log::debug!("beginning normal operation...");
        server::serve(&args)?;
    } else if let Some(host) = args.client.as_deref() {
        run_client(&args, host)?;
    } else {
        std::process::exit(2);
    }
    Ok(())
}
