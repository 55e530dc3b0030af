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

use std::net::IpAddr;
use std::time::Duration;

use crate::settings::{
    Amount, Direction, Protocol, Settings, DEFAULT_DURATION, DEFAULT_PORT, DEFAULT_TCP_BLOCK_SIZE, DEFAULT_UDP_BANDWIDTH,
    DEFAULT_UDP_BLOCK_SIZE, MAX_INTERVAL, MIN_INTERVAL,
};
use crate::stream::udp::TEST_HEADER_SIZE;

/// measures network throughput, jitter and loss between two hosts
#[derive(clap::Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// run in server mode
    #[arg(short, long, conflicts_with = "client")]
    pub server: bool,

    /// run in client mode; value is the server's address
    #[arg(short, long, value_name = "host", conflicts_with = "server")]
    pub client: Option<String>,

    /// the port used for client-server interactions
    #[arg(short, long, value_name = "number", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// enable debug-level logging
    #[arg(short, long)]
    pub debug: bool,

    /// use UDP rather than TCP
    #[arg(short, long)]
    pub udp: bool,

    /// have the server send data to the client
    #[arg(short = 'R', long, conflicts_with = "bidir")]
    pub reverse: bool,

    /// send data in both directions at once, over separate streams
    #[arg(long)]
    pub bidir: bool,

    /// the number of streams to use in each direction
    #[arg(short = 'P', long, value_name = "number", default_value_t = 1)]
    pub parallel: usize,

    /// target bandwidth per stream, with an optional k/m/g suffix for bits or K/M/G for bytes;
    /// UDP defaults to 1 Mbit/s, TCP is unlimited unless given
    #[arg(short, long, value_name = "bits/second", default_value = "")]
    pub bandwidth: String,

    /// the length of the test, in seconds
    #[arg(short, long, value_name = "seconds", default_value_t = DEFAULT_DURATION.as_secs_f64())]
    pub time: f64,

    /// send this many bytes instead of running for a fixed time
    #[arg(short = 'n', long, value_name = "bytes", conflicts_with = "packets")]
    pub bytes: Option<u64>,

    /// send this many datagrams instead of running for a fixed time (UDP only)
    #[arg(short = 'k', long, value_name = "count", requires = "udp")]
    pub packets: Option<u64>,

    /// the size of each block or datagram; 0 picks 8 KiB for TCP and 1472 bytes for UDP
    #[arg(short, long, value_name = "bytes", default_value_t = 0)]
    pub length: usize,

    /// seconds between interval reports; 0 reports only the totals
    #[arg(short, long, value_name = "seconds", default_value_t = 1.0)]
    pub interval: f64,

    /// socket buffer size hint for data streams
    #[arg(short, long, value_name = "bytes")]
    pub window: Option<usize>,

    /// use no-delay mode for TCP tests, disabling Nagle's Algorithm
    #[arg(short = 'N', long)]
    pub no_delay: bool,

    /// type-of-service byte for data packets, in decimal, octal (leading 0) or hex (leading 0x)
    #[arg(short = 'S', long, value_name = "tos", value_parser = parse_tos)]
    pub tos: Option<u8>,

    /// emit the final report as JSON
    #[arg(short = 'J', long)]
    pub json: bool,

    /// the address to which the server binds
    #[arg(short = 'B', long, value_name = "address", default_value = "::")]
    pub bind: IpAddr,

    /// limit the number of concurrent clients that can be processed by a server; 0 is unlimited
    #[arg(long, value_name = "number", default_value_t = 0)]
    pub client_limit: usize,

    /// an optional pool of IPv4 TCP ports over which data will be accepted; e.g. 10000-10100,10105
    #[arg(long, value_name = "ports", default_value = "")]
    pub tcp_port_pool: String,

    /// an optional pool of IPv6 TCP ports over which data will be accepted
    #[arg(long, value_name = "ports", default_value = "")]
    pub tcp6_port_pool: String,

    /// an optional pool of IPv4 UDP ports over which data will be accepted
    #[arg(long, value_name = "ports", default_value = "")]
    pub udp_port_pool: String,

    /// an optional pool of IPv6 UDP ports over which data will be accepted
    #[arg(long, value_name = "ports", default_value = "")]
    pub udp6_port_pool: String,
}

impl Args {
    /// the test the client proposes, with out-of-range values adjusted
    pub fn to_settings(&self) -> Settings {
        let protocol = if self.udp { Protocol::Udp } else { Protocol::Tcp };
        let direction = if self.bidir {
            Direction::Bidirectional
        } else if self.reverse {
            Direction::Reverse
        } else {
            Direction::Normal
        };
        let bandwidth = match (calc_bandwidth(&self.bandwidth), protocol) {
            (Some(bandwidth), _) => Some(bandwidth),
            (None, Protocol::Udp) => Some(DEFAULT_UDP_BANDWIDTH),
            (None, Protocol::Tcp) => None,
        };
        let amount = match (self.bytes, self.packets) {
            (Some(bytes), _) => Amount::Bytes(bytes),
            (None, Some(packets)) => Amount::Packets(packets),
            (None, None) => Amount::Duration(calc_duration(self.time)),
        };

        Settings {
            protocol,
            direction,
            streams: self.parallel,
            block_size: calc_block_size(self.length, self.udp),
            bandwidth,
            amount,
            interval: calc_interval(self.interval),
            window: self.window,
            no_delay: self.no_delay,
            tos: self.tos,
        }
    }
}

/// reads a type-of-service byte the way C's strtoul does with base 0
pub fn parse_tos(tos_s: &str) -> Result<u8, String> {
    let tos_s = tos_s.trim();
    let parsed = if let Some(hex) = tos_s.strip_prefix("0x").or_else(|| tos_s.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)
    } else if tos_s.len() > 1 && tos_s.starts_with('0') {
        u8::from_str_radix(&tos_s[1..], 8)
    } else {
        tos_s.parse::<u8>()
    };
    parsed.map_err(|_| format!("'{}' is not a type-of-service value between 0 and 255", tos_s))
}

/// parses a rate in bits per second; `None` when nothing usable was given
pub fn calc_bandwidth(bandwidth_s: &str) -> Option<u64> {
    let bandwidth_s = bandwidth_s.trim();
    let last = bandwidth_s.chars().last()?;
    let bandwidth_multiplier: f64 = match last {
        'k' => 1000.0,                      //kilobits
        'K' => 1000.0 * 8.0,                //kilobytes
        'm' => 1000.0 * 1000.0,             //megabits
        'M' => 1000.0 * 1000.0 * 8.0,       //megabytes
        'g' => 1000.0 * 1000.0 * 1000.0,    //gigabits
        'G' => 1000.0 * 1000.0 * 1000.0 * 8.0, //gigabytes
        _ => 1.0,
    };
    let bandwidth_string = if last.is_ascii_alphabetic() {
        &bandwidth_s[0..(bandwidth_s.len() - 1)]
    } else {
        bandwidth_s
    };

    match bandwidth_string.parse::<f64>() {
        Ok(v) if v > 0.0 && v.is_finite() && last.is_ascii_alphabetic() == (bandwidth_multiplier != 1.0) => {
            Some((v * bandwidth_multiplier) as u64)
        }
        _ => {
            log::warn!("invalid bandwidth: {}; using the default", bandwidth_s);
            None
        }
    }
}

pub fn calc_block_size(length: usize, udp: bool) -> usize {
    if length == 0 {
        if udp {
            DEFAULT_UDP_BLOCK_SIZE
        } else {
            DEFAULT_TCP_BLOCK_SIZE
        }
    } else if udp && length < TEST_HEADER_SIZE {
        log::warn!(
            "length {} cannot hold a datagram header; it has been set to {}",
            length,
            TEST_HEADER_SIZE
        );
        TEST_HEADER_SIZE
    } else {
        length
    }
}

pub fn calc_interval(seconds: f64) -> Duration {
    if seconds == 0.0 {
        return Duration::ZERO;
    }
    if !seconds.is_finite() || seconds < MIN_INTERVAL.as_secs_f64() {
        log::warn!(
            "interval was not in an acceptable range and has been set to {}",
            MIN_INTERVAL.as_secs_f64()
        );
        return MIN_INTERVAL;
    }
    if seconds > MAX_INTERVAL.as_secs_f64() {
        log::warn!(
            "interval was not in an acceptable range and has been set to {}",
            MAX_INTERVAL.as_secs_f64()
        );
        return MAX_INTERVAL;
    }
    Duration::from_secs_f64(seconds)
}

fn calc_duration(seconds: f64) -> Duration {
    if !seconds.is_finite() || seconds <= 0.0 {
        log::warn!(
            "time was not in an acceptable range and has been set to {}",
            DEFAULT_DURATION.as_secs_f64()
        );
        return DEFAULT_DURATION;
    }
    Duration::from_secs_f64(seconds)
}
