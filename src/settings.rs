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

//! Negotiated test parameters and the limits they are validated against.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::protocol::messaging::SettingsRecord;
use crate::stream::udp::TEST_HEADER_SIZE as UDP_HEADER_SIZE;

pub const DEFAULT_PORT: u16 = 5001;
pub const PLATFORM_MAX_STREAMS: usize = 8;

pub const DEFAULT_TCP_BLOCK_SIZE: usize = 8 * 1024;
pub const DEFAULT_UDP_BLOCK_SIZE: usize = 1472;
/// bits per second
pub const DEFAULT_UDP_BANDWIDTH: u64 = 1024 * 1024;
pub const DEFAULT_DURATION: Duration = Duration::from_secs(10);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

pub const MIN_INTERVAL: Duration = Duration::from_millis(100);
pub const MAX_INTERVAL: Duration = Duration::from_secs(3600);

const MAX_UDP_BLOCK_SIZE: usize = 65507;
const MAX_TCP_BLOCK_SIZE: usize = 1024 * 1024;
/// 100 Gbit/s
const MAX_BANDWIDTH: u64 = 100_000_000_000;
/// socket buffer sizes are handed to the kernel as a C int
const MAX_WINDOW: usize = i32::MAX as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(ConfigError::UnsupportedProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// the initiator sends
    Normal,
    /// the responder sends
    Reverse,
    /// both sides send, each over its own set of streams
    Bidirectional,
}

impl FromStr for Direction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Direction::Normal),
            "reverse" => Ok(Direction::Reverse),
            "bidirectional" => Ok(Direction::Bidirectional),
            other => Err(ConfigError::UnsupportedDirection(other.to_string())),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Normal => write!(f, "normal"),
            Direction::Reverse => write!(f, "reverse"),
            Direction::Bidirectional => write!(f, "bidirectional"),
        }
    }
}

/// which way data moves on one stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    /// initiator to responder
    Upload,
    /// responder to initiator
    Download,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Amount {
    Duration(Duration),
    Bytes(u64),
    Packets(u64),
}

/// a per-stream share of a byte or packet target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quota {
    Bytes(u64),
    Packets(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_streams: usize,
    pub max_block_size: usize,
    pub max_bandwidth: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_streams: PLATFORM_MAX_STREAMS,
            max_block_size: MAX_TCP_BLOCK_SIZE,
            max_bandwidth: MAX_BANDWIDTH,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub protocol: Protocol,
    pub direction: Direction,
    /// parallel streams per direction
    pub streams: usize,
    pub block_size: usize,
    /// target rate per stream, in bits per second
    pub bandwidth: Option<u64>,
    pub amount: Amount,
    /// `Duration::ZERO` disables interval reporting
    pub interval: Duration,
    /// socket buffer hint, in bytes
    pub window: Option<usize>,
    pub no_delay: bool,
    /// IP type-of-service byte for data packets; the top three bits select the WMM access category
    pub tos: Option<u8>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            protocol: Protocol::Tcp,
            direction: Direction::Normal,
            streams: 1,
            block_size: DEFAULT_TCP_BLOCK_SIZE,
            bandwidth: None,
            amount: Amount::Duration(DEFAULT_DURATION),
            interval: DEFAULT_INTERVAL,
            window: None,
            no_delay: false,
            tos: None,
        }
    }
}

impl Settings {
    pub fn validate(&self, limits: &Limits) -> Result<(), ConfigError> {
        if self.streams == 0 {
            return Err(ConfigError::NoStreams);
        }
        // a bidirectional test opens a set of streams for each direction
        if self.stream_count() > limits.max_streams {
            return Err(ConfigError::TooManyStreams {
                requested: self.stream_count(),
                max: limits.max_streams,
            });
        }

        let (min_block, max_block) = match self.protocol {
            Protocol::Udp => (UDP_HEADER_SIZE, MAX_UDP_BLOCK_SIZE.min(limits.max_block_size)),
            Protocol::Tcp => (1, limits.max_block_size),
        };
        if self.block_size < min_block || self.block_size > max_block {
            return Err(ConfigError::BlockSize {
                size: self.block_size,
                min: min_block,
                max: max_block,
            });
        }

        if let Some(bandwidth) = self.bandwidth {
            if bandwidth == 0 || bandwidth > limits.max_bandwidth {
                return Err(ConfigError::Bandwidth {
                    requested: bandwidth,
                    max: limits.max_bandwidth,
                });
            }
        }

        match self.amount {
            Amount::Duration(d) if d.is_zero() => return Err(ConfigError::ZeroAmount),
            Amount::Bytes(0) | Amount::Packets(0) => return Err(ConfigError::ZeroAmount),
            Amount::Packets(_) if self.protocol != Protocol::Udp => return Err(ConfigError::PacketTargetRequiresUdp),
            _ => (),
        }

        if !self.interval.is_zero() && (self.interval < MIN_INTERVAL || self.interval > MAX_INTERVAL) {
            return Err(ConfigError::Interval(self.interval.as_millis() as u64));
        }

        if let Some(window) = self.window {
            if window == 0 || window > MAX_WINDOW {
                return Err(ConfigError::Window {
                    size: window,
                    max: MAX_WINDOW,
                });
            }
        }
        Ok(())
    }

    /// the total number of data streams the session opens
    pub fn stream_count(&self) -> usize {
        match self.direction {
            Direction::Bidirectional => self.streams * 2,
            _ => self.streams,
        }
    }

    pub fn flow_of(&self, stream_idx: usize) -> Flow {
        match self.direction {
            Direction::Normal => Flow::Upload,
            Direction::Reverse => Flow::Download,
            Direction::Bidirectional => {
                if stream_idx < self.streams {
                    Flow::Upload
                } else {
                    Flow::Download
                }
            }
        }
    }

    /// the share of a byte/packet target carried by the sender of one stream;
    /// each direction carries the full target, split evenly with the remainder going to the lowest indices
    pub fn quota_of(&self, stream_idx: usize) -> Option<Quota> {
        let position = (stream_idx % self.streams) as u64;
        let streams = self.streams as u64;
        let share = |total: u64| total / streams + u64::from(position < total % streams);
        match self.amount {
            Amount::Duration(_) => None,
            Amount::Bytes(total) => Some(Quota::Bytes(share(total))),
            Amount::Packets(total) => Some(Quota::Packets(share(total))),
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self.amount {
            Amount::Duration(d) => Some(d),
            _ => None,
        }
    }

    pub fn to_record(&self) -> SettingsRecord {
        let (duration_ms, bytes, packets) = match self.amount {
            Amount::Duration(d) => (Some(d.as_millis() as u64), None, None),
            Amount::Bytes(n) => (None, Some(n), None),
            Amount::Packets(n) => (None, None, Some(n)),
        };
        SettingsRecord {
            protocol: self.protocol.to_string(),
            direction: self.direction.to_string(),
            streams: self.streams,
            block_size: self.block_size as u32,
            bandwidth: self.bandwidth,
            duration_ms,
            bytes,
            packets,
            interval_ms: self.interval.as_millis() as u64,
            window: self.window.and_then(|w| u32::try_from(w).ok()),
            no_delay: if self.protocol == Protocol::Tcp { Some(self.no_delay) } else { None },
            tos: self.tos,
        }
    }
}

impl TryFrom<&SettingsRecord> for Settings {
    type Error = ConfigError;

    fn try_from(record: &SettingsRecord) -> Result<Self, Self::Error> {
        let amount = match (record.duration_ms, record.bytes, record.packets) {
            (Some(ms), None, None) => Amount::Duration(Duration::from_millis(ms)),
            (None, Some(n), None) => Amount::Bytes(n),
            (None, None, Some(n)) => Amount::Packets(n),
            _ => return Err(ConfigError::AmbiguousAmount),
        };
        Ok(Settings {
            protocol: record.protocol.parse()?,
            direction: record.direction.parse()?,
            streams: record.streams,
            block_size: record.block_size as usize,
            bandwidth: record.bandwidth,
            amount,
            interval: Duration::from_millis(record.interval_ms),
            window: record.window.map(|w| w as usize),
            no_delay: record.no_delay.unwrap_or(false),
            tos: record.tos,
        })
    }
}
