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

//! Report shapes handed to the external formatter.

use serde::{Deserialize, Serialize};

use crate::protocol::messaging::SettingsRecord;
use crate::settings::Flow;

/// the current wall-clock time, RFC 3339
pub fn get_unix_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// bits per second over `seconds`; zero when the span is empty
pub fn bits_per_second(bytes: u64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        bytes as f64 * 8.0 / seconds
    } else {
        0.0
    }
}

/// statistics over one span of time, either one interval or the whole test
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct IntervalRecord {
    /// seconds since the test started
    pub interval_start: f64,
    pub interval_end: f64,
    pub bytes: u64,
    pub bits_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retransmits: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_packets: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_of_order: Option<u64>,
}

impl IntervalRecord {
    pub fn seconds(&self) -> f64 {
        self.interval_end - self.interval_start
    }

    /// percentage of datagrams lost, when loss was measured
    pub fn lost_percent(&self) -> Option<f64> {
        let lost = self.lost_packets?;
        let expected = lost + self.packets.unwrap_or(0);
        if expected == 0 {
            Some(0.0)
        } else {
            Some(lost as f64 * 100.0 / expected as f64)
        }
    }

    /// sums records that cover the same span; jitter is averaged over the streams that measured it
    pub fn sum<'a>(records: impl IntoIterator<Item = &'a IntervalRecord>) -> IntervalRecord {
        fn add(total: Option<u64>, value: Option<u64>) -> Option<u64> {
            match (total, value) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
            }
        }

        let mut sum = IntervalRecord::default();
        let mut jitter_total = 0.0;
        let mut jitter_count = 0;
        let mut first = true;
        for record in records {
            if first {
                sum.interval_start = record.interval_start;
                sum.interval_end = record.interval_end;
                first = false;
            } else {
                sum.interval_start = sum.interval_start.min(record.interval_start);
                sum.interval_end = sum.interval_end.max(record.interval_end);
            }
            sum.bytes += record.bytes;
            sum.bits_per_second += record.bits_per_second;
            sum.packets = add(sum.packets, record.packets);
            sum.retransmits = add(sum.retransmits, record.retransmits);
            sum.lost_packets = add(sum.lost_packets, record.lost_packets);
            sum.out_of_order = add(sum.out_of_order, record.out_of_order);
            if let Some(jitter_ms) = record.jitter_ms {
                jitter_total += jitter_ms;
                jitter_count += 1;
            }
        }
        if jitter_count > 0 {
            sum.jitter_ms = Some(jitter_total / jitter_count as f64);
        }
        sum
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct StreamInterval {
    pub stream_idx: usize,
    pub record: IntervalRecord,
}

/// one reporting period across every stream, emitted once per timer tick
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct IntervalReport {
    pub index: u64,
    pub streams: Vec<StreamInterval>,
    pub sum: IntervalRecord,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct StreamReport {
    pub stream_idx: usize,
    pub flow: Flow,
    /// true when this side sent the stream's data
    pub sending: bool,
    pub intervals: Vec<IntervalRecord>,
    pub cumulative: IntervalRecord,
    /// the peer's cumulative view, received at the end of the test
    pub peer: Option<IntervalRecord>,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Done,
    Cancelled,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct FinalReport {
    pub cookie: uuid::Uuid,
    pub settings: SettingsRecord,
    pub started: String,
    pub outcome: Outcome,
    pub streams: Vec<StreamReport>,
    pub sum: IntervalRecord,
    pub sum_peer: Option<IntervalRecord>,
}

impl FinalReport {
    /// the report of a session cancelled before any stream was opened
    pub fn cancelled_before_start(settings: SettingsRecord) -> FinalReport {
        FinalReport {
            cookie: uuid::Uuid::nil(),
            settings,
            started: get_unix_timestamp(),
            outcome: Outcome::Cancelled,
            streams: Vec::new(),
            sum: IntervalRecord::default(),
            sum_peer: None,
        }
    }

    pub fn stream(&self, stream_idx: usize) -> Option<&StreamReport> {
        self.streams.iter().find(|s| s.stream_idx == stream_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(bytes: u64, jitter_ms: Option<f64>) -> IntervalRecord {
        IntervalRecord {
            interval_start: 1.0,
            interval_end: 2.0,
            bytes,
            bits_per_second: bits_per_second(bytes, 1.0),
            packets: Some(10),
            jitter_ms,
            lost_packets: Some(1),
            ..IntervalRecord::default()
        }
    }

    #[test]
    fn sum_adds_counters_and_averages_jitter() {
        let sum = IntervalRecord::sum(&[record(100, Some(1.0)), record(300, Some(3.0)), record(0, None)]);
        assert_eq!(sum.bytes, 400);
        assert_eq!(sum.bits_per_second, 3200.0);
        assert_eq!(sum.packets, Some(30));
        assert_eq!(sum.lost_packets, Some(3));
        assert_eq!(sum.retransmits, None);
        assert_eq!(sum.jitter_ms, Some(2.0));
        assert_eq!(sum.seconds(), 1.0);
    }

    #[test]
    fn empty_span_has_no_throughput() {
        assert_eq!(bits_per_second(1000, 0.0), 0.0);
        assert_eq!(bits_per_second(1000, 2.0), 4000.0);
    }

    #[test]
    fn absent_fields_are_not_serialized() {
        let value = serde_json::to_value(IntervalRecord::default()).unwrap();
        assert!(value.get("jitter_ms").is_none());
        assert_eq!(value["bytes"], 0);
    }

    #[test]
    fn lost_percent_counts_lost_against_expected() {
        let r = record(0, None);
        let pct = r.lost_percent().unwrap();
        assert!((pct - 100.0 / 11.0).abs() < 1e-9);
    }
}
