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

//! Merges per-stream transfer deltas into interval and cumulative reports.
//!
//! The aggregator is owned by the session driver and never touches the network.
//! Samples are buffered per stream and consumed once, when the interval they
//! belong to (or a later one) is closed; every interval record is the difference
//! between the running totals at its close and at the previous close.

use crate::protocol::messaging::StreamResult;
use crate::protocol::results::{bits_per_second, IntervalRecord, IntervalReport, StreamInterval, StreamReport};
use crate::settings::{Flow, Protocol};
use crate::stream::{IntervalSample, TransferDelta};
use crate::utils::timer::TickSchedule;

/// which stream a ledger tracks, and whether this side sends on it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamSlot {
    pub stream_idx: usize,
    pub flow: Flow,
    pub sending: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
struct Totals {
    bytes: u64,
    packets: Option<u64>,
    retransmits: Option<u64>,
    out_of_order: u64,
    highest_sequence: Option<u64>,
    jitter_ms: Option<f64>,
}

impl Totals {
    fn apply(&mut self, delta: &TransferDelta) {
        fn add(total: &mut Option<u64>, value: Option<u64>) {
            if let Some(value) = value {
                *total = Some(total.unwrap_or(0) + value);
            }
        }

        self.bytes += delta.bytes;
        add(&mut self.packets, delta.packets);
        add(&mut self.retransmits, delta.retransmits);
        self.out_of_order += delta.out_of_order;
        if delta.highest_sequence > self.highest_sequence {
            self.highest_sequence = delta.highest_sequence;
        }
        if delta.jitter_ms.is_some() {
            self.jitter_ms = delta.jitter_ms;
        }
    }

    /// `max(seq) + 1 - received`, never negative
    fn lost(&self) -> u64 {
        match self.highest_sequence {
            Some(highest) => (highest + 1).saturating_sub(self.packets.unwrap_or(0)),
            None => 0,
        }
    }
}

struct StreamLedger {
    slot: StreamSlot,
    totals: Totals,
    /// totals as of the last closed interval
    reported: Totals,
    /// loss already attributed to closed intervals; late arrivals can leave this above the current loss
    lost_reported: u64,
    pending: Vec<(u64, TransferDelta)>,
    last_tick: Option<u64>,
    done: bool,
    intervals: Vec<IntervalRecord>,
}

impl StreamLedger {
    fn absorb_through(&mut self, k: Option<u64>) {
        let (ready, later): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|(tick, _)| k.map_or(true, |k| *tick <= k));
        self.pending = later;
        for (_, delta) in ready {
            self.totals.apply(&delta);
        }
    }

    /// the record for the span since the previous close, with the receive-side fields only where they were measured
    fn record_since(&self, previous: &Totals, current: &Totals, start: f64, end: f64, protocol: Protocol) -> IntervalRecord {
        let bytes = current.bytes - previous.bytes;
        let udp_receiver = protocol == Protocol::Udp && !self.slot.sending;
        IntervalRecord {
            interval_start: start,
            interval_end: end,
            bytes,
            bits_per_second: bits_per_second(bytes, end - start),
            packets: current.packets.map(|packets| packets - previous.packets.unwrap_or(0)),
            retransmits: current.retransmits.map(|retransmits| retransmits - previous.retransmits.unwrap_or(0)),
            jitter_ms: if udp_receiver { current.jitter_ms } else { None },
            lost_packets: if udp_receiver {
                Some(current.lost().saturating_sub(previous.lost()))
            } else {
                None
            },
            out_of_order: if udp_receiver {
                Some(current.out_of_order - previous.out_of_order)
            } else {
                None
            },
        }
    }

    /// loss not yet attributed to any interval; stragglers only ever reduce what is still owed
    fn take_unreported_loss(&mut self) -> u64 {
        let lost = self.totals.lost().saturating_sub(self.lost_reported);
        self.lost_reported += lost;
        lost
    }

    /// takes back loss that late arrivals disproved, newest interval first,
    /// so that the interval losses add up to the cumulative loss
    fn reconcile_loss(&mut self) {
        let mut excess = self.lost_reported.saturating_sub(self.totals.lost());
        for record in self.intervals.iter_mut().rev() {
            if excess == 0 {
                break;
            }
            if let Some(lost) = record.lost_packets.as_mut() {
                let taken = excess.min(*lost);
                *lost -= taken;
                excess -= taken;
            }
        }
        self.lost_reported = self.totals.lost();
    }

    fn close(&mut self, start: f64, end: f64, protocol: Protocol) -> IntervalRecord {
        let mut record = self.record_since(&self.reported, &self.totals, start, end, protocol);
        if record.lost_packets.is_some() {
            record.lost_packets = Some(self.take_unreported_loss());
        }
        self.reported = self.totals.clone();
        self.intervals.push(record.clone());
        record
    }
}

pub struct Aggregator {
    schedule: TickSchedule,
    protocol: Protocol,
    streams: Vec<StreamLedger>,
    /// number of intervals closed so far
    closed: u64,
    /// seconds from the origin at which the last interval record ends
    last_end: f64,
    finished_at: Option<f64>,
}

impl Aggregator {
    pub fn new(schedule: TickSchedule, slots: &[StreamSlot], protocol: Protocol) -> Aggregator {
        let streams = slots
            .iter()
            .map(|slot| StreamLedger {
                slot: *slot,
                totals: Totals::default(),
                reported: Totals::default(),
                lost_reported: 0,
                pending: Vec::new(),
                last_tick: None,
                done: false,
                intervals: Vec::new(),
            })
            .collect();
        Aggregator {
            schedule,
            protocol,
            streams,
            closed: 0,
            last_end: 0.0,
            finished_at: None,
        }
    }

    fn ledger(&mut self, stream_idx: usize) -> Option<&mut StreamLedger> {
        self.streams.iter_mut().find(|ledger| ledger.slot.stream_idx == stream_idx)
    }

    pub fn on_sample(&mut self, sample: IntervalSample) {
        let ledger = match self.ledger(sample.stream_idx) {
            Some(ledger) => ledger,
            None => {
                log::warn!("discarding sample for unknown stream {}", sample.stream_idx);
                return;
            }
        };
        ledger.last_tick = ledger.last_tick.max(Some(sample.tick));
        if sample.delta.finished {
            ledger.done = true;
        }
        ledger.pending.push((sample.tick, sample.delta));
    }

    /// a stream that will publish nothing more; its interval slots count as reported
    pub fn mark_done(&mut self, stream_idx: usize) {
        if let Some(ledger) = self.ledger(stream_idx) {
            ledger.done = true;
        }
    }

    /// whether every stream has reported through interval `k`
    pub fn is_complete(&self, k: u64) -> bool {
        self.streams
            .iter()
            .all(|ledger| ledger.done || ledger.last_tick.map_or(false, |tick| tick >= k))
    }

    /// closes every open interval up to and including `k` as one record per stream;
    /// samples that arrive after their interval closed are counted in the next one
    pub fn close_interval(&mut self, k: u64) -> Option<IntervalReport> {
        if self.schedule.is_one_shot() || k < self.closed {
            return None;
        }
        let start = self.schedule.seconds(self.closed);
        let end = self.schedule.seconds(k + 1);
        let protocol = self.protocol;

        let mut streams = Vec::with_capacity(self.streams.len());
        for ledger in self.streams.iter_mut() {
            ledger.absorb_through(Some(k));
            streams.push(StreamInterval {
                stream_idx: ledger.slot.stream_idx,
                record: ledger.close(start, end, protocol),
            });
        }
        if k > self.closed {
            log::debug!("coalesced intervals {}..={} into one report", self.closed, k);
        }
        self.closed = k + 1;
        self.last_end = end;

        let sum = IntervalRecord::sum(streams.iter().map(|stream| &stream.record));
        Some(IntervalReport { index: k, streams, sum })
    }

    /// consumes everything still buffered; `end` is seconds from the origin.
    /// A residual shorter than half an interval is folded into the last interval,
    /// anything longer becomes a final partial interval, which is returned.
    pub fn finish(&mut self, end: f64) -> Option<IntervalReport> {
        let partial = self.finish_intervals(end);
        for ledger in self.streams.iter_mut() {
            ledger.reconcile_loss();
        }
        partial
    }

    fn finish_intervals(&mut self, end: f64) -> Option<IntervalReport> {
        for ledger in self.streams.iter_mut() {
            ledger.absorb_through(None);
        }
        let end = end.max(self.last_end);
        self.finished_at = Some(end);

        if self.schedule.is_one_shot() {
            return None;
        }
        let residual = self.streams.iter().any(|ledger| ledger.totals != ledger.reported);
        if !residual {
            return None;
        }

        let half_interval = self.schedule.interval().as_secs_f64() / 2.0;
        let protocol = self.protocol;
        if self.closed > 0 && end - self.last_end < half_interval {
            log::debug!("folding {:.3}s of residual traffic into the last interval", end - self.last_end);
            for ledger in self.streams.iter_mut() {
                let previous = match ledger.intervals.pop() {
                    Some(record) => record,
                    None => continue,
                };
                let mut before = ledger.reported.clone();
                before.bytes -= previous.bytes;
                before.packets = before.packets.map(|packets| packets - previous.packets.unwrap_or(0));
                before.retransmits = before.retransmits.map(|retransmits| retransmits - previous.retransmits.unwrap_or(0));
                let mut record = ledger.record_since(&before, &ledger.totals, previous.interval_start, end, protocol);
                // loss and reordering are not differences of the rebuilt baseline
                if let (Some(lost), Some(previous_lost)) = (record.lost_packets.as_mut(), previous.lost_packets) {
                    *lost = previous_lost + ledger.take_unreported_loss();
                }
                if let (Some(out_of_order), Some(previous_out_of_order)) = (record.out_of_order.as_mut(), previous.out_of_order) {
                    *out_of_order = previous_out_of_order + (ledger.totals.out_of_order - ledger.reported.out_of_order);
                }
                ledger.reported = ledger.totals.clone();
                ledger.intervals.push(record);
            }
            self.last_end = end;
            return None;
        }

        let k = self.closed;
        let start = self.last_end;
        let mut streams = Vec::with_capacity(self.streams.len());
        for ledger in self.streams.iter_mut() {
            streams.push(StreamInterval {
                stream_idx: ledger.slot.stream_idx,
                record: ledger.close(start, end, protocol),
            });
        }
        self.closed += 1;
        self.last_end = end;
        let sum = IntervalRecord::sum(streams.iter().map(|stream| &stream.record));
        Some(IntervalReport { index: k, streams, sum })
    }

    fn cumulative_record(&self, ledger: &StreamLedger) -> IntervalRecord {
        let end = self.finished_at.unwrap_or(self.last_end);
        ledger.record_since(&Totals::default(), &ledger.totals, 0.0, end, self.protocol)
    }

    /// every stream's totals over the whole test, as sent to the peer
    pub fn cumulative(&self) -> Vec<StreamResult> {
        self.streams
            .iter()
            .map(|ledger| StreamResult {
                stream_idx: ledger.slot.stream_idx,
                totals: self.cumulative_record(ledger),
            })
            .collect()
    }

    pub fn into_reports(self) -> Vec<StreamReport> {
        self.streams
            .iter()
            .map(|ledger| StreamReport {
                stream_idx: ledger.slot.stream_idx,
                flow: ledger.slot.flow,
                sending: ledger.slot.sending,
                intervals: ledger.intervals.clone(),
                cumulative: self.cumulative_record(ledger),
                peer: None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn slots(sending: bool) -> Vec<StreamSlot> {
        (0..2)
            .map(|stream_idx| StreamSlot {
                stream_idx,
                flow: Flow::Upload,
                sending,
            })
            .collect()
    }

    fn sample(stream_idx: usize, tick: u64, bytes: u64) -> IntervalSample {
        IntervalSample {
            stream_idx,
            tick,
            delta: TransferDelta {
                bytes,
                ..TransferDelta::default()
            },
        }
    }

    fn udp_sample(tick: u64, packets: u64, highest: u64, out_of_order: u64) -> IntervalSample {
        IntervalSample {
            stream_idx: 0,
            tick,
            delta: TransferDelta {
                bytes: packets * 1200,
                packets: Some(packets),
                out_of_order,
                highest_sequence: Some(highest),
                jitter_ms: Some(0.25),
                ..TransferDelta::default()
            },
        }
    }

    fn schedule(interval: Duration) -> TickSchedule {
        TickSchedule::new(Instant::now(), interval)
    }

    #[test]
    fn intervals_sum_to_the_cumulative_totals() {
        let mut aggregator = Aggregator::new(schedule(Duration::from_secs(1)), &slots(true), Protocol::Tcp);
        let mut reports = Vec::new();
        for tick in 0..4 {
            aggregator.on_sample(sample(0, tick, 1000 + tick * 7));
            // stream 1 reports in two slices per interval
            aggregator.on_sample(sample(1, tick, 300));
            aggregator.on_sample(sample(1, tick, 211 * tick));
            assert!(aggregator.is_complete(tick));
            reports.push(aggregator.close_interval(tick).unwrap());
        }
        aggregator.on_sample(sample(0, 4, 55));
        assert!(aggregator.finish(4.0).is_none());

        let streams = aggregator.into_reports();
        for stream in &streams {
            let interval_bytes: u64 = stream.intervals.iter().map(|record| record.bytes).sum();
            assert_eq!(interval_bytes, stream.cumulative.bytes);
            assert_eq!(stream.intervals.len(), 4);
        }
        assert_eq!(streams[0].cumulative.bytes, 4000 + 7 * 6 + 55);
        assert_eq!(reports[2].sum.bytes, 1014 + 300 + 422);
        assert_eq!(reports[2].sum.bits_per_second, (1014 + 300 + 422) as f64 * 8.0);
    }

    #[test]
    fn late_samples_land_in_the_next_interval() {
        let mut aggregator = Aggregator::new(schedule(Duration::from_secs(1)), &slots(true), Protocol::Tcp);
        aggregator.on_sample(sample(0, 0, 100));
        assert!(!aggregator.is_complete(0));
        let first = aggregator.close_interval(0).unwrap();
        assert_eq!(first.streams[1].record.bytes, 0);

        aggregator.on_sample(sample(1, 0, 40));
        aggregator.on_sample(sample(1, 1, 60));
        aggregator.on_sample(sample(0, 1, 100));
        let second = aggregator.close_interval(1).unwrap();
        assert_eq!(second.streams[1].record.bytes, 100);

        // closing an interval twice yields nothing
        assert!(aggregator.close_interval(1).is_none());
    }

    #[test]
    fn missed_ticks_coalesce_into_one_record() {
        let mut aggregator = Aggregator::new(schedule(Duration::from_millis(500)), &slots(true), Protocol::Tcp);
        aggregator.on_sample(sample(0, 0, 10));
        aggregator.on_sample(sample(0, 1, 10));
        aggregator.on_sample(sample(0, 2, 10));
        let report = aggregator.close_interval(2).unwrap();
        assert_eq!(report.index, 2);
        assert_eq!(report.streams[0].record.interval_start, 0.0);
        assert_eq!(report.streams[0].record.interval_end, 1.5);
        assert_eq!(report.streams[0].record.bytes, 30);
        assert_eq!(report.streams[0].record.bits_per_second, 160.0);
    }

    #[test]
    fn one_shot_mode_only_produces_the_cumulative_report() {
        let mut aggregator = Aggregator::new(schedule(Duration::ZERO), &slots(true), Protocol::Tcp);
        aggregator.on_sample(sample(0, 0, 500));
        aggregator.on_sample(sample(0, 0, 500));
        assert!(aggregator.close_interval(0).is_none());
        assert!(aggregator.finish(2.0).is_none());

        let results = aggregator.cumulative();
        assert_eq!(results[0].totals.bytes, 1000);
        assert_eq!(results[0].totals.bits_per_second, 4000.0);
        assert!(aggregator.into_reports().iter().all(|stream| stream.intervals.is_empty()));
    }

    #[test]
    fn long_residuals_become_a_partial_interval() {
        let mut aggregator = Aggregator::new(schedule(Duration::from_secs(1)), &slots(true), Protocol::Tcp);
        aggregator.on_sample(sample(0, 0, 100));
        aggregator.close_interval(0);
        aggregator.on_sample(sample(0, 1, 80));
        let partial = aggregator.finish(1.8).unwrap();
        assert_eq!(partial.index, 1);
        assert_eq!(partial.streams[0].record.bytes, 80);
        assert!((partial.streams[0].record.seconds() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn short_residuals_fold_into_the_last_interval() {
        let mut aggregator = Aggregator::new(schedule(Duration::from_secs(1)), &slots(true), Protocol::Tcp);
        aggregator.on_sample(sample(0, 0, 100));
        aggregator.on_sample(sample(1, 0, 100));
        aggregator.close_interval(0);
        aggregator.on_sample(sample(0, 1, 20));
        assert!(aggregator.finish(1.1).is_none());

        let streams = aggregator.into_reports();
        assert_eq!(streams[0].intervals.len(), 1);
        assert_eq!(streams[0].intervals[0].bytes, 120);
        assert_eq!(streams[0].intervals[0].interval_end, 1.1);
        assert_eq!(streams[1].intervals[0].bytes, 100);
        assert_eq!(streams[0].cumulative.bytes, 120);
    }

    #[test]
    fn udp_receivers_report_loss_and_reordering() {
        let slot = StreamSlot {
            stream_idx: 0,
            flow: Flow::Upload,
            sending: false,
        };
        let mut aggregator = Aggregator::new(schedule(Duration::from_secs(1)), &[slot], Protocol::Udp);
        // sequences 0..=9 with 2 and 3 missing
        aggregator.on_sample(udp_sample(0, 8, 9, 0));
        let first = aggregator.close_interval(0).unwrap();
        assert_eq!(first.streams[0].record.lost_packets, Some(2));
        assert_eq!(first.streams[0].record.jitter_ms, Some(0.25));

        // one straggler shows up
        aggregator.on_sample(udp_sample(1, 1, 9, 1));
        let second = aggregator.close_interval(1).unwrap();
        assert_eq!(second.streams[0].record.lost_packets, Some(0));
        assert_eq!(second.streams[0].record.out_of_order, Some(1));
        aggregator.finish(2.0);

        let cumulative = &aggregator.cumulative()[0].totals;
        assert_eq!(cumulative.packets, Some(9));
        assert_eq!(cumulative.lost_packets, Some(1));
        assert_eq!(cumulative.lost_packets.unwrap() + cumulative.packets.unwrap(), 10);

        // the straggler's credit is taken back from the interval that counted it as lost
        let stream = &aggregator.into_reports()[0];
        let interval_lost: Vec<_> = stream.intervals.iter().map(|record| record.lost_packets).collect();
        assert_eq!(interval_lost, vec![Some(1), Some(0)]);
    }

    #[test]
    fn interval_losses_add_up_to_the_cumulative_loss() {
        let slot = StreamSlot {
            stream_idx: 0,
            flow: Flow::Upload,
            sending: false,
        };
        let mut aggregator = Aggregator::new(schedule(Duration::from_secs(1)), &[slot], Protocol::Udp);
        // 0..=9 with 2, 3 and 7 missing
        aggregator.on_sample(udp_sample(0, 7, 9, 0));
        aggregator.close_interval(0);
        // 2 shows up late, then 10..=14 with 12 missing
        aggregator.on_sample(udp_sample(1, 5, 14, 1));
        aggregator.close_interval(1);
        // 3 shows up late
        aggregator.on_sample(udp_sample(2, 1, 14, 1));
        aggregator.close_interval(2);
        assert!(aggregator.finish(3.0).is_none());

        let cumulative_lost = aggregator.cumulative()[0].totals.lost_packets.unwrap();
        assert_eq!(cumulative_lost, 2);
        let stream = &aggregator.into_reports()[0];
        let interval_lost: u64 = stream.intervals.iter().map(|record| record.lost_packets.unwrap()).sum();
        assert_eq!(interval_lost, cumulative_lost);
        assert!(stream.intervals.iter().all(|record| record.lost_packets.is_some()));
    }

    #[test]
    fn senders_carry_no_receive_side_fields() {
        let slot = StreamSlot {
            stream_idx: 0,
            flow: Flow::Upload,
            sending: true,
        };
        let mut aggregator = Aggregator::new(schedule(Duration::from_secs(1)), &[slot], Protocol::Udp);
        aggregator.on_sample(IntervalSample {
            stream_idx: 0,
            tick: 0,
            delta: TransferDelta {
                bytes: 1200,
                packets: Some(1),
                ..TransferDelta::default()
            },
        });
        let record = aggregator.close_interval(0).unwrap().streams[0].record.clone();
        assert_eq!(record.packets, Some(1));
        assert_eq!(record.lost_packets, None);
        assert_eq!(record.jitter_ms, None);
    }

    #[test]
    fn finished_streams_count_as_complete() {
        let mut aggregator = Aggregator::new(schedule(Duration::from_secs(1)), &slots(true), Protocol::Tcp);
        aggregator.on_sample(sample(0, 3, 1));
        assert!(!aggregator.is_complete(3));
        aggregator.mark_done(1);
        assert!(aggregator.is_complete(3));
        assert!(!aggregator.is_complete(4));
    }
}
