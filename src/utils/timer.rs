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

//! Interval ticks and the test deadline, computed from a fixed origin so that
//! late wake-ups never accumulate into drift.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::Result;

/// longest single sleep, so that a stop request is noticed promptly
const MAX_SLEEP: Duration = Duration::from_millis(50);

/// reporting-interval boundaries: interval `k` spans `boundary(k)..boundary(k + 1)`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickSchedule {
    origin: Instant,
    interval: Duration,
}

impl TickSchedule {
    /// an `interval` of zero yields a schedule without ticks
    pub fn new(origin: Instant, interval: Duration) -> TickSchedule {
        TickSchedule { origin, interval }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_one_shot(&self) -> bool {
        self.interval.is_zero()
    }

    pub fn boundary(&self, k: u64) -> Instant {
        self.origin + self.offset(k)
    }

    /// seconds from the origin to `boundary(k)`
    pub fn seconds(&self, k: u64) -> f64 {
        self.offset(k).as_secs_f64()
    }

    fn offset(&self, k: u64) -> Duration {
        let nanos = self.interval.as_nanos().saturating_mul(u128::from(k));
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// index of the interval containing `t`; equivalently, how many intervals have closed by `t`
    pub fn interval_at(&self, t: Instant) -> u64 {
        if self.is_one_shot() {
            return 0;
        }
        let elapsed = t.saturating_duration_since(self.origin);
        (elapsed.as_nanos() / self.interval.as_nanos()) as u64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerEvent {
    /// every interval up to and including `k` has closed; missed ticks are folded into one
    Tick(u64),
    /// the test's duration has elapsed
    Deadline,
}

pub struct TimerService {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TimerService {
    /// starts a timer thread that feeds `sink`; a tick due at the same instant as the
    /// deadline is delivered first, and nothing is delivered after the deadline
    pub fn start<F>(schedule: TickSchedule, deadline: Option<Instant>, mut sink: F) -> Result<TimerService>
    where
        F: FnMut(TimerEvent) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let c_stop = stop.clone();
        let handle = thread::Builder::new().name("timer".to_string()).spawn(move || {
            let mut closed: u64 = 0;
            while !c_stop.load(Ordering::Relaxed) {
                let now = Instant::now();
                if !schedule.is_one_shot() {
                    let newly_closed = schedule.interval_at(now);
                    if newly_closed > closed {
                        if newly_closed > closed + 1 {
                            log::debug!("timer fell behind; coalescing ticks {}..{}", closed, newly_closed);
                        }
                        closed = newly_closed;
                        sink(TimerEvent::Tick(closed - 1));
                    }
                }
                if let Some(deadline) = deadline {
                    if now >= deadline {
                        sink(TimerEvent::Deadline);
                        break;
                    }
                }

                let mut wake = now + MAX_SLEEP;
                if !schedule.is_one_shot() {
                    wake = wake.min(schedule.boundary(closed + 1));
                }
                if let Some(deadline) = deadline {
                    wake = wake.min(deadline);
                }
                thread::sleep(wake.saturating_duration_since(Instant::now()));
            }
            log::trace!("timer stopped");
        })?;
        Ok(TimerService {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("timer thread panicked");
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.stop();
    }
}
