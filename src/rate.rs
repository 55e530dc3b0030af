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

//! Token-bucket pacing for bandwidth-targeted streams.
//!
//! Tokens are bytes. They refill from the monotonic time that has elapsed since the
//! previous call rather than in fixed increments, so a sender that wakes late is
//! credited exactly for the time it slept. The bucket holds roughly one reporting
//! interval's worth of traffic and starts empty, so no interval can carry more
//! than twice its share.

use std::time::Duration;

/// the span used to size the bucket when interval reporting is disabled
const ONE_SHOT_SPAN: Duration = Duration::from_secs(1);

/// the longest a sender is told to wait before asking again
const MAX_WAIT: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// bytes per second; `None` disables throttling
    rate: Option<f64>,
    capacity: f64,
    tokens: f64,
    last: Duration,
}

impl TokenBucket {
    pub fn unlimited() -> TokenBucket {
        TokenBucket {
            rate: None,
            capacity: 0.0,
            tokens: 0.0,
            last: Duration::ZERO,
        }
    }

    /// a bucket pacing `bits_per_second`, able to hold `span` worth of traffic but never less than one block
    pub fn new(bits_per_second: u64, span: Duration, block_size: usize) -> TokenBucket {
        let rate = bits_per_second as f64 / 8.0;
        let span = if span.is_zero() { ONE_SHOT_SPAN } else { span };
        TokenBucket {
            rate: Some(rate),
            capacity: (rate * span.as_secs_f64()).max(block_size as f64),
            tokens: 0.0,
            last: Duration::ZERO,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.rate.is_some()
    }

    fn refill(&mut self, elapsed: Duration) {
        if let Some(rate) = self.rate {
            let delta = elapsed.saturating_sub(self.last);
            self.tokens = (self.tokens + rate * delta.as_secs_f64()).min(self.capacity);
        }
        self.last = self.last.max(elapsed);
    }

    /// how many of `requested` bytes may be sent now; `elapsed` is the monotonic time since the stream began.
    /// Never more than `requested`; always `requested` when unthrottled.
    pub fn admit(&mut self, requested: usize, elapsed: Duration) -> usize {
        if self.rate.is_none() {
            return requested;
        }
        self.refill(elapsed);
        let allowed = (self.tokens.floor() as usize).min(requested);
        self.tokens -= allowed as f64;
        allowed
    }

    /// returns tokens for bytes that were admitted but could not be sent
    pub fn refund(&mut self, unused: usize) {
        if self.rate.is_some() {
            self.tokens = (self.tokens + unused as f64).min(self.capacity);
        }
    }

    /// roughly how long until `wanted` bytes would be admitted
    pub fn wait_hint(&self, wanted: usize) -> Duration {
        match self.rate {
            Some(rate) if rate > 0.0 => {
                let deficit = (wanted.min(self.capacity as usize) as f64 - self.tokens).max(0.0);
                Duration::from_secs_f64(deficit / rate).min(MAX_WAIT)
            }
            _ => Duration::ZERO,
        }
    }
}
