// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A single leaky/token bucket: capacity, refill rate, and the tokens
//! currently available. Used for both per-peer and global message/bandwidth
//! limits by the enclosing [`super::RateLimiter`].

use std::time::Instant;

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    fill_rate: f64,
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, fill_rate: f64) -> Self {
        Self {
            capacity,
            fill_rate,
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    /// Refills based on elapsed time, then attempts to consume `amount`
    /// tokens. Returns whether the consumption succeeded.
    pub fn consume(&mut self, amount: f64) -> bool {
        self.refill();
        if amount <= self.tokens {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.fill_rate).min(self.capacity);
        self.last_update = now;
    }

    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}
