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

//! Per-peer and global rate limiting (C2/C3): leaky token buckets for message
//! rate and bandwidth, a rolling request-frequency window, and progressive
//! blocking for peers that blow through the window repeatedly.

pub mod bucket;

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use bucket::TokenBucket;

const DEFAULT_MESSAGE_RATE: f64 = 100.0;
const DEFAULT_BANDWIDTH_RATE: f64 = 1024.0 * 1024.0;
const BURST_MULTIPLIER: f64 = 2.0;
const REQUEST_WINDOW_SECS: f64 = 60.0;
const MAX_REQUESTS_PER_WINDOW: usize = 1000;
const BLOCK_DURATION_SECS: f64 = 300.0;
const GLOBAL_SCALE: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub default_message_rate: f64,
    pub default_bandwidth_rate: f64,
    pub burst_multiplier: f64,
    pub request_window_secs: f64,
    pub max_requests_per_window: usize,
    pub block_duration_secs: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            default_message_rate: DEFAULT_MESSAGE_RATE,
            default_bandwidth_rate: DEFAULT_BANDWIDTH_RATE,
            burst_multiplier: BURST_MULTIPLIER,
            request_window_secs: REQUEST_WINDOW_SECS,
            max_requests_per_window: MAX_REQUESTS_PER_WINDOW,
            block_duration_secs: BLOCK_DURATION_SECS,
        }
    }
}

struct PeerLimits {
    message_bucket: TokenBucket,
    bandwidth_bucket: TokenBucket,
    request_history: VecDeque<(f64, String, usize)>,
    blocked_until: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerRateStats {
    pub node_id: String,
    pub blocked: bool,
    pub blocked_remaining_secs: f64,
    pub requests_in_window: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalRateStats {
    pub registered_peers: usize,
    pub blocked_peers: usize,
}

/// Owns every peer's token buckets and the two global buckets. Not
/// internally locked: callers wrap it (typically `tokio::sync::Mutex`) so a
/// single critical section covers the whole admit-or-reject decision.
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    peers: HashMap<String, PeerLimits>,
    global_message_bucket: TokenBucket,
    global_bandwidth_bucket: TokenBucket,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        let global_message_bucket = TokenBucket::new(
            cfg.default_message_rate * GLOBAL_SCALE,
            cfg.default_message_rate * GLOBAL_SCALE,
        );
        let global_bandwidth_bucket = TokenBucket::new(
            cfg.default_bandwidth_rate * GLOBAL_SCALE,
            cfg.default_bandwidth_rate * GLOBAL_SCALE,
        );
        Self {
            cfg,
            peers: HashMap::new(),
            global_message_bucket,
            global_bandwidth_bucket,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    pub fn add_peer(&mut self, node_id: &str) {
        self.peers.entry(node_id.to_string()).or_insert_with(|| PeerLimits {
            message_bucket: TokenBucket::new(
                self.cfg.default_message_rate * self.cfg.burst_multiplier,
                self.cfg.default_message_rate,
            ),
            bandwidth_bucket: TokenBucket::new(
                self.cfg.default_bandwidth_rate * self.cfg.burst_multiplier,
                self.cfg.default_bandwidth_rate,
            ),
            request_history: VecDeque::new(),
            blocked_until: 0.0,
        });
    }

    pub fn remove_peer(&mut self, node_id: &str) {
        self.peers.remove(node_id);
    }

    /// Per-peer rate overrides (e.g. a trusted bootstrap node). Returns
    /// `false` if the peer isn't registered.
    pub fn update_limits(&mut self, node_id: &str, message_rate: Option<f64>, bandwidth_rate: Option<f64>) -> bool {
        let Some(peer) = self.peers.get_mut(node_id) else {
            return false;
        };
        if let Some(rate) = message_rate {
            peer.message_bucket = TokenBucket::new(rate * self.cfg.burst_multiplier, rate);
        }
        if let Some(rate) = bandwidth_rate {
            peer.bandwidth_bucket = TokenBucket::new(rate * self.cfg.burst_multiplier, rate);
        }
        true
    }

    /// Admits or rejects one frame of `size` bytes and type `msg_type` from
    /// `node_id`. Order of checks matches the original design precisely:
    /// block status, then global buckets, then per-peer buckets, then the
    /// rolling window -- global-bucket consumption is not rolled back if a
    /// later check fails.
    pub fn is_allowed(&mut self, node_id: &str, msg_type: &str, size: usize) -> (bool, Option<String>) {
        let now = now_ts();

        let Some(peer) = self.peers.get_mut(node_id) else {
            return (false, Some("peer not registered with rate limiter".to_string()));
        };

        if peer.blocked_until > now {
            return (
                false,
                Some(format!("peer blocked for {:.1}s", peer.blocked_until - now)),
            );
        }

        if !self.global_message_bucket.consume(1.0) {
            return (false, Some("global message rate limit exceeded".to_string()));
        }
        if !self.global_bandwidth_bucket.consume(size as f64) {
            return (false, Some("global bandwidth limit exceeded".to_string()));
        }

        let peer = self.peers.get_mut(node_id).expect("checked above");
        if !peer.message_bucket.consume(1.0) {
            return (false, Some("peer message rate limit exceeded".to_string()));
        }
        if !peer.bandwidth_bucket.consume(size as f64) {
            return (false, Some("peer bandwidth rate limit exceeded".to_string()));
        }

        peer.request_history.push_back((now, msg_type.to_string(), size));
        while let Some((ts, _, _)) = peer.request_history.front() {
            if now - ts > self.cfg.request_window_secs {
                peer.request_history.pop_front();
            } else {
                break;
            }
        }

        if peer.request_history.len() > self.cfg.max_requests_per_window {
            block_peer(peer, now, self.cfg.block_duration_secs);
        }

        (true, None)
    }

    pub fn peer_stats(&self, node_id: &str) -> Option<PeerRateStats> {
        let now = now_ts();
        self.peers.get(node_id).map(|p| PeerRateStats {
            node_id: node_id.to_string(),
            blocked: p.blocked_until > now,
            blocked_remaining_secs: (p.blocked_until - now).max(0.0),
            requests_in_window: p.request_history.len(),
        })
    }

    pub fn global_stats(&self) -> GlobalRateStats {
        let now = now_ts();
        GlobalRateStats {
            registered_peers: self.peers.len(),
            blocked_peers: self.peers.values().filter(|p| p.blocked_until > now).count(),
        }
    }
}

fn block_peer(peer: &mut PeerLimits, now: f64, block_duration: f64) {
    if peer.blocked_until > now {
        peer.blocked_until = now + block_duration * 2.0;
    } else {
        peer.blocked_until = now + block_duration;
    }
}

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_peer_is_rejected() {
        let mut limiter = RateLimiter::with_defaults();
        let (allowed, reason) = limiter.is_allowed("ghost", "heartbeat", 10);
        assert!(!allowed);
        assert!(reason.unwrap().contains("not registered"));
    }

    #[test]
    fn exhausting_peer_bucket_blocks_further_frames() {
        let mut cfg = RateLimiterConfig::default();
        cfg.default_message_rate = 1.0;
        cfg.burst_multiplier = 1.0;
        let mut limiter = RateLimiter::new(cfg);
        limiter.add_peer("p1");
        let (first, _) = limiter.is_allowed("p1", "heartbeat", 1);
        assert!(first);
        let (second, reason) = limiter.is_allowed("p1", "heartbeat", 1);
        assert!(!second);
        assert!(reason.unwrap().contains("rate limit"));
    }

    #[test]
    fn window_overflow_blocks_peer_for_configured_duration() {
        let mut cfg = RateLimiterConfig::default();
        cfg.default_message_rate = 1_000_000.0;
        cfg.default_bandwidth_rate = 1_000_000_000.0;
        cfg.max_requests_per_window = 3;
        let mut limiter = RateLimiter::new(cfg);
        limiter.add_peer("p1");
        for _ in 0..4 {
            limiter.is_allowed("p1", "heartbeat", 1);
        }
        let stats = limiter.peer_stats("p1").unwrap();
        assert!(stats.blocked);
        assert!(stats.blocked_remaining_secs > 0.0);
    }
}
