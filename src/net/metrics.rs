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

//! Prometheus-backed network metrics, mirroring the registration pattern used
//! by the node's other metric sets, plus an in-memory per-peer ledger for the
//! stats the registry itself can't cheaply answer (latency percentile inputs,
//! last-seen, rolling byte counters).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};
use serde::Serialize;
use thiserror::Error;

const LATENCY_SAMPLE_CAP: usize = 100;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus registration failed: {0}")]
    Registration(#[from] prometheus::Error),
}

pub struct NetworkMetrics {
    pub registry: Registry,
    pub connected_peers: IntGauge,
    pub messages_total: IntCounterVec,
    pub bytes_total: IntCounterVec,
    pub message_size: Histogram,
    pub message_latency: Histogram,
    pub peer_errors: IntCounterVec,
    pub rate_limited_total: IntCounterVec,
    pub sync_height: IntGauge,
    pub sync_target_height: IntGauge,
    pub sync_attempts_total: IntCounterVec,

    peers: Mutex<HashMap<String, PeerRecord>>,
}

struct PeerRecord {
    connected_at: Instant,
    messages_sent: u64,
    messages_received: u64,
    bytes_sent: u64,
    bytes_received: u64,
    errors: u64,
    last_seen: Instant,
    latency_samples: VecDeque<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStats {
    pub node_id: String,
    pub connected_seconds: f64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub last_seen_seconds_ago: f64,
    pub avg_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub peer_count: usize,
    pub total_messages_sent: u64,
    pub total_messages_received: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
}

impl NetworkMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let connected_peers = IntGauge::new("p2p_connected_peers", "currently connected peers")?;
        let messages_total = IntCounterVec::new(
            Opts::new("p2p_messages_total", "messages by type and direction"),
            &["type", "direction"],
        )?;
        let bytes_total = IntCounterVec::new(
            Opts::new("p2p_bytes_total", "bytes transferred by direction"),
            &["direction"],
        )?;
        let message_size = Histogram::with_opts(HistogramOpts::new(
            "p2p_message_size_bytes",
            "encoded message size",
        ))?;
        let message_latency = Histogram::with_opts(HistogramOpts::new(
            "p2p_message_round_trip_seconds",
            "request/response round trip latency",
        ))?;
        let peer_errors = IntCounterVec::new(
            Opts::new("p2p_peer_errors_total", "errors attributed to a peer"),
            &["peer_id", "kind"],
        )?;
        let rate_limited_total = IntCounterVec::new(
            Opts::new("p2p_rate_limited_total", "frames rejected by the rate limiter"),
            &["peer_id"],
        )?;
        let sync_height = IntGauge::new("p2p_sync_height", "local chain height as of the last sync attempt")?;
        let sync_target_height = IntGauge::new(
            "p2p_sync_target_height",
            "tallest peer height observed during the last sync attempt",
        )?;
        let sync_attempts_total = IntCounterVec::new(
            Opts::new("p2p_sync_attempts_total", "sync attempts by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(connected_peers.clone()))?;
        registry.register(Box::new(messages_total.clone()))?;
        registry.register(Box::new(bytes_total.clone()))?;
        registry.register(Box::new(message_size.clone()))?;
        registry.register(Box::new(message_latency.clone()))?;
        registry.register(Box::new(peer_errors.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;
        registry.register(Box::new(sync_height.clone()))?;
        registry.register(Box::new(sync_target_height.clone()))?;
        registry.register(Box::new(sync_attempts_total.clone()))?;

        Ok(Self {
            registry,
            connected_peers,
            messages_total,
            bytes_total,
            message_size,
            message_latency,
            peer_errors,
            rate_limited_total,
            sync_height,
            sync_target_height,
            sync_attempts_total,
            peers: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_peer(&self, node_id: &str) {
        self.connected_peers.inc();
        self.peers.lock().unwrap().insert(
            node_id.to_string(),
            PeerRecord {
                connected_at: Instant::now(),
                messages_sent: 0,
                messages_received: 0,
                bytes_sent: 0,
                bytes_received: 0,
                errors: 0,
                last_seen: Instant::now(),
                latency_samples: VecDeque::with_capacity(LATENCY_SAMPLE_CAP),
            },
        );
    }

    pub fn remove_peer(&self, node_id: &str) {
        if self.peers.lock().unwrap().remove(node_id).is_some() {
            self.connected_peers.dec();
        }
    }

    pub fn record_sent(&self, node_id: &str, msg_type: &str, size: usize) {
        self.messages_total
            .with_label_values(&[msg_type, "out"])
            .inc();
        self.bytes_total.with_label_values(&["out"]).inc_by(size as u64);
        self.message_size.observe(size as f64);
        if let Some(p) = self.peers.lock().unwrap().get_mut(node_id) {
            p.messages_sent += 1;
            p.bytes_sent += size as u64;
        }
    }

    pub fn record_received(&self, node_id: &str, msg_type: &str, size: usize) {
        self.messages_total
            .with_label_values(&[msg_type, "in"])
            .inc();
        self.bytes_total.with_label_values(&["in"]).inc_by(size as u64);
        self.message_size.observe(size as f64);
        if let Some(p) = self.peers.lock().unwrap().get_mut(node_id) {
            p.messages_received += 1;
            p.bytes_received += size as u64;
            p.last_seen = Instant::now();
        }
    }

    pub fn record_latency(&self, node_id: &str, seconds: f64) {
        self.message_latency.observe(seconds);
        if let Some(p) = self.peers.lock().unwrap().get_mut(node_id) {
            if p.latency_samples.len() >= LATENCY_SAMPLE_CAP {
                p.latency_samples.pop_front();
            }
            p.latency_samples.push_back(seconds * 1000.0);
        }
    }

    pub fn record_error(&self, node_id: &str, kind: &str) {
        self.peer_errors.with_label_values(&[node_id, kind]).inc();
        if let Some(p) = self.peers.lock().unwrap().get_mut(node_id) {
            p.errors += 1;
        }
    }

    pub fn record_rate_limited(&self, node_id: &str) {
        self.rate_limited_total.with_label_values(&[node_id]).inc();
    }

    pub fn record_sync_progress(&self, sync_height: u64, target_height: u64) {
        self.sync_height.set(sync_height as i64);
        self.sync_target_height.set(target_height as i64);
    }

    pub fn record_sync_attempt(&self, outcome: &str) {
        self.sync_attempts_total.with_label_values(&[outcome]).inc();
    }

    pub fn peer_stats(&self, node_id: &str) -> Option<PeerStats> {
        self.peers.lock().unwrap().get(node_id).map(|p| to_stats(node_id, p))
    }

    pub fn peer_list(&self) -> Vec<PeerStats> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, p)| to_stats(id, p))
            .collect()
    }

    pub fn network_stats(&self) -> NetworkStats {
        let peers = self.peers.lock().unwrap();
        let mut stats = NetworkStats {
            peer_count: peers.len(),
            total_messages_sent: 0,
            total_messages_received: 0,
            total_bytes_sent: 0,
            total_bytes_received: 0,
        };
        for p in peers.values() {
            stats.total_messages_sent += p.messages_sent;
            stats.total_messages_received += p.messages_received;
            stats.total_bytes_sent += p.bytes_sent;
            stats.total_bytes_received += p.bytes_received;
        }
        stats
    }
}

fn to_stats(node_id: &str, p: &PeerRecord) -> PeerStats {
    let avg_latency_ms = if p.latency_samples.is_empty() {
        None
    } else {
        Some(p.latency_samples.iter().sum::<f64>() / p.latency_samples.len() as f64)
    };
    PeerStats {
        node_id: node_id.to_string(),
        connected_seconds: p.connected_at.elapsed().as_secs_f64(),
        messages_sent: p.messages_sent,
        messages_received: p.messages_received,
        bytes_sent: p.bytes_sent,
        bytes_received: p.bytes_received,
        errors: p.errors,
        last_seen_seconds_ago: p.last_seen.elapsed().as_secs_f64(),
        avg_latency_ms,
    }
}

#[allow(dead_code)]
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
    fn tracks_peer_lifecycle() {
        let m = NetworkMetrics::new().unwrap();
        m.add_peer("peer-1");
        m.record_sent("peer-1", "heartbeat", 42);
        m.record_received("peer-1", "heartbeat", 10);
        let stats = m.peer_stats("peer-1").unwrap();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.bytes_sent, 42);
        m.remove_peer("peer-1");
        assert!(m.peer_stats("peer-1").is_none());
    }

    #[test]
    fn latency_window_is_bounded() {
        let m = NetworkMetrics::new().unwrap();
        m.add_peer("peer-1");
        for _ in 0..(LATENCY_SAMPLE_CAP + 20) {
            m.record_latency("peer-1", 0.01);
        }
        let stats = m.peer_stats("peer-1").unwrap();
        assert!(stats.avg_latency_ms.is_some());
    }
}
