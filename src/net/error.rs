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

//! Typed error taxonomy for the networking stack: every failure that crosses a
//! component boundary becomes a [`NetworkError`] with a kind, a severity, and
//! enough structured context to act on without re-parsing a message string.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::metrics::NetworkMetrics;
use std::sync::Arc;

const HISTORY_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Protocol,
    Authentication,
    RateLimit,
    Validation,
    Sync,
    Peer,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Ordered so `severity >= ErrorSeverity::High` reads naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Error, Serialize)]
#[error("{kind} [{severity:?}]: {message}")]
pub struct NetworkError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub details: Value,
    pub timestamp: f64,
}

impl NetworkError {
    pub fn new(kind: ErrorKind, severity: ErrorSeverity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            details: Value::Null,
            timestamp: now_ts(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub type ErrorObserver = Arc<dyn Fn(&NetworkError) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub error_counts: HashMap<String, u64>,
    pub recent_errors: Vec<NetworkError>,
}

struct Inner {
    counts: HashMap<ErrorKind, u64>,
    history: VecDeque<NetworkError>,
    observers: HashMap<ErrorKind, Vec<ErrorObserver>>,
}

/// Central error sink: records every [`NetworkError`] raised anywhere in the
/// stack, keeps a bounded history for diagnostics, and fans severity-gated
/// observers out without letting a panicking observer take the node down.
pub struct ErrorHandler {
    metrics: Arc<NetworkMetrics>,
    inner: Mutex<Inner>,
}

impl ErrorHandler {
    pub fn new(metrics: Arc<NetworkMetrics>) -> Self {
        Self {
            metrics,
            inner: Mutex::new(Inner {
                counts: HashMap::new(),
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
                observers: HashMap::new(),
            }),
        }
    }

    pub fn metrics(&self) -> &Arc<NetworkMetrics> {
        &self.metrics
    }

    /// Registers an observer invoked whenever an error of `kind` is handled.
    /// Observer panics are caught and logged; they never propagate.
    pub fn register_observer(&self, kind: ErrorKind, observer: ErrorObserver) {
        self.inner
            .lock()
            .unwrap()
            .observers
            .entry(kind)
            .or_default()
            .push(observer);
    }

    pub fn handle_error(&self, error: NetworkError, peer_id: Option<&str>) {
        let level = match error.severity {
            ErrorSeverity::Low => tracing::Level::DEBUG,
            ErrorSeverity::Medium => tracing::Level::WARN,
            ErrorSeverity::High | ErrorSeverity::Critical => tracing::Level::ERROR,
        };
        match level {
            tracing::Level::DEBUG => tracing::debug!(kind = %error.kind, peer = peer_id, msg = %error.message, "network error"),
            tracing::Level::WARN => tracing::warn!(kind = %error.kind, peer = peer_id, msg = %error.message, "network error"),
            _ => tracing::error!(kind = %error.kind, peer = peer_id, msg = %error.message, "network error"),
        }

        if let Some(peer) = peer_id {
            self.metrics.record_error(peer, &error.kind.to_string());
        }

        let observers_to_run: Vec<ErrorObserver> = {
            let mut inner = self.inner.lock().unwrap();
            *inner.counts.entry(error.kind).or_insert(0) += 1;
            if inner.history.len() >= HISTORY_CAPACITY {
                inner.history.pop_front();
            }
            inner.history.push_back(error.clone());
            inner
                .observers
                .get(&error.kind)
                .map(|v| v.to_vec())
                .unwrap_or_default()
        };

        for observer in observers_to_run {
            let result = catch_unwind(AssertUnwindSafe(|| observer(&error)));
            if result.is_err() {
                tracing::error!(kind = %error.kind, "error observer panicked");
            }
        }
    }

    pub fn stats(&self) -> ErrorStats {
        let inner = self.inner.lock().unwrap();
        let total = inner.counts.values().sum();
        let error_counts = inner
            .counts
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        let recent_errors = inner.history.iter().rev().take(10).cloned().collect();
        ErrorStats {
            total_errors: total,
            error_counts,
            recent_errors,
        }
    }

    pub fn clear_history(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.history.clear();
        inner.counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handler() -> ErrorHandler {
        ErrorHandler::new(Arc::new(NetworkMetrics::new().unwrap()))
    }

    #[test]
    fn history_is_bounded() {
        let h = handler();
        for i in 0..(HISTORY_CAPACITY + 10) {
            h.handle_error(
                NetworkError::new(ErrorKind::Internal, ErrorSeverity::Low, format!("e{i}")),
                None,
            );
        }
        assert_eq!(h.stats().total_errors, (HISTORY_CAPACITY + 10) as u64);
        assert!(h.inner.lock().unwrap().history.len() <= HISTORY_CAPACITY);
    }

    #[test]
    fn observer_panic_does_not_propagate() {
        let h = handler();
        let called = Arc::new(AtomicUsize::new(0));
        let called2 = called.clone();
        h.register_observer(
            ErrorKind::Protocol,
            Arc::new(move |_: &NetworkError| {
                called2.fetch_add(1, Ordering::SeqCst);
                panic!("boom");
            }),
        );
        h.handle_error(
            NetworkError::new(ErrorKind::Protocol, ErrorSeverity::High, "bad frame"),
            Some("peer-1"),
        );
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn severity_ordering() {
        assert!(ErrorSeverity::Critical > ErrorSeverity::High);
        assert!(ErrorSeverity::High > ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium > ErrorSeverity::Low);
    }
}
