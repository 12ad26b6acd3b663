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

//! Connection manager (C9): accepts and dials TCP connections, runs the
//! handshake, owns every live [`PeerHandle`], and drives the background
//! maintenance and peer-discovery loops. Every background task's
//! [`JoinHandle`] is retained and awaited on shutdown -- nothing here is
//! fire-and-forget.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::codec::{Message, MessageType};
use super::collaborators::{BlockchainStore, Validator};
use super::config::NetworkConfig;
use super::dispatch::Dispatcher;
use super::error::{ErrorHandler, ErrorKind, ErrorSeverity, NetworkError};
use super::metrics::NetworkMetrics;
use super::ratelimit::RateLimiter;
use super::session::{self, InboundSink, PeerHandle};

/// Routes inbound frames through the rate limiter before handing anything to
/// the dispatcher, and records metrics either way.
struct Gatekeeper {
    dispatcher: Arc<Dispatcher>,
    rate_limiter: Arc<StdMutex<RateLimiter>>,
    error_handler: Arc<ErrorHandler>,
    metrics: Arc<NetworkMetrics>,
    sessions: Arc<Mutex<std::collections::HashMap<String, PeerHandle>>>,
}

impl InboundSink for Gatekeeper {
    fn on_message(&self, peer_id: &str, msg: Message) -> Option<Message> {
        let type_str = msg.message_type.as_str();
        let size = serde_json::to_vec(&msg).map(|b| b.len()).unwrap_or(0);

        let allowed = {
            let mut limiter = self.rate_limiter.lock().unwrap();
            limiter.is_allowed(peer_id, type_str, size)
        };

        match allowed {
            (true, _) => {
                self.metrics.record_received(peer_id, type_str, size);
                self.dispatcher.dispatch(msg, peer_id)
            }
            (false, reason) => {
                self.metrics.record_rate_limited(peer_id);
                let reason = reason.unwrap_or_else(|| "rate limited".to_string());
                let not_registered = reason.contains("not registered");
                self.error_handler.handle_error(
                    NetworkError::new(ErrorKind::RateLimit, ErrorSeverity::Medium, reason),
                    Some(peer_id),
                );
                // A peer the limiter has never heard of is a session the
                // manager has already torn down or never finished setting
                // up; close it instead of letting it linger half-admitted.
                if not_registered {
                    tokio::spawn(close_peer_handle(
                        self.sessions.clone(),
                        self.rate_limiter.clone(),
                        self.metrics.clone(),
                        peer_id.to_string(),
                    ));
                }
                None
            }
        }
    }
}

async fn close_peer_handle(
    sessions: Arc<Mutex<std::collections::HashMap<String, PeerHandle>>>,
    rate_limiter: Arc<StdMutex<RateLimiter>>,
    metrics: Arc<NetworkMetrics>,
    node_id: String,
) {
    let handle = sessions.lock().await.remove(&node_id);
    if let Some(handle) = handle {
        handle.shutdown();
    }
    rate_limiter.lock().unwrap().remove_peer(&node_id);
    metrics.remove_peer(&node_id);
}

pub struct ConnectionManager {
    config: Arc<NetworkConfig>,
    dispatcher: Arc<Dispatcher>,
    rate_limiter: Arc<StdMutex<RateLimiter>>,
    error_handler: Arc<ErrorHandler>,
    metrics: Arc<NetworkMetrics>,
    sessions: Arc<Mutex<std::collections::HashMap<String, PeerHandle>>>,
    pending_dials: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        config: Arc<NetworkConfig>,
        store: Arc<dyn BlockchainStore>,
        validator: Option<Arc<dyn Validator>>,
        error_handler: Arc<ErrorHandler>,
        metrics: Arc<NetworkMetrics>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(config.node_id.clone(), store, validator));
        Self {
            config,
            dispatcher,
            rate_limiter: Arc::new(StdMutex::new(RateLimiter::with_defaults())),
            error_handler,
            metrics,
            sessions: Arc::new(Mutex::new(std::collections::HashMap::new())),
            pending_dials: Arc::new(Mutex::new(HashSet::new())),
            cancel: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn active_node_ids(&self) -> Vec<String> {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|h| h.is_active())
            .map(|h| h.node_id.clone())
            .collect()
    }

    /// Send-only access for collaborators (e.g. the sync manager) that must
    /// not be able to enumerate or mutate the session table directly.
    pub async fn send_to(&self, node_id: &str, msg: Message) -> Result<(), NetworkError> {
        let sessions = self.sessions.lock().await;
        let handle = sessions
            .get(node_id)
            .ok_or_else(|| NetworkError::new(ErrorKind::Peer, ErrorSeverity::Low, "peer not connected"))?;
        self.metrics.record_sent(node_id, msg.message_type.as_str(), 0);
        handle
            .try_send(msg)
            .map_err(|_| NetworkError::new(ErrorKind::Connection, ErrorSeverity::Medium, "peer send queue closed"))
    }

    /// Registers a one-shot waiter for `expect_type` from `node_id`, used by
    /// the sync manager's request/response correlation.
    pub async fn await_reply(
        &self,
        node_id: &str,
        expect_type: MessageType,
    ) -> Result<tokio::sync::oneshot::Receiver<Message>, NetworkError> {
        let sessions = self.sessions.lock().await;
        let handle = sessions
            .get(node_id)
            .ok_or_else(|| NetworkError::new(ErrorKind::Peer, ErrorSeverity::Low, "peer not connected"))?;
        Ok(handle.await_reply(expect_type))
    }

    pub async fn broadcast(&self, msg: Message) {
        let mut dead = Vec::new();
        {
            let sessions = self.sessions.lock().await;
            for (node_id, handle) in sessions.iter() {
                if handle.try_send(msg.clone()).is_err() {
                    dead.push(node_id.clone());
                } else {
                    self.metrics.record_sent(node_id, msg.message_type.as_str(), 0);
                }
            }
        }
        for node_id in dead {
            self.close_peer(&node_id).await;
        }
    }

    pub async fn start(self: &Arc<Self>, listener: TcpListener) {
        let accept = {
            let this = self.clone();
            tokio::spawn(async move { this.accept_loop(listener).await })
        };
        let maintain = {
            let this = self.clone();
            tokio::spawn(async move { this.maintain_loop().await })
        };
        let discover = {
            let this = self.clone();
            tokio::spawn(async move { this.discover_loop().await })
        };
        let mut background = self.background.lock().await;
        background.push(accept);
        background.push(maintain);
        background.push(discover);
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        let sessions: std::collections::HashMap<String, PeerHandle> =
            self.sessions.lock().await.drain().collect();
        for (_, handle) in sessions {
            handle.shutdown();
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, addr)) = accepted else { continue };
                    if self.session_count().await >= self.config.max_peers {
                        continue;
                    }
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.accept_connection(stream, addr.to_string()).await;
                    });
                }
            }
        }
    }

    async fn accept_connection(self: Arc<Self>, mut stream: TcpStream, addr: String) {
        let timeout = self.config.connection_timeout;
        let result = tokio::time::timeout(
            timeout,
            session::handshake_accept(&mut stream, &self.config.node_id, self.config.max_message_size),
        )
        .await;

        let remote_node_id = match result {
            Ok(Ok(id)) => id,
            _ => {
                self.error_handler.handle_error(
                    NetworkError::new(ErrorKind::Connection, ErrorSeverity::Low, "inbound handshake failed")
                        .with_details(serde_json::json!({ "addr": addr })),
                    None,
                );
                return;
            }
        };

        self.register_session(stream, remote_node_id).await;
    }

    /// Dials `addr` and, on a successful handshake, registers the session.
    pub async fn dial(&self, addr: &str) -> Result<(), NetworkError> {
        {
            let mut pending = self.pending_dials.lock().await;
            if !pending.insert(addr.to_string()) {
                return Err(NetworkError::new(ErrorKind::Connection, ErrorSeverity::Low, "dial already in flight"));
            }
        }
        let result = self.dial_inner(addr).await;
        self.pending_dials.lock().await.remove(addr);
        result
    }

    async fn dial_inner(&self, addr: &str) -> Result<(), NetworkError> {
        let mut stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::new(ErrorKind::Connection, ErrorSeverity::Medium, e.to_string()))?;

        let timeout = self.config.connection_timeout;
        let remote_node_id = tokio::time::timeout(
            timeout,
            session::handshake_dial(&mut stream, &self.config.node_id, self.config.max_message_size),
        )
        .await
        .map_err(|_| NetworkError::new(ErrorKind::Connection, ErrorSeverity::Medium, "handshake timed out"))?
        .map_err(|e| NetworkError::new(ErrorKind::Protocol, ErrorSeverity::Medium, e.to_string()))?;

        self.register_session(stream, remote_node_id).await;
        Ok(())
    }

    /// A duplicate dial/accept for the same `node_id` closes the *newer*
    /// connection and keeps whichever session was registered first. The peer
    /// is registered with the rate limiter and metrics *before* its reader
    /// task is spawned, so no frame can ever arrive while the limiter still
    /// considers the peer unregistered.
    async fn register_session(&self, stream: TcpStream, node_id: String) {
        self.rate_limiter.lock().unwrap().add_peer(&node_id);
        self.metrics.add_peer(&node_id);

        let sink: Arc<dyn InboundSink> = Arc::new(Gatekeeper {
            dispatcher: self.dispatcher.clone(),
            rate_limiter: self.rate_limiter.clone(),
            error_handler: self.error_handler.clone(),
            metrics: self.metrics.clone(),
            sessions: self.sessions.clone(),
        });
        let handle = session::spawn_peer_actor(stream, node_id.clone(), self.config.max_message_size, sink);

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&node_id) {
            if existing.is_active() {
                handle.shutdown();
                self.rate_limiter.lock().unwrap().remove_peer(&node_id);
                self.metrics.remove_peer(&node_id);
                return;
            }
        }
        self.dispatcher.seed_peer_addrs([node_id.clone()]);
        sessions.insert(node_id, handle);
    }

    async fn close_peer(&self, node_id: &str) {
        close_peer_handle(
            self.sessions.clone(),
            self.rate_limiter.clone(),
            self.metrics.clone(),
            node_id.to_string(),
        )
        .await;
    }

    async fn maintain_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.ping_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.reap_stale_peers().await;
                    self.maintain_minimum_peers().await;
                }
            }
        }
    }

    async fn reap_stale_peers(&self) {
        let timeout = self.config.connection_timeout.as_secs_f64();
        let stale: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .filter(|h| !h.is_active() || h.last_seen_secs_ago() > timeout)
                .map(|h| h.node_id.clone())
                .collect()
        };
        for node_id in stale {
            self.close_peer(&node_id).await;
        }
    }

    async fn maintain_minimum_peers(&self) {
        if self.session_count().await >= self.config.min_peers_for_sync {
            return;
        }
        for addr in &self.config.bootstrap_nodes {
            if self.session_count().await >= self.config.min_peers_for_sync {
                break;
            }
            let connected: HashSet<String> = self.active_node_ids().await.into_iter().collect();
            if connected.contains(addr) {
                continue;
            }
            let _ = self.dial(addr).await;
        }
    }

    async fn discover_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.peer_discovery_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.broadcast_peer_list().await,
            }
        }
    }

    async fn broadcast_peer_list(&self) {
        let peers = self.dispatcher.known_peer_addrs();
        if peers.is_empty() {
            return;
        }
        let msg = Message::new(
            MessageType::PeerDiscovery,
            serde_json::json!({ "peers": peers }),
            &self.config.node_id,
        );
        self.broadcast(msg).await;
    }
}
