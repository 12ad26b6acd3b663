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

//! End-to-end tests driving two or more real [`ConnectionManager`]s over
//! loopback TCP, rather than unit-testing a single component in isolation.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::sleep;

use meridian_p2p::net::codec::{Message, MessageType};
use meridian_p2p::net::{
    BlockchainStore, ConnectionManager, ErrorHandler, NetworkConfig, NetworkMetrics, NetworkError,
    SyncManager, Validator,
};

struct MemStore {
    blocks: StdMutex<Vec<serde_json::Value>>,
}

impl MemStore {
    fn new() -> Self {
        Self { blocks: StdMutex::new(Vec::new()) }
    }

    fn seeded(n: usize) -> Self {
        let store = Self::new();
        for i in 0..n {
            store.blocks.lock().unwrap().push(json!({ "i": i }));
        }
        store
    }
}

impl BlockchainStore for MemStore {
    fn height(&self) -> u64 {
        self.blocks.lock().unwrap().len() as u64
    }
    fn add_block(&self, block: serde_json::Value) -> Result<(), NetworkError> {
        self.blocks.lock().unwrap().push(block);
        Ok(())
    }
    fn add_transaction(&self, _tx: serde_json::Value) -> Result<(), NetworkError> {
        Ok(())
    }
    fn snapshot(&self) -> serde_json::Value {
        json!({ "height": self.height() })
    }
    fn blocks_in_range(&self, start: u64, end: u64) -> Vec<serde_json::Value> {
        let blocks = self.blocks.lock().unwrap();
        blocks
            .iter()
            .enumerate()
            .filter(|(i, _)| *i as u64 >= start && *i as u64 <= end)
            .map(|(_, b)| b.clone())
            .collect()
    }
}

struct AcceptAll;
impl Validator for AcceptAll {
    fn validate_block(&self, _block: &serde_json::Value) -> bool {
        true
    }
    fn validate_transaction(&self, _tx: &serde_json::Value) -> bool {
        true
    }
}

/// Rejects any block whose `"i"` field is `3`, to exercise the sync abort path.
struct RejectThree;
impl Validator for RejectThree {
    fn validate_block(&self, block: &serde_json::Value) -> bool {
        block.get("i").and_then(|v| v.as_u64()) != Some(3)
    }
    fn validate_transaction(&self, _tx: &serde_json::Value) -> bool {
        true
    }
}

fn test_config(node_id: &str) -> Arc<NetworkConfig> {
    test_config_with_timeout(node_id, Duration::from_secs(2))
}

fn test_config_with_timeout(node_id: &str, connection_timeout: Duration) -> Arc<NetworkConfig> {
    Arc::new(NetworkConfig {
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        node_id: node_id.to_string(),
        max_peers: 16,
        min_peers_for_sync: 1,
        max_message_size: 1024 * 1024,
        max_blocks_per_request: 2,
        ping_interval: Duration::from_millis(50),
        peer_discovery_interval: Duration::from_secs(300),
        connection_timeout,
        bootstrap_nodes: Vec::new(),
        use_tor: false,
        tor_socks_port: 9050,
        tor_control_port: 9051,
        tor_service_port: 8334,
        tor_control_password: None,
        tor_data_dir: "./data/tor".to_string(),
        tor_hidden_service_dir: "./data/tor/hs".to_string(),
        tor_bootstrap_nodes: Vec::new(),
        data_dir: "./data/p2p".to_string(),
    })
}

async fn start_node_with_config(
    config: Arc<NetworkConfig>,
    store: Arc<dyn BlockchainStore>,
    validator: Option<Arc<dyn Validator>>,
) -> (Arc<ConnectionManager>, Arc<NetworkMetrics>, String) {
    let metrics = Arc::new(NetworkMetrics::new().unwrap());
    let error_handler = Arc::new(ErrorHandler::new(metrics.clone()));
    let manager = Arc::new(ConnectionManager::new(
        config,
        store,
        validator,
        error_handler,
        metrics.clone(),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    manager.start(listener).await;
    (manager, metrics, addr)
}

async fn start_node(
    node_id: &str,
    store: Arc<dyn BlockchainStore>,
    validator: Option<Arc<dyn Validator>>,
) -> (Arc<ConnectionManager>, Arc<NetworkMetrics>, String) {
    start_node_with_config(test_config(node_id), store, validator).await
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_then_block_delivery_updates_remote_store() {
    let store_a = Arc::new(MemStore::new());
    let store_b = Arc::new(MemStore::new());
    let (manager_a, _metrics_a, addr_a) =
        start_node("node-a", store_a.clone(), Some(Arc::new(AcceptAll))).await;
    let (manager_b, _metrics_b, _addr_b) =
        start_node("node-b", store_b.clone(), Some(Arc::new(AcceptAll))).await;

    manager_b.dial(&addr_a).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(manager_a.session_count().await, 1);
    assert_eq!(manager_b.session_count().await, 1);

    let msg = Message::new(MessageType::Block, json!({ "i": 0 }), "node-b");
    manager_b.send_to("node-a", msg).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(store_a.height(), 1);

    manager_a.stop().await;
    manager_b.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_peers_are_reaped_past_the_connection_timeout() {
    let store_a = Arc::new(MemStore::new());
    let store_b = Arc::new(MemStore::new());
    let timeout = Duration::from_millis(100);
    let (manager_a, _metrics_a, addr_a) =
        start_node_with_config(test_config_with_timeout("node-a", timeout), store_a, Some(Arc::new(AcceptAll)))
            .await;
    let (manager_b, _metrics_b, _addr_b) =
        start_node_with_config(test_config_with_timeout("node-b", timeout), store_b, Some(Arc::new(AcceptAll)))
            .await;

    manager_b.dial(&addr_a).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(manager_a.session_count().await, 1);

    // connection_timeout is 100ms: reaped once idle past that, not some multiple of it.
    sleep(Duration::from_millis(250)).await;
    assert_eq!(manager_a.session_count().await, 0);
    assert_eq!(manager_b.session_count().await, 0);

    manager_a.stop().await;
    manager_b.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn flooding_a_peer_trips_the_rate_limiter() {
    let store_a = Arc::new(MemStore::new());
    let store_b = Arc::new(MemStore::new());
    let (manager_a, metrics_a, addr_a) = start_node("node-a", store_a, Some(Arc::new(AcceptAll))).await;
    let (manager_b, _metrics_b, _addr_b) = start_node("node-b", store_b, Some(Arc::new(AcceptAll))).await;

    manager_b.dial(&addr_a).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    for _ in 0..400 {
        let msg = Message::new(MessageType::Heartbeat, json!({}), "node-b");
        if manager_b.send_to("node-a", msg).await.is_err() {
            break;
        }
    }
    sleep(Duration::from_millis(200)).await;

    let rejected = metrics_a.rate_limited_total.with_label_values(&["node-b"]).get();
    assert!(rejected > 0, "expected the flood to trip node-a's rate limiter");

    manager_a.stop().await;
    manager_b.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_once_catches_up_to_a_taller_peer() {
    let store_a = Arc::new(MemStore::seeded(5));
    let store_b = Arc::new(MemStore::new());
    let (manager_a, _metrics_a, addr_a) =
        start_node("node-a", store_a.clone(), Some(Arc::new(AcceptAll))).await;
    let (manager_b, metrics_b, _addr_b) =
        start_node("node-b", store_b.clone(), Some(Arc::new(AcceptAll))).await;

    manager_b.dial(&addr_a).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let config_b = test_config("node-b");
    let error_handler_b = Arc::new(ErrorHandler::new(metrics_b.clone()));
    let sync_b = SyncManager::new(
        config_b,
        manager_b.clone(),
        store_b.clone(),
        Some(Arc::new(AcceptAll)),
        error_handler_b,
    );

    let outcome = sync_b.sync_once().await;
    assert_eq!(outcome, meridian_p2p::net::sync::SyncOutcome::Synced { new_height: 5 });
    assert_eq!(store_b.height(), 5);

    let status = sync_b.status();
    assert!(!status.is_syncing);
    assert_eq!(status.sync_height, 5);
    assert_eq!(status.target_height, 5);
    assert_eq!(status.sync_peers, vec!["node-a".to_string()]);
    assert!(status.last_sync_unix_secs.is_some());

    assert_eq!(metrics_b.sync_height.get(), 5);
    assert_eq!(metrics_b.sync_target_height.get(), 5);
    assert_eq!(metrics_b.sync_attempts_total.with_label_values(&["synced"]).get(), 1);

    manager_a.stop().await;
    manager_b.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_aborts_without_rollback_on_first_invalid_block() {
    let store_a = Arc::new(MemStore::seeded(5));
    let store_b = Arc::new(MemStore::new());
    let (manager_a, _metrics_a, addr_a) =
        start_node("node-a", store_a.clone(), Some(Arc::new(AcceptAll))).await;
    let (manager_b, metrics_b, _addr_b) =
        start_node("node-b", store_b.clone(), Some(Arc::new(AcceptAll))).await;

    manager_b.dial(&addr_a).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let config_b = test_config("node-b");
    let error_handler_b = Arc::new(ErrorHandler::new(metrics_b));
    let sync_b = SyncManager::new(
        config_b,
        manager_b.clone(),
        store_b.clone(),
        Some(Arc::new(RejectThree)),
        error_handler_b,
    );

    // max_blocks_per_request is 2, so the batch containing height 3 (index 3,
    // the fourth block) lands in the second batch: [1,2] then [3,4].
    let outcome = sync_b.sync_once().await;
    assert_eq!(
        outcome,
        meridian_p2p::net::sync::SyncOutcome::AbortedOnInvalidBlock { at_height: 2 }
    );
    // Blocks already appended before the invalid one are kept.
    assert_eq!(store_b.height(), 2);

    manager_a.stop().await;
    manager_b.stop().await;
}
