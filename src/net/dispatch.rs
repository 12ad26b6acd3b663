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

//! Message dispatcher (C8): routes a decoded [`Message`] to the handler for
//! its type and returns an optional reply. Exhaustive over [`MessageType`],
//! so a new variant is a compile error here rather than a silently dropped
//! frame.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::json;

use super::codec::{Message, MessageType};
use super::collaborators::{BlockchainStore, Validator};
use super::error::{ErrorKind, ErrorSeverity, NetworkError};

pub struct Dispatcher {
    local_node_id: String,
    store: Arc<dyn BlockchainStore>,
    validator: Option<Arc<dyn Validator>>,
    known_peer_addrs: Arc<Mutex<HashSet<String>>>,
}

impl Dispatcher {
    pub fn new(
        local_node_id: String,
        store: Arc<dyn BlockchainStore>,
        validator: Option<Arc<dyn Validator>>,
    ) -> Self {
        Self {
            local_node_id,
            store,
            validator,
            known_peer_addrs: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn known_peer_addrs(&self) -> Vec<String> {
        self.known_peer_addrs.lock().unwrap().iter().cloned().collect()
    }

    pub fn seed_peer_addrs(&self, addrs: impl IntoIterator<Item = String>) {
        let mut set = self.known_peer_addrs.lock().unwrap();
        set.extend(addrs);
    }

    /// Dispatches `msg`, received from `remote_node_id`, and returns the
    /// reply frame if one applies. Handler failures never propagate as
    /// panics: they become an `ERROR` reply carrying the failure text.
    pub fn dispatch(&self, msg: Message, _remote_node_id: &str) -> Option<Message> {
        let result = match msg.message_type {
            MessageType::Handshake => self.handle_handshake(&msg),
            MessageType::Block => self.handle_block(&msg),
            MessageType::Transaction => self.handle_transaction(&msg),
            MessageType::PeerDiscovery => self.handle_peer_discovery(&msg),
            MessageType::PeerList => self.handle_peer_list(&msg),
            MessageType::Heartbeat => self.handle_heartbeat(&msg),
            MessageType::ChainRequest => self.handle_chain_request(&msg),
            MessageType::ChainResponse => Ok(None), // unsolicited; sync manager consumes via its own waiter
            MessageType::BlockRequest => self.handle_block_request(&msg),
            MessageType::BlockResponse => Ok(None), // unsolicited; see above
            MessageType::Error => self.handle_error_message(&msg),
        };

        match result {
            Ok(reply) => reply,
            Err(err) => Some(Message::reply(
                MessageType::Error,
                json!({ "error": err.message }),
                &self.local_node_id,
                &msg,
            )),
        }
    }

    fn handle_handshake(&self, msg: &Message) -> Result<Option<Message>, NetworkError> {
        Ok(Some(Message::reply(
            MessageType::Handshake,
            json!({ "node_id": self.local_node_id }),
            &self.local_node_id,
            msg,
        )))
    }

    fn handle_block(&self, msg: &Message) -> Result<Option<Message>, NetworkError> {
        if let Some(validator) = &self.validator {
            if !validator.validate_block(&msg.data) {
                return Err(NetworkError::new(
                    ErrorKind::Validation,
                    ErrorSeverity::Medium,
                    "block failed validation",
                ));
            }
        }
        self.store.add_block(msg.data.clone())?;
        Ok(None)
    }

    fn handle_transaction(&self, msg: &Message) -> Result<Option<Message>, NetworkError> {
        if let Some(validator) = &self.validator {
            if !validator.validate_transaction(&msg.data) {
                return Err(NetworkError::new(
                    ErrorKind::Validation,
                    ErrorSeverity::Low,
                    "transaction failed validation",
                ));
            }
        }
        self.store.add_transaction(msg.data.clone())?;
        Ok(None)
    }

    fn handle_peer_discovery(&self, msg: &Message) -> Result<Option<Message>, NetworkError> {
        self.merge_peer_addrs(msg);
        Ok(Some(Message::reply(
            MessageType::PeerList,
            json!({ "peers": self.known_peer_addrs() }),
            &self.local_node_id,
            msg,
        )))
    }

    fn handle_peer_list(&self, msg: &Message) -> Result<Option<Message>, NetworkError> {
        self.merge_peer_addrs(msg);
        Ok(None)
    }

    fn merge_peer_addrs(&self, msg: &Message) {
        if let Some(peers) = msg.data.get("peers").and_then(|v| v.as_array()) {
            let mut set = self.known_peer_addrs.lock().unwrap();
            for addr in peers.iter().filter_map(|v| v.as_str()) {
                set.insert(addr.to_string());
            }
        }
    }

    fn handle_heartbeat(&self, msg: &Message) -> Result<Option<Message>, NetworkError> {
        Ok(Some(Message::reply(
            MessageType::Heartbeat,
            json!({}),
            &self.local_node_id,
            msg,
        )))
    }

    fn handle_chain_request(&self, msg: &Message) -> Result<Option<Message>, NetworkError> {
        Ok(Some(Message::reply(
            MessageType::ChainResponse,
            self.store.snapshot(),
            &self.local_node_id,
            msg,
        )))
    }

    fn handle_block_request(&self, msg: &Message) -> Result<Option<Message>, NetworkError> {
        let start = msg.data.get("start_height").and_then(|v| v.as_u64()).unwrap_or(0);
        let end = msg.data.get("end_height").and_then(|v| v.as_u64()).unwrap_or(start);
        if end < start {
            return Err(NetworkError::new(
                ErrorKind::Protocol,
                ErrorSeverity::Low,
                "block_request end_height before start_height",
            ));
        }
        let blocks = self.store.blocks_in_range(start, end);
        Ok(Some(Message::reply(
            MessageType::BlockResponse,
            json!({ "blocks": blocks }),
            &self.local_node_id,
            msg,
        )))
    }

    fn handle_error_message(&self, msg: &Message) -> Result<Option<Message>, NetworkError> {
        tracing::warn!(sender = %msg.sender, data = %msg.data, "peer reported an error");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct MemStore {
        blocks: StdMutex<Vec<serde_json::Value>>,
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

    struct RejectAll;
    impl Validator for RejectAll {
        fn validate_block(&self, _block: &serde_json::Value) -> bool {
            false
        }
        fn validate_transaction(&self, _tx: &serde_json::Value) -> bool {
            false
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            "local".into(),
            Arc::new(MemStore { blocks: StdMutex::new(vec![]) }),
            None,
        )
    }

    #[test]
    fn handshake_echoes_local_node_id() {
        let d = dispatcher();
        let msg = Message::new(MessageType::Handshake, json!({ "node_id": "remote" }), "remote");
        let reply = d.dispatch(msg, "remote").unwrap();
        assert_eq!(reply.data["node_id"], "local");
    }

    #[test]
    fn chain_request_returns_store_snapshot() {
        let d = dispatcher();
        let msg = Message::new(MessageType::ChainRequest, json!({}), "remote");
        let reply = d.dispatch(msg, "remote").unwrap();
        assert_eq!(reply.data["height"], 0);
    }

    #[test]
    fn block_validation_failure_becomes_error_reply() {
        let d = Dispatcher::new(
            "local".into(),
            Arc::new(MemStore { blocks: StdMutex::new(vec![]) }),
            Some(Arc::new(RejectAll)),
        );
        let msg = Message::new(MessageType::Block, json!({ "h": 1 }), "remote");
        let reply = d.dispatch(msg, "remote").unwrap();
        assert!(matches!(reply.message_type, MessageType::Error));
    }

    #[test]
    fn peer_discovery_merges_and_echoes_peer_list() {
        let d = dispatcher();
        let msg = Message::new(
            MessageType::PeerDiscovery,
            json!({ "peers": ["1.2.3.4:9333"] }),
            "remote",
        );
        let reply = d.dispatch(msg, "remote").unwrap();
        let peers = reply.data["peers"].as_array().unwrap();
        assert!(peers.iter().any(|v| v == "1.2.3.4:9333"));
    }

    #[test]
    fn block_request_clamps_and_returns_blocks_in_range() {
        let store = Arc::new(MemStore { blocks: StdMutex::new(vec![]) });
        for i in 0..5 {
            store.add_block(json!({ "i": i })).unwrap();
        }
        let d = Dispatcher::new("local".into(), store, None);
        let msg = Message::new(
            MessageType::BlockRequest,
            json!({ "start_height": 1, "end_height": 3 }),
            "remote",
        );
        let reply = d.dispatch(msg, "remote").unwrap();
        assert_eq!(reply.data["blocks"].as_array().unwrap().len(), 3);
    }
}
