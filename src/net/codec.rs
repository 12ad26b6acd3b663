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

//! Wire message shape and JSON (de)serialization. Framing (the 4-byte length
//! prefix) lives in [`super::session`]; this module only knows how to turn a
//! [`Message`] into bytes and back, and how to compute the canonical bytes a
//! signature is taken over.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use std::time::{SystemTime, UNIX_EPOCH};

use super::config::PROTOCOL_VERSION;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message exceeds max size ({size} > {limit} bytes)")]
    TooLarge { size: usize, limit: usize },
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("protocol version mismatch: expected {expected}, got {found}")]
    VersionMismatch { expected: String, found: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Handshake,
    Block,
    Transaction,
    PeerDiscovery,
    PeerList,
    Heartbeat,
    ChainRequest,
    ChainResponse,
    BlockRequest,
    BlockResponse,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Handshake => "handshake",
            MessageType::Block => "block",
            MessageType::Transaction => "transaction",
            MessageType::PeerDiscovery => "peer_discovery",
            MessageType::PeerList => "peer_list",
            MessageType::Heartbeat => "heartbeat",
            MessageType::ChainRequest => "chain_request",
            MessageType::ChainResponse => "chain_response",
            MessageType::BlockRequest => "block_request",
            MessageType::BlockResponse => "block_response",
            MessageType::Error => "error",
        }
    }
}

/// A single wire message. Field order here is load-bearing: it is the order
/// `serde_json` serializes in, and therefore the order canonical signing
/// bytes are produced in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub data: Value,
    pub sender: String,
    pub timestamp: f64,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Message {
    pub fn new(message_type: MessageType, data: Value, sender: impl Into<String>) -> Self {
        Self {
            message_type,
            data,
            sender: sender.into(),
            timestamp: now_ts(),
            version: PROTOCOL_VERSION.to_string(),
            signature: None,
        }
    }

    /// Builds a reply that carries the *incoming* message's timestamp, as the
    /// node has always done for request/response pairs.
    pub fn reply(message_type: MessageType, data: Value, sender: impl Into<String>, in_reply_to: &Message) -> Self {
        Self {
            message_type,
            data,
            sender: sender.into(),
            timestamp: in_reply_to.timestamp,
            version: PROTOCOL_VERSION.to_string(),
            signature: None,
        }
    }

    pub fn error(text: impl Into<String>, sender: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            serde_json::json!({ "error": text.into() }),
            sender,
        )
    }

    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = Some(hex::encode(signature));
        self
    }

    /// Bytes the signature is computed and verified over: the message with
    /// `signature` forced absent, so signing never depends on itself.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        Ok(serde_json::to_vec(&unsigned)?)
    }

    pub fn signature_bytes(&self) -> Option<Vec<u8>> {
        self.signature.as_deref().and_then(|s| hex::decode(s).ok())
    }
}

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Encodes a message to its JSON wire representation, bounded by `max_size`.
pub fn encode(msg: &Message, max_size: usize) -> Result<Vec<u8>, CodecError> {
    let bytes = serde_json::to_vec(msg)?;
    if bytes.len() > max_size {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            limit: max_size,
        });
    }
    Ok(bytes)
}

/// Decodes a JSON wire payload back into a [`Message`]. Callers are
/// responsible for enforcing `max_size` on the raw frame before this is
/// called, so this function never has to allocate beyond what it's handed.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    let msg: Message = serde_json::from_slice(bytes)?;
    if msg.version != PROTOCOL_VERSION {
        return Err(CodecError::VersionMismatch {
            expected: PROTOCOL_VERSION.to_string(),
            found: msg.version,
        });
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_json() {
        let msg = Message::new(MessageType::Heartbeat, json!({}), "node-a");
        let bytes = encode(&msg, 1024).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back.sender, "node-a");
        assert!(matches!(back.message_type, MessageType::Heartbeat));
    }

    #[test]
    fn rejects_oversized_payload() {
        let msg = Message::new(MessageType::Block, json!({"x": "y".repeat(100)}), "node-a");
        let err = encode(&msg, 10).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { .. }));
    }

    #[test]
    fn unknown_type_tag_fails_to_decode() {
        let raw = br#"{"type":"bogus","data":{},"sender":"x","timestamp":0.0,"version":"1.0.0"}"#;
        assert!(decode(raw).is_err());
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let raw = br#"{"type":"heartbeat","data":{},"sender":"x","timestamp":0.0,"version":"0.9.0"}"#;
        let err = decode(raw).unwrap_err();
        assert!(matches!(err, CodecError::VersionMismatch { .. }));
    }

    #[test]
    fn canonical_bytes_ignore_signature_field() {
        let mut msg = Message::new(MessageType::Block, json!({"h": 1}), "node-a");
        let unsigned = msg.canonical_bytes().unwrap();
        msg.signature = Some("deadbeef".to_string());
        let still_unsigned = msg.canonical_bytes().unwrap();
        assert_eq!(unsigned, still_unsigned);
    }

    #[test]
    fn reply_preserves_incoming_timestamp() {
        let incoming = Message::new(MessageType::ChainRequest, json!({}), "node-a");
        let reply = Message::reply(MessageType::ChainResponse, json!({"height": 1}), "node-b", &incoming);
        assert_eq!(reply.timestamp, incoming.timestamp);
    }
}
