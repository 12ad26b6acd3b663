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

//! Trait-based seams between the networking core and the rest of the node.
//!
//! The networking stack never touches chain state directly: it only ever
//! calls through [`BlockchainStore`] and [`Validator`]. Both are `Send + Sync`
//! and take `&self`, so the implementer owns the single-writer discipline
//! (typically an inner mutex or an actor channel) — the dispatcher never
//! assumes it is the only caller.

use serde_json::Value;

use super::error::NetworkError;

/// Read/write access to chain state, as required by the message handlers.
/// Blocks and transactions are passed through as opaque JSON: the networking
/// layer has no opinion on their internal shape.
pub trait BlockchainStore: Send + Sync {
    /// Current chain height, used to answer `CHAIN_REQUEST`.
    fn height(&self) -> u64;

    /// Appends a block that already passed [`Validator::validate_block`].
    fn add_block(&self, block: Value) -> Result<(), NetworkError>;

    /// Appends a transaction that already passed [`Validator::validate_transaction`].
    fn add_transaction(&self, tx: Value) -> Result<(), NetworkError>;

    /// A compact summary of chain state, sent as the `CHAIN_RESPONSE` payload.
    fn snapshot(&self) -> Value;

    /// Blocks in `[start, end]` (inclusive), for `BLOCK_RESPONSE`. Callers
    /// are expected to pre-clamp the range to `max_blocks_per_request`.
    fn blocks_in_range(&self, start: u64, end: u64) -> Vec<Value>;
}

/// Validation gate applied before anything reaches [`BlockchainStore`].
pub trait Validator: Send + Sync {
    fn validate_block(&self, block: &Value) -> bool;
    fn validate_transaction(&self, tx: &Value) -> bool;
}
