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

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Meridian P2P - the peer-to-peer networking core of a blockchain node.
//!
//! This crate provides:
//! - A framed, length-prefixed JSON wire protocol
//! - Per-peer and global rate limiting (token buckets)
//! - ECDH/ECDSA session crypto on P-384 with AES-256-CBC transport encryption
//! - A message dispatcher, connection manager, and chain-sync state machine
//! - An optional Tor hidden-service transport façade
//! - Prometheus metrics and a typed, severity-ranked error taxonomy
//!
//! The networking stack never touches chain state directly: it calls through
//! the [`net::BlockchainStore`] and [`net::Validator`] traits, so it can be
//! embedded in any node that implements them.

/// The P2P networking core (wire codec, rate limiting, crypto, sync).
pub mod net;
