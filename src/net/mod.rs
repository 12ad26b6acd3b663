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

//! The P2P networking core: wire codec, rate limiting, session crypto,
//! per-peer sessions, message dispatch, connection management, chain sync,
//! and the Tor transport façade. Everything here is reachable from
//! [`ConnectionManager`], the top-level entry point wired up in `main.rs`.

pub mod codec;
pub mod collaborators;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod ratelimit;
pub mod session;
pub mod sync;
pub mod tor;

pub use codec::{Message, MessageType};
pub use collaborators::{BlockchainStore, Validator};
pub use config::NetworkConfig;
pub use crypto::{CryptoContext, NodeIdentity};
pub use dispatch::Dispatcher;
pub use error::{ErrorHandler, NetworkError};
pub use manager::ConnectionManager;
pub use metrics::NetworkMetrics;
pub use sync::SyncManager;
