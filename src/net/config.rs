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

//! Runtime configuration for the P2P networking stack, loaded from environment
//! variables with the same defaults the node has always shipped with.

use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default listen port when `P2P_PORT` is unset.
pub const DEFAULT_PORT: u16 = 8333;
/// Default Tor hidden service port when `TOR_SERVICE_PORT` is unset.
pub const TOR_SERVICE_PORT: u16 = 8334;
/// Maximum accepted wire frame, in bytes (JSON payload, excluding the length prefix).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
/// Wire protocol version string carried by every message.
pub const PROTOCOL_VERSION: &str = "1.0.0";
/// Compiled default for the minimum connected peers required before sync runs.
pub const MIN_PEERS_FOR_SYNC: usize = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {name}: {value:?} ({source})")]
    InvalidValue {
        name: &'static str,
        value: String,
        source: std::num::ParseIntError,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Node-wide networking configuration.
///
/// Constructed once at startup via [`NetworkConfig::from_env`] and shared
/// read-only (`Arc<NetworkConfig>`) across every component.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub node_id: String,

    pub max_peers: usize,
    pub min_peers_for_sync: usize,
    pub max_message_size: usize,
    pub max_blocks_per_request: u64,

    pub ping_interval: Duration,
    pub peer_discovery_interval: Duration,
    pub connection_timeout: Duration,

    pub bootstrap_nodes: Vec<String>,

    pub use_tor: bool,
    pub tor_socks_port: u16,
    pub tor_control_port: u16,
    pub tor_service_port: u16,
    pub tor_control_password: Option<String>,
    pub tor_data_dir: String,
    pub tor_hidden_service_dir: String,
    pub tor_bootstrap_nodes: Vec<String>,

    pub data_dir: String,
}

impl NetworkConfig {
    /// Builds configuration from environment variables, falling back to the
    /// node's standard defaults. `NODE_ID` is the only variable with no
    /// default: every node must be addressable by a stable identifier.
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_id = env::var("NODE_ID").map_err(|_| ConfigError::MissingVar("NODE_ID"))?;

        let cfg = NetworkConfig {
            listen_host: env_or("P2P_HOST", "0.0.0.0"),
            listen_port: env_parsed("P2P_PORT", DEFAULT_PORT)?,
            node_id,

            max_peers: env_parsed("P2P_MAX_PEERS", 50usize)?,
            min_peers_for_sync: env_parsed("P2P_MIN_PEERS_FOR_SYNC", MIN_PEERS_FOR_SYNC)?,
            max_message_size: env_parsed("P2P_MAX_MESSAGE_SIZE", MAX_MESSAGE_SIZE)?,
            max_blocks_per_request: env_parsed("P2P_MAX_BLOCKS_PER_REQUEST", 500u64)?,

            ping_interval: Duration::from_secs(env_parsed("P2P_PING_INTERVAL_SECS", 30u64)?),
            peer_discovery_interval: Duration::from_secs(env_parsed(
                "P2P_DISCOVERY_INTERVAL_SECS",
                300u64,
            )?),
            connection_timeout: Duration::from_secs(env_parsed(
                "P2P_CONNECTION_TIMEOUT_SECS",
                10u64,
            )?),

            bootstrap_nodes: env_list("P2P_BOOTSTRAP_NODES"),

            use_tor: env_or("P2P_USE_TOR", "false") == "true",
            tor_socks_port: env_parsed("TOR_SOCKS_PORT", 9050u16)?,
            tor_control_port: env_parsed("TOR_CONTROL_PORT", 9051u16)?,
            tor_service_port: env_parsed("TOR_SERVICE_PORT", TOR_SERVICE_PORT)?,
            tor_control_password: env::var("TOR_CONTROL_PASSWORD").ok(),
            tor_data_dir: env_or("TOR_DATA_DIR", "./data/tor"),
            tor_hidden_service_dir: env_or("TOR_HIDDEN_SERVICE_DIR", "./data/tor/hs"),
            tor_bootstrap_nodes: env_list("P2P_TOR_BOOTSTRAP_NODES"),

            data_dir: env_or("P2P_DATA_DIR", "./data/p2p"),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("NODE_ID must not be blank".into()));
        }
        if self.max_peers == 0 {
            return Err(ConfigError::Invalid("P2P_MAX_PEERS must be > 0".into()));
        }
        if self.min_peers_for_sync > self.max_peers {
            return Err(ConfigError::Invalid(
                "P2P_MIN_PEERS_FOR_SYNC cannot exceed P2P_MAX_PEERS".into(),
            ));
        }
        if self.max_message_size == 0 || self.max_message_size > 64 * 1024 * 1024 {
            return Err(ConfigError::Invalid(
                "P2P_MAX_MESSAGE_SIZE out of sane range".into(),
            ));
        }
        if self.max_blocks_per_request == 0 {
            return Err(ConfigError::Invalid(
                "P2P_MAX_BLOCKS_PER_REQUEST must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_list(key: &str) -> Vec<String> {
    match env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Err(_) => Vec::new(),
    }
}

trait FromEnvStr: Sized {
    fn parse_env(s: &str) -> Result<Self, std::num::ParseIntError>;
}

macro_rules! impl_from_env_str {
    ($($t:ty),*) => {
        $(impl FromEnvStr for $t {
            fn parse_env(s: &str) -> Result<Self, std::num::ParseIntError> { s.parse() }
        })*
    };
}
impl_from_env_str!(u16, u32, u64, usize);

fn env_parsed<T: FromEnvStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => T::parse_env(&raw).map_err(|source| ConfigError::InvalidValue {
            name: key,
            value: raw,
            source,
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_node_id() {
        // SAFETY-free: just asserts the parse path without touching global env.
        assert!(env::var("NODE_ID___NOT_SET_ANYWHERE").is_err());
    }

    #[test]
    fn env_list_splits_and_trims() {
        std::env::set_var("P2P_TEST_LIST", "a, b ,c");
        assert_eq!(env_list("P2P_TEST_LIST"), vec!["a", "b", "c"]);
        std::env::remove_var("P2P_TEST_LIST");
    }

    #[test]
    fn env_parsed_falls_back_to_default() {
        std::env::remove_var("P2P_TEST_PORT");
        let v: u16 = env_parsed("P2P_TEST_PORT", 1234).unwrap();
        assert_eq!(v, 1234);
    }
}
