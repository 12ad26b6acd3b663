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

//! Meridian P2P node entrypoint (systemd-friendly).
//! Loads configuration from the environment, brings up the networking
//! stack, and runs until `SIGINT`/`SIGTERM`.

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use meridian_p2p::net::{
    BlockchainStore, ConnectionManager, CryptoContext, ErrorHandler, NetworkConfig,
    NetworkMetrics, NodeIdentity, SyncManager, Validator,
};

/// Trivial in-process chain placeholder: accepts anything, answers with a
/// monotonically increasing height. Real deployments provide their own
/// `BlockchainStore`/`Validator` implementations backed by actual chain
/// state; this exists so the binary is runnable standalone.
struct InMemoryChain {
    blocks: std::sync::Mutex<Vec<serde_json::Value>>,
}

impl BlockchainStore for InMemoryChain {
    fn height(&self) -> u64 {
        self.blocks.lock().unwrap().len() as u64
    }

    fn add_block(&self, block: serde_json::Value) -> Result<(), meridian_p2p::net::NetworkError> {
        self.blocks.lock().unwrap().push(block);
        Ok(())
    }

    fn add_transaction(&self, _tx: serde_json::Value) -> Result<(), meridian_p2p::net::NetworkError> {
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({ "height": self.height() })
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

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init();

    let config = match NetworkConfig::from_env() {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    info!(node_id = %config.node_id, port = config.listen_port, "meridian-p2p starting");

    let identity = match NodeIdentity::load_or_create(Path::new(&config.data_dir)) {
        Ok(id) => id,
        Err(e) => {
            error!(?e, "failed to load or create node identity");
            std::process::exit(1);
        }
    };
    let _crypto = Arc::new(CryptoContext::new(identity));

    let metrics = Arc::new(NetworkMetrics::new().expect("metrics registration failed"));
    let error_handler = Arc::new(ErrorHandler::new(metrics.clone()));

    let store: Arc<dyn BlockchainStore> = Arc::new(InMemoryChain {
        blocks: std::sync::Mutex::new(Vec::new()),
    });
    let validator: Option<Arc<dyn Validator>> = Some(Arc::new(AcceptAll));

    let manager = Arc::new(ConnectionManager::new(
        config.clone(),
        store.clone(),
        validator.clone(),
        error_handler.clone(),
        metrics.clone(),
    ));

    let listener = match tokio::net::TcpListener::bind((config.listen_host.as_str(), config.listen_port)).await {
        Ok(l) => l,
        Err(e) => {
            error!(?e, "failed to bind listener");
            std::process::exit(1);
        }
    };
    manager.start(listener).await;

    let hidden_service = if config.use_tor {
        match meridian_p2p::net::tor::start_hidden_service(&config, config.listen_port).await {
            Ok(service) => {
                info!(onion = %service.onion_address, "tor hidden service published");
                Some(service)
            }
            Err(e) => {
                warn!(?e, "tor hidden service setup failed; continuing clearnet-only");
                None
            }
        }
    } else {
        None
    };

    for addr in &config.bootstrap_nodes {
        let manager = manager.clone();
        let addr = addr.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.dial(&addr).await {
                warn!(%addr, ?e, "bootstrap dial failed");
            }
        });
    }

    let sync_manager = Arc::new(SyncManager::new(
        config.clone(),
        manager.clone(),
        store,
        validator,
        error_handler,
    ));
    let sync_task = {
        let sync_manager = sync_manager.clone();
        let mut ticker = tokio::time::interval(config.ping_interval * 2);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let outcome = sync_manager.sync_once().await;
                info!(?outcome, "sync attempt finished");
            }
        })
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => warn!(?e, "failed to listen for shutdown signal"),
    }

    sync_task.abort();
    manager.stop().await;
    if let Some(service) = hidden_service {
        if let Err(e) = service.shutdown().await {
            warn!(?e, "tor hidden service shutdown failed");
        }
    }
    info!("meridian-p2p stopped");
}
