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

//! Anonymizing transport façade (C11): launches a private `tor` daemon,
//! publishes an ephemeral v3 hidden service for this node's listener over its
//! control port, and validates onion addresses. Socket-level SOCKS5 dialing
//! for outbound connections to `.onion` peers is left to
//! [`super::manager::ConnectionManager`] by routing through `tor_socks_port`;
//! this module owns the daemon and control-channel lifecycle, mirroring
//! `TorNetwork.start`/`stop` in the original Python networking layer (which
//! drove `stem`'s `launch_tor_with_config` the same way).

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use thiserror::Error;

use super::config::NetworkConfig;

const ONION_V3_ADDR_LEN: usize = 56;
const CONTROL_PORT_RETRY_INTERVAL: Duration = Duration::from_millis(200);
const CONTROL_PORT_RETRY_ATTEMPTS: usize = 25;

#[derive(Debug, Error)]
pub enum TorError {
    #[error("io error talking to the tor control port: {0}")]
    Io(#[from] std::io::Error),
    #[error("tor control protocol error: {0}")]
    Protocol(String),
    #[error("control port authentication failed")]
    AuthFailed,
    #[error("invalid onion address: {0}")]
    InvalidAddress(String),
    #[error("tor daemon never opened its control port")]
    DaemonDidNotStart,
}

/// A running ephemeral hidden service, backed by a `tor` process this node
/// launched and owns. The control connection is kept open for the service's
/// lifetime since Tor tears down `ADD_ONION` services created with a
/// transient (non-`Detach`) flag set when the control connection that
/// created them closes.
pub struct HiddenService {
    control: TorControlClient,
    process: Child,
    pub onion_address: String,
}

impl HiddenService {
    /// Tears the service down via `DEL_ONION` and then kills the daemon this
    /// node launched for it, mirroring `TorNetwork.stop`'s
    /// `controller.close()` followed by `tor_process.kill()`.
    pub async fn shutdown(mut self) -> Result<(), TorError> {
        let service_id = self
            .onion_address
            .strip_suffix(".onion")
            .unwrap_or(&self.onion_address)
            .to_string();
        let del_result = self.control.command(&format!("DEL_ONION {service_id}")).await;
        let _ = self.process.kill().await;
        del_result?;
        Ok(())
    }
}

/// A line-oriented client for Tor's control protocol (the same protocol
/// `stem` speaks), authenticating and issuing the handful of commands the
/// node needs.
pub struct TorControlClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl TorControlClient {
    pub async fn connect(control_port: u16, password: Option<&str>) -> Result<Self, TorError> {
        let stream = TcpStream::connect(("127.0.0.1", control_port)).await?;
        let (read_half, write_half) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        };
        client.authenticate(password).await?;
        Ok(client)
    }

    async fn authenticate(&mut self, password: Option<&str>) -> Result<(), TorError> {
        let cmd = match password {
            Some(p) => format!("AUTHENTICATE \"{p}\""),
            None => "AUTHENTICATE".to_string(),
        };
        let reply = self.command(&cmd).await?;
        if !reply.starts_with("250") {
            return Err(TorError::AuthFailed);
        }
        Ok(())
    }

    /// Sends a single control command and returns the first reply line with
    /// its status code stripped. Good enough for the single-line replies
    /// every command this node issues produces.
    pub async fn command(&mut self, line: &str) -> Result<String, TorError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;

        let mut response = String::new();
        self.reader.read_line(&mut response).await?;
        let response = response.trim_end().to_string();
        if response.starts_with("250") || response.starts_with("251") {
            Ok(response)
        } else {
            Err(TorError::Protocol(response))
        }
    }

    /// Publishes a new ephemeral v3 hidden service mapping `onion_port` to
    /// `target_port` on localhost, with a freshly generated key the control
    /// connection never exposes (`Flags=DiscardPK`).
    pub async fn add_ephemeral_onion(&mut self, onion_port: u16, target_port: u16) -> Result<String, TorError> {
        let cmd = format!("ADD_ONION NEW:BEST Flags=DiscardPK Port={onion_port},127.0.0.1:{target_port}");
        let reply = self.command(&cmd).await?;
        let service_id = reply
            .strip_prefix("250-ServiceID=")
            .or_else(|| reply.strip_prefix("250 ServiceID="))
            .ok_or_else(|| TorError::Protocol(format!("unexpected ADD_ONION reply: {reply}")))?;
        Ok(format!("{}.onion", service_id.trim()))
    }
}

/// Writes a torrc into `config.tor_data_dir`, launches a `tor` process
/// against it, waits for its control port to come up, then authenticates and
/// publishes an ephemeral hidden service for this node's listener. Mirrors
/// `TorNetwork.start`: `launch_tor_with_config` followed by
/// `Controller.from_port` + `authenticate` + `create_ephemeral_hidden_service`.
pub async fn start_hidden_service(config: &NetworkConfig, target_port: u16) -> Result<HiddenService, TorError> {
    tokio::fs::create_dir_all(&config.tor_data_dir).await?;
    tokio::fs::create_dir_all(&config.tor_hidden_service_dir).await?;

    let torrc_path = std::path::Path::new(&config.tor_data_dir).join("torrc");
    tokio::fs::write(&torrc_path, render_torrc(config)).await?;

    let process = Command::new("tor")
        .arg("-f")
        .arg(&torrc_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    wait_for_control_port(config.tor_control_port).await?;

    let mut control = TorControlClient::connect(config.tor_control_port, config.tor_control_password.as_deref()).await?;
    let onion_address = control
        .add_ephemeral_onion(config.tor_service_port, target_port)
        .await?;
    validate_onion_address(&onion_address)?;
    Ok(HiddenService {
        control,
        process,
        onion_address,
    })
}

/// The fixed subset of `tor_config` from the original `TorNetwork`
/// (`SocksPort`, `ControlPort`, `DataDirectory`) plus the hidden service
/// directory this node needs, rendered as lines a torrc file expects.
fn render_torrc(config: &NetworkConfig) -> String {
    format!(
        "SocksPort {}\nControlPort {}\nDataDirectory {}\nHiddenServiceDir {}\nCircuitBuildTimeout 10\nNumEntryGuards 4\nKeepalivePeriod 60\n",
        config.tor_socks_port, config.tor_control_port, config.tor_data_dir, config.tor_hidden_service_dir,
    )
}

async fn wait_for_control_port(control_port: u16) -> Result<(), TorError> {
    for _ in 0..CONTROL_PORT_RETRY_ATTEMPTS {
        if TcpStream::connect(("127.0.0.1", control_port)).await.is_ok() {
            return Ok(());
        }
        tokio::time::sleep(CONTROL_PORT_RETRY_INTERVAL).await;
    }
    Err(TorError::DaemonDidNotStart)
}

/// A v3 onion address is exactly 56 base32 characters followed by `.onion`.
pub fn validate_onion_address(address: &str) -> Result<(), TorError> {
    let label = address
        .strip_suffix(".onion")
        .ok_or_else(|| TorError::InvalidAddress(address.to_string()))?;
    if label.len() != ONION_V3_ADDR_LEN {
        return Err(TorError::InvalidAddress(format!(
            "expected {ONION_V3_ADDR_LEN} base32 chars, got {}",
            label.len()
        )));
    }
    if !label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err(TorError::InvalidAddress(address.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_v3_address() {
        let addr = format!("{}.onion", "a".repeat(ONION_V3_ADDR_LEN));
        assert!(validate_onion_address(&addr).is_ok());
    }

    #[test]
    fn rejects_wrong_length() {
        let addr = format!("{}.onion", "a".repeat(10));
        assert!(validate_onion_address(&addr).is_err());
    }

    #[test]
    fn rejects_missing_suffix() {
        assert!(validate_onion_address(&"a".repeat(ONION_V3_ADDR_LEN)).is_err());
    }

    #[test]
    fn rejects_uppercase_characters() {
        let addr = format!("{}.onion", "A".repeat(ONION_V3_ADDR_LEN));
        assert!(validate_onion_address(&addr).is_err());
    }
}
