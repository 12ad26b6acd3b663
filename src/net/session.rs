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

//! Peer session I/O (C7): the 4-byte length-prefixed framing around a
//! [`super::codec::Message`], and the per-connection actor that owns a split
//! socket, multiplexing inbound dispatch and outbound sends onto a single
//! task pair per peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::codec::{self, CodecError, Message, MessageType};

const LENGTH_PREFIX_BYTES: usize = 4;
const OUTBOUND_QUEUE_DEPTH: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SessionIoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Reads length-prefixed frames off an `AsyncRead` half.
pub struct FrameReader<R> {
    inner: R,
    max_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_size: usize) -> Self {
        Self { inner, max_size }
    }

    /// Returns `Ok(None)` on a clean EOF between frames (peer closed the
    /// connection), `Err` on anything else, including an oversized length
    /// prefix -- which is rejected before the payload is ever allocated.
    pub async fn recv(&mut self) -> Result<Option<Message>, SessionIoError> {
        let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_size {
            return Err(SessionIoError::Codec(CodecError::TooLarge {
                size: len,
                limit: self.max_size,
            }));
        }
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        let msg = codec::decode(&payload)?;
        Ok(Some(msg))
    }
}

/// Writes length-prefixed frames to an `AsyncWrite` half.
pub struct FrameWriter<W> {
    inner: W,
    max_size: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_size: usize) -> Self {
        Self { inner, max_size }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<usize, SessionIoError> {
        let bytes = codec::encode(msg, self.max_size)?;
        let len = (bytes.len() as u32).to_be_bytes();
        self.inner.write_all(&len).await?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(bytes.len())
    }
}

/// A handle to a running peer connection actor. Cloneable-by-field pieces
/// (the atomics and the outbound channel) let the connection manager and the
/// sync manager interact with the peer without touching the socket.
pub struct PeerHandle {
    pub node_id: String,
    pub connected_at: f64,
    last_seen_ms: Arc<AtomicU64>,
    active: Arc<AtomicBool>,
    outbound: mpsc::Sender<Message>,
    pending: Arc<Mutex<HashMap<MessageType, oneshot::Sender<Message>>>>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl PeerHandle {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn last_seen_secs_ago(&self) -> f64 {
        let now_ms = now_ts() * 1000.0;
        let last = self.last_seen_ms.load(Ordering::Relaxed) as f64;
        ((now_ms - last) / 1000.0).max(0.0)
    }

    /// Best-effort send: a full or closed outbound queue is treated as a
    /// dead peer by the caller, never blocks the caller itself.
    pub fn try_send(&self, msg: Message) -> Result<(), mpsc::error::TrySendError<Message>> {
        self.outbound.try_send(msg)
    }

    /// Registers a one-shot waiter for the next message of `expect_type`
    /// from this peer, used by the sync manager to correlate a request with
    /// its reply without a dedicated request-id field on the wire.
    pub fn await_reply(&self, expect_type: MessageType) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(expect_type, tx);
        rx
    }

    pub fn shutdown(self) {
        self.active.store(false, Ordering::Relaxed);
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

/// What the reader task does with a successfully decoded inbound message,
/// after rate limiting and pending-reply interception have already run.
pub trait InboundSink: Send + Sync {
    fn on_message(&self, peer_id: &str, msg: Message) -> Option<Message>;
}

/// Spawns the reader/writer task pair for a freshly handshaken connection and
/// returns a [`PeerHandle`] the connection manager registers.
pub fn spawn_peer_actor<S>(
    stream: S,
    node_id: String,
    max_message_size: usize,
    sink: Arc<dyn InboundSink>,
) -> PeerHandle
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let active = Arc::new(AtomicBool::new(true));
    let last_seen_ms = Arc::new(AtomicU64::new((now_ts() * 1000.0) as u64));
    let pending: Arc<Mutex<HashMap<MessageType, oneshot::Sender<Message>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_DEPTH);

    let writer_task = tokio::spawn(async move {
        let mut writer = FrameWriter::new(write_half, max_message_size);
        while let Some(msg) = outbound_rx.recv().await {
            if writer.send(&msg).await.is_err() {
                break;
            }
        }
    });

    let reader_task = {
        let active = active.clone();
        let last_seen_ms = last_seen_ms.clone();
        let pending = pending.clone();
        let node_id = node_id.clone();
        let outbound_tx = outbound_tx.clone();
        tokio::spawn(async move {
            let mut reader = FrameReader::new(read_half, max_message_size);
            loop {
                let msg = match reader.recv().await {
                    Ok(Some(msg)) => msg,
                    Ok(None) | Err(_) => break,
                };
                last_seen_ms.store((now_ts() * 1000.0) as u64, Ordering::Relaxed);

                let waiter = pending.lock().unwrap().remove(&msg.message_type);
                if let Some(tx) = waiter {
                    let _ = tx.send(msg);
                    continue;
                }

                if let Some(reply) = sink.on_message(&node_id, msg) {
                    if outbound_tx.try_send(reply).is_err() {
                        break;
                    }
                }
            }
            active.store(false, Ordering::Relaxed);
        })
    };

    PeerHandle {
        node_id,
        connected_at: now_ts(),
        last_seen_ms,
        active,
        outbound: outbound_tx,
        pending,
        reader_task,
        writer_task,
    }
}

/// Performs the dialer side of the handshake directly on an unsplit stream:
/// send local identity first, then await the peer's.
pub async fn handshake_dial<S>(
    stream: &mut S,
    local_node_id: &str,
    max_message_size: usize,
) -> Result<String, SessionIoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = Message::new(
        MessageType::Handshake,
        serde_json::json!({ "node_id": local_node_id }),
        local_node_id,
    );
    send_unsplit(stream, &hello, max_message_size).await?;
    let reply = recv_unsplit(stream, max_message_size).await?;
    extract_node_id(reply)
}

/// Performs the acceptor side: await the peer's identity first, then reply
/// with ours.
pub async fn handshake_accept<S>(
    stream: &mut S,
    local_node_id: &str,
    max_message_size: usize,
) -> Result<String, SessionIoError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let incoming = recv_unsplit(stream, max_message_size).await?;
    let remote_node_id = extract_node_id(incoming)?;
    let hello = Message::new(
        MessageType::Handshake,
        serde_json::json!({ "node_id": local_node_id }),
        local_node_id,
    );
    send_unsplit(stream, &hello, max_message_size).await?;
    Ok(remote_node_id)
}

fn extract_node_id(msg: Message) -> Result<String, SessionIoError> {
    msg.data
        .get("node_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| SessionIoError::Codec(CodecError::Json(serde::de::Error::custom(
            "handshake payload missing node_id",
        ))))
}

async fn send_unsplit<S: AsyncWrite + Unpin>(
    stream: &mut S,
    msg: &Message,
    max_size: usize,
) -> Result<(), SessionIoError> {
    let bytes = codec::encode(msg, max_size)?;
    let len = (bytes.len() as u32).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn recv_unsplit<S: AsyncRead + Unpin>(stream: &mut S, max_size: usize) -> Result<Message, SessionIoError> {
    let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(SessionIoError::Codec(CodecError::TooLarge { size: len, limit: max_size }));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(codec::decode(&payload)?)
}

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frame_round_trips_over_a_duplex_pair() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let msg = Message::new(MessageType::Heartbeat, json!({}), "node-a");
        let mut writer = FrameWriter::new(&mut a, 1024 * 1024);
        writer.send(&msg).await.unwrap();
        let mut reader = FrameReader::new(&mut b, 1024 * 1024);
        let got = reader.recv().await.unwrap().unwrap();
        assert_eq!(got.sender, "node-a");
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected_before_allocating() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let huge_len: u32 = 50 * 1024 * 1024;
        a.write_all(&huge_len.to_be_bytes()).await.unwrap();
        let mut reader = FrameReader::new(&mut b, 1024 * 1024);
        let err = reader.recv().await.unwrap_err();
        assert!(matches!(err, SessionIoError::Codec(CodecError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn clean_close_between_frames_yields_none() {
        let (a, mut b) = tokio::io::duplex(4096);
        drop(a);
        let mut reader = FrameReader::new(&mut b, 1024 * 1024);
        assert!(reader.recv().await.unwrap().is_none());
    }
}
