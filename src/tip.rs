//! Tip chaser: merges a push notification source (ZMQ `hashblock`) with a
//! polling fallback into one de-duplicated stream of tip hashes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeromq::{Socket, SocketRecv, SubSocket};

use crate::chain::Blockchain;

const POLL_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Push source of best-block hashes.
#[async_trait]
pub trait TipSource: Send {
    /// Await the next tip notification. `None` means the source is closed
    /// for good.
    async fn recv(&mut self) -> Option<String>;
}

/// ZMQ `hashblock` subscription with internal reconnect.
pub struct ZmqTipSource {
    endpoint: String,
    socket: Option<SubSocket>,
}

impl ZmqTipSource {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            endpoint: format!("tcp://{host}:{port}"),
            socket: None,
        }
    }

    async fn ensure_connected(&mut self) -> Option<&mut SubSocket> {
        if self.socket.is_none() {
            let mut socket = SubSocket::new();
            match socket.connect(&self.endpoint).await {
                Ok(()) => {
                    if let Err(err) = socket.subscribe("hashblock").await {
                        warn!(%err, "zmq subscribe failed");
                        return None;
                    }
                    info!(endpoint = %self.endpoint, "zmq tip source connected");
                    self.socket = Some(socket);
                }
                Err(err) => {
                    warn!(%err, endpoint = %self.endpoint, "zmq connect failed");
                    return None;
                }
            }
        }
        self.socket.as_mut()
    }
}

#[async_trait]
impl TipSource for ZmqTipSource {
    async fn recv(&mut self) -> Option<String> {
        loop {
            let Some(socket) = self.ensure_connected().await else {
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            };
            match socket.recv().await {
                Ok(message) => {
                    // Frames: topic, 32-byte hash (wire order), sequence.
                    let frames: Vec<_> = message.into_vec();
                    let Some(hash_frame) = frames.get(1) else {
                        continue;
                    };
                    if hash_frame.len() != 32 {
                        continue;
                    }
                    let mut bytes = hash_frame.to_vec();
                    bytes.reverse();
                    return Some(hex::encode(bytes));
                }
                Err(err) => {
                    warn!(%err, "zmq receive failed, reconnecting");
                    self.socket = None;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }
}

/// An mpsc-backed source for tests and for wiring the SPV session in as a
/// notifier.
pub struct ChannelTipSource {
    rx: mpsc::Receiver<String>,
}

impl ChannelTipSource {
    pub fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl TipSource for ChannelTipSource {
    async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

pub struct TipChaser {
    source: Box<dyn TipSource>,
    chain: Arc<dyn Blockchain>,
    out: mpsc::Sender<String>,
    last_seen: Option<String>,
}

impl TipChaser {
    pub fn new(
        source: Box<dyn TipSource>,
        chain: Arc<dyn Blockchain>,
    ) -> (Self, mpsc::Receiver<String>) {
        let (out, rx) = mpsc::channel(8);
        (
            Self {
                source,
                chain,
                out,
                last_seen: None,
            },
            rx,
        )
    }

    async fn emit(&mut self, hash: String) {
        if self.last_seen.as_deref() == Some(hash.as_str()) {
            return;
        }
        debug!(%hash, "tip changed");
        self.last_seen = Some(hash.clone());
        let _ = self.out.send(hash).await;
    }

    /// Run until cancelled. The poll ticker keeps the stream alive when the
    /// push source is down or the node drops notifications.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut push_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("tip chaser shutting down");
                    return;
                }
                notified = self.source.recv(), if push_open => {
                    match notified {
                        Some(hash) => self.emit(hash).await,
                        None => {
                            warn!("tip source closed, falling back to polling");
                            push_open = false;
                        }
                    }
                }
                _ = poll.tick() => {
                    match self.chain.best_block_hash().await {
                        Ok(hash) => self.emit(hash).await,
                        Err(err) => debug!(%err, "tip poll failed"),
                    }
                }
            }
        }
    }
}
