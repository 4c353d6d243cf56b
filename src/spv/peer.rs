//! SPV peer session lifecycle: connect, handshake, header sync, block and
//! transaction fetch, keepalive. The session implements [`Blockchain`] so
//! it can stand in for the RPC client as the ingest source.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{Blockchain, ChainError, HeaderInfo, MempoolEntry};
use crate::doge::{
    hash_from_hex_reversed, hex_reversed, Block, Transaction, MAINNET_GENESIS_HASH,
};
use crate::spv::message::{
    build_getdata, build_getheaders, build_version_payload, parse_headers, parse_inv,
    parse_version, InvItem, MessageReader, MessageWriter, MAX_HEADERS_PER_MESSAGE, MSG_BLOCK,
    MSG_TX,
};
use crate::spv::{validate_header, HeaderChain, SessionState, SpvError, SpvHeader};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const BLOCK_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const TX_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// An otherwise silent peer is dropped after this long.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Mempool announcements older than this fall out of the snapshot.
const ANNOUNCEMENT_RETENTION: i64 = 3600;

#[derive(Debug, Clone)]
pub struct SpvConfig {
    /// Peer addresses, `host:port` (Dogecoin mainnet port 22556).
    pub peers: Vec<String>,
    /// Height of the block the header chain starts from.
    pub start_height: i64,
    /// Display-order hash the first synced header must link to; the
    /// mainnet genesis when syncing from scratch.
    pub start_hash: String,
}

impl SpvConfig {
    pub fn from_genesis(peers: Vec<String>) -> Self {
        Self {
            peers,
            start_height: 0,
            start_hash: MAINNET_GENESIS_HASH.to_string(),
        }
    }
}

struct Shared {
    headers: StdMutex<HeaderChain>,
    state: StdMutex<SessionState>,
    start_height: i64,
    start_hash: String,
    writer: Mutex<Option<MessageWriter>>,
    pending_blocks: Mutex<HashMap<String, oneshot::Sender<Block>>>,
    pending_txs: Mutex<HashMap<String, oneshot::Sender<Transaction>>>,
    /// Transactions the peer has announced via inv, with first-seen time.
    /// This is the best view of the remote mempool SPV can offer.
    announced_txs: StdMutex<HashMap<String, i64>>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Connection-level failures are transient for the callers; protocol and
/// validation failures are not.
fn chain_error(err: SpvError) -> ChainError {
    match err {
        SpvError::Io(_) | SpvError::Timeout(_) | SpvError::Disconnected => {
            ChainError::Transport(err.to_string())
        }
        other => ChainError::BadResponse(other.to_string()),
    }
}

pub struct SpvSession {
    config: SpvConfig,
    shared: Arc<Shared>,
}

impl SpvSession {
    pub fn new(config: SpvConfig) -> Self {
        let shared = Arc::new(Shared {
            headers: StdMutex::new(HeaderChain::default()),
            state: StdMutex::new(SessionState::Disconnected),
            start_height: config.start_height,
            start_hash: config.start_hash.clone(),
            writer: Mutex::new(None),
            pending_blocks: Mutex::new(HashMap::new()),
            pending_txs: Mutex::new(HashMap::new()),
            announced_txs: StdMutex::new(HashMap::new()),
        });
        Self { config, shared }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.lock().unwrap()
    }

    pub fn synced_height(&self) -> Option<i64> {
        self.shared.headers.lock().unwrap().height()
    }

    pub fn header_by_height(&self, height: i64) -> Option<SpvHeader> {
        self.shared.headers.lock().unwrap().by_height(height).cloned()
    }

    pub fn header_by_hash(&self, hash_hex: &str) -> Option<SpvHeader> {
        self.shared.headers.lock().unwrap().by_hash(hash_hex).cloned()
    }

    /// Connection manager: cycle through the configured peers, serving one
    /// connection at a time, backing off between attempts.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            for peer in &self.config.peers {
                if cancel.is_cancelled() {
                    return;
                }
                match self.serve_peer(peer, &cancel).await {
                    Ok(()) => return, // cancelled
                    Err(err) => {
                        warn!(%peer, %err, "peer session ended");
                        self.set_state(SessionState::Disconnected).await;
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
            if self.config.peers.is_empty() {
                warn!("spv session has no peers configured");
                return;
            }
        }
    }

    async fn set_state(&self, state: SessionState) {
        *self.shared.state.lock().unwrap() = state;
        if state == SessionState::Disconnected {
            // Nothing will answer outstanding fetches now.
            self.shared.pending_blocks.lock().await.clear();
            self.shared.pending_txs.lock().await.clear();
            *self.shared.writer.lock().await = None;
        }
    }

    async fn serve_peer(&self, peer: &str, cancel: &CancellationToken) -> Result<(), SpvError> {
        info!(%peer, "connecting");
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
            .await
            .map_err(|_| SpvError::Timeout("connect"))??;
        let (read_half, write_half) = stream.into_split();
        let mut reader = MessageReader::new(read_half);
        *self.shared.writer.lock().await = Some(MessageWriter::new(write_half));

        self.set_state(SessionState::Handshaking).await;
        timeout(HANDSHAKE_TIMEOUT, self.handshake(&mut reader))
            .await
            .map_err(|_| SpvError::Timeout("handshake"))??;
        info!(%peer, "handshake complete");

        self.set_state(SessionState::HeaderSyncing).await;
        self.request_headers().await?;

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    self.set_state(SessionState::Disconnected).await;
                    return Ok(());
                }
                message = timeout(READ_IDLE_TIMEOUT, reader.read_message()) => {
                    message.map_err(|_| SpvError::Timeout("peer read"))??
                }
            };
            self.dispatch(message.command.as_str(), &message.payload)
                .await?;
        }
    }

    async fn handshake(&self, reader: &mut MessageReader) -> Result<(), SpvError> {
        let nonce: u64 = rand::thread_rng().gen();
        let start_height = self.synced_height().unwrap_or(self.shared.start_height) as i32;
        let payload = build_version_payload(start_height, nonce, true);
        self.send("version", &payload).await?;

        let mut got_version = false;
        let mut got_verack = false;
        while !(got_version && got_verack) {
            let message = reader.read_message().await?;
            match message.command.as_str() {
                "version" => {
                    let info = parse_version(&message.payload)?;
                    debug!(
                        version = info.version,
                        agent = %info.user_agent,
                        height = info.start_height,
                        "peer version"
                    );
                    got_version = true;
                    self.send("verack", &[]).await?;
                }
                "verack" => got_verack = true,
                "ping" => self.send("pong", &message.payload).await?,
                other => debug!(command = other, "ignored during handshake"),
            }
        }
        Ok(())
    }

    async fn send(&self, command: &str, payload: &[u8]) -> Result<(), SpvError> {
        let mut writer = self.shared.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => writer.send_message(command, payload).await,
            None => Err(SpvError::Disconnected),
        }
    }

    async fn request_headers(&self) -> Result<(), SpvError> {
        let locator = {
            let headers = self.shared.headers.lock().unwrap();
            headers.tip_locator().or_else(|| {
                hash_from_hex_reversed(&self.shared.start_hash)
            })
        };
        let Some(locator) = locator else {
            return Err(SpvError::Protocol("invalid start hash"));
        };
        self.send("getheaders", &build_getheaders(&[locator], [0u8; 32]))
            .await
    }

    /// Fetch one block by display-order hash via getdata, waiting up to the
    /// block fetch timeout.
    pub async fn fetch_block(&self, hash_hex: &str) -> Result<Block, SpvError> {
        let hash = hash_from_hex_reversed(hash_hex)
            .ok_or(SpvError::Protocol("invalid block hash"))?;
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending_blocks
            .lock()
            .await
            .insert(hash_hex.to_string(), tx);

        *self.shared.state.lock().unwrap() = SessionState::BlockSyncing;
        self.send(
            "getdata",
            &build_getdata(&[InvItem {
                kind: MSG_BLOCK,
                hash,
            }]),
        )
        .await?;

        let result = match timeout(BLOCK_FETCH_TIMEOUT, rx).await {
            Ok(Ok(block)) => Ok(block),
            Ok(Err(_)) => Err(SpvError::Disconnected),
            Err(_) => {
                self.shared.pending_blocks.lock().await.remove(hash_hex);
                Err(SpvError::Timeout("block fetch"))
            }
        };
        *self.shared.state.lock().unwrap() = SessionState::Idle;
        result
    }

    /// Fetch one transaction via getdata. Peers only relay what they still
    /// hold (their mempool and recent blocks), so callers treat failures as
    /// best-effort.
    pub async fn fetch_transaction(&self, txid_hex: &str) -> Result<Transaction, SpvError> {
        let hash = hash_from_hex_reversed(txid_hex)
            .ok_or(SpvError::Protocol("invalid transaction id"))?;
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending_txs
            .lock()
            .await
            .insert(txid_hex.to_string(), tx);

        self.send(
            "getdata",
            &build_getdata(&[InvItem { kind: MSG_TX, hash }]),
        )
        .await?;

        match timeout(TX_FETCH_TIMEOUT, rx).await {
            Ok(Ok(transaction)) => Ok(transaction),
            Ok(Err(_)) => Err(SpvError::Disconnected),
            Err(_) => {
                self.shared.pending_txs.lock().await.remove(txid_hex);
                Err(SpvError::Timeout("transaction fetch"))
            }
        }
    }

    async fn dispatch(&self, command: &str, payload: &[u8]) -> Result<(), SpvError> {
        match command {
            "ping" => self.send("pong", payload).await,
            "headers" => self.handle_headers(payload).await,
            "inv" => self.handle_inv(payload).await,
            "block" => self.handle_block(payload).await,
            "tx" => self.handle_tx(payload).await,
            "sendheaders" | "sendcmpct" | "feefilter" | "addr" | "getheaders" => {
                debug!(%command, "ignored");
                Ok(())
            }
            other => {
                debug!(command = other, "unknown message");
                Ok(())
            }
        }
    }

    /// Validate and store a headers batch. Any invalid header rejects the
    /// whole batch and disconnects the peer.
    async fn handle_headers(&self, payload: &[u8]) -> Result<(), SpvError> {
        let batch = parse_headers(payload)?;
        if batch.is_empty() {
            info!(
                height = self.synced_height().unwrap_or(self.shared.start_height),
                "header sync complete"
            );
            *self.shared.state.lock().unwrap() = SessionState::Idle;
            return Ok(());
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let full_batch = batch.len() == MAX_HEADERS_PER_MESSAGE;

        {
            let mut headers = self.shared.headers.lock().unwrap();
            let (mut prev_hash, mut height) = match headers.tip() {
                Some(tip) => (tip.hash_hex.clone(), tip.height),
                None => (self.shared.start_hash.clone(), self.shared.start_height),
            };
            for header in batch {
                validate_header(&header, &prev_hash, now)?;
                height += 1;
                prev_hash = header.block_hash_hex();
                headers.insert(header, height);
            }
            debug!(height, "headers accepted");
        }

        if full_batch {
            self.request_headers().await
        } else {
            info!(
                height = self.synced_height().unwrap_or(self.shared.start_height),
                "header sync complete"
            );
            *self.shared.state.lock().unwrap() = SessionState::Idle;
            Ok(())
        }
    }

    /// Announcements: request announced blocks so the header chain keeps
    /// following the tip, and remember announced transactions as the
    /// mempool view.
    async fn handle_inv(&self, payload: &[u8]) -> Result<(), SpvError> {
        let items = parse_inv(payload)?;
        let mut blocks = Vec::new();
        {
            let now = unix_now();
            let mut announced = self.shared.announced_txs.lock().unwrap();
            for item in &items {
                match item.kind {
                    MSG_TX => {
                        announced
                            .entry(hex_reversed(&item.hash))
                            .or_insert(now);
                    }
                    MSG_BLOCK => {
                        let hash_hex = hex_reversed(&item.hash);
                        if !self.shared.headers.lock().unwrap().contains(&hash_hex) {
                            blocks.push(*item);
                        }
                    }
                    other => debug!(kind = other, "unknown inventory type"),
                }
            }
        }
        if blocks.is_empty() {
            return Ok(());
        }
        debug!(count = blocks.len(), "requesting announced blocks");
        self.send("getdata", &build_getdata(&blocks)).await
    }

    async fn handle_block(&self, payload: &[u8]) -> Result<(), SpvError> {
        let block = Block::decode_bytes(payload)?;
        let hash_hex = block.header.block_hash_hex();

        // Extend the header chain when the block links to our tip.
        {
            let mut headers = self.shared.headers.lock().unwrap();
            let tip = headers.tip().map(|t| (t.hash_hex.clone(), t.height));
            if let Some((tip_hash, tip_height)) = tip {
                if hex_reversed(&block.header.prev_block) == tip_hash
                    && !headers.contains(&hash_hex)
                {
                    headers.insert(block.header, tip_height + 1);
                }
            }
        }

        if let Some(waiter) = self.shared.pending_blocks.lock().await.remove(&hash_hex) {
            let _ = waiter.send(block);
        } else {
            debug!(hash = %hash_hex, txs = block.transactions.len(), "unsolicited block");
        }
        Ok(())
    }

    async fn handle_tx(&self, payload: &[u8]) -> Result<(), SpvError> {
        let transaction = Transaction::decode_bytes(payload)?;
        let txid = transaction.txid();
        if let Some(waiter) = self.shared.pending_txs.lock().await.remove(&txid) {
            let _ = waiter.send(transaction);
        } else {
            debug!(%txid, "unsolicited transaction");
        }
        Ok(())
    }
}

/// The chain-source contract, served from the synced header chain and the
/// peer wire. Header lookups come from memory; block and transaction bytes
/// go through getdata; the mempool view is the set of inv-announced
/// transactions, refreshed by a `mempool` request.
#[async_trait]
impl Blockchain for SpvSession {
    async fn best_block_hash(&self) -> Result<String, ChainError> {
        let headers = self.shared.headers.lock().unwrap();
        match headers.tip() {
            Some(tip) => Ok(tip.hash_hex.clone()),
            None => Err(ChainError::Transport(
                "header chain not synced yet".to_string(),
            )),
        }
    }

    async fn block_hash(&self, height: i64) -> Result<String, ChainError> {
        if height == self.shared.start_height {
            return Ok(self.shared.start_hash.clone());
        }
        let headers = self.shared.headers.lock().unwrap();
        headers
            .by_height(height)
            .map(|entry| entry.hash_hex.clone())
            .ok_or_else(|| ChainError::BadResponse(format!("no header at height {height}")))
    }

    async fn block_header(&self, hash: &str) -> Result<HeaderInfo, ChainError> {
        let headers = self.shared.headers.lock().unwrap();
        let tip_height = headers.height().unwrap_or(self.shared.start_height);

        // The anchor the chain starts from is on-chain by definition but
        // has no stored header bytes.
        if hash == self.shared.start_hash && !headers.contains(hash) {
            return Ok(HeaderInfo {
                hash: hash.to_string(),
                height: self.shared.start_height,
                time: 0,
                prev_hash: None,
                next_hash: headers
                    .by_height(self.shared.start_height + 1)
                    .map(|entry| entry.hash_hex.clone()),
                confirmations: tip_height - self.shared.start_height + 1,
            });
        }

        let entry = headers
            .by_hash(hash)
            .ok_or_else(|| ChainError::BadResponse(format!("unknown block {hash}")))?;
        let active = headers.is_active(hash);
        Ok(HeaderInfo {
            hash: entry.hash_hex.clone(),
            height: entry.height,
            time: i64::from(entry.header.time),
            prev_hash: Some(hex_reversed(&entry.header.prev_block)),
            next_hash: if active {
                headers
                    .by_height(entry.height + 1)
                    .map(|next| next.hash_hex.clone())
            } else {
                None
            },
            confirmations: if active {
                tip_height - entry.height + 1
            } else {
                -1
            },
        })
    }

    async fn block(&self, hash: &str) -> Result<Vec<u8>, ChainError> {
        let block = self.fetch_block(hash).await.map_err(chain_error)?;
        Ok(block.serialize())
    }

    async fn raw_transaction(&self, txid: &str) -> Result<Vec<u8>, ChainError> {
        let transaction = self
            .fetch_transaction(txid)
            .await
            .map_err(chain_error)?;
        Ok(transaction.serialize())
    }

    async fn mempool_txids(&self) -> Result<Vec<String>, ChainError> {
        // Nudge the peer to announce its pool; answers arrive as inv
        // messages and land in the announcement set.
        if let Err(err) = self.send("mempool", &[]).await {
            debug!(%err, "mempool request failed");
        }
        let now = unix_now();
        let mut announced = self.shared.announced_txs.lock().unwrap();
        announced.retain(|_, seen| now - *seen < ANNOUNCEMENT_RETENTION);
        Ok(announced.keys().cloned().collect())
    }

    async fn mempool_entry(&self, txid: &str) -> Result<MempoolEntry, ChainError> {
        let announced = self.shared.announced_txs.lock().unwrap();
        announced
            .get(txid)
            .map(|seen| MempoolEntry { time: *seen })
            .ok_or_else(|| ChainError::BadResponse(format!("{txid} not announced")))
    }
}
