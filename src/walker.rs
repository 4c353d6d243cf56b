//! Block walker: turns the forking blockchain into a total-ordered stream
//! of connect/undo events.
//!
//! The walker is the only component that ever sees a fork. It keeps the
//! hash and height of the block it last handed to the indexer and, on every
//! tip change, first rolls back to the fork point if that block fell off
//! the active chain, then emits the missing blocks in height order.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chain::{Blockchain, ChainError};
use crate::doge::Block;

const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum ChainEvent {
    Connect {
        block: Block,
        hash: String,
        height: i64,
    },
    Undo {
        /// Dead block hashes, newest first.
        block_hashes: Vec<String>,
        last_valid_height: i64,
        resume_from_hash: String,
    },
}

#[derive(Debug, Error)]
pub enum WalkerError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("event channel closed")]
    ChannelClosed,
    #[error("chain walk failed: {0}")]
    BrokenChain(String),
}

pub struct BlockWalker {
    chain: Arc<dyn Blockchain>,
    active_hash: String,
    active_height: i64,
    out: mpsc::Sender<ChainEvent>,
}

impl BlockWalker {
    /// `resume_hash` is the last block already reflected in the store; the
    /// first emitted event continues after it.
    pub async fn new(
        chain: Arc<dyn Blockchain>,
        resume_hash: String,
    ) -> Result<(Self, mpsc::Receiver<ChainEvent>), WalkerError> {
        let header = chain.block_header(&resume_hash).await?;
        info!(hash = %resume_hash, height = header.height, "walker resuming");
        let (out, rx) = mpsc::channel(1);
        Ok((
            Self {
                chain,
                active_hash: resume_hash,
                active_height: header.height,
                out,
            },
            rx,
        ))
    }

    /// Drive the walker until cancellation. Each tip notification triggers
    /// one catch-up pass; node outages pause the walker without emitting
    /// speculative events.
    pub async fn run(mut self, mut tips: mpsc::Receiver<String>, cancel: CancellationToken) {
        // Catch up from the resume point before waiting for the first tip.
        if !self.sync_with_retry(&cancel).await {
            return;
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("walker shutting down");
                    return;
                }
                tip = tips.recv() => {
                    if tip.is_none() {
                        warn!("tip stream closed, walker stopping");
                        return;
                    }
                    // Collapse a burst of notifications into one pass.
                    while tips.try_recv().is_ok() {}
                    if !self.sync_with_retry(&cancel).await {
                        return;
                    }
                }
            }
        }
    }

    async fn sync_with_retry(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            match self.sync_to_tip().await {
                Ok(()) => return true,
                Err(WalkerError::ChannelClosed) => return false,
                Err(err) => {
                    warn!(%err, "walker sync failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                }
            }
        }
    }

    /// One catch-up pass: undo to the fork point if our tip went stale,
    /// then connect every block up to the node's best.
    async fn sync_to_tip(&mut self) -> Result<(), WalkerError> {
        self.undo_if_stale().await?;

        let best_hash = self.chain.best_block_hash().await?;
        if best_hash == self.active_hash {
            return Ok(());
        }
        let best_height = self.chain.block_header(&best_hash).await?.height;

        while self.active_height < best_height {
            let next_height = self.active_height + 1;
            let next_hash = self.chain.block_hash(next_height).await?;
            let bytes = self.chain.block(&next_hash).await?;
            let block = Block::decode_bytes(&bytes).map_err(ChainError::Decode)?;

            // The node can reorg while we walk; if linkage breaks, recheck
            // the active tip or back off until the node settles.
            if block.header.block_hash_hex() != next_hash
                || crate::doge::hex_reversed(&block.header.prev_block) != self.active_hash
            {
                warn!(height = next_height, "chain moved under the walker, rechecking");
                if !self.undo_if_stale().await? {
                    return Err(WalkerError::BrokenChain(format!(
                        "block {next_hash} does not extend {}",
                        self.active_hash
                    )));
                }
                continue;
            }

            self.out
                .send(ChainEvent::Connect {
                    block,
                    hash: next_hash.clone(),
                    height: next_height,
                })
                .await
                .map_err(|_| WalkerError::ChannelClosed)?;
            self.active_hash = next_hash;
            self.active_height = next_height;
        }
        Ok(())
    }

    /// If the active tip is no longer on the node's best chain, walk its
    /// prev-links back to the fork point and emit one undo event covering
    /// every dead block, newest first. Returns whether an undo was emitted.
    async fn undo_if_stale(&mut self) -> Result<bool, WalkerError> {
        let mut header = self.chain.block_header(&self.active_hash).await?;
        if header.confirmations >= 0 {
            return Ok(false);
        }

        let mut dead = Vec::new();
        while header.confirmations < 0 {
            dead.push(header.hash.clone());
            let prev = header.prev_hash.clone().ok_or_else(|| {
                WalkerError::BrokenChain(format!("no ancestor on active chain below {}", header.hash))
            })?;
            header = self.chain.block_header(&prev).await?;
        }

        warn!(
            fork_height = header.height,
            undone = dead.len(),
            "chain reorganization detected"
        );
        let fork_hash = header.hash.clone();
        let fork_height = header.height;
        self.out
            .send(ChainEvent::Undo {
                block_hashes: dead,
                last_valid_height: fork_height,
                resume_from_hash: fork_hash.clone(),
            })
            .await
            .map_err(|_| WalkerError::ChannelClosed)?;
        self.active_hash = fork_hash;
        self.active_height = fork_height;
        Ok(true)
    }
}

/// Resolve the configured start block: a decimal height, a block hash, the
/// persisted cursor, or the node's current best, in that order.
pub async fn resolve_start_block(
    chain: &dyn Blockchain,
    configured: Option<&str>,
    cursor_hash: Option<String>,
) -> Result<String, ChainError> {
    if let Some(start) = configured.filter(|s| !s.is_empty()) {
        if let Ok(height) = start.parse::<i64>() {
            let hash = chain.block_hash(height).await?;
            info!(height, %hash, "starting from configured height");
            return Ok(hash);
        }
        info!(hash = %start, "starting from configured hash");
        return Ok(start.to_string());
    }
    if let Some(hash) = cursor_hash {
        info!(%hash, "resuming from persisted cursor");
        return Ok(hash);
    }
    let best = chain.best_block_hash().await?;
    info!(hash = %best, "no cursor found, starting from the node tip");
    Ok(best)
}
