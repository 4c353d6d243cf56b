//! Durable projection store: tracked addresses, per-address transaction
//! ledger, unspent outputs and the block cursor.
//!
//! The indexer composes a [`BlockBatch`] per connected block and hands it to
//! [`Store::apply_block`], which must apply every mutation in one database
//! transaction. Undo works the same way through [`Store::undo_blocks`]. Both
//! backends (PostgreSQL and the in-memory test twin) implement identical
//! semantics.

pub mod mem;
pub mod pg;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use mem::MemStore;
pub use pg::PgStore;

/// Confirmations stop counting up once they reach this ceiling.
pub const MAX_CONFIRMATIONS: i64 = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirmed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Confirmed => "confirmed",
        }
    }

    pub fn from_confirmations(confirmations: i64, required: i64) -> Self {
        if confirmations >= required {
            TxStatus::Confirmed
        } else {
            TxStatus::Pending
        }
    }

    pub(crate) fn parse(value: &str) -> Self {
        if value == "confirmed" {
            TxStatus::Confirmed
        } else {
            TxStatus::Pending
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackedAddress {
    pub id: i64,
    pub address: String,
    pub required_confirmations: i64,
    pub balance: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One per-address view of a chain or mempool transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TxRecord {
    pub address_id: i64,
    pub tx_id: String,
    pub block_hash: Option<String>,
    pub block_height: Option<i64>,
    /// Signed DOGE amount: positive incoming, negative outgoing.
    pub amount: f64,
    pub fee: f64,
    pub timestamp: i64,
    pub is_incoming: bool,
    pub confirmations: i64,
    pub status: TxStatus,
    pub sender_address: String,
    pub receiver_address: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UtxoRecord {
    pub address_id: i64,
    pub tx_id: String,
    pub vout: i64,
    pub amount: f64,
    /// scriptPubKey, hex encoded.
    pub script: String,
    pub created_at: i64,
}

/// Key of an unspent output consumed by a block in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpentOutput {
    pub address_id: i64,
    pub tx_id: String,
    pub vout: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockCursor {
    pub height: i64,
    pub hash: String,
}

/// Every mutation derived from one connected block. Applied atomically.
#[derive(Debug, Clone, Default)]
pub struct BlockBatch {
    pub block_hash: String,
    pub block_height: i64,
    pub transactions: Vec<TxRecord>,
    pub unspent_outputs: Vec<UtxoRecord>,
    pub spent_outputs: Vec<SpentOutput>,
}

impl BlockBatch {
    pub fn new(block_hash: String, block_height: i64) -> Self {
        Self {
            block_hash,
            block_height,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
            && self.unspent_outputs.is_empty()
            && self.spent_outputs.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AddressDetails {
    pub address: TrackedAddress,
    pub transactions: Vec<TxRecord>,
    pub unspent_outputs: Vec<UtxoRecord>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Idempotent registration; inserts with balance 0 when absent. An
    /// existing address keeps its original `required_confirmations`.
    async fn get_or_create_address(
        &self,
        address: &str,
        required_confirmations: i64,
    ) -> Result<TrackedAddress, StoreError>;

    async fn find_address(&self, address: &str) -> Result<Option<TrackedAddress>, StoreError>;

    /// Full per-address view for the API: balance, ledger (newest first)
    /// and live unspent set. `None` when the address is not tracked.
    async fn address_details(&self, address: &str)
        -> Result<Option<AddressDetails>, StoreError>;

    async fn list_tracked_addresses(&self) -> Result<Vec<TrackedAddress>, StoreError>;

    async fn cursor(&self) -> Result<Option<BlockCursor>, StoreError>;

    /// Mempool path: insert a pending row only when `(address_id, tx_id)`
    /// is absent. Returns whether a row was written; rows from prior ticks
    /// or confirming blocks win.
    async fn add_pending_transaction(&self, row: &TxRecord) -> Result<bool, StoreError>;

    /// Apply one connected block in a single transaction: refresh
    /// confirmations of every existing confirmed row against the new
    /// height, upsert the batch rows (an existing row keeps its
    /// `amount`/`is_incoming`), delete spent outputs, rewrite every
    /// address balance from its unspent set and advance the cursor.
    async fn apply_block(&self, batch: &BlockBatch) -> Result<(), StoreError>;

    /// Undo the given block hashes (newest first) in a single transaction:
    /// delete their transaction rows and the unspent outputs created by
    /// their incoming rows, rewrite balances, rewind the cursor and
    /// recompute confirmations from the post-undo height.
    async fn undo_blocks(
        &self,
        block_hashes: &[String],
        resume_height: i64,
        resume_hash: &str,
    ) -> Result<(), StoreError>;
}

pub(crate) fn unix_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Confirmation count of a block at the given tip height, shared by both
/// backends.
pub(crate) fn confirmations_at(tip_height: i64, block_height: i64) -> i64 {
    (tip_height - block_height + 1).clamp(0, MAX_CONFIRMATIONS)
}
