//! Chain source port: the capability set the walker, indexer and mempool
//! tracker need from a Dogecoin node. Implemented by the Core JSON-RPC
//! client, by the SPV session, and by an in-memory fake in tests.

pub mod rpc;

use async_trait::async_trait;
use thiserror::Error;

pub use rpc::CoreRpcClient;

#[derive(Debug, Error)]
pub enum ChainError {
    /// Connection-level failures; retried by the owning task.
    #[error("chain transport error: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("unexpected chain response: {0}")]
    BadResponse(String),
    #[error("decode error: {0}")]
    Decode(#[from] crate::doge::DecodeError),
}

impl ChainError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Transport(_))
    }
}

/// Header metadata as reported by the node. `confirmations` is negative for
/// blocks that are no longer on the active chain, which is how the walker
/// detects reorgs.
#[derive(Debug, Clone)]
pub struct HeaderInfo {
    pub hash: String,
    pub height: i64,
    pub time: i64,
    pub prev_hash: Option<String>,
    pub next_hash: Option<String>,
    pub confirmations: i64,
}

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    /// Unix time the transaction entered the node mempool.
    pub time: i64,
}

#[async_trait]
pub trait Blockchain: Send + Sync {
    async fn best_block_hash(&self) -> Result<String, ChainError>;

    async fn block_hash(&self, height: i64) -> Result<String, ChainError>;

    async fn block_header(&self, hash: &str) -> Result<HeaderInfo, ChainError>;

    /// Raw serialized block bytes.
    async fn block(&self, hash: &str) -> Result<Vec<u8>, ChainError>;

    /// Raw serialized transaction bytes, confirmed or mempool.
    async fn raw_transaction(&self, txid: &str) -> Result<Vec<u8>, ChainError>;

    async fn mempool_txids(&self) -> Result<Vec<String>, ChainError>;

    async fn mempool_entry(&self, txid: &str) -> Result<MempoolEntry, ChainError>;
}
