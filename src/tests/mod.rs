//! Shared test fixtures: an in-memory chain source and block builders.

pub mod indexer_tests;
pub mod walker_tests;

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::chain::{Blockchain, ChainError, HeaderInfo, MempoolEntry};
use crate::doge::script::base58check_encode;
use crate::doge::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut, COIN};

pub fn p2pkh_script(hash: &[u8; 20]) -> Vec<u8> {
    let mut script = vec![0x76, 0xa9, 0x14];
    script.extend_from_slice(hash);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

/// Dogecoin mainnet address paying to the given pubkey hash.
pub fn address_for(hash: &[u8; 20]) -> String {
    base58check_encode(crate::doge::script::P2PKH_VERSION, hash)
}

pub fn doge(amount: f64) -> u64 {
    (amount * COIN as f64).round() as u64
}

/// A coinbase transaction paying the given script.
pub fn coinbase_paying(value: u64, script: Vec<u8>) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint {
                hash: [0u8; 32],
                index: u32::MAX,
            },
            script_sig: vec![0x51],
            sequence: 0xffff_ffff,
        }],
        outputs: vec![TxOut {
            value,
            script_pubkey: script,
        }],
        lock_time: 0,
    }
}

/// A transaction spending one outpoint into the given outputs.
pub fn spend(prev: &Transaction, prev_vout: u32, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint {
                hash: crate::doge::hash_from_hex_reversed(&prev.txid()).unwrap(),
                index: prev_vout,
            },
            script_sig: vec![0xde, 0xad],
            sequence: 0xffff_ffff,
        }],
        outputs,
        lock_time: 0,
    }
}

pub fn block_with(prev_block: [u8; 32], time: u32, transactions: Vec<Transaction>) -> Block {
    Block {
        header: BlockHeader {
            version: 0x0062_0004,
            prev_block,
            merkle_root: [0u8; 32],
            time,
            bits: 0x1e0f_ffff,
            nonce: 0,
        },
        transactions,
    }
}

#[derive(Default)]
struct FakeChainInner {
    /// Every block ever seen, active or not.
    blocks: HashMap<String, (Block, i64)>,
    /// The active chain, height to hash.
    active: BTreeMap<i64, String>,
    /// Raw transaction lookup, including off-block funding transactions.
    transactions: HashMap<String, Transaction>,
    mempool: Vec<String>,
    mempool_times: HashMap<String, i64>,
}

/// In-memory `Blockchain` fake: blocks are attached to heights, the active
/// chain can be rewritten to simulate reorganizations, and headers report
/// negative confirmations for blocks that fell off it.
#[derive(Default)]
pub struct FakeChain {
    inner: Mutex<FakeChainInner>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a block as the active block at its height, registering its
    /// transactions for raw lookup.
    pub fn add_block(&self, block: &Block, height: i64) -> String {
        let hash = block.header.block_hash_hex();
        let mut inner = self.inner.lock().unwrap();
        for tx in &block.transactions {
            inner.transactions.insert(tx.txid(), tx.clone());
        }
        inner.blocks.insert(hash.clone(), (block.clone(), height));
        inner.active.insert(height, hash.clone());
        // Anything above this height belongs to a replaced chain now.
        inner.active.split_off(&(height + 1));
        hash
    }

    /// Register a transaction that exists outside any block (funding txs,
    /// mempool candidates).
    pub fn add_transaction(&self, tx: &Transaction) {
        self.inner
            .lock()
            .unwrap()
            .transactions
            .insert(tx.txid(), tx.clone());
    }

    pub fn set_mempool(&self, entries: Vec<(Transaction, i64)>) {
        let mut inner = self.inner.lock().unwrap();
        inner.mempool.clear();
        inner.mempool_times.clear();
        for (tx, time) in entries {
            let txid = tx.txid();
            inner.transactions.insert(txid.clone(), tx);
            inner.mempool_times.insert(txid.clone(), time);
            inner.mempool.push(txid);
        }
    }
}

#[async_trait]
impl Blockchain for FakeChain {
    async fn best_block_hash(&self) -> Result<String, ChainError> {
        let inner = self.inner.lock().unwrap();
        inner
            .active
            .values()
            .next_back()
            .cloned()
            .ok_or_else(|| ChainError::BadResponse("empty chain".into()))
    }

    async fn block_hash(&self, height: i64) -> Result<String, ChainError> {
        let inner = self.inner.lock().unwrap();
        inner.active.get(&height).cloned().ok_or(ChainError::Rpc {
            code: -8,
            message: "block height out of range".into(),
        })
    }

    async fn block_header(&self, hash: &str) -> Result<HeaderInfo, ChainError> {
        let inner = self.inner.lock().unwrap();
        let (block, height) = inner.blocks.get(hash).ok_or(ChainError::Rpc {
            code: -5,
            message: "block not found".into(),
        })?;
        let on_active = inner.active.get(height).map(String::as_str) == Some(hash);
        let best_height = inner.active.keys().next_back().copied().unwrap_or(*height);
        Ok(HeaderInfo {
            hash: hash.to_string(),
            height: *height,
            time: i64::from(block.header.time),
            prev_hash: Some(crate::doge::hex_reversed(&block.header.prev_block)),
            next_hash: inner.active.get(&(height + 1)).cloned(),
            confirmations: if on_active {
                best_height - height + 1
            } else {
                -1
            },
        })
    }

    async fn block(&self, hash: &str) -> Result<Vec<u8>, ChainError> {
        let inner = self.inner.lock().unwrap();
        let (block, _) = inner.blocks.get(hash).ok_or(ChainError::Rpc {
            code: -5,
            message: "block not found".into(),
        })?;
        Ok(block.serialize())
    }

    async fn raw_transaction(&self, txid: &str) -> Result<Vec<u8>, ChainError> {
        let inner = self.inner.lock().unwrap();
        let tx = inner.transactions.get(txid).ok_or(ChainError::Rpc {
            code: -5,
            message: "no such transaction".into(),
        })?;
        Ok(tx.serialize())
    }

    async fn mempool_txids(&self) -> Result<Vec<String>, ChainError> {
        Ok(self.inner.lock().unwrap().mempool.clone())
    }

    async fn mempool_entry(&self, txid: &str) -> Result<MempoolEntry, ChainError> {
        let inner = self.inner.lock().unwrap();
        inner
            .mempool_times
            .get(txid)
            .map(|time| MempoolEntry { time: *time })
            .ok_or(ChainError::Rpc {
                code: -5,
                message: "not in mempool".into(),
            })
    }
}
