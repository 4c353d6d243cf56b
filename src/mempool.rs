//! Mempool tracker: scans the node's unconfirmed pool on a fixed tick and
//! records pending rows for transactions touching tracked addresses.
//!
//! Pending rows are inserted only when `(address_id, tx_id)` is absent, so
//! rows written by an earlier tick or by a confirming block always win; the
//! block-connect upsert later flips the same row to confirmed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{Blockchain, ChainError};
use crate::doge::{classify_script, to_doge, Transaction};
use crate::indexer::{derive_receiver, derive_sender, fetch_prev_output, AddressIndex, AddressInfo};
use crate::store::{Store, TxRecord, TxStatus};

const TICK_INTERVAL: Duration = Duration::from_secs(10);

pub struct MempoolTracker {
    chain: Arc<dyn Blockchain>,
    store: Arc<dyn Store>,
    addresses: Mutex<AddressIndex>,
    /// Txids already scanned this session. Cleared whenever the tracked
    /// address set changes so the current pool is re-matched for newcomers.
    seen: Mutex<HashSet<String>>,
}

impl MempoolTracker {
    pub fn new(chain: Arc<dyn Blockchain>, store: Arc<dyn Store>) -> Self {
        Self {
            chain,
            store,
            addresses: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Register an address immediately, without waiting for the next tick's
    /// refresh. Called synchronously from the API after the store insert.
    pub async fn add_address(&self, address: &str, info: AddressInfo) {
        let mut addresses = self.addresses.lock().await;
        if addresses.insert(address.to_string(), info).is_none() {
            info!(%address, "address added to mempool tracker");
            // Already-scanned pool entries may pay the newcomer.
            self.seen.lock().await.clear();
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("mempool tracker shutting down");
                    return;
                }
                _ = tick.tick() => {
                    if let Err(err) = self.check_mempool().await {
                        warn!(%err, "mempool scan failed");
                    }
                }
            }
        }
    }

    /// Refresh the address map from the store; a changed address set voids
    /// the seen cache so the whole pool is re-matched.
    async fn refresh_addresses(&self) -> Result<(), ChainError> {
        let fresh = match crate::indexer::load_address_index(self.store.as_ref()).await {
            Ok(fresh) => fresh,
            Err(err) => {
                error!(%err, "failed to refresh tracked addresses");
                return Ok(());
            }
        };
        let mut addresses = self.addresses.lock().await;
        let changed = fresh.len() != addresses.len()
            || fresh.keys().any(|key| !addresses.contains_key(key));
        *addresses = fresh;
        drop(addresses);
        if changed {
            self.seen.lock().await.clear();
        }
        Ok(())
    }

    pub async fn check_mempool(&self) -> Result<usize, ChainError> {
        self.refresh_addresses().await?;

        let txids = self.chain.mempool_txids().await?;
        debug!(count = txids.len(), "mempool snapshot");

        let pool: HashSet<String> = txids.iter().cloned().collect();
        {
            // Entries that left the pool can be scanned again if they return.
            let mut seen = self.seen.lock().await;
            seen.retain(|txid| pool.contains(txid));
        }

        let mut inserted = 0;
        for txid in txids {
            if self.seen.lock().await.contains(&txid) {
                continue;
            }
            match self.scan_transaction(&txid).await {
                Ok(count) => {
                    inserted += count;
                    self.seen.lock().await.insert(txid);
                }
                Err(err) => {
                    // Transactions evicted or confirmed mid-scan are normal.
                    debug!(%txid, %err, "skipping mempool transaction");
                }
            }
        }
        if inserted > 0 {
            info!(inserted, "recorded pending mempool transactions");
        }
        Ok(inserted)
    }

    /// Classify one mempool transaction exactly like the block path, but
    /// with no block metadata, zero confirmations and the mempool entry
    /// time as the row timestamp.
    async fn scan_transaction(&self, txid: &str) -> Result<usize, ChainError> {
        let addresses = self.addresses.lock().await.clone();
        if addresses.is_empty() {
            return Ok(0);
        }

        let bytes = self.chain.raw_transaction(txid).await?;
        let tx = Transaction::decode_bytes(&bytes)?;
        let timestamp = self.chain.mempool_entry(txid).await?.time;

        let mut prev_outputs = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            prev_outputs.push(fetch_prev_output(self.chain.as_ref(), &input.prevout).await);
        }
        let sender = derive_sender(prev_outputs.first().and_then(Option::as_ref));

        let mut inserted = 0;

        for output in &tx.outputs {
            let Some((_, address)) = classify_script(&output.script_pubkey) else {
                continue;
            };
            let Some(info) = addresses.get(&address) else {
                continue;
            };
            let row = pending_row(
                info,
                txid,
                to_doge(output.value),
                true,
                timestamp,
                sender.clone(),
                address,
            );
            if self.insert_pending(&row).await {
                inserted += 1;
            }
        }

        for prev_output in prev_outputs.iter().flatten() {
            let Some((_, address)) = classify_script(&prev_output.script_pubkey) else {
                continue;
            };
            let Some(info) = addresses.get(&address) else {
                continue;
            };
            let row = pending_row(
                info,
                txid,
                -to_doge(prev_output.value),
                false,
                timestamp,
                address.clone(),
                derive_receiver(&tx),
            );
            if self.insert_pending(&row).await {
                inserted += 1;
            }
        }

        Ok(inserted)
    }

    async fn insert_pending(&self, row: &TxRecord) -> bool {
        match self.store.add_pending_transaction(row).await {
            Ok(written) => {
                if written {
                    debug!(txid = %row.tx_id, address_id = row.address_id, "pending row added");
                }
                written
            }
            Err(err) => {
                error!(%err, txid = %row.tx_id, "failed to record pending transaction");
                false
            }
        }
    }
}

fn pending_row(
    info: &AddressInfo,
    txid: &str,
    amount: f64,
    is_incoming: bool,
    timestamp: i64,
    sender_address: String,
    receiver_address: String,
) -> TxRecord {
    TxRecord {
        address_id: info.id,
        tx_id: txid.to_string(),
        block_hash: None,
        block_height: None,
        amount,
        fee: 0.0,
        timestamp,
        is_incoming,
        confirmations: 0,
        status: TxStatus::Pending,
        sender_address,
        receiver_address,
        created_at: 0,
    }
}
