//! In-memory projection store mirroring the PostgreSQL semantics, used by
//! the unit tests to exercise the indexer without a database.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::store::{
    confirmations_at, unix_now, AddressDetails, BlockBatch, BlockCursor, Store, StoreError,
    TrackedAddress, TxRecord, TxStatus, UtxoRecord,
};

#[derive(Default)]
struct Inner {
    next_address_id: i64,
    addresses: Vec<TrackedAddress>,
    /// Keyed by `(address_id, tx_id)`.
    transactions: BTreeMap<(i64, String), TxRecord>,
    /// Keyed by `(address_id, tx_id, vout)`.
    utxos: BTreeMap<(i64, String, i64), UtxoRecord>,
    cursor: Option<BlockCursor>,
}

impl Inner {
    fn refresh_confirmations(&mut self, tip_height: i64) {
        let required: BTreeMap<i64, i64> = self
            .addresses
            .iter()
            .map(|a| (a.id, a.required_confirmations))
            .collect();
        for record in self.transactions.values_mut() {
            let Some(height) = record.block_height else {
                continue;
            };
            let confirmations = confirmations_at(tip_height, height);
            record.confirmations = confirmations;
            let threshold = required.get(&record.address_id).copied().unwrap_or(1);
            record.status = TxStatus::from_confirmations(confirmations, threshold);
        }
    }

    fn sweep_balances(&mut self, now: i64) {
        for address in &mut self.addresses {
            address.balance = self
                .utxos
                .values()
                .filter(|u| u.address_id == address.id)
                .map(|u| u.amount)
                .sum();
            address.updated_at = now;
        }
    }
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_or_create_address(
        &self,
        address: &str,
        required_confirmations: i64,
    ) -> Result<TrackedAddress, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.addresses.iter().find(|a| a.address == address) {
            return Ok(existing.clone());
        }
        inner.next_address_id += 1;
        let now = unix_now();
        let tracked = TrackedAddress {
            id: inner.next_address_id,
            address: address.to_string(),
            required_confirmations: required_confirmations.max(1),
            balance: 0.0,
            created_at: now,
            updated_at: now,
        };
        inner.addresses.push(tracked.clone());
        Ok(tracked)
    }

    async fn find_address(&self, address: &str) -> Result<Option<TrackedAddress>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .addresses
            .iter()
            .find(|a| a.address == address)
            .cloned())
    }

    async fn address_details(
        &self,
        address: &str,
    ) -> Result<Option<AddressDetails>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let Some(tracked) = inner.addresses.iter().find(|a| a.address == address).cloned()
        else {
            return Ok(None);
        };
        let mut transactions: Vec<TxRecord> = inner
            .transactions
            .values()
            .filter(|t| t.address_id == tracked.id)
            .cloned()
            .collect();
        transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let unspent_outputs = inner
            .utxos
            .values()
            .filter(|u| u.address_id == tracked.id)
            .cloned()
            .collect();
        Ok(Some(AddressDetails {
            address: tracked,
            transactions,
            unspent_outputs,
        }))
    }

    async fn list_tracked_addresses(&self) -> Result<Vec<TrackedAddress>, StoreError> {
        Ok(self.inner.lock().unwrap().addresses.clone())
    }

    async fn cursor(&self) -> Result<Option<BlockCursor>, StoreError> {
        Ok(self.inner.lock().unwrap().cursor.clone())
    }

    async fn add_pending_transaction(&self, record: &TxRecord) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (record.address_id, record.tx_id.clone());
        if inner.transactions.contains_key(&key) {
            return Ok(false);
        }
        let mut row = record.clone();
        row.block_hash = None;
        row.block_height = None;
        row.confirmations = 0;
        row.status = TxStatus::Pending;
        row.created_at = unix_now();
        inner.transactions.insert(key, row);
        Ok(true)
    }

    async fn apply_block(&self, batch: &BlockBatch) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = unix_now();

        inner.refresh_confirmations(batch.block_height);

        for record in &batch.transactions {
            let key = (record.address_id, record.tx_id.clone());
            match inner.transactions.get_mut(&key) {
                Some(existing) => {
                    // Same field policy as the SQL upsert: amount and
                    // direction are first-writer-wins.
                    existing.block_hash = record.block_hash.clone();
                    existing.block_height = record.block_height;
                    existing.fee = record.fee;
                    existing.timestamp = record.timestamp;
                    existing.confirmations = record.confirmations;
                    existing.status = record.status;
                    existing.sender_address = record.sender_address.clone();
                    existing.receiver_address = record.receiver_address.clone();
                }
                None => {
                    let mut row = record.clone();
                    row.created_at = now;
                    inner.transactions.insert(key, row);
                }
            }
        }

        for utxo in &batch.unspent_outputs {
            let key = (utxo.address_id, utxo.tx_id.clone(), utxo.vout);
            match inner.utxos.get_mut(&key) {
                Some(existing) => {
                    existing.amount = utxo.amount;
                    existing.script = utxo.script.clone();
                }
                None => {
                    let mut row = utxo.clone();
                    row.created_at = now;
                    inner.utxos.insert(key, row);
                }
            }
        }

        for spent in &batch.spent_outputs {
            inner
                .utxos
                .remove(&(spent.address_id, spent.tx_id.clone(), spent.vout));
        }

        inner.sweep_balances(now);
        inner.cursor = Some(BlockCursor {
            height: batch.block_height,
            hash: batch.block_hash.clone(),
        });
        Ok(())
    }

    async fn undo_blocks(
        &self,
        block_hashes: &[String],
        resume_height: i64,
        resume_hash: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let now = unix_now();

        for hash in block_hashes {
            let doomed: Vec<(i64, String, bool)> = inner
                .transactions
                .values()
                .filter(|t| t.block_hash.as_deref() == Some(hash.as_str()))
                .map(|t| (t.address_id, t.tx_id.clone(), t.is_incoming))
                .collect();
            for (address_id, tx_id, is_incoming) in doomed {
                if is_incoming {
                    let keys: Vec<(i64, String, i64)> = inner
                        .utxos
                        .keys()
                        .filter(|(aid, tid, _)| *aid == address_id && *tid == tx_id)
                        .cloned()
                        .collect();
                    for key in keys {
                        inner.utxos.remove(&key);
                    }
                }
                inner.transactions.remove(&(address_id, tx_id));
            }
        }

        inner.sweep_balances(now);
        inner.cursor = Some(BlockCursor {
            height: resume_height,
            hash: resume_hash.to_string(),
        });
        inner.refresh_confirmations(resume_height);
        Ok(())
    }
}
