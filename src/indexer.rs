//! Indexer: applies connect/undo events to the projection store while
//! keeping the balance, confirmation and unspent-set invariants intact.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{Blockchain, ChainError};
use crate::doge::{classify_script, to_doge, Block, OutPoint, Transaction, TxOut};
use crate::store::{
    BlockBatch, SpentOutput, Store, StoreError, TxRecord, TxStatus, UtxoRecord,
};

const APPLY_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Tracked address lookup: base58 address to `(id, required_confirmations)`.
pub type AddressIndex = HashMap<String, AddressInfo>;

#[derive(Debug, Clone, Copy)]
pub struct AddressInfo {
    pub id: i64,
    pub required_confirmations: i64,
}

/// Snapshot the registry; each work unit refreshes from the store instead
/// of sharing a map across tasks.
pub async fn load_address_index(store: &dyn Store) -> Result<AddressIndex, StoreError> {
    let addresses = store.list_tracked_addresses().await?;
    Ok(addresses
        .into_iter()
        .map(|a| {
            (
                a.address,
                AddressInfo {
                    id: a.id,
                    required_confirmations: a.required_confirmations,
                },
            )
        })
        .collect())
}

/// Fetch and decode the transaction a given input spends, returning the
/// referenced output. Best-effort: lookup failures yield `None`.
pub(crate) async fn fetch_prev_output(
    chain: &dyn Blockchain,
    prevout: &OutPoint,
) -> Option<TxOut> {
    if prevout.is_null() {
        return None;
    }
    let txid = prevout.txid_hex();
    let bytes = match chain.raw_transaction(&txid).await {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(%txid, %err, "prev tx lookup failed");
            return None;
        }
    };
    let tx = match Transaction::decode_bytes(&bytes) {
        Ok(tx) => tx,
        Err(err) => {
            debug!(%txid, %err, "prev tx decode failed");
            return None;
        }
    };
    tx.outputs.get(prevout.index as usize).cloned()
}

/// The address a transaction's first input spends from, or empty when it
/// cannot be resolved.
pub(crate) fn derive_sender(prev_out: Option<&TxOut>) -> String {
    prev_out
        .and_then(|out| classify_script(&out.script_pubkey))
        .map(|(_, address)| address)
        .unwrap_or_default()
}

/// The address a transaction's first output pays to, or empty.
pub(crate) fn derive_receiver(tx: &Transaction) -> String {
    tx.outputs
        .first()
        .and_then(|out| classify_script(&out.script_pubkey))
        .map(|(_, address)| address)
        .unwrap_or_default()
}

pub struct Indexer {
    chain: Arc<dyn Blockchain>,
    store: Arc<dyn Store>,
}

impl Indexer {
    pub fn new(chain: Arc<dyn Blockchain>, store: Arc<dyn Store>) -> Self {
        Self { chain, store }
    }

    /// Consume walker events serially until the stream ends or we are
    /// cancelled. Store failures are retried; a block is either fully
    /// applied or not applied at all.
    pub async fn run(self, mut events: mpsc::Receiver<crate::walker::ChainEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("indexer shutting down");
                    return;
                }
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        info!("walker stream ended, indexer stopping");
                        return;
                    }
                },
            };

            let mut attempt = 0;
            loop {
                match self.handle_event(&event).await {
                    Ok(()) => break,
                    Err(err) => {
                        attempt += 1;
                        if attempt > APPLY_RETRIES {
                            error!(%err, "giving up applying chain event, requesting shutdown");
                            cancel.cancel();
                            return;
                        }
                        warn!(%err, attempt, "failed to apply chain event, retrying");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_secs(1 << attempt)) => {}
                        }
                    }
                }
            }
        }
    }

    pub async fn handle_event(
        &self,
        event: &crate::walker::ChainEvent,
    ) -> Result<(), IndexError> {
        match event {
            crate::walker::ChainEvent::Connect {
                block,
                hash,
                height,
            } => self.connect_block(block, hash, *height).await,
            crate::walker::ChainEvent::Undo {
                block_hashes,
                last_valid_height,
                resume_from_hash,
            } => {
                info!(
                    undone = block_hashes.len(),
                    resume_height = last_valid_height,
                    "undoing reorganized blocks"
                );
                self.store
                    .undo_blocks(block_hashes, *last_valid_height, resume_from_hash)
                    .await?;
                Ok(())
            }
        }
    }

    /// Project one connected block into a batch and apply it atomically.
    pub async fn connect_block(
        &self,
        block: &Block,
        hash: &str,
        height: i64,
    ) -> Result<(), IndexError> {
        let index = load_address_index(self.store.as_ref()).await?;
        let mut batch = BlockBatch::new(hash.to_string(), height);
        let timestamp = i64::from(block.header.time);

        if !index.is_empty() {
            for tx in &block.transactions {
                self.project_transaction(tx, &index, timestamp, &mut batch)
                    .await;
            }
        }

        debug!(
            %hash,
            height,
            rows = batch.transactions.len(),
            utxos = batch.unspent_outputs.len(),
            spends = batch.spent_outputs.len(),
            "applying block"
        );
        self.store.apply_block(&batch).await?;
        Ok(())
    }

    async fn project_transaction(
        &self,
        tx: &Transaction,
        index: &AddressIndex,
        timestamp: i64,
        batch: &mut BlockBatch,
    ) {
        let txid = tx.txid();
        let coinbase = tx.is_coinbase();

        // Resolve every spent output up front; the fee and the outgoing
        // classification both need them.
        let mut prev_outputs: Vec<Option<TxOut>> = Vec::with_capacity(tx.inputs.len());
        if coinbase {
            prev_outputs.resize(tx.inputs.len(), None);
        } else {
            for input in &tx.inputs {
                prev_outputs.push(fetch_prev_output(self.chain.as_ref(), &input.prevout).await);
            }
        }

        let fee = if coinbase {
            0.0
        } else {
            let total_in: f64 = prev_outputs
                .iter()
                .flatten()
                .map(|out| to_doge(out.value))
                .sum();
            let total_out: f64 = tx.outputs.iter().map(|out| to_doge(out.value)).sum();
            total_in - total_out
        };

        let sender = derive_sender(prev_outputs.first().and_then(Option::as_ref));

        // Incoming side: classified outputs paying a tracked address.
        for (vout, output) in tx.outputs.iter().enumerate() {
            let Some((_, address)) = classify_script(&output.script_pubkey) else {
                continue;
            };
            let Some(info) = index.get(&address) else {
                continue;
            };
            let amount = to_doge(output.value);
            let confirmations = 1;
            batch.unspent_outputs.push(UtxoRecord {
                address_id: info.id,
                tx_id: txid.clone(),
                vout: vout as i64,
                amount,
                script: hex::encode(&output.script_pubkey),
                created_at: 0,
            });
            batch.transactions.push(TxRecord {
                address_id: info.id,
                tx_id: txid.clone(),
                block_hash: Some(batch.block_hash.clone()),
                block_height: Some(batch.block_height),
                amount,
                fee,
                timestamp,
                is_incoming: true,
                confirmations,
                status: TxStatus::from_confirmations(confirmations, info.required_confirmations),
                sender_address: sender.clone(),
                receiver_address: address,
                created_at: 0,
            });
        }

        // Outgoing side: inputs spending an output of a tracked address.
        for (input, prev_output) in tx.inputs.iter().zip(&prev_outputs) {
            let Some(prev_output) = prev_output else {
                continue;
            };
            let Some((_, address)) = classify_script(&prev_output.script_pubkey) else {
                continue;
            };
            let Some(info) = index.get(&address) else {
                continue;
            };
            batch.spent_outputs.push(SpentOutput {
                address_id: info.id,
                tx_id: input.prevout.txid_hex(),
                vout: i64::from(input.prevout.index),
            });
            let confirmations = 1;
            batch.transactions.push(TxRecord {
                address_id: info.id,
                tx_id: txid.clone(),
                block_hash: Some(batch.block_hash.clone()),
                block_height: Some(batch.block_height),
                amount: -to_doge(prev_output.value),
                fee,
                timestamp,
                is_incoming: false,
                confirmations,
                status: TxStatus::from_confirmations(confirmations, info.required_confirmations),
                sender_address: address,
                receiver_address: derive_receiver(tx),
                created_at: 0,
            });
        }
    }
}
