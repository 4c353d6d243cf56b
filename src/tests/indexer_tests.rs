//! End-to-end indexer scenarios over the in-memory store and chain fake.

use std::sync::Arc;

use crate::doge::TxOut;
use crate::indexer::Indexer;
use crate::store::{MemStore, Store, TxStatus};
use crate::tests::{
    address_for, block_with, coinbase_paying, doge, p2pkh_script, spend, FakeChain,
};
use crate::walker::ChainEvent;

const TRACKED_HASH: [u8; 20] = [0x11; 20];
const OTHER_HASH: [u8; 20] = [0x22; 20];

struct Harness {
    chain: Arc<FakeChain>,
    store: Arc<MemStore>,
    indexer: Indexer,
}

fn harness() -> Harness {
    let chain = Arc::new(FakeChain::new());
    let store = Arc::new(MemStore::new());
    let indexer = Indexer::new(chain.clone(), store.clone());
    Harness {
        chain,
        store,
        indexer,
    }
}

#[tokio::test]
async fn registration_then_receive_reaches_required_confirmations() {
    let h = harness();
    let tracked = address_for(&TRACKED_HASH);
    h.store.get_or_create_address(&tracked, 3).await.unwrap();

    // Funding tx lives outside the indexed range; the payment spends it.
    let funding = coinbase_paying(doge(7.0), p2pkh_script(&OTHER_HASH));
    h.chain.add_transaction(&funding);
    let payment = spend(
        &funding,
        0,
        vec![
            TxOut {
                value: doge(5.0),
                script_pubkey: p2pkh_script(&TRACKED_HASH),
            },
            TxOut {
                value: doge(1.5),
                script_pubkey: p2pkh_script(&OTHER_HASH),
            },
        ],
    );

    let block = block_with([0xaa; 32], 1_700_000_000, vec![payment.clone()]);
    let hash = h.chain.add_block(&block, 100);
    h.indexer.connect_block(&block, &hash, 100).await.unwrap();

    let details = h.store.address_details(&tracked).await.unwrap().unwrap();
    assert_eq!(details.transactions.len(), 1);
    let row = &details.transactions[0];
    assert!(row.is_incoming);
    assert_eq!(row.amount, 5.0);
    assert_eq!(row.confirmations, 1);
    assert_eq!(row.status, TxStatus::Pending);
    assert_eq!(row.block_hash.as_deref(), Some(hash.as_str()));
    assert_eq!(row.sender_address, address_for(&OTHER_HASH));
    assert_eq!(row.receiver_address, tracked);
    // Fee: 7.0 in, 6.5 out.
    assert!((row.fee - 0.5).abs() < 1e-9);
    assert_eq!(details.unspent_outputs.len(), 1);
    assert_eq!(details.unspent_outputs[0].amount, 5.0);
    assert_eq!(details.address.balance, 5.0);

    // Two unrelated blocks bring the row to the threshold.
    for (height, prev) in [(101, [0xbb; 32]), (102, [0xcc; 32])] {
        let empty = block_with(prev, 1_700_000_100, vec![]);
        let empty_hash = h.chain.add_block(&empty, height);
        h.indexer
            .connect_block(&empty, &empty_hash, height)
            .await
            .unwrap();
    }

    let details = h.store.address_details(&tracked).await.unwrap().unwrap();
    let row = &details.transactions[0];
    assert_eq!(row.confirmations, 3);
    assert_eq!(row.status, TxStatus::Confirmed);

    let cursor = h.store.cursor().await.unwrap().unwrap();
    assert_eq!(cursor.height, 102);
}

#[tokio::test]
async fn spend_removes_unspent_output_and_records_outgoing_row() {
    let h = harness();
    let tracked = address_for(&TRACKED_HASH);
    h.store.get_or_create_address(&tracked, 1).await.unwrap();

    let funding = coinbase_paying(doge(5.0), p2pkh_script(&TRACKED_HASH));
    let receive_block = block_with([0xaa; 32], 1_700_000_000, vec![funding.clone()]);
    let receive_hash = h.chain.add_block(&receive_block, 100);
    h.indexer
        .connect_block(&receive_block, &receive_hash, 100)
        .await
        .unwrap();

    let details = h.store.address_details(&tracked).await.unwrap().unwrap();
    assert_eq!(details.address.balance, 5.0);
    assert_eq!(details.unspent_outputs.len(), 1);

    // Spend the whole output to an untracked address.
    let spending = spend(
        &funding,
        0,
        vec![TxOut {
            value: doge(4.9),
            script_pubkey: p2pkh_script(&OTHER_HASH),
        }],
    );
    let spend_block = block_with([0xbb; 32], 1_700_000_100, vec![spending.clone()]);
    let spend_hash = h.chain.add_block(&spend_block, 101);
    h.indexer
        .connect_block(&spend_block, &spend_hash, 101)
        .await
        .unwrap();

    let details = h.store.address_details(&tracked).await.unwrap().unwrap();
    assert!(details.unspent_outputs.is_empty());
    assert_eq!(details.address.balance, 0.0);
    assert_eq!(details.transactions.len(), 2);
    let outgoing = details
        .transactions
        .iter()
        .find(|row| !row.is_incoming)
        .expect("outgoing row");
    assert_eq!(outgoing.amount, -5.0);
    assert_eq!(outgoing.sender_address, tracked);
    assert_eq!(outgoing.receiver_address, address_for(&OTHER_HASH));
}

#[tokio::test]
async fn reorg_rolls_back_to_replacement_chain() {
    let h = harness();
    let tracked = address_for(&TRACKED_HASH);
    h.store.get_or_create_address(&tracked, 1).await.unwrap();

    let paying = coinbase_paying(doge(2.0), p2pkh_script(&TRACKED_HASH));
    let dead_block = block_with([0xaa; 32], 1_700_000_000, vec![paying]);
    let dead_hash = h.chain.add_block(&dead_block, 100);
    h.indexer
        .connect_block(&dead_block, &dead_hash, 100)
        .await
        .unwrap();

    let details = h.store.address_details(&tracked).await.unwrap().unwrap();
    assert_eq!(details.address.balance, 2.0);

    // The block is reorganized away; its replacement pays nobody we track.
    let parent_hash = crate::doge::hex_reversed(&[0xaa; 32]);
    h.indexer
        .handle_event(&ChainEvent::Undo {
            block_hashes: vec![dead_hash.clone()],
            last_valid_height: 99,
            resume_from_hash: parent_hash.clone(),
        })
        .await
        .unwrap();

    let replacement = block_with([0xaa; 32], 1_700_000_050, vec![coinbase_paying(
        doge(2.0),
        p2pkh_script(&OTHER_HASH),
    )]);
    let replacement_hash = h.chain.add_block(&replacement, 100);
    h.indexer
        .connect_block(&replacement, &replacement_hash, 100)
        .await
        .unwrap();

    let details = h.store.address_details(&tracked).await.unwrap().unwrap();
    assert!(details.transactions.is_empty());
    assert!(details.unspent_outputs.is_empty());
    assert_eq!(details.address.balance, 0.0);
    let cursor = h.store.cursor().await.unwrap().unwrap();
    assert_eq!(cursor.height, 100);
    assert_eq!(cursor.hash, replacement_hash);
}

#[tokio::test]
async fn reconnecting_an_undone_block_restores_the_same_view() {
    let h = harness();
    let tracked = address_for(&TRACKED_HASH);
    h.store.get_or_create_address(&tracked, 1).await.unwrap();

    let paying = coinbase_paying(doge(3.25), p2pkh_script(&TRACKED_HASH));
    let block = block_with([0xaa; 32], 1_700_000_000, vec![paying]);
    let hash = h.chain.add_block(&block, 100);

    h.indexer.connect_block(&block, &hash, 100).await.unwrap();
    let before = h.store.address_details(&tracked).await.unwrap().unwrap();

    h.indexer
        .handle_event(&ChainEvent::Undo {
            block_hashes: vec![hash.clone()],
            last_valid_height: 99,
            resume_from_hash: crate::doge::hex_reversed(&[0xaa; 32]),
        })
        .await
        .unwrap();
    h.indexer.connect_block(&block, &hash, 100).await.unwrap();
    let after = h.store.address_details(&tracked).await.unwrap().unwrap();

    let view = |rows: &[crate::store::TxRecord]| {
        rows.iter()
            .map(|r| {
                let mut r = r.clone();
                r.created_at = 0;
                r
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(view(&before.transactions), view(&after.transactions));
    assert_eq!(
        before
            .unspent_outputs
            .iter()
            .map(|u| (u.tx_id.clone(), u.vout, u.amount.to_bits()))
            .collect::<Vec<_>>(),
        after
            .unspent_outputs
            .iter()
            .map(|u| (u.tx_id.clone(), u.vout, u.amount.to_bits()))
            .collect::<Vec<_>>()
    );
    assert_eq!(before.address.balance, after.address.balance);
}

#[tokio::test]
async fn auxpow_block_advances_cursor_without_rows() {
    let h = harness();
    let tracked = address_for(&TRACKED_HASH);
    h.store.get_or_create_address(&tracked, 1).await.unwrap();

    let mut block = block_with(
        [0xaa; 32],
        1_700_000_000,
        vec![coinbase_paying(0, vec![0x6a])],
    );
    block.header.version = 0x0062_0004 | crate::doge::types::AUXPOW_VERSION_THRESHOLD;
    let hash = block.header.block_hash_hex();

    h.indexer.connect_block(&block, &hash, 200).await.unwrap();

    let details = h.store.address_details(&tracked).await.unwrap().unwrap();
    assert!(details.transactions.is_empty());
    assert!(details.unspent_outputs.is_empty());
    let cursor = h.store.cursor().await.unwrap().unwrap();
    assert_eq!(cursor.height, 200);
    assert_eq!(cursor.hash, hash);
}

#[tokio::test]
async fn dual_role_transaction_keeps_first_written_direction() {
    let h = harness();
    let tracked = address_for(&TRACKED_HASH);
    h.store.get_or_create_address(&tracked, 1).await.unwrap();

    // The tracked address pays itself change: incoming and outgoing rows
    // collide on the same (address, txid) key.
    let funding = coinbase_paying(doge(10.0), p2pkh_script(&TRACKED_HASH));
    let fund_block = block_with([0xaa; 32], 1_700_000_000, vec![funding.clone()]);
    let fund_hash = h.chain.add_block(&fund_block, 100);
    h.indexer
        .connect_block(&fund_block, &fund_hash, 100)
        .await
        .unwrap();

    let self_spend = spend(
        &funding,
        0,
        vec![
            TxOut {
                value: doge(4.0),
                script_pubkey: p2pkh_script(&OTHER_HASH),
            },
            TxOut {
                value: doge(5.9),
                script_pubkey: p2pkh_script(&TRACKED_HASH),
            },
        ],
    );
    let block = block_with([0xbb; 32], 1_700_000_100, vec![self_spend.clone()]);
    let hash = h.chain.add_block(&block, 101);
    h.indexer.connect_block(&block, &hash, 101).await.unwrap();

    let details = h.store.address_details(&tracked).await.unwrap().unwrap();
    // One row for the self-spend tx, keyed by (address, txid).
    let rows: Vec<_> = details
        .transactions
        .iter()
        .filter(|row| row.tx_id == self_spend.txid())
        .collect();
    assert_eq!(rows.len(), 1);
    // Outputs are processed first, so the surviving direction is incoming.
    assert!(rows[0].is_incoming);
    assert_eq!(rows[0].amount, 5.9);
    // The old output is spent, the change output is the only UTXO left.
    assert_eq!(details.unspent_outputs.len(), 1);
    assert_eq!(details.unspent_outputs[0].amount, 5.9);
    assert_eq!(details.address.balance, 5.9);
}
