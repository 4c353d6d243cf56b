//! Walker scenarios: extension, burst catch-up and reorg undo ordering.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tests::{block_with, coinbase_paying, doge, p2pkh_script, FakeChain};
use crate::walker::{BlockWalker, ChainEvent};

async fn next_event(rx: &mut mpsc::Receiver<ChainEvent>) -> ChainEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for walker event")
        .expect("walker stream ended")
}

fn chain_of(heights: std::ops::RangeInclusive<i64>, chain: &FakeChain) -> Vec<String> {
    let mut prev = [0u8; 32];
    let mut hashes = Vec::new();
    for height in heights {
        let block = block_with(
            prev,
            1_700_000_000 + height as u32,
            vec![coinbase_paying(doge(1.0), p2pkh_script(&[height as u8; 20]))],
        );
        prev = block.header.block_hash();
        hashes.push(chain.add_block(&block, height));
    }
    hashes
}

#[tokio::test]
async fn walker_emits_connects_in_height_order() {
    let chain = Arc::new(FakeChain::new());
    let hashes = chain_of(0..=3, &chain);

    let (walker, mut events) = BlockWalker::new(chain.clone(), hashes[0].clone())
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    let (tip_tx, tip_rx) = mpsc::channel(4);
    let handle = tokio::spawn(walker.run(tip_rx, cancel.clone()));

    // Startup catch-up covers heights 1..=3 without any tip notification.
    for (expected_height, expected_hash) in (1..=3).zip(&hashes[1..]) {
        match next_event(&mut events).await {
            ChainEvent::Connect { hash, height, .. } => {
                assert_eq!(height, expected_height);
                assert_eq!(&hash, expected_hash);
            }
            other => panic!("expected connect, got {other:?}"),
        }
    }

    // A new block arrives with a notification.
    let prev_wire = crate::doge::hash_from_hex_reversed(&hashes[3]).unwrap();
    let block4 = block_with(
        prev_wire,
        1_700_000_004,
        vec![coinbase_paying(doge(1.0), p2pkh_script(&[4; 20]))],
    );
    let tip = chain.add_block(&block4, 4);
    tip_tx.send(tip.clone()).await.unwrap();
    match next_event(&mut events).await {
        ChainEvent::Connect { hash, height, .. } => {
            assert_eq!(height, 4);
            assert_eq!(hash, tip);
        }
        other => panic!("expected connect, got {other:?}"),
    }

    cancel.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn walker_undoes_reorganized_blocks_newest_first() {
    let chain = Arc::new(FakeChain::new());
    let hashes = chain_of(0..=3, &chain);

    let (walker, mut events) = BlockWalker::new(chain.clone(), hashes[0].clone())
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    let (tip_tx, tip_rx) = mpsc::channel(4);
    let handle = tokio::spawn(walker.run(tip_rx, cancel.clone()));

    for _ in 1..=3 {
        next_event(&mut events).await;
    }

    // Replace heights 2..=3 with a competing branch extending height 1.
    let parent_wire = crate::doge::hash_from_hex_reversed(&hashes[1]).unwrap();
    let branch2 = block_with(
        parent_wire,
        1_800_000_000,
        vec![coinbase_paying(doge(2.0), p2pkh_script(&[0x77; 20]))],
    );
    let branch2_hash = chain.add_block(&branch2, 2);
    let branch3 = block_with(
        branch2.header.block_hash(),
        1_800_000_010,
        vec![coinbase_paying(doge(2.0), p2pkh_script(&[0x78; 20]))],
    );
    let branch3_hash = chain.add_block(&branch3, 3);

    tip_tx.send(branch3_hash.clone()).await.unwrap();

    match next_event(&mut events).await {
        ChainEvent::Undo {
            block_hashes,
            last_valid_height,
            resume_from_hash,
        } => {
            // Newest first, down to (but excluding) the fork point.
            assert_eq!(block_hashes, vec![hashes[3].clone(), hashes[2].clone()]);
            assert_eq!(last_valid_height, 1);
            assert_eq!(resume_from_hash, hashes[1]);
        }
        other => panic!("expected undo, got {other:?}"),
    }
    match next_event(&mut events).await {
        ChainEvent::Connect { hash, height, .. } => {
            assert_eq!(height, 2);
            assert_eq!(hash, branch2_hash);
        }
        other => panic!("expected connect, got {other:?}"),
    }
    match next_event(&mut events).await {
        ChainEvent::Connect { hash, height, .. } => {
            assert_eq!(height, 3);
            assert_eq!(hash, branch3_hash);
        }
        other => panic!("expected connect, got {other:?}"),
    }

    cancel.cancel();
    let _ = handle.await;
}
