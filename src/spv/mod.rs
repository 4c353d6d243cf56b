//! SPV peer session: wire-level handshake, header chain sync with
//! proof-of-work validation and targeted block fetches over the Dogecoin
//! peer-to-peer protocol.

pub mod message;
pub mod peer;

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::doge::{hex_reversed, BlockHeader, Hash256};

pub use peer::{SpvConfig, SpvSession};

#[derive(Debug, Error)]
pub enum SpvError {
    #[error("peer io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("decode error: {0}")]
    Decode(#[from] crate::doge::DecodeError),
    #[error("header validation failed: {0}")]
    InvalidHeader(&'static str),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("peer disconnected")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    HeaderSyncing,
    BlockSyncing,
    Idle,
}

/// Expand a compact difficulty encoding into a 256-bit big-endian target.
pub fn compact_to_target(bits: u32) -> [u8; 32] {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    let bytes = mantissa.to_be_bytes();
    let mut target = [0u8; 32];
    if exponent <= 3 {
        let shifted = mantissa >> (8 * (3 - exponent));
        target[29..].copy_from_slice(&shifted.to_be_bytes()[1..]);
    } else if exponent <= 32 {
        let start = 32 - exponent;
        for (i, byte) in bytes[1..].iter().enumerate() {
            if start + i < 32 {
                target[start + i] = *byte;
            }
        }
    } else {
        // Degenerate exponent: everything passes rather than nothing.
        target = [0xff; 32];
    }
    target
}

/// True when the header's double-SHA-256 meets its own compact target.
pub fn meets_target(header: &BlockHeader) -> bool {
    let mut hash = header.block_hash();
    hash.reverse();
    hash <= compact_to_target(header.bits)
}

/// A validated header pinned to a chain height.
#[derive(Debug, Clone)]
pub struct SpvHeader {
    pub header: BlockHeader,
    pub hash_hex: String,
    pub height: i64,
}

/// The synced header chain, height-keyed, answering the lookups the
/// original left unimplemented on the wire. Replaced headers stay
/// reachable by hash so confirmation queries can report them off-chain.
#[derive(Debug, Default)]
pub struct HeaderChain {
    by_height: BTreeMap<i64, SpvHeader>,
    all: HashMap<String, SpvHeader>,
}

impl HeaderChain {
    pub fn tip(&self) -> Option<&SpvHeader> {
        self.by_height.values().next_back()
    }

    pub fn height(&self) -> Option<i64> {
        self.by_height.keys().next_back().copied()
    }

    pub fn by_height(&self, height: i64) -> Option<&SpvHeader> {
        self.by_height.get(&height)
    }

    /// Any header ever validated, on the active chain or not.
    pub fn by_hash(&self, hash_hex: &str) -> Option<&SpvHeader> {
        self.all.get(hash_hex)
    }

    pub fn contains(&self, hash_hex: &str) -> bool {
        self.all.contains_key(hash_hex)
    }

    /// True when the hash is the active entry at its height.
    pub fn is_active(&self, hash_hex: &str) -> bool {
        self.all
            .get(hash_hex)
            .and_then(|entry| self.by_height.get(&entry.height))
            .map(|active| active.hash_hex == hash_hex)
            .unwrap_or(false)
    }

    pub fn insert(&mut self, header: BlockHeader, height: i64) {
        let hash_hex = header.block_hash_hex();
        let entry = SpvHeader {
            header,
            hash_hex: hash_hex.clone(),
            height,
        };
        self.by_height.insert(height, entry.clone());
        self.all.insert(hash_hex, entry);
    }

    /// Wire-order hash of the tip, for getheaders locators.
    pub fn tip_locator(&self) -> Option<Hash256> {
        self.tip().map(|entry| entry.header.block_hash())
    }
}

/// Validate one header against the chain tip: version, future-time bound,
/// previous-hash linkage and proof of work. `expected_prev` is the hash the
/// header must link to (display order).
pub fn validate_header(
    header: &BlockHeader,
    expected_prev: &str,
    now: i64,
) -> Result<(), SpvError> {
    if header.version < 1 {
        return Err(SpvError::InvalidHeader("version below 1"));
    }
    if i64::from(header.time) > now + 2 * 60 * 60 {
        return Err(SpvError::InvalidHeader("timestamp too far in the future"));
    }
    if hex_reversed(&header.prev_block) != expected_prev {
        return Err(SpvError::InvalidHeader("previous hash not on chain"));
    }
    if !meets_target(header) {
        return Err(SpvError::InvalidHeader("hash does not meet target"));
    }
    Ok(())
}
