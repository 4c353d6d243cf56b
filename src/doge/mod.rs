//! Dogecoin wire codec: block and transaction decoding, script
//! classification, base58check addresses and hash helpers.

pub mod encoding;
pub mod hash;
pub mod script;
pub mod types;

pub use encoding::{DecodeError, Decoder, Encoder};
pub use hash::{hash_from_hex_reversed, hex_reversed, sha256d, Hash256};
pub use script::{classify_script, ScriptKind};
pub use types::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};

/// Dogecoin mainnet genesis block hash (RPC display order).
pub const MAINNET_GENESIS_HASH: &str =
    "1a91e3dace36e2be3bf030a65679fe821aa1d6ef92e7c9902eb318182c355691";

/// Dogecoin mainnet peer-to-peer port.
pub const MAINNET_P2P_PORT: u16 = 22556;

/// Message start bytes for Dogecoin mainnet.
pub const MAINNET_MAGIC: [u8; 4] = [0xc0, 0xc0, 0xc0, 0xc0];

/// Satoshis per DOGE.
pub const COIN: u64 = 100_000_000;

/// Convert a satoshi amount to DOGE.
pub fn to_doge(satoshis: u64) -> f64 {
    satoshis as f64 / COIN as f64
}
