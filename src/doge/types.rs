//! Block, header and transaction types with consensus serialization.

use crate::doge::encoding::{DecodeError, Decoder, Encoder};
use crate::doge::hash::{hex_reversed, sha256d, Hash256};

/// Header versions with the AuxPoW bit set carry merged-mining data after
/// the parent coinbase transaction.
pub const AUXPOW_VERSION_THRESHOLD: u32 = 0x2000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_u32_le()?,
            prev_block: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.version);
        encoder.write_bytes(&self.prev_block);
        encoder.write_bytes(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode(&mut encoder);
        encoder.into_inner()
    }

    /// Double-SHA-256 of the 80 serialized header bytes, wire order.
    pub fn block_hash(&self) -> Hash256 {
        sha256d(&self.serialize())
    }

    /// Block hash in the RPC display spelling.
    pub fn block_hash_hex(&self) -> String {
        hex_reversed(&self.block_hash())
    }

    pub fn is_auxpow(&self) -> bool {
        self.version >= AUXPOW_VERSION_THRESHOLD
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    /// True for the all-zero outpoint that marks a coinbase input.
    pub fn is_null(&self) -> bool {
        self.hash == [0u8; 32] && self.index == u32::MAX
    }

    /// The spent transaction's id in RPC display order.
    pub fn txid_hex(&self) -> String {
        hex_reversed(&self.hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let hash = decoder.read_hash()?;
        let index = decoder.read_u32_le()?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout: OutPoint { hash, index },
            script_sig,
            sequence,
        })
    }

    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.prevout.hash);
        encoder.write_u32_le(self.prevout.index);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    /// Output value in satoshis.
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            value: decoder.read_u64_le()?,
            script_pubkey: decoder.read_var_bytes()?,
        })
    }

    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_u32_le()?;
        let input_count = decoder.read_varint()?;
        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            inputs.push(TxIn::decode(decoder)?);
        }
        let output_count = decoder.read_varint()?;
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            outputs.push(TxOut::decode(decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode(&mut Decoder::new(bytes))
    }

    pub fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.version);
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.encode(encoder);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode(&mut encoder);
        encoder.into_inner()
    }

    /// Transaction id: double-SHA-256 of the serialized bytes, rendered in
    /// the RPC display order so ids match `getrawtransaction` lookups and
    /// the mempool enumeration.
    pub fn txid(&self) -> String {
        hex_reversed(&sha256d(&self.serialize()))
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Decode a full block. AuxPoW blocks yield only the parent-chain
    /// coinbase; the merged-mining proof that follows is not needed for
    /// address indexing and is left unread.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::decode(&mut decoder)?;

        let tx_count = decoder.read_varint()?;
        if header.is_auxpow() {
            let mut transactions = Vec::new();
            if tx_count > 0 {
                transactions.push(Transaction::decode(&mut decoder)?);
            }
            return Ok(Self {
                header,
                transactions,
            });
        }

        let mut transactions = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            transactions.push(Transaction::decode(&mut decoder)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.header.encode(&mut encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode(&mut encoder);
        }
        encoder.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint {
                    hash: [3u8; 32],
                    index: 1,
                },
                script_sig: vec![0xde, 0xad],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOut {
                value: 500_000_000,
                script_pubkey: vec![0x76, 0xa9],
            }],
            lock_time: 0,
        }
    }

    fn coinbase_tx() -> Transaction {
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
                value: 1_000_000_000_000,
                script_pubkey: vec![0x76, 0xa9],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn transaction_round_trip() {
        let tx = sample_tx();
        let bytes = tx.serialize();
        let decoded = Transaction::decode_bytes(&bytes).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid().len(), 64);
    }

    #[test]
    fn coinbase_detection() {
        assert!(coinbase_tx().is_coinbase());
        assert!(!sample_tx().is_coinbase());
    }

    #[test]
    fn block_round_trip() {
        let header = BlockHeader {
            version: 0x0062_0104,
            prev_block: [1u8; 32],
            merkle_root: [2u8; 32],
            time: 1_700_000_000,
            bits: 0x1e0f_ffff,
            nonce: 42,
        };
        let mut encoder = Encoder::new();
        header.encode(&mut encoder);
        encoder.write_varint(2);
        coinbase_tx().encode(&mut encoder);
        sample_tx().encode(&mut encoder);

        let block = Block::decode_bytes(&encoder.into_inner()).unwrap();
        assert_eq!(block.header, header);
        assert_eq!(block.transactions.len(), 2);
    }

    #[test]
    fn auxpow_block_decodes_coinbase_only() {
        let header = BlockHeader {
            version: 0x0062_0004 | AUXPOW_VERSION_THRESHOLD,
            prev_block: [1u8; 32],
            merkle_root: [2u8; 32],
            time: 1_700_000_000,
            bits: 0x1e0f_ffff,
            nonce: 7,
        };
        assert!(header.is_auxpow());

        let mut encoder = Encoder::new();
        header.encode(&mut encoder);
        encoder.write_varint(3);
        coinbase_tx().encode(&mut encoder);
        // Arbitrary trailing merged-mining bytes that must not be parsed.
        encoder.write_bytes(&[0xaa; 64]);

        let block = Block::decode_bytes(&encoder.into_inner()).unwrap();
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_coinbase());
    }

    #[test]
    fn header_hash_is_stable() {
        let header = BlockHeader {
            version: 1,
            ..Default::default()
        };
        assert_eq!(header.block_hash(), header.block_hash());
        assert_eq!(header.block_hash_hex().len(), 64);
    }

    #[test]
    fn truncated_block_fails() {
        let header = BlockHeader::default();
        let mut encoder = Encoder::new();
        header.encode(&mut encoder);
        encoder.write_varint(1);
        // No transaction bytes follow the count.
        assert!(Block::decode_bytes(&encoder.into_inner()).is_err());
    }
}
