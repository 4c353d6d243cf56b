//! Peer-to-peer message framing and payload codecs.
//!
//! Framing is the Bitcoin wire format with the Dogecoin mainnet magic:
//! 4-byte magic, 12-byte zero-padded command, 4-byte payload length and the
//! first four bytes of the payload's double-SHA-256.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::doge::{sha256d, BlockHeader, Decoder, Encoder, Hash256, MAINNET_MAGIC};
use crate::spv::SpvError;

/// Hard cap on any single message.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

pub const PROTOCOL_VERSION: i32 = 70015;
pub const USER_AGENT: &str = concat!("/dogeindex:", env!("CARGO_PKG_VERSION"), "/");

pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;

/// Headers arrive in batches of up to this many; a full batch means more
/// are available.
pub const MAX_HEADERS_PER_MESSAGE: usize = 2000;

pub struct RawMessage {
    pub command: String,
    pub payload: Vec<u8>,
}

pub struct MessageReader {
    stream: OwnedReadHalf,
}

impl MessageReader {
    pub fn new(stream: OwnedReadHalf) -> Self {
        Self { stream }
    }

    pub async fn read_message(&mut self) -> Result<RawMessage, SpvError> {
        let mut header = [0u8; 24];
        self.stream.read_exact(&mut header).await?;
        if header[..4] != MAINNET_MAGIC {
            return Err(SpvError::Protocol("invalid message magic"));
        }
        let command = header[4..16]
            .iter()
            .take_while(|byte| **byte != 0)
            .map(|byte| *byte as char)
            .collect::<String>();
        let length =
            u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(SpvError::Protocol("message exceeds size limit"));
        }
        let checksum = [header[20], header[21], header[22], header[23]];
        let mut payload = vec![0u8; length];
        self.stream.read_exact(&mut payload).await?;
        if sha256d(&payload)[..4] != checksum {
            return Err(SpvError::Protocol("invalid payload checksum"));
        }
        Ok(RawMessage { command, payload })
    }
}

pub struct MessageWriter {
    stream: OwnedWriteHalf,
}

impl MessageWriter {
    pub fn new(stream: OwnedWriteHalf) -> Self {
        Self { stream }
    }

    pub async fn send_message(&mut self, command: &str, payload: &[u8]) -> Result<(), SpvError> {
        let mut frame = Vec::with_capacity(24 + payload.len());
        frame.extend_from_slice(&MAINNET_MAGIC);
        let mut name = [0u8; 12];
        name[..command.len()].copy_from_slice(command.as_bytes());
        frame.extend_from_slice(&name);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&sha256d(payload)[..4]);
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub version: i32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
}

fn write_net_address(encoder: &mut Encoder, services: u64) {
    encoder.write_u64_le(services);
    encoder.write_bytes(&[0u8; 16]);
    // Big-endian port per the legacy address encoding; unused, so zero.
    encoder.write_bytes(&[0u8; 2]);
}

pub fn build_version_payload(start_height: i32, nonce: u64, relay: bool) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_u64_le(0); // services: not a full node
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    encoder.write_i64_le(now);
    write_net_address(&mut encoder, 0);
    write_net_address(&mut encoder, 0);
    encoder.write_u64_le(nonce);
    encoder.write_var_str(USER_AGENT);
    encoder.write_i32_le(start_height);
    encoder.write_u8(u8::from(relay));
    encoder.into_inner()
}

pub fn parse_version(payload: &[u8]) -> Result<VersionInfo, SpvError> {
    let mut decoder = Decoder::new(payload);
    let version = decoder.read_i32_le()?;
    let services = decoder.read_u64_le()?;
    let _timestamp = decoder.read_i64_le()?;
    decoder.read_bytes(26)?; // addr_recv
    decoder.read_bytes(26)?; // addr_from
    let _nonce = decoder.read_u64_le()?;
    let user_agent = decoder.read_var_str()?;
    let start_height = decoder.read_i32_le()?;
    Ok(VersionInfo {
        version,
        services,
        user_agent,
        start_height,
    })
}

/// getheaders: protocol version, locator hashes, stop hash (zero = as many
/// as possible). Locator hashes are wire order.
pub fn build_getheaders(locator: &[Hash256], stop: Hash256) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_u32_le(PROTOCOL_VERSION as u32);
    encoder.write_varint(locator.len() as u64);
    for hash in locator {
        encoder.write_bytes(hash);
    }
    encoder.write_bytes(&stop);
    encoder.into_inner()
}

/// headers: each entry is an 80-byte header followed by a varint tx count
/// that is always zero.
pub fn parse_headers(payload: &[u8]) -> Result<Vec<BlockHeader>, SpvError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint()? as usize;
    if count > MAX_HEADERS_PER_MESSAGE {
        return Err(SpvError::Protocol("too many headers in one message"));
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let header = BlockHeader::decode(&mut decoder)?;
        let _tx_count = decoder.read_varint()?;
        headers.push(header);
    }
    Ok(headers)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvItem {
    pub kind: u32,
    pub hash: Hash256,
}

pub fn parse_inv(payload: &[u8]) -> Result<Vec<InvItem>, SpvError> {
    let mut decoder = Decoder::new(payload);
    let count = decoder.read_varint()?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = decoder.read_u32_le()?;
        let hash = decoder.read_hash()?;
        items.push(InvItem { kind, hash });
    }
    Ok(items)
}

pub fn build_getdata(items: &[InvItem]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(items.len() as u64);
    for item in items {
        encoder.write_u32_le(item.kind);
        encoder.write_bytes(&item.hash);
    }
    encoder.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_payload_round_trip() {
        let payload = build_version_payload(123_456, 42, true);
        let info = parse_version(&payload).unwrap();
        assert_eq!(info.version, PROTOCOL_VERSION);
        assert_eq!(info.services, 0);
        assert_eq!(info.user_agent, USER_AGENT);
        assert_eq!(info.start_height, 123_456);
    }

    #[test]
    fn getheaders_layout() {
        let locator = [[7u8; 32]];
        let payload = build_getheaders(&locator, [0u8; 32]);
        // version + count varint + one hash + stop hash
        assert_eq!(payload.len(), 4 + 1 + 32 + 32);
        assert_eq!(&payload[5..37], &[7u8; 32]);
    }

    #[test]
    fn headers_round_trip() {
        let header = BlockHeader {
            version: 3,
            prev_block: [1u8; 32],
            merkle_root: [2u8; 32],
            time: 1_600_000_000,
            bits: 0x1e0f_ffff,
            nonce: 99,
        };
        let mut encoder = Encoder::new();
        encoder.write_varint(2);
        for _ in 0..2 {
            header.encode(&mut encoder);
            encoder.write_varint(0);
        }
        let parsed = parse_headers(&encoder.into_inner()).unwrap();
        assert_eq!(parsed, vec![header, header]);
    }

    #[test]
    fn inv_round_trip() {
        let items = vec![
            InvItem {
                kind: MSG_BLOCK,
                hash: [9u8; 32],
            },
            InvItem {
                kind: MSG_TX,
                hash: [4u8; 32],
            },
        ];
        let payload = build_getdata(&items);
        assert_eq!(parse_inv(&payload).unwrap(), items);
    }
}
