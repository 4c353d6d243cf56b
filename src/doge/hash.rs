use sha2::{Digest, Sha256};

pub type Hash256 = [u8; 32];

pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Hex-encode a hash in RPC display order (reversed byte order).
///
/// Hashes travel little-endian on the wire but every RPC call and log line
/// uses the big-endian rendering, so this is the only spelling the rest of
/// the system ever sees.
pub fn hex_reversed(hash: &Hash256) -> String {
    let mut bytes = *hash;
    bytes.reverse();
    hex::encode(bytes)
}

/// Decode an RPC-order hex hash back into wire byte order.
pub fn hash_from_hex_reversed(s: &str) -> Option<Hash256> {
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    out.reverse();
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_known_vector() {
        // sha256d("") per the well-known vector
        let digest = sha256d(b"");
        assert_eq!(
            hex::encode(digest),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn reversed_hex_round_trip() {
        let mut hash = [0u8; 32];
        hash[0] = 0xab;
        hash[31] = 0x01;
        let display = hex_reversed(&hash);
        assert!(display.starts_with("01"));
        assert!(display.ends_with("ab"));
        assert_eq!(hash_from_hex_reversed(&display), Some(hash));
    }
}
