//! Output script classification and base58check address encoding.

use crate::doge::hash::sha256d;

/// Base58check version byte for Dogecoin mainnet P2PKH addresses ("D…").
pub const P2PKH_VERSION: u8 = 0x1e;
/// Base58check version byte for Dogecoin mainnet P2SH addresses.
pub const P2SH_VERSION: u8 = 0x16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    P2pkh,
    P2sh,
}

impl ScriptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptKind::P2pkh => "p2pkh",
            ScriptKind::P2sh => "p2sh",
        }
    }
}

/// Classify a scriptPubKey, returning the script kind and the mainnet
/// address it pays to. Anything that is not a canonical P2PKH or P2SH
/// template is unclassified and ignored by the indexer.
pub fn classify_script(script: &[u8]) -> Option<(ScriptKind, String)> {
    // P2PKH: OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
    if script.len() == 25
        && script[0] == 0x76
        && script[1] == 0xa9
        && script[2] == 0x14
        && script[23] == 0x88
        && script[24] == 0xac
    {
        return Some((
            ScriptKind::P2pkh,
            base58check_encode(P2PKH_VERSION, &script[3..23]),
        ));
    }

    // P2SH: OP_HASH160 <20> OP_EQUAL
    if script.len() == 23
        && script[0] == 0xa9
        && script[1] == 0x14
        && script[22] == 0x87
    {
        return Some((
            ScriptKind::P2sh,
            base58check_encode(P2SH_VERSION, &script[2..22]),
        ));
    }

    None
}

/// Version byte + payload + first four bytes of sha256d, base58 encoded.
pub fn base58check_encode(version: u8, payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(1 + payload.len() + 4);
    data.push(version);
    data.extend_from_slice(payload);
    let checksum = sha256d(&data);
    data.extend_from_slice(&checksum[..4]);
    bs58::encode(data).into_string()
}

/// Decode a base58check string, verifying the checksum and returning the
/// version byte and payload.
pub fn base58check_decode(input: &str) -> Option<(u8, Vec<u8>)> {
    let data = bs58::decode(input).into_vec().ok()?;
    if data.len() < 5 {
        return None;
    }
    let (body, checksum) = data.split_at(data.len() - 4);
    if sha256d(body)[..4] != *checksum {
        return None;
    }
    Some((body[0], body[1..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2pkh_script(hash: &[u8; 20]) -> Vec<u8> {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(hash);
        script.extend_from_slice(&[0x88, 0xac]);
        script
    }

    #[test]
    fn classifies_p2pkh_to_d_address() {
        let script = p2pkh_script(&[0u8; 20]);
        let (kind, address) = classify_script(&script).unwrap();
        assert_eq!(kind, ScriptKind::P2pkh);
        assert!(address.starts_with('D'), "got {address}");
        let (version, payload) = base58check_decode(&address).unwrap();
        assert_eq!(version, P2PKH_VERSION);
        assert_eq!(payload, vec![0u8; 20]);
    }

    #[test]
    fn classifies_p2sh() {
        let mut script = vec![0xa9, 0x14];
        script.extend_from_slice(&[7u8; 20]);
        script.push(0x87);
        let (kind, address) = classify_script(&script).unwrap();
        assert_eq!(kind, ScriptKind::P2sh);
        let (version, _) = base58check_decode(&address).unwrap();
        assert_eq!(version, P2SH_VERSION);
    }

    #[test]
    fn rejects_non_standard_scripts() {
        assert!(classify_script(&[]).is_none());
        assert!(classify_script(&[0x6a, 0x01, 0xff]).is_none()); // OP_RETURN
        // Right opcodes, wrong length
        assert!(classify_script(&[0x76, 0xa9, 0x14, 0x00]).is_none());
    }

    #[test]
    fn base58check_rejects_bad_checksum() {
        let mut address = base58check_encode(P2PKH_VERSION, &[1u8; 20]);
        address.pop();
        address.push('1');
        assert!(base58check_decode(&address).is_none());
    }
}
