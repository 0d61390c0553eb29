//! Hash utilities
//!
//! - SHA-256 for transport event ids and audit chain links
//! - BLAKE3 for human-readable key fingerprints

use sha2::{Digest, Sha256};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Fingerprint of a public key: BLAKE3, truncated to 20 bytes, hex in
/// groups of 4 for display.
///
/// Example: "a1b2 c3d4 e5f6 7890 abcd ef01 2345 6789 0abc def0"
pub fn fingerprint(public: &[u8]) -> String {
    let hash = blake3::hash(public);
    let hex = hex::encode(&hash.as_bytes()[..20]);
    hex.as_bytes()
        .chunks(4)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn fingerprint_has_ten_groups() {
        let fp = fingerprint(&[1u8; 32]);
        assert_eq!(fp.split(' ').count(), 10);
    }
}
