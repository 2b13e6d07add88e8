//! Content digest for transferred files.
//!
//! SHA-256 over the complete unencrypted byte sequence, lowercase hex on the
//! wire. Uploaders declare it and downloaders recompute and compare it.

use crate::error::{Result, SyncError};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Digest of a complete byte sequence
    pub fn compute(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    /// Parse a declared checksum from its wire form
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| SyncError::Protocol(format!("bad checksum '{}': {}", s, e)))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SyncError::Protocol(format!("checksum '{}' is not 32 bytes", s)))?;
        Ok(Self(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Recompute over `data` and compare against `self`
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let actual = Self::compute(data);
        if bool::from(self.0.ct_eq(&actual.0)) {
            Ok(())
        } else {
            Err(SyncError::ChecksumMismatch {
                expected: self.to_hex(),
                actual: actual.to_hex(),
            })
        }
    }
}

impl std::fmt::Debug for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        // sha256("abc")
        let sum = Checksum::compute(b"abc");
        assert_eq!(
            sum.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hex_parse_and_verify() {
        let data = vec![0x5Au8; 40_000];
        let sum = Checksum::compute(&data);
        let parsed = Checksum::from_hex(&sum.to_hex().to_uppercase()).unwrap();
        assert_eq!(parsed, sum);
        assert!(parsed.verify(&data).is_ok());
    }

    #[test]
    fn test_single_byte_change_detected() {
        let mut data = vec![1u8; 1000];
        let sum = Checksum::compute(&data);
        data[999] ^= 0x01;
        match sum.verify(&data) {
            Err(SyncError::ChecksumMismatch { expected, actual }) => {
                assert_eq!(expected, sum.to_hex());
                assert_ne!(expected, actual);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_hex_rejected() {
        assert!(Checksum::from_hex("zz").is_err());
        assert!(Checksum::from_hex("abcd").is_err());
    }
}
