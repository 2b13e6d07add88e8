//! Message codec: symmetric encryption of chat payloads.
//!
//! ChaCha20-Poly1305 with a random 96-bit nonce per message.
//! Wire format: base64([12-byte nonce][ciphertext with 16-byte auth tag]).
//!
//! Pure and stateless. Keys come from the key directory as opaque key
//! material and are stretched to 32 bytes with BLAKE3 `derive_key`.

use crate::error::{Result, SyncError};
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

// Domain separation for key material -> cipher key
const DOMAIN_MESSAGE_KEY: &str = "ratchat 2024 message key v0";

/// 32-byte symmetric key for one sender
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive a cipher key from the key material published in the directory
    pub fn from_passphrase(material: &str) -> Self {
        Self(blake3::derive_key(DOMAIN_MESSAGE_KEY, material.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short public fingerprint for logs (never the key itself)
    pub fn fingerprint(&self) -> String {
        hex::encode(&blake3::hash(&self.0).as_bytes()[..4])
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey({})", self.fingerprint())
    }
}

/// Seal raw bytes: [nonce][ciphertext+tag]
pub fn encrypt_bytes(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|e| SyncError::Encryption(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce: Nonce = nonce_bytes.into();

    let ciphertext = cipher
        .encrypt(&nonce, data)
        .map_err(|e| SyncError::Encryption(e.to_string()))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Open bytes produced by [`encrypt_bytes`]
pub fn decrypt_bytes(key: &SymmetricKey, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(SyncError::Decryption);
    }

    let cipher =
        ChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| SyncError::Decryption)?;

    let nonce_bytes: [u8; NONCE_SIZE] = sealed[..NONCE_SIZE]
        .try_into()
        .map_err(|_| SyncError::Decryption)?;
    let nonce: Nonce = nonce_bytes.into();

    cipher
        .decrypt(&nonce, &sealed[NONCE_SIZE..])
        .map_err(|_| SyncError::Decryption)
}

/// Encrypt a chat message body into its wire string
pub fn encrypt_text(key: &SymmetricKey, plaintext: &str) -> Result<String> {
    Ok(STANDARD.encode(encrypt_bytes(key, plaintext.as_bytes())?))
}

/// Decrypt a wire string back into the message body
///
/// Anything that is not valid base64, fails authentication, or is not UTF-8
/// reports `Decryption`.
pub fn decrypt_text(key: &SymmetricKey, ciphertext: &str) -> Result<String> {
    let sealed = STANDARD
        .decode(ciphertext.trim())
        .map_err(|_| SyncError::Decryption)?;
    let plain = decrypt_bytes(key, &sealed)?;
    String::from_utf8(plain).map_err(|_| SyncError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_roundtrip() {
        let key = SymmetricKey::from_passphrase("hunter2");
        let wire = encrypt_text(&key, "hello **world**").unwrap();
        assert_ne!(wire, "hello **world**");
        assert_eq!(decrypt_text(&key, &wire).unwrap(), "hello **world**");
    }

    #[test]
    fn test_nonce_is_fresh_per_message() {
        let key = SymmetricKey::from_passphrase("k");
        let a = encrypt_text(&key, "same").unwrap();
        let b = encrypt_text(&key, "same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let wire = encrypt_text(&SymmetricKey::from_passphrase("a"), "secret").unwrap();
        let result = decrypt_text(&SymmetricKey::from_passphrase("b"), &wire);
        assert!(matches!(result, Err(SyncError::Decryption)));
    }

    #[test]
    fn test_garbage_ciphertext_fails() {
        let key = SymmetricKey::from_passphrase("a");
        assert!(decrypt_text(&key, "not base64 at all!").is_err());
        assert!(decrypt_text(&key, "AAAA").is_err()); // too short
        assert!(decrypt_bytes(&key, &[0u8; 40]).is_err()); // bad tag
    }

    #[test]
    fn test_passphrase_derivation_is_stable() {
        let a = SymmetricKey::from_passphrase("material");
        let b = SymmetricKey::from_passphrase("material");
        assert_eq!(a, b);
        assert_ne!(a, SymmetricKey::from_passphrase("other"));
        assert_eq!(a.fingerprint().len(), 8);
        assert!(!format!("{:?}", a).contains(&hex::encode(a.as_bytes())));
    }
}
