pub mod checksum;
pub mod codec;

pub use checksum::Checksum;
pub use codec::{decrypt_bytes, decrypt_text, encrypt_bytes, encrypt_text, SymmetricKey};
