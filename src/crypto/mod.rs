//! Key derivation and AEAD sealing/opening.

pub mod cipher;
pub mod kdf;

pub use cipher::{Channel, Cipher, Method, NonceCounter, NONCE_LEN, TAG_LEN};
pub use kdf::{derive_key, random_key, random_salt, KEY_LEN, SALT_LEN};
