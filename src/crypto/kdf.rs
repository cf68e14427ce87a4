//! Key derivation: HKDF-SHA256 over the shared password, salted per session.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::Error;

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;

const INFO: &[u8] = b"nyxsocks-key-derivation";

/// Expand `password` with `salt` into a 32-byte AEAD key.
pub fn derive_key(password: &str, salt: &[u8; SALT_LEN]) -> Result<[u8; KEY_LEN], Error> {
	let hk = Hkdf::<Sha256>::new(Some(salt), password.as_bytes());
	let mut key = [0u8; KEY_LEN];
	hk.expand(INFO, &mut key)
		.map_err(|_| Error::crypto("HKDF output length invalid"))?;
	Ok(key)
}

/// Generate a fresh random salt for a new session.
pub fn random_salt() -> [u8; SALT_LEN] {
	use aead::OsRng;
	use aead::rand_core::RngCore;
	let mut salt = [0u8; SALT_LEN];
	OsRng.fill_bytes(&mut salt);
	salt
}

/// Generate a fresh random 32-byte key, bypassing the password path --
/// used only for ephemeral key rotation, never for the initial handshake
/// key.
pub fn random_key() -> [u8; KEY_LEN] {
	use aead::OsRng;
	use aead::rand_core::RngCore;
	let mut key = [0u8; KEY_LEN];
	OsRng.fill_bytes(&mut key);
	key
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn deterministic_for_same_inputs() {
		let salt = [7u8; SALT_LEN];
		let a = derive_key("hunter2", &salt).unwrap();
		let b = derive_key("hunter2", &salt).unwrap();
		assert_eq!(a, b);
	}

	#[test]
	fn differs_by_salt() {
		let a = derive_key("hunter2", &[1u8; SALT_LEN]).unwrap();
		let b = derive_key("hunter2", &[2u8; SALT_LEN]).unwrap();
		assert_ne!(a, b);
	}

	#[test]
	fn differs_by_password() {
		let salt = [9u8; SALT_LEN];
		let a = derive_key("hunter2", &salt).unwrap();
		let b = derive_key("hunter3", &salt).unwrap();
		assert_ne!(a, b);
	}
}
