//! The AEAD abstraction the rest of the codebase is generic over: pick
//! AES-256-GCM or ChaCha20-Poly1305 once at startup, then `seal`/`open`
//! without caring which one it is.

use aead::generic_array::GenericArray;
use aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use bytes::BytesMut;
use chacha20poly1305::ChaCha20Poly1305;

use crate::crypto::kdf::KEY_LEN;
use crate::error::Error;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
	Aes256Gcm,
	ChaCha20Poly1305,
}

impl Default for Method {
	fn default() -> Self {
		Method::Aes256Gcm
	}
}

impl std::str::FromStr for Method {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Error> {
		match s {
			"aes-256-gcm" => Ok(Method::Aes256Gcm),
			"chacha20-poly1305" => Ok(Method::ChaCha20Poly1305),
			other => Err(Error::Config(format!("unsupported encryption method: {other}"))),
		}
	}
}

/// One concrete AEAD instance, keyed and ready to seal/open.
pub enum Cipher {
	Aes256Gcm(Aes256Gcm),
	ChaCha20Poly1305(ChaCha20Poly1305),
}

impl Cipher {
	pub fn new(method: Method, key: &[u8; KEY_LEN]) -> Self {
		let key = GenericArray::from_slice(key);
		match method {
			Method::Aes256Gcm => Cipher::Aes256Gcm(Aes256Gcm::new(key)),
			Method::ChaCha20Poly1305 => Cipher::ChaCha20Poly1305(ChaCha20Poly1305::new(key)),
		}
	}

	/// Seal `buf` in place; the AEAD tag is appended (standard construction).
	pub fn seal_in_place(
		&self,
		nonce: &[u8; NONCE_LEN],
		aad: &[u8],
		buf: &mut BytesMut,
	) -> Result<(), Error> {
		let nonce = GenericArray::from_slice(nonce);
		let result = match self {
			Cipher::Aes256Gcm(c) => c.encrypt_in_place(nonce, aad, buf),
			Cipher::ChaCha20Poly1305(c) => c.encrypt_in_place(nonce, aad, buf),
		};
		result.map_err(|_| Error::crypto("seal failed"))
	}

	/// Open `buf` in place; the trailing tag is stripped on success.
	pub fn open_in_place(
		&self,
		nonce: &[u8; NONCE_LEN],
		aad: &[u8],
		buf: &mut BytesMut,
	) -> Result<(), Error> {
		let nonce = GenericArray::from_slice(nonce);
		let result = match self {
			Cipher::Aes256Gcm(c) => c.decrypt_in_place(nonce, aad, buf),
			Cipher::ChaCha20Poly1305(c) => c.decrypt_in_place(nonce, aad, buf),
		};
		result.map_err(|_| Error::crypto("DECRYPT_FAILED"))
	}
}

/// A 12-byte monotonic counter, incremented exactly once per seal/open.
///
/// Both peers derive the *same* key from the session salt, so a record
/// stream and its reverse direction, and the length sub-channel and the
/// payload sub-channel within one direction, must never share a nonce:
/// two ciphertexts sealed under the same (key, nonce) pair is a full
/// break of the AEAD's confidentiality. Byte 8 carries a fixed per-channel
/// tag (see [`Channel`]) so the four logical counters that share one key
/// -- client-length, client-payload, server-length, server-payload --
/// occupy disjoint nonce spaces; bytes 0..8 are the little-endian
/// monotonic count within that channel. Wraparound is a fatal session
/// error, not UB: `next` returns `Err` once the counter would overflow
/// its 64-bit working range (already far beyond any plausible session
/// lifetime).
#[derive(Debug)]
pub struct NonceCounter {
	tag: u8,
	count: u64,
}

/// Which of the four nonce-space channels a counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
	ClientLength,
	ClientPayload,
	ServerLength,
	ServerPayload,
}

impl Channel {
	fn tag(self) -> u8 {
		match self {
			Channel::ClientLength => 0,
			Channel::ClientPayload => 1,
			Channel::ServerLength => 2,
			Channel::ServerPayload => 3,
		}
	}
}

impl NonceCounter {
	pub fn new(channel: Channel) -> Self {
		Self { tag: channel.tag(), count: 0 }
	}

	pub fn next(&mut self) -> Result<[u8; NONCE_LEN], Error> {
		let value = self.count;
		self.count = self
			.count
			.checked_add(1)
			.ok_or_else(|| Error::crypto("nonce counter wrapped"))?;
		let mut nonce = [0u8; NONCE_LEN];
		nonce[..8].copy_from_slice(&value.to_le_bytes());
		nonce[8] = self.tag;
		Ok(nonce)
	}

	pub fn peek(&self) -> u64 {
		self.count
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn roundtrip(method: Method) {
		let key = [0x42u8; KEY_LEN];
		let cipher = Cipher::new(method, &key);
		let mut counter = NonceCounter::new(Channel::ClientPayload);
		let nonce = counter.next().unwrap();

		let mut buf = BytesMut::from(&b"hello, tunnel"[..]);
		cipher.seal_in_place(&nonce, b"", &mut buf).unwrap();
		assert_ne!(&buf[..], b"hello, tunnel");

		cipher.open_in_place(&nonce, b"", &mut buf).unwrap();
		assert_eq!(&buf[..], b"hello, tunnel");
	}

	#[test]
	fn roundtrip_aes256gcm() {
		roundtrip(Method::Aes256Gcm);
	}

	#[test]
	fn roundtrip_chacha20poly1305() {
		roundtrip(Method::ChaCha20Poly1305);
	}

	#[test]
	fn tamper_detected() {
		let key = [0x11u8; KEY_LEN];
		let cipher = Cipher::new(Method::Aes256Gcm, &key);
		let mut counter = NonceCounter::new(Channel::ClientPayload);
		let nonce = counter.next().unwrap();

		let mut buf = BytesMut::from(&b"payload"[..]);
		cipher.seal_in_place(&nonce, b"", &mut buf).unwrap();
		let last = buf.len() - 1;
		buf[last] ^= 0xff;

		assert!(cipher.open_in_place(&nonce, b"", &mut buf).is_err());
	}

	#[test]
	fn wrong_nonce_fails() {
		let key = [0x22u8; KEY_LEN];
		let cipher = Cipher::new(Method::ChaCha20Poly1305, &key);
		let mut counter = NonceCounter::new(Channel::ClientPayload);
		let nonce = counter.next().unwrap();

		let mut buf = BytesMut::from(&b"payload"[..]);
		cipher.seal_in_place(&nonce, b"", &mut buf).unwrap();

		let wrong_nonce = counter.next().unwrap();
		assert!(cipher.open_in_place(&wrong_nonce, b"", &mut buf).is_err());
	}

	#[test]
	fn counter_is_monotonic() {
		let mut counter = NonceCounter::new(Channel::ClientPayload);
		let a = counter.next().unwrap();
		let b = counter.next().unwrap();
		assert_ne!(a, b);
		assert_eq!(counter.peek(), 2);
	}
}
