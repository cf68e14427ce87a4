//! Tunnel UDP envelope: `[4-byte nonce][4-byte unix timestamp][AEAD
//! ciphertext]`. The preamble is carried in cleartext -- it is checked
//! structurally (monotonic nonce, freshness window) rather than protected
//! by the AEAD, so it doubles as the nonce material for the seal.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};

use crate::crypto::{Cipher, NONCE_LEN};
use crate::error::Error;

const PREAMBLE_LEN: usize = 8;

/// A datagram whose timestamp is more than this many seconds old is
/// dropped regardless of its nonce.
pub const STALE_WINDOW_SECS: u64 = 300;

pub fn now_unix() -> u32 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before unix epoch")
		.as_secs() as u32
}

/// Seal `plaintext` (the `[Address][payload]` pair) into a complete
/// envelope using the given nonce counter value and current timestamp.
pub fn seal(cipher: &Cipher, nonce: u32, plaintext: &[u8]) -> Result<BytesMut, Error> {
	let timestamp = now_unix();
	let mut buf = BytesMut::with_capacity(PREAMBLE_LEN + plaintext.len() + 16);
	buf.put_u32(nonce);
	buf.put_u32(timestamp);

	let mut body = BytesMut::from(plaintext);
	let aead_nonce = aead_nonce(nonce, timestamp);
	cipher.seal_in_place(&aead_nonce, b"", &mut body)?;
	buf.extend_from_slice(&body);
	Ok(buf)
}

/// A parsed but not-yet-authenticated envelope: the preamble has been
/// structurally validated, but the ciphertext has not been opened.
pub struct Parsed<'a> {
	pub nonce: u32,
	pub timestamp: u32,
	ciphertext: &'a [u8],
}

impl<'a> Parsed<'a> {
	pub fn open(self, cipher: &Cipher) -> Result<BytesMut, Error> {
		let mut body = BytesMut::from(self.ciphertext);
		let aead_nonce = aead_nonce(self.nonce, self.timestamp);
		cipher.open_in_place(&aead_nonce, b"", &mut body)?;
		Ok(body)
	}
}

/// Split a raw datagram into its preamble and ciphertext without opening
/// it. Errors if the datagram is too short to contain a preamble.
pub fn parse(datagram: &[u8]) -> Result<Parsed<'_>, Error> {
	if datagram.len() < PREAMBLE_LEN {
		return Err(Error::protocol("UDP envelope shorter than preamble"));
	}
	let mut hdr = &datagram[..PREAMBLE_LEN];
	let nonce = hdr.get_u32();
	let timestamp = hdr.get_u32();
	Ok(Parsed {
		nonce,
		timestamp,
		ciphertext: &datagram[PREAMBLE_LEN..],
	})
}

/// True if `timestamp` is further than [`STALE_WINDOW_SECS`] in the past
/// relative to `now`. Timestamps in the future are accepted -- small clock
/// skew between peers is tolerated, only staleness is checked.
pub fn is_stale(timestamp: u32, now: u32) -> bool {
	now.saturating_sub(timestamp) as u64 > STALE_WINDOW_SECS
}

fn aead_nonce(nonce: u32, timestamp: u32) -> [u8; NONCE_LEN] {
	let mut out = [0u8; NONCE_LEN];
	out[0..4].copy_from_slice(&nonce.to_be_bytes());
	out[4..8].copy_from_slice(&timestamp.to_be_bytes());
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::{derive_key, Method};

	fn cipher() -> Cipher {
		let key = derive_key("hunter2", &[5u8; crate::crypto::SALT_LEN]).unwrap();
		Cipher::new(Method::Aes256Gcm, &key)
	}

	#[test]
	fn roundtrip() {
		let c = cipher();
		let envelope = seal(&c, 1, b"payload").unwrap();
		let parsed = parse(&envelope).unwrap();
		assert_eq!(parsed.nonce, 1);
		let opened = parsed.open(&c).unwrap();
		assert_eq!(&opened[..], b"payload");
	}

	#[test]
	fn tamper_detected() {
		let c = cipher();
		let mut envelope = seal(&c, 1, b"payload").unwrap();
		let last = envelope.len() - 1;
		envelope[last] ^= 0xff;
		let parsed = parse(&envelope).unwrap();
		assert!(parsed.open(&c).is_err());
	}

	#[test]
	fn rejects_short_datagram() {
		assert!(parse(&[0u8; 4]).is_err());
	}

	#[test]
	fn staleness_window() {
		assert!(!is_stale(1000, 1000));
		assert!(!is_stale(1000, 1000 + STALE_WINDOW_SECS as u32));
		assert!(is_stale(1000, 1000 + STALE_WINDOW_SECS as u32 + 1));
	}

	#[test]
	fn future_timestamp_not_stale() {
		assert!(!is_stale(2000, 1000));
	}
}
