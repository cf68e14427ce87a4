//! Tunnel TCP wire framing: a 16-byte salt prefix followed by a stream of
//! length-prefixed AEAD records. Both the length and the payload are sealed
//! independently so an on-path attacker cannot learn or tamper with record
//! boundaries without failing authentication.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{Channel, Cipher, NonceCounter, SALT_LEN, TAG_LEN};
use crate::error::Error;

/// Maximum plaintext payload carried by one record.
pub const MAX_PAYLOAD: usize = 16 * 1024;

/// Send-side half of the framed stream: one cipher, two nonce channels (one
/// for sealed lengths, one for sealed payloads) so the two sub-streams never
/// share a nonce space with each other or with the peer's own channels.
pub struct Writer {
	cipher: std::sync::Arc<Cipher>,
	length_nonce: NonceCounter,
	payload_nonce: NonceCounter,
}

impl Writer {
	pub fn new(cipher: std::sync::Arc<Cipher>, length: Channel, payload: Channel) -> Self {
		Self {
			cipher,
			length_nonce: NonceCounter::new(length),
			payload_nonce: NonceCounter::new(payload),
		}
	}

	/// Seal and write one record. `plaintext` must be at most [`MAX_PAYLOAD`]
	/// bytes.
	pub async fn write_record<S: AsyncWrite + Unpin>(
		&mut self,
		io: &mut S,
		plaintext: &[u8],
	) -> Result<(), Error> {
		if plaintext.len() > MAX_PAYLOAD {
			return Err(Error::protocol("record exceeds maximum payload size"));
		}

		let mut len_buf = BytesMut::with_capacity(2 + TAG_LEN);
		len_buf.put_u16(plaintext.len() as u16);
		let len_nonce = self.length_nonce.next()?;
		self.cipher.seal_in_place(&len_nonce, b"", &mut len_buf)?;

		let mut payload_buf = BytesMut::from(plaintext);
		let payload_nonce = self.payload_nonce.next()?;
		self.cipher
			.seal_in_place(&payload_nonce, b"", &mut payload_buf)?;

		io.write_all(&len_buf).await?;
		io.write_all(&payload_buf).await?;
		Ok(())
	}
}

/// Receive-side half of the framed stream.
pub struct Reader {
	cipher: std::sync::Arc<Cipher>,
	length_nonce: NonceCounter,
	payload_nonce: NonceCounter,
}

impl Reader {
	pub fn new(cipher: std::sync::Arc<Cipher>, length: Channel, payload: Channel) -> Self {
		Self {
			cipher,
			length_nonce: NonceCounter::new(length),
			payload_nonce: NonceCounter::new(payload),
		}
	}

	/// Read and open one record. Returns `Ok(None)` on clean EOF before any
	/// bytes of a new record have been read.
	pub async fn read_record<S: AsyncRead + Unpin>(
		&mut self,
		io: &mut S,
	) -> Result<Option<BytesMut>, Error> {
		let mut len_buf = BytesMut::zeroed(2 + TAG_LEN);
		if !read_exact_or_eof(io, &mut len_buf).await? {
			return Ok(None);
		}

		let len_nonce = self.length_nonce.next()?;
		self.cipher.open_in_place(&len_nonce, b"", &mut len_buf)?;
		let plaintext_len = (&len_buf[..]).get_u16() as usize;
		if plaintext_len > MAX_PAYLOAD {
			return Err(Error::protocol("record length exceeds maximum payload size"));
		}

		let mut payload_buf = BytesMut::zeroed(plaintext_len + TAG_LEN);
		io.read_exact(&mut payload_buf).await?;
		let payload_nonce = self.payload_nonce.next()?;
		self.cipher
			.open_in_place(&payload_nonce, b"", &mut payload_buf)?;

		Ok(Some(payload_buf))
	}
}

/// Like `AsyncReadExt::read_exact`, but returns `Ok(false)` instead of an
/// `UnexpectedEof` error when zero bytes were read before EOF.
async fn read_exact_or_eof<S: AsyncRead + Unpin>(io: &mut S, buf: &mut [u8]) -> Result<bool, Error> {
	let mut filled = 0;
	while filled < buf.len() {
		let n = io.read(&mut buf[filled..]).await?;
		if n == 0 {
			if filled == 0 {
				return Ok(false);
			}
			return Err(Error::Io(std::io::Error::new(
				std::io::ErrorKind::UnexpectedEof,
				"truncated record",
			)));
		}
		filled += n;
	}
	Ok(true)
}

/// Write the 16-byte random salt that opens each direction of a tunnel TCP
/// connection.
pub async fn write_salt<S: AsyncWrite + Unpin>(io: &mut S, salt: &[u8; SALT_LEN]) -> Result<(), Error> {
	io.write_all(salt).await?;
	Ok(())
}

/// Read the 16-byte salt prefix the peer sends at the start of its
/// direction.
pub async fn read_salt<S: AsyncRead + Unpin>(io: &mut S) -> Result<[u8; SALT_LEN], Error> {
	let mut salt = [0u8; SALT_LEN];
	io.read_exact(&mut salt).await?;
	Ok(salt)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::{derive_key, Method};
	use std::sync::Arc;

	fn cipher() -> Arc<Cipher> {
		let key = derive_key("correct horse", &[3u8; crate::crypto::SALT_LEN]).unwrap();
		Arc::new(Cipher::new(Method::Aes256Gcm, &key))
	}

	#[tokio::test]
	async fn roundtrip_single_record() {
		let (mut client, mut server) = tokio::io::duplex(1024);
		let c = cipher();
		let mut writer = Writer::new(c.clone(), Channel::ClientLength, Channel::ClientPayload);
		let mut reader = Reader::new(c, Channel::ClientLength, Channel::ClientPayload);

		writer.write_record(&mut client, b"hello").await.unwrap();
		drop(client);
		let record = reader.read_record(&mut server).await.unwrap().unwrap();
		assert_eq!(&record[..], b"hello");
	}

	#[tokio::test]
	async fn roundtrip_multiple_records_preserve_order() {
		let (mut client, mut server) = tokio::io::duplex(4096);
		let c = cipher();
		let mut writer = Writer::new(c.clone(), Channel::ServerLength, Channel::ServerPayload);
		let mut reader = Reader::new(c, Channel::ServerLength, Channel::ServerPayload);

		for chunk in [&b"one"[..], &b"two"[..], &b"three"[..]] {
			writer.write_record(&mut client, chunk).await.unwrap();
		}
		drop(client);

		for expected in [&b"one"[..], &b"two"[..], &b"three"[..]] {
			let record = reader.read_record(&mut server).await.unwrap().unwrap();
			assert_eq!(&record[..], expected);
		}
	}

	#[tokio::test]
	async fn eof_before_any_record_returns_none() {
		let (client, mut server) = tokio::io::duplex(64);
		drop(client);
		let c = cipher();
		let mut reader = Reader::new(c, Channel::ClientLength, Channel::ClientPayload);
		assert!(reader.read_record(&mut server).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn tampered_length_field_fails_to_open() {
		let (mut client, mut server) = tokio::io::duplex(1024);
		let c = cipher();
		let mut writer = Writer::new(c.clone(), Channel::ClientLength, Channel::ClientPayload);
		writer.write_record(&mut client, b"hello").await.unwrap();
		drop(client);

		let mut buf = Vec::new();
		tokio::io::AsyncReadExt::read_to_end(&mut server, &mut buf).await.unwrap();
		buf[0] ^= 0xff;

		let (mut rewritten, mut replay_server) = tokio::io::duplex(1024);
		rewritten.write_all(&buf).await.unwrap();
		drop(rewritten);
		let mut reader = Reader::new(c, Channel::ClientLength, Channel::ClientPayload);
		assert!(reader.read_record(&mut replay_server).await.is_err());
	}

	#[tokio::test]
	async fn oversized_plaintext_rejected() {
		let (mut client, _server) = tokio::io::duplex(1024);
		let c = cipher();
		let mut writer = Writer::new(c, Channel::ClientLength, Channel::ClientPayload);
		let big = vec![0u8; MAX_PAYLOAD + 1];
		assert!(writer.write_record(&mut client, &big).await.is_err());
	}
}
