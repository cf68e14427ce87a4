//! Bidirectional TCP relay: one loop shuttles plaintext bytes from the
//! local peer into AEAD-sealed records on the tunnel, the other does the
//! inverse. Both run concurrently; an error in either cancels the pair,
//! but a clean EOF in one only half-closes its destination and lets the
//! other direction drain to completion.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout as with_timeout;

use crate::error::Error;
use crate::framing::{MAX_PAYLOAD, Reader, Writer};
use crate::metrics::METRICS;
use crate::plugin::TransformChain;

fn timed_out() -> Error {
	Error::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "idle timeout"))
}

/// Run the relay to completion. `plain` is the local app's connection (on
/// the client) or the dialed target (on the server); `tunnel` is the
/// encrypted connection to the peer proxy.
pub async fn relay<P, T>(
	plain: P,
	tunnel: T,
	mut reader: Reader,
	mut writer: Writer,
	transforms: &TransformChain,
	deadline: Duration,
) -> Result<(), Error>
where
	P: AsyncRead + AsyncWrite + Unpin + Send,
	T: AsyncRead + AsyncWrite + Unpin + Send,
{
	let (mut plain_rd, mut plain_wr) = tokio::io::split(plain);
	let (mut tunnel_rd, mut tunnel_wr) = tokio::io::split(tunnel);

	let to_tunnel = async {
		let mut buf = vec![0u8; MAX_PAYLOAD];
		loop {
			let n = match with_timeout(deadline, plain_rd.read(&mut buf)).await {
				Ok(Ok(0)) => break,
				Ok(Ok(n)) => n,
				Ok(Err(e)) => return Err(Error::Io(e)),
				Err(_) => return Err(timed_out()),
			};
			let mut record = BytesMut::from(&buf[..n]);
			transforms.apply(&mut record)?;
			writer.write_record(&mut tunnel_wr, &record).await?;
			METRICS.bytes_out(n as u64);
		}
		let _ = tunnel_wr.shutdown().await;
		Ok::<(), Error>(())
	};

	let to_plain = async {
		loop {
			let mut record = match with_timeout(deadline, reader.read_record(&mut tunnel_rd)).await {
				Ok(Ok(Some(r))) => r,
				Ok(Ok(None)) => break,
				Ok(Err(e)) => return Err(e),
				Err(_) => return Err(timed_out()),
			};
			transforms.apply(&mut record)?;
			METRICS.bytes_in(record.len() as u64);
			plain_wr.write_all(&record).await?;
		}
		let _ = plain_wr.shutdown().await;
		Ok::<(), Error>(())
	};

	tokio::try_join!(to_tunnel, to_plain)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::crypto::{Channel, Cipher, Method, derive_key};
	use std::sync::Arc;

	fn cipher() -> Arc<Cipher> {
		let key = derive_key("relay-test", &[9u8; crate::crypto::SALT_LEN]).unwrap();
		Arc::new(Cipher::new(Method::Aes256Gcm, &key))
	}

	#[tokio::test]
	async fn echoes_plaintext_through_tunnel_round_trip() {
		let (plain_app, mut plain_peer) = tokio::io::duplex(4096);
		let (tunnel_a, tunnel_b) = tokio::io::duplex(4096);
		let c = cipher();

		let transforms = TransformChain::new();
		let c_relay = c.clone();
		let client_relay = tokio::spawn(async move {
			relay(
				plain_app,
				tunnel_a,
				crate::framing::Reader::new(c_relay.clone(), Channel::ServerLength, Channel::ServerPayload),
				crate::framing::Writer::new(c_relay.clone(), Channel::ClientLength, Channel::ClientPayload),
				&transforms,
				Duration::from_secs(5),
			)
			.await
		});

		let mut server_reader = crate::framing::Reader::new(c.clone(), Channel::ClientLength, Channel::ClientPayload);
		let mut server_writer = crate::framing::Writer::new(c, Channel::ServerLength, Channel::ServerPayload);
		let mut tunnel_b = tunnel_b;

		plain_peer.write_all(b"ping").await.unwrap();
		let record = server_reader.read_record(&mut tunnel_b).await.unwrap().unwrap();
		assert_eq!(&record[..], b"ping");

		server_writer.write_record(&mut tunnel_b, b"pong").await.unwrap();
		let mut reply = [0u8; 4];
		plain_peer.read_exact(&mut reply).await.unwrap();
		assert_eq!(&reply, b"pong");

		drop(plain_peer);
		drop(tunnel_b);
		let _ = client_relay.await.unwrap();
	}
}
