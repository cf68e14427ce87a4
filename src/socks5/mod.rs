//! SOCKS5 handshake (RFC 1928 subset): NO-AUTH only, CONNECT and
//! UDP_ASSOCIATE, no BIND, no fragmentation.

pub mod udp;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::Address;
use crate::error::{Error, ReplyStatus};

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xff;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
	Connect,
	UdpAssociate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
	pub command: Command,
	pub dst: Address,
}

/// Either the request was malformed (close the connection, no reply), or
/// it named something we don't support and the caller must answer with
/// the given SOCKS5 status before closing.
#[derive(Debug)]
pub enum RequestError {
	Unsupported(ReplyStatus),
	Malformed(Error),
}

impl From<Error> for RequestError {
	fn from(e: Error) -> Self {
		RequestError::Malformed(e)
	}
}

impl From<std::io::Error> for RequestError {
	fn from(e: std::io::Error) -> Self {
		RequestError::Malformed(Error::Io(e))
	}
}

/// Step 1 of the client handshake: negotiate NO-AUTH. Accepts any method
/// list that contains 0x00; replies `{5, 0xFF}` and errors otherwise.
pub async fn negotiate_methods<S: AsyncRead + AsyncWrite + Unpin>(io: &mut S) -> Result<(), Error> {
	let mut hdr = [0u8; 2];
	io.read_exact(&mut hdr).await?;
	if hdr[0] != VERSION {
		return Err(Error::protocol(format!("invalid SOCKS version: 0x{:02x}", hdr[0])));
	}
	let mut methods = vec![0u8; hdr[1] as usize];
	io.read_exact(&mut methods).await?;

	if methods.contains(&METHOD_NO_AUTH) {
		io.write_all(&[VERSION, METHOD_NO_AUTH]).await?;
		Ok(())
	} else {
		io.write_all(&[VERSION, METHOD_NO_ACCEPTABLE]).await?;
		Err(Error::protocol("no acceptable authentication method"))
	}
}

/// Step 2: read `{ver, cmd, rsv, atyp, addr, port}`. Does not write a
/// reply -- the caller decides the status once it knows whether the dial
/// succeeded.
pub async fn read_request<S: AsyncRead + Unpin>(io: &mut S) -> Result<Request, RequestError> {
	let mut hdr = [0u8; 4];
	io.read_exact(&mut hdr).await?;

	if hdr[0] != VERSION {
		return Err(Error::protocol(format!("invalid SOCKS version: 0x{:02x}", hdr[0])).into());
	}
	if hdr[2] != 0 {
		return Err(Error::protocol("reserved byte must be 0").into());
	}

	let command = match hdr[1] {
		CMD_CONNECT => Command::Connect,
		CMD_UDP_ASSOCIATE => Command::UdpAssociate,
		_ => return Err(RequestError::Unsupported(ReplyStatus::CommandNotSupported)),
	};

	let dst = read_address(io, hdr[3]).await?;
	Ok(Request { command, dst })
}

async fn read_address<S: AsyncRead + Unpin>(io: &mut S, atyp: u8) -> Result<Address, RequestError> {
	use crate::address::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
	use std::net::{Ipv4Addr, Ipv6Addr};

	match atyp {
		ATYP_IPV4 => {
			let mut buf = [0u8; 6];
			io.read_exact(&mut buf).await?;
			let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
			let port = u16::from_be_bytes([buf[4], buf[5]]);
			Ok(Address::Ipv4(ip, port))
		}
		ATYP_IPV6 => {
			let mut buf = [0u8; 18];
			io.read_exact(&mut buf).await?;
			let mut octets = [0u8; 16];
			octets.copy_from_slice(&buf[..16]);
			let port = u16::from_be_bytes([buf[16], buf[17]]);
			Ok(Address::Ipv6(Ipv6Addr::from(octets), port))
		}
		ATYP_DOMAIN => {
			let mut len_buf = [0u8; 1];
			io.read_exact(&mut len_buf).await?;
			let len = len_buf[0] as usize;
			let mut rest = vec![0u8; len + 2];
			io.read_exact(&mut rest).await?;
			if rest[..len].contains(&0) {
				return Err(Error::protocol("domain name contains NUL").into());
			}
			let domain = String::from_utf8(rest[..len].to_vec())
				.map_err(|_| Error::protocol("invalid utf8 in domain"))?;
			let port = u16::from_be_bytes([rest[len], rest[len + 1]]);
			Ok(Address::Domain(domain, port))
		}
		_ => Err(RequestError::Unsupported(ReplyStatus::AddressTypeNotSupported)),
	}
}

/// Step 3: `{5, status, 0, atyp, bnd, port}`.
pub async fn write_reply<S: AsyncWrite + Unpin>(
	io: &mut S,
	status: ReplyStatus,
	bnd: &Address,
) -> Result<(), Error> {
	let mut buf = BytesMut::with_capacity(3 + bnd.encoded_len());
	buf.put_u8(VERSION);
	buf.put_u8(status as u8);
	buf.put_u8(0);
	bnd.encode(&mut buf);
	io.write_all(&buf).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;

	#[tokio::test]
	async fn negotiate_accepts_no_auth() {
		let (mut client, mut server) = tokio::io::duplex(64);
		let h = tokio::spawn(async move {
			client.write_all(&[VERSION, 2, 0x02, 0x00]).await.unwrap();
			let mut resp = [0u8; 2];
			client.read_exact(&mut resp).await.unwrap();
			resp
		});
		negotiate_methods(&mut server).await.unwrap();
		assert_eq!(h.await.unwrap(), [VERSION, METHOD_NO_AUTH]);
	}

	#[tokio::test]
	async fn negotiate_rejects_missing_no_auth() {
		let (mut client, mut server) = tokio::io::duplex(64);
		let h = tokio::spawn(async move {
			client.write_all(&[VERSION, 1, 0x02]).await.unwrap();
			let mut resp = [0u8; 2];
			client.read_exact(&mut resp).await.unwrap();
			resp
		});
		assert!(negotiate_methods(&mut server).await.is_err());
		assert_eq!(h.await.unwrap(), [VERSION, METHOD_NO_ACCEPTABLE]);
	}

	#[tokio::test]
	async fn read_request_parses_connect_domain() {
		let (mut client, mut server) = tokio::io::duplex(128);
		tokio::spawn(async move {
			let mut buf = vec![VERSION, CMD_CONNECT, 0x00, 0x03];
			buf.push(b"example.test".len() as u8);
			buf.extend_from_slice(b"example.test");
			buf.extend_from_slice(&80u16.to_be_bytes());
			client.write_all(&buf).await.unwrap();
		});
		let req = read_request(&mut server).await.unwrap();
		assert_eq!(req.command, Command::Connect);
		assert_eq!(req.dst, Address::Domain("example.test".to_owned(), 80));
	}

	#[tokio::test]
	async fn read_request_rejects_bind() {
		let (mut client, mut server) = tokio::io::duplex(64);
		tokio::spawn(async move {
			let buf = [VERSION, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
			client.write_all(&buf).await.unwrap();
		});
		match read_request(&mut server).await {
			Err(RequestError::Unsupported(ReplyStatus::CommandNotSupported)) => {}
			other => panic!("expected CommandNotSupported, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn write_reply_encodes_status_and_bnd() {
		let (mut client, mut server) = tokio::io::duplex(64);
		let bnd = Address::Ipv4(Ipv4Addr::new(0, 0, 0, 0), 0);
		write_reply(&mut server, ReplyStatus::Success, &bnd).await.unwrap();
		drop(server);
		let mut buf = Vec::new();
		client.read_to_end(&mut buf).await.unwrap();
		assert_eq!(buf, vec![VERSION, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
	}
}
