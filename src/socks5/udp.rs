//! The SOCKS5 UDP request header (RFC 1928 §7): `RSV(2)=0, FRAG(1), ATYP,
//! DST.ADDR, DST.PORT, DATA`. Fragmentation is not supported; any packet
//! with FRAG != 0 must be dropped by the caller without a protocol error.

use bytes::{BufMut, BytesMut};

use crate::address::Address;
use crate::error::Error;

/// Parse a SOCKS5 UDP datagram from the local application. Returns the
/// destination address and a slice of the remaining payload.
pub fn parse<'a>(buf: &'a [u8]) -> Result<(Address, &'a [u8]), Error> {
	if buf.len() < 4 {
		return Err(Error::protocol("UDP header too short"));
	}
	if buf[0] != 0 || buf[1] != 0 {
		return Err(Error::protocol("UDP RSV must be 0"));
	}
	if buf[2] != 0 {
		return Err(Error::protocol("fragmented UDP datagrams are not supported"));
	}

	let mut rest = &buf[3..];
	let dst = Address::decode(&mut rest)?;
	// `rest` has been advanced past the address by `Buf::decode`; recover
	// the remaining slice from its current position.
	let consumed = buf.len() - 3 - rest.len();
	Ok((dst, &buf[3 + consumed..]))
}

/// Build the SOCKS5 UDP reply header the local application expects:
/// `RSV=0, FRAG=0, ATYP, BND.ADDR, BND.PORT, DATA`.
pub fn build(bnd: &Address, data: &[u8]) -> BytesMut {
	let mut buf = BytesMut::with_capacity(3 + bnd.encoded_len() + data.len());
	buf.put_u16(0);
	buf.put_u8(0);
	bnd.encode(&mut buf);
	buf.put_slice(data);
	buf
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;

	#[test]
	fn roundtrip() {
		let dst = Address::Ipv4(Ipv4Addr::new(1, 2, 3, 4), 53);
		let datagram = build(&dst, b"hello");
		let (parsed, data) = parse(&datagram).unwrap();
		assert_eq!(parsed, dst);
		assert_eq!(data, b"hello");
	}

	#[test]
	fn rejects_fragmentation() {
		let mut datagram = build(&Address::Ipv4(Ipv4Addr::LOCALHOST, 1), b"x");
		datagram[2] = 1;
		assert!(parse(&datagram).is_err());
	}

	#[test]
	fn rejects_nonzero_rsv() {
		let mut datagram = build(&Address::Ipv4(Ipv4Addr::LOCALHOST, 1), b"x");
		datagram[0] = 1;
		assert!(parse(&datagram).is_err());
	}

	#[test]
	fn rejects_short_header() {
		assert!(parse(&[0, 0]).is_err());
	}
}
