//! The SOCKS5/tunnel address type: IPv4, IPv6, or a domain name, each with
//! a port. One wire codec serves the SOCKS5 request/reply, the UDP header,
//! and the tunnel's own "first sealed record is the destination" framing.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};

use crate::error::Error;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// A destination or bound address as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
	Ipv4(Ipv4Addr, u16),
	Ipv6(Ipv6Addr, u16),
	/// Domain name, 1..=255 bytes, guaranteed free of interior NULs.
	Domain(String, u16),
}

impl Address {
	pub fn port(&self) -> u16 {
		match self {
			Address::Ipv4(_, p) | Address::Ipv6(_, p) | Address::Domain(_, p) => *p,
		}
	}

	pub fn unspecified_ipv4() -> Self {
		Address::Ipv4(Ipv4Addr::UNSPECIFIED, 0)
	}

	pub fn atyp(&self) -> u8 {
		match self {
			Address::Ipv4(..) => ATYP_IPV4,
			Address::Ipv6(..) => ATYP_IPV6,
			Address::Domain(..) => ATYP_DOMAIN,
		}
	}

	/// Host rendered for downstream dialing. Never goes through a numeric
	/// string conversion path that could reinterpret the port as a code
	/// point -- see `to_host_port`.
	pub fn host_string(&self) -> String {
		match self {
			Address::Ipv4(ip, _) => ip.to_string(),
			Address::Ipv6(ip, _) => ip.to_string(),
			Address::Domain(d, _) => d.clone(),
		}
	}

	/// Render as `host:port` for `TcpStream::connect`/`lookup_host`. The
	/// port MUST be formatted as decimal digits; a prior implementation of
	/// this join converted the raw `u16` into a single `char` (a Unicode
	/// code point) instead of formatting it, silently corrupting every
	/// port above 127. Exercised by `tests::port_is_rendered_as_decimal`.
	pub fn to_host_port(&self) -> String {
		format!("{}:{}", self.host_string(), self.port())
	}

	pub fn encoded_len(&self) -> usize {
		1 + match self {
			Address::Ipv4(..) => 4,
			Address::Ipv6(..) => 16,
			Address::Domain(d, _) => 1 + d.len(),
		} + 2
	}

	pub fn encode(&self, buf: &mut impl BufMut) {
		buf.put_u8(self.atyp());
		match self {
			Address::Ipv4(ip, _) => buf.put_slice(&ip.octets()),
			Address::Ipv6(ip, _) => buf.put_slice(&ip.octets()),
			Address::Domain(d, _) => {
				buf.put_u8(d.len() as u8);
				buf.put_slice(d.as_bytes());
			}
		}
		buf.put_u16(self.port());
	}

	pub fn to_vec(&self) -> Vec<u8> {
		let mut v = Vec::with_capacity(self.encoded_len());
		self.encode(&mut v);
		v
	}

	/// Parse one address+port out of `buf`, advancing it past the bytes
	/// consumed. `buf` typically has trailing payload after the address.
	pub fn decode(buf: &mut impl Buf) -> Result<Self, Error> {
		if !buf.has_remaining() {
			return Err(Error::protocol("ADDRESS_TOO_SHORT"));
		}
		let atyp = buf.get_u8();
		let addr = match atyp {
			ATYP_IPV4 => {
				if buf.remaining() < 4 + 2 {
					return Err(Error::protocol("ADDRESS_TOO_SHORT"));
				}
				let mut octets = [0u8; 4];
				buf.copy_to_slice(&mut octets);
				let port = buf.get_u16();
				Address::Ipv4(Ipv4Addr::from(octets), port)
			}
			ATYP_IPV6 => {
				if buf.remaining() < 16 + 2 {
					return Err(Error::protocol("ADDRESS_TOO_SHORT"));
				}
				let mut octets = [0u8; 16];
				buf.copy_to_slice(&mut octets);
				let port = buf.get_u16();
				Address::Ipv6(Ipv6Addr::from(octets), port)
			}
			ATYP_DOMAIN => {
				if buf.remaining() < 1 {
					return Err(Error::protocol("ADDRESS_TOO_SHORT"));
				}
				let len = buf.get_u8() as usize;
				if buf.remaining() < len + 2 {
					return Err(Error::protocol("INVALID_DOMAIN_LENGTH"));
				}
				let mut raw = vec![0u8; len];
				buf.copy_to_slice(&mut raw);
				if raw.contains(&0) {
					return Err(Error::protocol("domain name contains NUL"));
				}
				let domain =
					String::from_utf8(raw).map_err(|_| Error::protocol("invalid utf8 in domain"))?;
				let port = buf.get_u16();
				Address::Domain(domain, port)
			}
			other => {
				return Err(Error::protocol(format!(
					"INVALID_ADDRESS_TYPE: 0x{:02x}",
					other
				)));
			}
		};
		Ok(addr)
	}
}

impl From<SocketAddr> for Address {
	fn from(sa: SocketAddr) -> Self {
		match sa {
			SocketAddr::V4(v4) => Address::Ipv4(*v4.ip(), v4.port()),
			SocketAddr::V6(v6) => Address::Ipv6(*v6.ip(), v6.port()),
		}
	}
}

impl fmt::Display for Address {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.host_string(), self.port())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn roundtrip(addr: Address) {
		let mut buf = addr.to_vec();
		let decoded = Address::decode(&mut &buf[..]).unwrap();
		assert_eq!(addr, decoded);
		buf.clear();
	}

	#[test]
	fn roundtrip_ipv4() {
		roundtrip(Address::Ipv4(Ipv4Addr::new(1, 2, 3, 4), 53));
	}

	#[test]
	fn roundtrip_ipv6() {
		roundtrip(Address::Ipv6(Ipv6Addr::LOCALHOST, 443));
	}

	#[test]
	fn roundtrip_domain() {
		roundtrip(Address::Domain("example.test".to_owned(), 80));
		roundtrip(Address::Domain("a".repeat(255), 1));
	}

	#[test]
	fn rejects_bad_atyp() {
		let buf = [0x02u8, 0, 0, 0, 0, 0, 0];
		assert!(Address::decode(&mut &buf[..]).is_err());
	}

	#[test]
	fn rejects_truncated_domain_length() {
		// declares a 10-byte domain but only provides 3
		let buf = [ATYP_DOMAIN, 10, b'a', b'b', b'c'];
		assert!(Address::decode(&mut &buf[..]).is_err());
	}

	#[test]
	fn rejects_truncated_ipv4() {
		let buf = [ATYP_IPV4, 1, 2, 3];
		assert!(Address::decode(&mut &buf[..]).is_err());
	}

	#[test]
	fn port_is_rendered_as_decimal() {
		// A port whose low byte would decode as a printable ASCII char if
		// mishandled as a `char` conversion; decimal rendering must still
		// produce ordinary digits.
		let addr = Address::Domain("example.test".to_owned(), 8080);
		assert_eq!(addr.to_host_port(), "example.test:8080");

		let addr = Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1), 65535);
		assert_eq!(addr.to_host_port(), "10.0.0.1:65535");
	}
}
