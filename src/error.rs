//! Crate-wide error taxonomy.
//!
//! Mirrors the error classes the runtime actually reacts to differently:
//! protocol violations close the connection silently, crypto failures drop
//! the record (or the whole session, for TCP), replay/stale datagrams are
//! dropped without logging at more than debug level, dial errors map to a
//! SOCKS5 reply status, bind errors abort startup with a distinct exit
//! code from other fatal runtime errors, and config/io errors are fatal to
//! startup.

use std::fmt;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("crypto error: {0}")]
	Crypto(String),

	#[error("replayed packet")]
	Replay,

	#[error("stale packet")]
	Stale,

	#[error("dial error: {0}")]
	Dial(#[source] std::io::Error),

	#[error("bind error: {0}")]
	Bind(#[source] std::io::Error),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("config error: {0}")]
	Config(String),
}

impl Error {
	pub fn protocol(msg: impl Into<String>) -> Self {
		Error::Protocol(msg.into())
	}

	pub fn crypto(msg: impl Into<String>) -> Self {
		Error::Crypto(msg.into())
	}
}

/// SOCKS5 reply status codes (RFC 1928 §6), used to translate an [`Error`]
/// into the byte the client-facing handshake sends back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
	Success = 0x00,
	GeneralFailure = 0x01,
	HostUnreachable = 0x04,
	ConnectionRefused = 0x05,
	TtlExpired = 0x06,
	CommandNotSupported = 0x07,
	AddressTypeNotSupported = 0x08,
}

impl fmt::Display for ReplyStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:#04x}", *self as u8)
	}
}

impl ReplyStatus {
	/// Map an upstream dial failure to the closest SOCKS5 status.
	pub fn from_dial_error(e: &std::io::Error) -> Self {
		use std::io::ErrorKind::*;
		match e.kind() {
			ConnectionRefused => ReplyStatus::ConnectionRefused,
			TimedOut => ReplyStatus::TtlExpired,
			AddrNotAvailable | NotFound => ReplyStatus::HostUnreachable,
			_ => ReplyStatus::GeneralFailure,
		}
	}
}
