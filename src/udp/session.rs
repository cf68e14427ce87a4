//! UDP session tracking: one entry per client source address, carrying the
//! anti-replay high-water mark and the outbound send counter for that
//! client's reverse direction. Kept behind a trait so the in-memory map
//! used here can be swapped for an out-of-process backing without touching
//! the relay logic.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::Error;

/// Idle sessions older than this are evicted by the background GC task.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct Session {
	pub last_seen: Instant,
	pub highest_nonce_seen: u32,
	pub send_counter: u32,
}

impl Session {
	fn new() -> Self {
		Self {
			last_seen: Instant::now(),
			highest_nonce_seen: 0,
			send_counter: 0,
		}
	}
}

/// Contract a UDP session map must satisfy. The default implementation is
/// in-memory; an out-of-process backing (e.g. an external cache) is a
/// swap-in with this identical interface.
pub trait SessionStore: Send + Sync {
	fn get(&self, addr: SocketAddr) -> Option<Session>;
	fn put(&self, addr: SocketAddr, session: Session);
	fn delete(&self, addr: SocketAddr);
	fn expire_idle(&self, now: Instant, timeout: Duration) -> Vec<SocketAddr>;
}

/// `DashMap`-backed default store. Lookups and the nonce-update occur while
/// holding the shard lock; AEAD open and upstream I/O always happen outside
/// of it.
#[derive(Default)]
pub struct InMemorySessionStore {
	sessions: DashMap<SocketAddr, Session>,
}

impl InMemorySessionStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Check whether `nonce` would currently be accepted for `addr` --
	/// strictly greater than the session's high-water mark (or no session
	/// yet). Read-only: does not create the session or touch any state.
	/// The caller must only call `commit_nonce` once the datagram this
	/// nonce belongs to has been opened and forwarded successfully; a
	/// failed open must never move the high-water mark.
	pub fn check_nonce(&self, addr: SocketAddr, nonce: u32) -> bool {
		match self.sessions.get(&addr) {
			Some(session) => nonce > session.highest_nonce_seen,
			None => true,
		}
	}

	/// Commit `nonce` as the new high-water mark for `addr`, creating the
	/// session on first contact. Re-validates under the shard lock so a
	/// datagram that raced past a prior `check_nonce` cannot regress or
	/// duplicate the mark; returns `false` if it lost that race.
	pub fn commit_nonce(&self, addr: SocketAddr, nonce: u32) -> bool {
		let mut entry = self.sessions.entry(addr).or_insert_with(Session::new);
		if nonce > entry.highest_nonce_seen {
			entry.highest_nonce_seen = nonce;
			entry.last_seen = Instant::now();
			true
		} else {
			false
		}
	}

	/// Advance the outbound send counter for `addr`. Wraparound is a fatal
	/// session error, mirroring the TCP nonce counter: the caller must close
	/// the session rather than reuse a counter value.
	pub fn next_send_counter(&self, addr: SocketAddr) -> Result<u32, Error> {
		let mut entry = self.sessions.entry(addr).or_insert_with(Session::new);
		entry.send_counter = entry
			.send_counter
			.checked_add(1)
			.ok_or_else(|| Error::crypto("UDP send counter wrapped"))?;
		Ok(entry.send_counter)
	}
}

impl SessionStore for InMemorySessionStore {
	fn get(&self, addr: SocketAddr) -> Option<Session> {
		self.sessions.get(&addr).map(|e| e.clone())
	}

	fn put(&self, addr: SocketAddr, session: Session) {
		self.sessions.insert(addr, session);
	}

	fn delete(&self, addr: SocketAddr) {
		self.sessions.remove(&addr);
	}

	fn expire_idle(&self, now: Instant, timeout: Duration) -> Vec<SocketAddr> {
		let expired: Vec<SocketAddr> = self
			.sessions
			.iter()
			.filter(|e| now.duration_since(e.last_seen) > timeout)
			.map(|e| *e.key())
			.collect();
		for addr in &expired {
			self.sessions.remove(addr);
		}
		expired
	}
}
