//! Atomic counters for the proxy's hot paths. No exporter is built in;
//! [`Metrics::snapshot`] hands back a plain struct for whoever wants to
//! print or ship it.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide metrics instance.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
	pub connections_opened: AtomicU64,
	pub connections_closed: AtomicU64,
	pub connections_failed: AtomicU64,
	pub bytes_in: AtomicU64,
	pub bytes_out: AtomicU64,
	pub datagrams_in: AtomicU64,
	pub datagrams_out: AtomicU64,
	pub replay_drops: AtomicU64,
	pub stale_drops: AtomicU64,
	pub decrypt_failures: AtomicU64,
	pub rate_limit_rejections: AtomicU64,
}

impl Metrics {
	pub const fn new() -> Self {
		Self {
			connections_opened: AtomicU64::new(0),
			connections_closed: AtomicU64::new(0),
			connections_failed: AtomicU64::new(0),
			bytes_in: AtomicU64::new(0),
			bytes_out: AtomicU64::new(0),
			datagrams_in: AtomicU64::new(0),
			datagrams_out: AtomicU64::new(0),
			replay_drops: AtomicU64::new(0),
			stale_drops: AtomicU64::new(0),
			decrypt_failures: AtomicU64::new(0),
			rate_limit_rejections: AtomicU64::new(0),
		}
	}

	#[inline]
	pub fn connection_opened(&self) {
		self.connections_opened.fetch_add(1, Ordering::Relaxed);
	}

	#[inline]
	pub fn connection_closed(&self) {
		self.connections_closed.fetch_add(1, Ordering::Relaxed);
	}

	#[inline]
	pub fn connection_failed(&self) {
		self.connections_failed.fetch_add(1, Ordering::Relaxed);
	}

	#[inline]
	pub fn bytes_in(&self, n: u64) {
		self.bytes_in.fetch_add(n, Ordering::Relaxed);
	}

	#[inline]
	pub fn bytes_out(&self, n: u64) {
		self.bytes_out.fetch_add(n, Ordering::Relaxed);
	}

	#[inline]
	pub fn datagram_in(&self) {
		self.datagrams_in.fetch_add(1, Ordering::Relaxed);
	}

	#[inline]
	pub fn datagram_out(&self) {
		self.datagrams_out.fetch_add(1, Ordering::Relaxed);
	}

	#[inline]
	pub fn replay_drop(&self) {
		self.replay_drops.fetch_add(1, Ordering::Relaxed);
	}

	#[inline]
	pub fn stale_drop(&self) {
		self.stale_drops.fetch_add(1, Ordering::Relaxed);
	}

	#[inline]
	pub fn decrypt_failure(&self) {
		self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
	}

	#[inline]
	pub fn rate_limit_rejection(&self) {
		self.rate_limit_rejections.fetch_add(1, Ordering::Relaxed);
	}

	pub fn snapshot(&self) -> MetricsSnapshot {
		MetricsSnapshot {
			connections_opened: self.connections_opened.load(Ordering::Relaxed),
			connections_closed: self.connections_closed.load(Ordering::Relaxed),
			connections_failed: self.connections_failed.load(Ordering::Relaxed),
			bytes_in: self.bytes_in.load(Ordering::Relaxed),
			bytes_out: self.bytes_out.load(Ordering::Relaxed),
			datagrams_in: self.datagrams_in.load(Ordering::Relaxed),
			datagrams_out: self.datagrams_out.load(Ordering::Relaxed),
			replay_drops: self.replay_drops.load(Ordering::Relaxed),
			stale_drops: self.stale_drops.load(Ordering::Relaxed),
			decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
			rate_limit_rejections: self.rate_limit_rejections.load(Ordering::Relaxed),
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
	pub connections_opened: u64,
	pub connections_closed: u64,
	pub connections_failed: u64,
	pub bytes_in: u64,
	pub bytes_out: u64,
	pub datagrams_in: u64,
	pub datagrams_out: u64,
	pub replay_drops: u64,
	pub stale_drops: u64,
	pub decrypt_failures: u64,
	pub rate_limit_rejections: u64,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counters_accumulate() {
		let m = Metrics::new();
		m.connection_opened();
		m.connection_opened();
		m.connection_closed();
		m.bytes_in(100);
		m.replay_drop();

		let snap = m.snapshot();
		assert_eq!(snap.connections_opened, 2);
		assert_eq!(snap.connections_closed, 1);
		assert_eq!(snap.bytes_in, 100);
		assert_eq!(snap.replay_drops, 1);
	}
}
