//! Token bucket rate limiting: one global bucket gates TCP accept, one
//! per-source-IP bucket (behind a concurrent map) gates UDP datagrams.

use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// A single token bucket. `rate` tokens refill per second up to `burst`
/// capacity; each admitted unit of work consumes one token.
struct Bucket {
	tokens: f64,
	rate: f64,
	burst: f64,
	last_refill: Instant,
}

impl Bucket {
	fn new(rate: u32, burst: u32) -> Self {
		Self {
			tokens: burst as f64,
			rate: rate as f64,
			burst: burst as f64,
			last_refill: Instant::now(),
		}
	}

	fn try_acquire(&mut self, now: Instant) -> bool {
		let elapsed = now.duration_since(self.last_refill).as_secs_f64();
		self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
		self.last_refill = now;

		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// A single global rate limiter, used for TCP accept admission.
pub struct GlobalLimiter {
	bucket: Mutex<Bucket>,
}

impl GlobalLimiter {
	pub fn new(rate: u32, burst: u32) -> Self {
		Self {
			bucket: Mutex::new(Bucket::new(rate, burst)),
		}
	}

	pub fn try_acquire(&self) -> bool {
		self.bucket
			.lock()
			.expect("rate limiter mutex poisoned")
			.try_acquire(Instant::now())
	}
}

/// A per-key rate limiter, used for UDP admission keyed by source IP.
/// Entries for keys that haven't been seen recently are pruned on GC.
pub struct PerKeyLimiter {
	rate: u32,
	burst: u32,
	buckets: DashMap<IpAddr, Bucket>,
}

impl PerKeyLimiter {
	pub fn new(rate: u32, burst: u32) -> Self {
		Self {
			rate,
			burst,
			buckets: DashMap::new(),
		}
	}

	pub fn try_acquire(&self, key: IpAddr) -> bool {
		let mut entry = self
			.buckets
			.entry(key)
			.or_insert_with(|| Bucket::new(self.rate, self.burst));
		entry.try_acquire(Instant::now())
	}

	/// Drop buckets whose owner hasn't made a request in `idle_for`.
	pub fn gc(&self, idle_for: Duration) {
		let now = Instant::now();
		self.buckets
			.retain(|_, b| now.duration_since(b.last_refill) <= idle_for);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;

	#[test]
	fn global_limiter_allows_up_to_burst_then_blocks() {
		let limiter = GlobalLimiter::new(1, 3);
		assert!(limiter.try_acquire());
		assert!(limiter.try_acquire());
		assert!(limiter.try_acquire());
		assert!(!limiter.try_acquire());
	}

	#[test]
	fn per_key_limiter_tracks_keys_independently() {
		let limiter = PerKeyLimiter::new(1, 1);
		let a = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
		let b = IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2));
		assert!(limiter.try_acquire(a));
		assert!(!limiter.try_acquire(a));
		assert!(limiter.try_acquire(b));
	}

	#[test]
	fn bucket_refills_over_time() {
		let mut bucket = Bucket::new(10, 1);
		let t0 = Instant::now();
		assert!(bucket.try_acquire(t0));
		assert!(!bucket.try_acquire(t0));
		let t1 = t0 + Duration::from_millis(200);
		assert!(bucket.try_acquire(t1));
	}
}
