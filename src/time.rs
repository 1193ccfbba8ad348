//! Millisecond timestamps and the pluggable clock used for deterministic
//! time-based assertions (SW ticks, TTL expiry, ack waits).
//!
//! Ack-wait and SW-tick code elsewhere in the crate takes a `SizedClock`
//! rather than calling `SystemTime::now()` directly so tests can drive time
//! explicitly.

use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::err::Error;

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Timestamp {
	pub value: u64,
}

impl Timestamp {
	pub const ZERO: Timestamp = Timestamp { value: 0 };

	pub fn from_millis(value: u64) -> Self {
		Timestamp { value }
	}

	pub fn checked_sub(&self, d: Duration) -> Result<Timestamp, Error> {
		self.value
			.checked_sub(d.as_millis() as u64)
			.map(|value| Timestamp { value })
			.ok_or(Error::TimestampOverflow)
	}
}

impl Add<Duration> for Timestamp {
	type Output = Timestamp;
	fn add(self, rhs: Duration) -> Timestamp {
		Timestamp {
			value: self.value.saturating_add(rhs.as_millis() as u64),
		}
	}
}

impl Sub<Duration> for Timestamp {
	type Output = Result<Timestamp, Error>;
	fn sub(self, rhs: Duration) -> Result<Timestamp, Error> {
		self.checked_sub(rhs)
	}
}

/// A clock usable from both production and test code. Traits can't be
/// async-dyn-safe here without boxing every call, so this is a sized enum
/// rather than `dyn Clock`.
#[derive(Clone)]
#[non_exhaustive]
pub enum SizedClock {
	System(SystemClock),
	#[cfg(any(test, feature = "test-util"))]
	Fake(FakeClock),
	#[cfg(any(test, feature = "test-util"))]
	Inc(IncFakeClock),
}

impl SizedClock {
	pub async fn now(&self) -> Timestamp {
		match self {
			SizedClock::System(c) => c.now(),
			#[cfg(any(test, feature = "test-util"))]
			SizedClock::Fake(c) => c.now().await,
			#[cfg(any(test, feature = "test-util"))]
			SizedClock::Inc(c) => c.now().await,
		}
	}
}

impl Default for SizedClock {
	fn default() -> Self {
		SizedClock::System(SystemClock::new())
	}
}

/// A clock fully controlled externally; use in tests that assert on exact
/// TTL/SW boundary crossings.
#[cfg(any(test, feature = "test-util"))]
#[non_exhaustive]
pub struct FakeClock {
	now: AtomicU64,
}

#[cfg(any(test, feature = "test-util"))]
impl Clone for FakeClock {
	fn clone(&self) -> Self {
		FakeClock {
			now: AtomicU64::new(self.now.load(Ordering::SeqCst)),
		}
	}
}

#[cfg(any(test, feature = "test-util"))]
impl FakeClock {
	pub fn new(now: Timestamp) -> Self {
		FakeClock {
			now: AtomicU64::new(now.value),
		}
	}

	pub async fn now(&self) -> Timestamp {
		Timestamp {
			value: self.now.load(Ordering::SeqCst),
		}
	}

	pub async fn set(&self, timestamp: Timestamp) {
		self.now.store(timestamp.value, Ordering::SeqCst);
	}

	pub async fn advance(&self, d: Duration) {
		self.now.fetch_add(d.as_millis() as u64, Ordering::SeqCst);
	}
}

/// A clock that auto-increments on every read, for generating unique but
/// still partially-deterministic timestamps in tests that don't care about
/// exact values, only monotonicity.
#[cfg(any(test, feature = "test-util"))]
#[non_exhaustive]
pub struct IncFakeClock {
	now: AtomicU64,
	increment: Duration,
}

#[cfg(any(test, feature = "test-util"))]
impl Clone for IncFakeClock {
	fn clone(&self) -> Self {
		IncFakeClock {
			now: AtomicU64::new(self.now.load(Ordering::SeqCst)),
			increment: self.increment,
		}
	}
}

#[cfg(any(test, feature = "test-util"))]
impl IncFakeClock {
	pub fn new(now: Timestamp, increment: Duration) -> Self {
		IncFakeClock {
			now: AtomicU64::new(now.value),
			increment,
		}
	}

	pub async fn now(&self) -> Timestamp {
		self.now.fetch_add(self.increment.as_millis() as u64, Ordering::SeqCst);
		Timestamp {
			value: self.now.load(Ordering::SeqCst),
		}
	}
}

/// Wraps `SystemTime::now()`. Used when there are no other alternatives.
#[derive(Clone, Copy)]
#[non_exhaustive]
pub struct SystemClock;

impl SystemClock {
	pub fn new() -> Self {
		SystemClock
	}

	pub fn now(&self) -> Timestamp {
		let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
			Ok(d) => d.as_millis(),
			Err(e) => panic!("clock may have gone backwards: {:?}", e.duration()),
		};
		Timestamp {
			value: now as u64,
		}
	}
}

impl Default for SystemClock {
	fn default() -> Self {
		Self::new()
	}
}
