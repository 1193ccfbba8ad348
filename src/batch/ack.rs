//! Ack bookkeeping: a reference-counted 3-tuple of atomic counters plus a
//! generation tag, held in a shared registry. The generation tag advances
//! on every process respawn so a waiting producer can distinguish "still
//! in flight" from "the worker set restarted and this ack will never
//! complete".

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::AckLevel;
use crate::err::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AckId(pub u64);

/// One ack's live state. `generation_at_creation` is the owning database's
/// generation counter sampled when the ack was created; if the scheduler's
/// live counter has since advanced, the worker/combiner set that was meant
/// to service this ack may have been respawned and the batch is presumed
/// lost.
pub struct Ack {
	pub id: AckId,
	generation_at_creation: u64,
	expected: u64,
	worker_received: AtomicU64,
	combiner_received: AtomicU64,
	combiner_committed: AtomicU64,
	notify: Notify,
}

impl Ack {
	fn new(id: AckId, expected: u64, generation_at_creation: u64) -> Self {
		Ack {
			id,
			generation_at_creation,
			expected,
			worker_received: AtomicU64::new(0),
			combiner_received: AtomicU64::new(0),
			combiner_committed: AtomicU64::new(0),
			notify: Notify::new(),
		}
	}

	pub fn bump_worker_received(&self, n: u64) {
		self.worker_received.fetch_add(n, Ordering::SeqCst);
		self.notify.notify_waiters();
	}

	pub fn bump_combiner_received(&self, n: u64) {
		self.combiner_received.fetch_add(n, Ordering::SeqCst);
		self.notify.notify_waiters();
	}

	pub fn bump_combiner_committed(&self, n: u64) {
		self.combiner_committed.fetch_add(n, Ordering::SeqCst);
		self.notify.notify_waiters();
	}

	pub fn worker_received(&self) -> u64 {
		self.worker_received.load(Ordering::SeqCst)
	}

	pub fn combiner_received(&self) -> u64 {
		self.combiner_received.load(Ordering::SeqCst)
	}

	pub fn combiner_committed(&self) -> u64 {
		self.combiner_committed.load(Ordering::SeqCst)
	}

	fn satisfied(&self, level: AckLevel) -> bool {
		match level {
			AckLevel::Async => true,
			AckLevel::SyncReceive => self.worker_received() >= self.expected,
			AckLevel::SyncCommit => self.combiner_committed() >= self.expected,
		}
	}

	/// Waits until the ack reaches `level`, or returns `Err(Error::LostAck)`
	/// if `current_generation` diverges from the snapshot taken at
	/// creation. A lost ack is reported as a warning at the
	/// call site, not propagated as a hard error — callers should treat
	/// `Err(Error::LostAck)` as "stop waiting", not "the insert failed".
	pub async fn wait(&self, level: AckLevel, current_generation: impl Fn() -> u64) -> Result<()> {
		loop {
			if self.satisfied(level) {
				return Ok(());
			}
			if current_generation() != self.generation_at_creation {
				return Err(Error::LostAck);
			}
			// Re-check the generation periodically even with no counter
			// movement, since a respawn doesn't itself notify this ack.
			let notified = self.notify.notified();
			tokio::select! {
				_ = notified => {}
				_ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
			}
		}
	}
}

/// Shared table of live acks. Entries are removed once the producer has
/// finished waiting on them; the combiner/worker never need to look one up
/// after the producer has stopped caring.
#[derive(Clone, Default)]
pub struct AckRegistry {
	inner: Arc<DashMap<AckId, Arc<Ack>>>,
	next_id: Arc<AtomicU64>,
}

impl AckRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn create(&self, expected: u64, generation_at_creation: u64) -> Arc<Ack> {
		let id = AckId(self.next_id.fetch_add(1, Ordering::Relaxed));
		let ack = Arc::new(Ack::new(id, expected, generation_at_creation));
		self.inner.insert(id, ack.clone());
		ack
	}

	pub fn get(&self, id: AckId) -> Option<Arc<Ack>> {
		self.inner.get(&id).map(|a| a.clone())
	}

	pub fn remove(&self, id: AckId) {
		self.inner.remove(&id);
	}
}
