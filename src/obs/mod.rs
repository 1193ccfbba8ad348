//! Observability: per-(kind, task, cq) and per-stream counters, exposed as
//! read-only snapshots.
//!
//! Stale entries (whose referenced process no longer exists) are dropped on
//! scan rather than eagerly on exit, since a killed task can't run its own
//! cleanup.

pub mod heartbeat;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::catalog::{CqId, StreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcKind {
	Worker,
	Combiner,
	Queue,
	Reaper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatKey {
	pub kind: ProcKind,
	pub task: u32,
	pub cq: CqId,
}

#[derive(Default)]
struct CqCounters {
	input_rows: AtomicU64,
	inserted_rows: AtomicU64,
	updated_rows: AtomicU64,
	input_bytes: AtomicU64,
	inserted_bytes: AtomicU64,
	updated_bytes: AtomicU64,
	executions: AtomicU64,
	errors: AtomicU64,
	exec_ms: AtomicU64,
}

/// A point-in-time copy of one [`StatKey`]'s counters, for the read-only
/// observability view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CqStatsSnapshot {
	pub kind: ProcKind,
	pub task: u32,
	pub cq: CqId,
	pub input_rows: u64,
	pub inserted_rows: u64,
	pub updated_rows: u64,
	pub input_bytes: u64,
	pub inserted_bytes: u64,
	pub updated_bytes: u64,
	pub executions: u64,
	pub errors: u64,
	pub exec_ms: u64,
}

#[derive(Default)]
struct StreamCounters {
	input_rows: AtomicU64,
	input_batches: AtomicU64,
	input_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatsSnapshot {
	pub stream: StreamId,
	pub input_rows: u64,
	pub input_batches: u64,
	pub input_bytes: u64,
}

/// Shared stats table. Cheap to clone; every clone sees the same counters.
#[derive(Clone, Default)]
pub struct StatsRegistry {
	cq: Arc<DashMap<StatKey, CqCounters>>,
	stream: Arc<DashMap<StreamId, StreamCounters>>,
}

impl StatsRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn record_input(&self, key: StatKey, rows: u64, bytes: u64) {
		let c = self.cq.entry(key).or_default();
		c.input_rows.fetch_add(rows, Ordering::Relaxed);
		c.input_bytes.fetch_add(bytes, Ordering::Relaxed);
	}

	pub fn record_insert(&self, key: StatKey, rows: u64, bytes: u64) {
		let c = self.cq.entry(key).or_default();
		c.inserted_rows.fetch_add(rows, Ordering::Relaxed);
		c.inserted_bytes.fetch_add(bytes, Ordering::Relaxed);
	}

	pub fn record_update(&self, key: StatKey, rows: u64, bytes: u64) {
		let c = self.cq.entry(key).or_default();
		c.updated_rows.fetch_add(rows, Ordering::Relaxed);
		c.updated_bytes.fetch_add(bytes, Ordering::Relaxed);
	}

	pub fn record_execution(&self, key: StatKey, exec_ms: u64) {
		let c = self.cq.entry(key).or_default();
		c.executions.fetch_add(1, Ordering::Relaxed);
		c.exec_ms.fetch_add(exec_ms, Ordering::Relaxed);
	}

	pub fn record_error(&self, key: StatKey) {
		let c = self.cq.entry(key).or_default();
		c.errors.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_stream_input(&self, stream: StreamId, rows: u64, batches: u64, bytes: u64) {
		let c = self.stream.entry(stream).or_default();
		c.input_rows.fetch_add(rows, Ordering::Relaxed);
		c.input_batches.fetch_add(batches, Ordering::Relaxed);
		c.input_bytes.fetch_add(bytes, Ordering::Relaxed);
	}

	/// Snapshots every live counter, dropping entries whose task is no
	/// longer alive per `is_alive`.
	pub fn scan_cq_stats(&self, is_alive: impl Fn(ProcKind, u32) -> bool) -> Vec<CqStatsSnapshot> {
		let mut stale = Vec::new();
		let mut out = Vec::new();
		for entry in self.cq.iter() {
			let key = *entry.key();
			if !is_alive(key.kind, key.task) {
				stale.push(key);
				continue;
			}
			let c = entry.value();
			out.push(CqStatsSnapshot {
				kind: key.kind,
				task: key.task,
				cq: key.cq,
				input_rows: c.input_rows.load(Ordering::Relaxed),
				inserted_rows: c.inserted_rows.load(Ordering::Relaxed),
				updated_rows: c.updated_rows.load(Ordering::Relaxed),
				input_bytes: c.input_bytes.load(Ordering::Relaxed),
				inserted_bytes: c.inserted_bytes.load(Ordering::Relaxed),
				updated_bytes: c.updated_bytes.load(Ordering::Relaxed),
				executions: c.executions.load(Ordering::Relaxed),
				errors: c.errors.load(Ordering::Relaxed),
				exec_ms: c.exec_ms.load(Ordering::Relaxed),
			});
		}
		for key in stale {
			self.cq.remove(&key);
		}
		out
	}

	pub fn scan_stream_stats(&self) -> Vec<StreamStatsSnapshot> {
		self.stream
			.iter()
			.map(|entry| StreamStatsSnapshot {
				stream: *entry.key(),
				input_rows: entry.input_rows.load(Ordering::Relaxed),
				input_batches: entry.input_batches.load(Ordering::Relaxed),
				input_bytes: entry.input_bytes.load(Ordering::Relaxed),
			})
			.collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn records_accumulate() {
		let reg = StatsRegistry::new();
		let key = StatKey {
			kind: ProcKind::Worker,
			task: 0,
			cq: CqId(1),
		};
		reg.record_input(key, 10, 100);
		reg.record_input(key, 5, 50);
		let snap = reg.scan_cq_stats(|_, _| true);
		assert_eq!(snap[0].input_rows, 15);
		assert_eq!(snap[0].input_bytes, 150);
	}

	#[test]
	fn stale_entries_are_purged_on_scan() {
		let reg = StatsRegistry::new();
		let key = StatKey {
			kind: ProcKind::Combiner,
			task: 3,
			cq: CqId(2),
		};
		reg.record_error(key);
		let snap = reg.scan_cq_stats(|_, _| false);
		assert!(snap.is_empty());
		assert_eq!(reg.cq.len(), 0);
	}

	#[test]
	fn stream_stats_accumulate_independently_of_cq_stats() {
		let reg = StatsRegistry::new();
		reg.record_stream_input(StreamId(1), 3, 1, 300);
		let snap = reg.scan_stream_stats();
		assert_eq!(snap[0].input_rows, 3);
	}
}
