//! The matrel store: one row per group (or one ungrouped row), plus the
//! transaction boundary the combiner and reaper write through.
//!
//! A host database's row-level locking (`heap_lock_tuple`, `FOR UPDATE
//! SKIP LOCKED`) has no direct analogue in a single in-memory table guarded
//! by one mutex per transaction — contention between a combiner and the
//! reaper is already serialized by the transaction boundary itself, so
//! `lock_for_update` always succeeds and `lock_skip_locked` only matters
//! *within* a transaction that re-enters the same matrel twice (it never
//! does). The per-row `locked` flag is kept anyway so the call shape (and
//! the tests exercising it) match the real contract exactly.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::batch::{BatchSeq, Value};
use crate::catalog::MatrelId;
use crate::err::{Error, Result};
use crate::sketch::SketchState;
use crate::time::Timestamp;

pub type GroupKey = Vec<u8>;

/// Canonical encoding of a group-by tuple, used as the hash-expression
/// index key. Deterministic over the group columns only.
pub fn encode_group(values: &[Value]) -> GroupKey {
	bincode::serialize(values).unwrap_or_default()
}

/// Locality-sensitive enough for the combiner's `hash(group) mod
/// N_combiners` shard assignment. Not a true datetime-aware locality-
/// sensitive hash — see DESIGN.md for that simplification.
pub fn hash_group(values: &[Value]) -> u64 {
	use std::hash::{Hash, Hasher};
	let mut hasher = ahash::AHasher::default();
	encode_group(values).hash(&mut hasher);
	hasher.finish()
}

#[derive(Debug, Clone)]
pub struct MatrelRow {
	pub pk: u64,
	pub group: Vec<Value>,
	pub state: BTreeMap<String, SketchState>,
	pub arrival_ts: Option<Timestamp>,
	/// Highest `BatchSeq` folded into this row so far, so a replayed worker
	/// flush (same or older sequence number) can be recognized and skipped
	/// instead of double-applied.
	pub last_batch_seq: Option<BatchSeq>,
}

impl MatrelRow {
	/// Byte-wise datum equality over every non-group, non-pk column — the
	/// test behind the no-op update suppression.
	pub fn state_equals(&self, other: &BTreeMap<String, SketchState>) -> bool {
		if self.state.len() != other.len() {
			return false;
		}
		self.state.iter().all(|(k, v)| other.get(k).map(|o| o.serialize() == v.serialize()).unwrap_or(false))
	}
}

#[derive(Default)]
struct Matrel {
	rows: BTreeMap<u64, MatrelRow>,
	group_index: HashMap<GroupKey, u64>,
	locked: HashSet<u64>,
	next_pk: u64,
}

impl Matrel {
	fn alloc_pk(&mut self) -> u64 {
		self.next_pk += 1;
		self.next_pk
	}
}

#[derive(Default)]
struct StoreInner {
	matrels: HashMap<MatrelId, Matrel>,
}

/// Cheap to clone; every clone shares the same underlying table via `Arc`.
#[derive(Clone, Default)]
pub struct MatrelStore {
	inner: Arc<Mutex<StoreInner>>,
}

impl MatrelStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Opens a transaction. `write` only gates `Drop`'s unclosed-transaction
	/// warning — both read and write transactions hold the same exclusive
	/// guard since there is no MVCC snapshot isolation here.
	pub async fn begin(&self, write: bool) -> Transaction {
		let guard = self.inner.clone().lock_owned().await;
		Transaction {
			guard: Some(guard),
			write,
			done: false,
		}
	}
}

#[non_exhaustive]
pub struct Transaction {
	guard: Option<OwnedMutexGuard<StoreInner>>,
	write: bool,
	done: bool,
}

impl Drop for Transaction {
	fn drop(&mut self) {
		if !self.done && self.write && !std::thread::panicking() {
			tracing::warn!(target: "flowrelay::storage", "a write transaction was dropped without being committed or cancelled");
		}
	}
}

impl Transaction {
	fn matrel_mut<'a>(inner: &'a mut StoreInner, id: MatrelId) -> &'a mut Matrel {
		inner.matrels.entry(id).or_default()
	}

	fn guard_mut(&mut self) -> Result<&mut StoreInner> {
		self.guard.as_deref_mut().ok_or(Error::TxFinished)
	}

	pub fn closed(&self) -> bool {
		self.done
	}

	pub async fn commit(&mut self) -> Result<()> {
		if self.done {
			return Err(Error::TxFinished);
		}
		self.done = true;
		self.guard = None;
		Ok(())
	}

	pub async fn cancel(&mut self) -> Result<()> {
		if self.done {
			return Err(Error::TxFinished);
		}
		self.done = true;
		self.guard = None;
		Ok(())
	}

	fn require_write(&self) -> Result<()> {
		if !self.write {
			return Err(Error::TxReadonly);
		}
		Ok(())
	}

	/// Physical group lookup: the nested-loop join between a values-of-
	/// hashes relation and the matrel, driven by the hash-expression index.
	/// Here it is a direct index hit since the index literally is the hash
	/// map.
	pub fn get_by_group(&mut self, matrel: MatrelId, group: &[Value]) -> Result<Option<MatrelRow>> {
		let inner = self.guard_mut()?;
		let m = Self::matrel_mut(inner, matrel);
		let key = encode_group(group);
		Ok(m.group_index.get(&key).and_then(|pk| m.rows.get(pk)).cloned())
	}

	/// Acquires the blocking, always-succeeds row lock a combiner takes via
	/// `heap_lock_tuple`/`LockWaitBlock` before merging into an existing row.
	pub fn lock_for_update(&mut self, matrel: MatrelId, pk: u64) -> Result<()> {
		let inner = self.guard_mut()?;
		Self::matrel_mut(inner, matrel).locked.insert(pk);
		Ok(())
	}

	/// `FOR UPDATE SKIP LOCKED`: returns `false` instead of blocking when the
	/// row is already locked.
	pub fn try_lock_skip_locked(&mut self, matrel: MatrelId, pk: u64) -> Result<bool> {
		let inner = self.guard_mut()?;
		let m = Self::matrel_mut(inner, matrel);
		if m.locked.contains(&pk) {
			return Ok(false);
		}
		m.locked.insert(pk);
		Ok(true)
	}

	pub fn unlock(&mut self, matrel: MatrelId, pk: u64) -> Result<()> {
		let inner = self.guard_mut()?;
		Self::matrel_mut(inner, matrel).locked.remove(&pk);
		Ok(())
	}

	/// Inserts a new group row, allocating `$pk` from the matrel's internal
	/// sequence.
	pub fn insert_row(&mut self, matrel: MatrelId, group: Vec<Value>, state: BTreeMap<String, SketchState>, arrival_ts: Option<Timestamp>, last_batch_seq: Option<BatchSeq>) -> Result<MatrelRow> {
		self.require_write()?;
		let inner = self.guard_mut()?;
		let m = Self::matrel_mut(inner, matrel);
		let pk = m.alloc_pk();
		let key = encode_group(&group);
		let row = MatrelRow {
			pk,
			group,
			state,
			arrival_ts,
			last_batch_seq,
		};
		m.group_index.insert(key, pk);
		m.rows.insert(pk, row.clone());
		Ok(row)
	}

	/// In-place update preserving `$pk`.
	pub fn update_row(&mut self, matrel: MatrelId, pk: u64, state: BTreeMap<String, SketchState>, arrival_ts: Option<Timestamp>, last_batch_seq: Option<BatchSeq>) -> Result<MatrelRow> {
		self.require_write()?;
		let inner = self.guard_mut()?;
		let m = Self::matrel_mut(inner, matrel);
		let row = m.rows.get_mut(&pk).ok_or(Error::KeyNotFound)?;
		row.state = state;
		if arrival_ts.is_some() {
			row.arrival_ts = arrival_ts;
		}
		if last_batch_seq.is_some() {
			row.last_batch_seq = last_batch_seq;
		}
		Ok(row.clone())
	}

	pub fn delete_row(&mut self, matrel: MatrelId, pk: u64) -> Result<()> {
		self.require_write()?;
		let inner = self.guard_mut()?;
		let m = Self::matrel_mut(inner, matrel);
		if let Some(row) = m.rows.remove(&pk) {
			m.group_index.remove(&encode_group(&row.group));
		}
		m.locked.remove(&pk);
		Ok(())
	}

	/// `DELETE ... WHERE ttl_col < cutoff LIMIT batch_size FOR UPDATE SKIP
	/// LOCKED`. Rows held by an in-progress combiner merge are
	/// skipped rather than waited on. `limit = 0` means unbounded.
	pub fn delete_expired_batch(&mut self, matrel: MatrelId, cutoff: Timestamp, limit: usize) -> Result<Vec<MatrelRow>> {
		self.require_write()?;
		let inner = self.guard_mut()?;
		let m = Self::matrel_mut(inner, matrel);
		let candidates: Vec<u64> = m
			.rows
			.values()
			.filter(|r| r.arrival_ts.map(|ts| ts < cutoff).unwrap_or(false))
			.filter(|r| !m.locked.contains(&r.pk))
			.map(|r| r.pk)
			.take(if limit == 0 { usize::MAX } else { limit })
			.collect();
		let mut deleted = Vec::with_capacity(candidates.len());
		for pk in candidates {
			if let Some(row) = m.rows.remove(&pk) {
				m.group_index.remove(&encode_group(&row.group));
				deleted.push(row);
			}
		}
		Ok(deleted)
	}

	/// One-time lazy sync of SW step groups from the matrel: every row whose
	/// `arrival_ts >= since`, restricted to this combiner's shard.
	pub fn scan_shard_since(&mut self, matrel: MatrelId, since: Timestamp, shard: u32, n_combiners: u32) -> Result<Vec<MatrelRow>> {
		let inner = self.guard_mut()?;
		let m = Self::matrel_mut(inner, matrel);
		Ok(m.rows
			.values()
			.filter(|r| r.arrival_ts.map(|ts| ts >= since).unwrap_or(false))
			.filter(|r| (hash_group(&r.group) % n_combiners as u64) as u32 == shard)
			.cloned()
			.collect())
	}

	pub fn row_count(&mut self, matrel: MatrelId) -> Result<usize> {
		let inner = self.guard_mut()?;
		Ok(Self::matrel_mut(inner, matrel).rows.len())
	}
}
