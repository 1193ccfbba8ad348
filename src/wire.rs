//! Wire payloads exchanged on the worker→combiner and combiner→osrel hops.
//! Kept separate from [`crate::batch`]'s raw stream-ingestion `MicroBatch`
//! because the shapes differ: a worker emits pre-finalize transition state
//! per group, not stream tuples.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::batch::{AckRef, BatchSeq};
use crate::catalog::CqId;
use crate::err::Result;
use crate::ipc::EndpointId;
use crate::sketch::SketchState;
use crate::time::Timestamp;

pub use crate::batch::ChangeRow;

/// One group's worker-side partial contribution, pre-finalize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialRow {
	pub group: Vec<crate::batch::Value>,
	pub group_hash: u64,
	pub state: BTreeMap<String, SketchState>,
	pub arrival_ts: Option<Timestamp>,
	/// Highest `BatchSeq` among the stream inserts folded into this group so
	/// far this tick, so the combiner can tell a replayed worker flush from a
	/// genuinely new contribution.
	pub batch_seq: Option<BatchSeq>,
}

/// A worker→combiner batch: every partial destined for one CQ shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialBatch {
	pub dst: EndpointId,
	pub cq: CqId,
	pub rows: Vec<PartialRow>,
	pub acks: Vec<AckRef>,
}

impl PartialBatch {
	pub fn new(dst: EndpointId, cq: CqId) -> Self {
		PartialBatch {
			dst,
			cq,
			rows: Vec::new(),
			acks: Vec::new(),
		}
	}

	pub fn is_empty(&self) -> bool {
		self.rows.is_empty()
	}

	pub fn encode(&self) -> Result<Bytes> {
		Ok(Bytes::from(bincode::serialize(self)?))
	}

	pub fn decode(bytes: &[u8]) -> Result<PartialBatch> {
		Ok(bincode::deserialize(bytes)?)
	}
}

/// Per-CQ table of combiner endpoints, indexed by shard (`hash(group) mod
/// N_combiners`). Populated by the scheduler as it starts combiner tasks,
/// consulted by every worker sharding a partial batch.
#[derive(Clone, Default)]
pub struct CombinerRoutes {
	inner: Arc<DashMap<CqId, Vec<EndpointId>>>,
}

impl CombinerRoutes {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers the endpoint owning shard `shard` of `cq`. Shards must be
	/// registered in order (0, 1, 2, ...) as the scheduler starts each
	/// combiner task.
	pub fn register(&self, cq: CqId, shard: u32, endpoint: EndpointId) {
		let mut list = self.inner.entry(cq).or_default();
		let idx = shard as usize;
		if list.len() <= idx {
			list.resize(idx + 1, 0);
		}
		list[idx] = endpoint;
	}

	pub fn n_combiners(&self, cq: CqId) -> Option<usize> {
		self.inner.get(&cq).map(|l| l.len())
	}

	pub fn shard_endpoint(&self, cq: CqId, shard: u32) -> Option<EndpointId> {
		self.inner.get(&cq).and_then(|l| l.get(shard as usize).copied())
	}

	pub fn cqs(&self) -> Vec<CqId> {
		self.inner.iter().map(|e| *e.key()).collect()
	}

	/// Swaps every occurrence of `old` for `new` across every CQ's shard
	/// list, called after a combiner respawn so CQs already sharded to the
	/// dead endpoint start reaching its replacement.
	pub fn replace_endpoint(&self, old: EndpointId, new: EndpointId) {
		for mut entry in self.inner.iter_mut() {
			for e in entry.value_mut().iter_mut() {
				if *e == old {
					*e = new;
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registers_and_resolves_shards() {
		let routes = CombinerRoutes::new();
		routes.register(CqId(1), 0, 100);
		routes.register(CqId(1), 1, 101);
		assert_eq!(routes.n_combiners(CqId(1)), Some(2));
		assert_eq!(routes.shard_endpoint(CqId(1), 1), Some(101));
	}

	#[test]
	fn unregistered_cq_resolves_to_none() {
		let routes = CombinerRoutes::new();
		assert_eq!(routes.shard_endpoint(CqId(9), 0), None);
	}

	#[test]
	fn partial_batch_encode_decode_roundtrip() {
		let mut batch = PartialBatch::new(5, CqId(1));
		batch.rows.push(PartialRow {
			group: vec![crate::batch::Value::I64(1)],
			group_hash: 42,
			state: BTreeMap::new(),
			arrival_ts: None,
			batch_seq: None,
		});
		let bytes = batch.encode().unwrap();
		let decoded = PartialBatch::decode(&bytes).unwrap();
		assert_eq!(decoded.rows.len(), 1);
		assert_eq!(decoded.cq, CqId(1));
	}
}
