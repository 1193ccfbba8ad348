//! Catalog metadata: continuous queries, streams, and the reader bitmaps
//! that drive the stream-insert fast path.
//!
//! Each referent kind (CQ, stream, matrel, output stream) gets its own
//! newtype id rather than sharing a raw integer, so the catalog's typed
//! dependency edges (CQ -> matrel -> osrel -> defrel) can't be crossed by
//! accident.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::err::{Error, Result};

pub mod plan;
pub use plan::{AggregateSpec, WorkerPlanSpec};

macro_rules! typed_id {
	($name:ident) => {
		#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		pub struct $name(pub u32);

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}({})", stringify!($name), self.0)
			}
		}
	};
}

typed_id!(CqId);
typed_id!(StreamId);
typed_id!(MatrelId);
typed_id!(OsrelId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CqKind {
	View,
	Transform,
}

/// Recognized CQ definition options, persisted as storage-option key/value
/// pairs on the definition relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CqAction {
	Materialize,
	Transform,
	Dumped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SwSpec {
	pub interval: Duration,
	pub step_factor_pct: u32,
}

impl SwSpec {
	pub fn step(&self) -> Duration {
		let millis = self.interval.as_millis() as u64 * self.step_factor_pct as u64 / 100;
		Duration::from_millis(millis.max(1))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlSpec {
	pub column: String,
	pub seconds: u64,
}

/// Everything needed to register a new CQ. The parsed query tree is kept
/// opaque (`serde_json::Value`) since the query language itself is out of
/// scope for this crate.
#[derive(Debug, Clone)]
pub struct CqDefinition {
	pub kind: CqKind,
	pub action: CqAction,
	pub source_stream: StreamId,
	pub matrel: MatrelId,
	pub osrel: Option<OsrelId>,
	pub pk_index: String,
	pub lookup_index: Option<String>,
	pub seqrel: Option<String>,
	pub ttl: Option<TtlSpec>,
	pub sw: Option<SwSpec>,
	pub fillfactor: u32,
	pub tgfn: Option<String>,
	pub tgargs: Vec<String>,
	pub definition: serde_json::Value,
	pub plan: WorkerPlanSpec,
}

#[derive(Debug, Clone)]
pub struct Cq {
	pub id: CqId,
	pub def: CqDefinition,
	pub active: bool,
	/// Version bumped on activate/deactivate; exposed for callers that need
	/// to detect a catalog-visible change across a longer-lived snapshot.
	pub generation: u64,
}

impl Cq {
	pub fn is_grouped(&self) -> bool {
		self.def.plan.is_grouped()
	}
}

#[derive(Debug, Clone)]
pub struct Stream {
	pub id: StreamId,
	pub name: String,
	pub columns: Vec<String>,
	pub readers: RoaringBitmap,
}

impl Stream {
	/// Streams always carry this reserved column; absent on insert, it is
	/// filled with the current wall-clock time.
	pub const ARRIVAL_TIMESTAMP: &'static str = "arrival_timestamp";

	pub fn known_column(&self, name: &str) -> bool {
		name == Self::ARRIVAL_TIMESTAMP || self.columns.iter().any(|c| c == name)
	}
}

/// Central catalog. Cheap to clone (every field is `Arc`-backed through
/// `DashMap`); the intended usage is one instance shared across the whole
/// server via `Arc<CqCatalog>` or a plain clone.
#[derive(Clone, Default)]
pub struct CqCatalog {
	cqs: DashMap<CqId, Cq>,
	streams: DashMap<StreamId, Stream>,
	next_cq: std::sync::Arc<AtomicU32>,
	next_stream: std::sync::Arc<AtomicU32>,
}

impl CqCatalog {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn create_stream(&self, name: impl Into<String>, columns: Vec<String>) -> StreamId {
		let id = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
		self.streams.insert(
			id,
			Stream {
				id,
				name: name.into(),
				columns,
				readers: RoaringBitmap::new(),
			},
		);
		id
	}

	pub fn stream(&self, id: StreamId) -> Result<Stream> {
		self.streams.get(&id).map(|s| s.clone()).ok_or(Error::StreamNotFound(id))
	}

	/// Creates a CQ, validating that TTL and SW are mutually exclusive, that
	/// the SW step is at least one second, and that the
	/// combiner-balanced id pool is bounded by `cnf::MAX_CQS`.
	pub fn create_cq(&self, def: CqDefinition) -> Result<CqId> {
		if def.ttl.is_some() && def.sw.is_some() {
			return Err(Error::SwTtlConflict);
		}
		if let Some(sw) = &def.sw {
			if sw.step() < Duration::from_secs(1) {
				return Err(Error::SwStepTooSmall);
			}
		}
		if self.cqs.len() >= crate::cnf::MAX_CQS {
			return Err(Error::TooManyCqs(crate::cnf::MAX_CQS));
		}
		let source = def.source_stream;
		let id = CqId(self.next_cq.fetch_add(1, Ordering::Relaxed));
		let mut stream = self.streams.get_mut(&source).ok_or(Error::StreamNotFound(source))?;
		stream.readers.insert(id.0);
		drop(stream);
		self.cqs.insert(
			id,
			Cq {
				id,
				def,
				active: *crate::cnf::CONTINUOUS_QUERIES_ENABLED,
				generation: 0,
			},
		);
		Ok(id)
	}

	pub fn activate_cq(&self, id: CqId) -> Result<()> {
		let mut cq = self.cqs.get_mut(&id).ok_or(Error::CqNotFound(id))?;
		cq.active = true;
		cq.generation += 1;
		Ok(())
	}

	pub fn deactivate_cq(&self, id: CqId) -> Result<()> {
		let mut cq = self.cqs.get_mut(&id).ok_or(Error::CqNotFound(id))?;
		cq.active = false;
		cq.generation += 1;
		Ok(())
	}

	/// Drops a CQ and removes it from its source stream's reader bitmap.
	/// Dependency teardown (matrel/osrel/index/sequence rows) is the
	/// storage layer's responsibility; the catalog only owns the
	/// dependency *list*, torn down here in reverse of creation order.
	pub fn drop_cq(&self, id: CqId) -> Result<()> {
		let (_, cq) = self.cqs.remove(&id).ok_or(Error::CqNotFound(id))?;
		if let Some(mut stream) = self.streams.get_mut(&cq.def.source_stream) {
			stream.readers.remove(id.0);
		}
		Ok(())
	}

	pub fn cq(&self, id: CqId) -> Result<Cq> {
		self.cqs.get(&id).map(|c| c.clone()).ok_or(Error::CqNotFound(id))
	}

	pub fn readers_of(&self, stream: StreamId) -> Result<RoaringBitmap> {
		self.streams
			.get(&stream)
			.map(|s| s.readers.clone())
			.ok_or(Error::StreamNotFound(stream))
	}

	pub fn active_cq_ids(&self) -> Vec<CqId> {
		self.cqs.iter().filter(|c| c.active).map(|c| c.id).collect()
	}

	/// Every active CQ with a TTL, for the reaper's enumeration step.
	pub fn ttl_cqs(&self) -> Vec<Cq> {
		self.cqs.iter().filter(|c| c.active && c.def.ttl.is_some()).map(|c| c.clone()).collect()
	}

	pub fn cqs_for_stream(&self, stream: StreamId) -> Result<Vec<Cq>> {
		let bitmap = self.readers_of(stream)?;
		Ok(bitmap.iter().filter_map(|id| self.cqs.get(&CqId(id)).map(|c| c.clone())).collect())
	}
}
