//! Micro-batches: the in-transit unit between worker, queue, and combiner.

pub mod ack;

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::catalog::CqId;
use crate::cnf;
use crate::err::Result;
use crate::ipc::EndpointId;
use crate::time::Timestamp;

pub use ack::{Ack, AckId, AckRegistry};
/// Per-call flush level, shared with the session-level `insert_into_stream`
/// knob.
pub type AckLevel = cnf::StreamInsertLevel;

/// A process-wide monotonic sequence number, one per `insert_into_stream`
/// call. Carried in the ack and, per group, on the `PartialRow`/`MatrelRow`
/// it contributes to, so the combiner can recognize a replayed batch after
/// a worker restart mid-flush and skip re-applying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchSeq(pub u64);

/// A single value in a stream/matrel row. Streams are schemaless column
/// maps, so cells need a dynamically-typed value rather than a fixed
/// per-column type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
	Null,
	Bool(bool),
	I64(i64),
	F64(f64),
	Str(String),
	Bytes(Vec<u8>),
	Timestamp(Timestamp),
}

impl Value {
	/// Best-effort coercion used when a worker plan's input column type
	/// doesn't match the stream's column type. Never errors; failure
	/// becomes `Value::Null`.
	pub fn coerce_to_f64(&self) -> Value {
		match self {
			Value::F64(_) => self.clone(),
			Value::I64(i) => Value::F64(*i as f64),
			Value::Str(s) => s.parse::<f64>().map(Value::F64).unwrap_or(Value::Null),
			_ => Value::Null,
		}
	}

	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Value::F64(f) => Some(*f),
			Value::I64(i) => Some(*i as f64),
			_ => None,
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Value::Str(s) => Some(s.as_str()),
			_ => None,
		}
	}
}

/// A schemaless row: column name -> value, plus the always-present
/// `arrival_timestamp` tracked separately so it can be defaulted cheaply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Row {
	pub columns: BTreeMap<String, Value>,
}

impl Row {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, col: &str) -> Value {
		self.columns.get(col).cloned().unwrap_or(Value::Null)
	}

	pub fn set(&mut self, col: impl Into<String>, v: Value) {
		self.columns.insert(col.into(), v);
	}

	pub fn arrival_timestamp(&self) -> Option<Timestamp> {
		match self.columns.get(crate::catalog::Stream::ARRIVAL_TIMESTAMP) {
			Some(Value::Timestamp(ts)) => Some(*ts),
			_ => None,
		}
	}

	/// Approximate in-memory size, used against the batch byte budget.
	pub fn approx_bytes(&self) -> usize {
		self.columns
			.iter()
			.map(|(k, v)| k.len() + Row::value_bytes(v))
			.sum::<usize>()
			+ 32
	}

	fn value_bytes(v: &Value) -> usize {
		match v {
			Value::Null => 0,
			Value::Bool(_) => 1,
			Value::I64(_) => 8,
			Value::F64(_) => 8,
			Value::Str(s) => s.len(),
			Value::Bytes(b) => b.len(),
			Value::Timestamp(_) => 8,
		}
	}
}

/// An output-stream tuple: `(old, new, delta)` for non-SW CQs, `(old, new)`
/// for SW CQs (`delta` is `None`). `None` in `old`/`new` encodes
/// insert/delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRow {
	pub old: Option<Row>,
	pub new: Option<Row>,
	pub delta: Option<Row>,
}

/// A reference to an in-flight ack, carried alongside the rows it covers so
/// the receiver can bump the right counter by the right amount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRef {
	pub id: AckId,
	pub level: AckLevel,
	pub batch_seq: BatchSeq,
	/// Number of stream tuples this batch represents, for committed-counter
	/// accounting.
	pub tuple_count: u64,
}

/// The in-transit unit between worker → queue → combiner. Column-name list
/// stands in for a shared tuple descriptor since there is no external type
/// system to consult.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroBatch {
	pub dst: EndpointId,
	pub cq: Option<CqId>,
	pub columns: Vec<String>,
	pub rows: Vec<Row>,
	pub acks: Vec<AckRef>,
	/// Reader CQ ids this batch fans out to, for a raw stream-ingestion
	/// batch bound for a worker. Empty for a worker→combiner batch, which is already
	/// addressed to one CQ via `cq`.
	#[serde(default)]
	pub readers: Vec<CqId>,
	bytes_used: usize,
}

impl MicroBatch {
	pub fn new(dst: EndpointId, cq: Option<CqId>, columns: Vec<String>) -> Self {
		MicroBatch {
			dst,
			cq,
			columns,
			rows: Vec::new(),
			acks: Vec::new(),
			readers: Vec::new(),
			bytes_used: 0,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.rows.is_empty()
	}

	/// Appends a row if doing so would not exceed the configured byte/row
	/// caps. Returns `false` (and does not push) when the batch is already
	/// full — the caller is expected to flush and open a fresh batch.
	pub fn try_push(&mut self, row: Row) -> bool {
		let row_bytes = row.approx_bytes();
		let max_bytes = *cnf::BATCH_MEM_KIB * 1024;
		if !self.rows.is_empty() && (self.bytes_used + row_bytes > max_bytes || self.rows.len() >= *cnf::BATCH_SIZE) {
			return false;
		}
		self.bytes_used += row_bytes;
		self.rows.push(row);
		true
	}

	pub fn requires_sync_commit(&self) -> bool {
		self.acks.iter().any(|a| a.level == AckLevel::SyncCommit)
	}

	pub fn requires_sync_receive(&self) -> bool {
		self.acks.iter().any(|a| matches!(a.level, AckLevel::SyncReceive | AckLevel::SyncCommit))
	}

	pub fn encode(&self) -> Result<Bytes> {
		Ok(Bytes::from(bincode::serialize(self)?))
	}

	pub fn decode(bytes: &[u8]) -> Result<MicroBatch> {
		Ok(bincode::deserialize(bytes)?)
	}
}
