//! Crate-wide error type.
//!
//! Background task loops (worker/combiner/queue/reaper/scheduler) never
//! surface these past their own loop boundary — they log, bump a counter,
//! and continue. `Error` only escapes at the catalog-API / `insert_into_stream`
//! boundary.

use std::fmt;

use crate::catalog::CqId;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("ipc: send to endpoint {0} failed, peer busy or gone")]
	IpcSendFailed(u64),

	#[error("ipc: endpoint {0} is not registered")]
	IpcUnknownEndpoint(u64),

	#[error("plan execution failed for cq {cq}: {reason}")]
	PlanExecution { cq: CqId, reason: String },

	#[error("stale catalog reference: {0}")]
	StaleCatalog(String),

	#[error("not enough task budget: need {needed}, have {available}")]
	InsufficientTaskBudget { needed: usize, available: usize },

	#[error("ack generation advanced while waiting; tuples may be lost")]
	LostAck,

	#[error("schema mismatch on stream {stream}: unknown column {column}")]
	SchemaMismatch { stream: String, column: String },

	#[error("catalog: cq {0} not found")]
	CqNotFound(CqId),

	#[error("catalog: stream {0} not found")]
	StreamNotFound(crate::catalog::StreamId),

	#[error("catalog: too many continuous queries, limit is {0}")]
	TooManyCqs(usize),

	#[error("catalog: sw and ttl are mutually exclusive on a single cq")]
	SwTtlConflict,

	#[error("catalog: sw step must be >= 1 second")]
	SwStepTooSmall,

	#[error("storage: transaction already finished")]
	TxFinished,

	#[error("storage: transaction is read-only")]
	TxReadonly,

	#[error("storage: key not found")]
	KeyNotFound,

	#[error("storage: key already exists")]
	KeyExists,

	#[error("sketch: cannot combine incompatible sketch variants ({0} vs {1})")]
	SketchMismatch(&'static str, &'static str),

	#[error("sketch: corrupt serialized state: {0}")]
	SketchDecode(String),

	#[error("timestamp overflow")]
	TimestampOverflow,

	#[error("serialization failed: {0}")]
	Encode(#[from] bincode::Error),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Wraps an error with the CQ it occurred under, for use at combiner/worker
/// call sites that need to attach context before bumping the per-CQ error
/// counter and continuing.
#[derive(Debug)]
pub struct CqError {
	pub cq: CqId,
	pub source: Error,
}

impl fmt::Display for CqError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "cq {}: {}", self.cq, self.source)
	}
}

impl std::error::Error for CqError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		Some(&self.source)
	}
}
