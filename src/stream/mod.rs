//! The stream-insert fast path: the entry point used by
//! external producers, by transform output functions, and — via the
//! re-entrant chained variant — by combiners writing to an osrel without
//! risking ack-deadlock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::batch::{Ack, AckId, AckLevel, AckRef, AckRegistry, BatchSeq, MicroBatch, Row, Value};
use crate::catalog::{CqCatalog, StreamId};
use crate::cnf;
use crate::err::{Error, Result};
use crate::ipc::{EndpointId, Registry};
use crate::obs::{ProcKind, StatKey, StatsRegistry};
use crate::time::SizedClock;

/// Round-robin table of which worker endpoints currently ingest each
/// stream. Populated by the scheduler as it starts worker tasks.
#[derive(Clone, Default)]
pub struct StreamRoutes {
	routes: Arc<DashMap<StreamId, Vec<EndpointId>>>,
	cursor: Arc<DashMap<StreamId, AtomicUsize>>,
}

impl StreamRoutes {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&self, stream: StreamId, worker: EndpointId) {
		self.routes.entry(stream).or_default().push(worker);
	}

	pub fn unregister(&self, stream: StreamId, worker: EndpointId) {
		if let Some(mut list) = self.routes.get_mut(&stream) {
			list.retain(|&w| w != worker);
		}
	}

	/// Swaps every occurrence of `old` for `new` across every stream's
	/// route list, called after a worker respawn so streams that already
	/// pointed at the dead endpoint start reaching its replacement.
	pub fn replace_endpoint(&self, old: EndpointId, new: EndpointId) {
		for mut entry in self.routes.iter_mut() {
			for w in entry.value_mut().iter_mut() {
				if *w == old {
					*w = new;
				}
			}
		}
	}

	/// Picks the next worker endpoint for this stream, round-robin. A
	/// single call's rows all land on the same pick so within-call ordering
	/// is preserved per worker.
	pub fn pick(&self, stream: StreamId) -> Option<EndpointId> {
		let list = self.routes.get(&stream)?;
		if list.is_empty() {
			return None;
		}
		let counter = self.cursor.entry(stream).or_insert_with(|| AtomicUsize::new(0));
		let idx = counter.fetch_add(1, Ordering::Relaxed) % list.len();
		Some(list[idx])
	}
}

/// Everything `insert_into_stream` needs, bundled so call sites don't carry
/// six separate parameters.
#[derive(Clone)]
pub struct StreamInsertCtx {
	pub catalog: CqCatalog,
	pub routes: StreamRoutes,
	pub ipc: Registry,
	pub acks: AckRegistry,
	pub stats: StatsRegistry,
	pub clock: SizedClock,
	pub generation: Arc<AtomicU64>,
}

impl StreamInsertCtx {
	fn validate_schema(&self, stream_id: StreamId, rows: &[Row]) -> Result<()> {
		let stream = self.catalog.stream(stream_id)?;
		for row in rows {
			for col in row.columns.keys() {
				if !stream.known_column(col) {
					return Err(Error::SchemaMismatch {
						stream: stream.name.clone(),
						column: col.clone(),
					});
				}
			}
		}
		Ok(())
	}

	async fn stamp_arrival_async(&self, rows: &mut [Row]) {
		let now = self.clock.now().await;
		for row in rows.iter_mut() {
			if row.arrival_timestamp().is_none() {
				row.set(crate::catalog::Stream::ARRIVAL_TIMESTAMP, Value::Timestamp(now));
			}
		}
	}

	fn current_generation(&self) -> u64 {
		self.generation.load(Ordering::SeqCst)
	}
}

static NEXT_BATCH_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_batch_seq() -> BatchSeq {
	BatchSeq(NEXT_BATCH_SEQ.fetch_add(1, Ordering::Relaxed))
}

/// Builds and flushes micro-batches for `rows`, all carrying `ack_ref`,
/// addressed to `dst`. Returns the number of batches sent.
fn flush_rows(ipc: &Registry, dst: EndpointId, readers: Vec<crate::catalog::CqId>, columns: Vec<String>, rows: Vec<Row>, ack_ref: AckRef) -> Result<u64> {
	let mut sent = 0u64;
	let mut batch = MicroBatch::new(dst, None, columns.clone());
	batch.readers = readers.clone();
	for row in rows {
		if !batch.try_push(row.clone()) {
			batch.acks.push(ack_ref.clone());
			let bytes = batch.encode()?;
			if !ipc.send(dst, bytes) {
				tracing::trace!(target: "flowrelay::stream", dst, "ingestion send failed, dropping non-blocking");
			}
			sent += 1;
			batch = MicroBatch::new(dst, None, columns.clone());
			batch.readers = readers.clone();
			batch.try_push(row);
		}
	}
	if !batch.is_empty() {
		batch.acks.push(ack_ref);
		let bytes = batch.encode()?;
		if !ipc.send(dst, bytes) {
			tracing::trace!(target: "flowrelay::stream", dst, "ingestion send failed, dropping non-blocking");
		}
		sent += 1;
	}
	Ok(sent)
}

/// The top-level entry point. Validates the rows against the
/// target stream's schema, fans them out to a worker endpoint, and — unless
/// `level` is `Async` — waits for the matching ack to reach that level or
/// for the database generation counter to advance.
pub async fn insert_into_stream(ctx: &StreamInsertCtx, stream_id: StreamId, mut rows: Vec<Row>, level: AckLevel, target_filter: Option<&[crate::catalog::CqId]>) -> Result<()> {
	ctx.validate_schema(stream_id, &rows)?;
	ctx.stamp_arrival_async(&mut rows).await;

	let stream = ctx.catalog.stream(stream_id)?;
	let readers = ctx.catalog.readers_of(stream_id)?;
	let row_count = rows.len() as u64;
	let byte_count: u64 = rows.iter().map(|r| r.approx_bytes() as u64).sum();

	if readers.is_empty() {
		ctx.stats.record_stream_input(stream_id, row_count, 0, byte_count);
		return Ok(());
	}

	let mut reader_ids: Vec<crate::catalog::CqId> = readers.iter().map(crate::catalog::CqId).collect();
	if let Some(filter) = target_filter {
		reader_ids.retain(|id| filter.contains(id));
	}
	if reader_ids.is_empty() {
		ctx.stats.record_stream_input(stream_id, row_count, 0, byte_count);
		return Ok(());
	}

	let dst = ctx.routes.pick(stream_id).ok_or_else(|| Error::IpcUnknownEndpoint(0))?;
	let ack = ctx.acks.create(row_count, ctx.current_generation());
	let ack_ref = AckRef {
		id: ack.id,
		level,
		batch_seq: next_batch_seq(),
		tuple_count: row_count,
	};

	let sent = flush_rows(&ctx.ipc, dst, reader_ids, stream.columns.clone(), rows, ack_ref)?;
	ctx.stats.record_stream_input(stream_id, row_count, sent, byte_count);

	if level != AckLevel::Async {
		match ack.wait(level, || ctx.current_generation()).await {
			Ok(()) => {}
			Err(Error::LostAck) => {
				tracing::warn!(target: "flowrelay::stream", stream = %stream.name, "ack generation advanced mid-wait, tuples may be lost");
			}
			Err(e) => return Err(e),
		}
	}
	ctx.acks.remove(ack.id);
	Ok(())
}

/// Re-entrant variant used by a combiner writing to an osrel:
/// reuses the caller's ack instead of creating and waiting on a new one, so
/// a combiner's own write triggering downstream CQs can never deadlock
/// waiting on itself.
pub async fn insert_into_stream_chained(ctx: &StreamInsertCtx, stream_id: StreamId, mut rows: Vec<Row>, ack: &Arc<Ack>, level: AckLevel) -> Result<()> {
	ctx.validate_schema(stream_id, &rows)?;
	ctx.stamp_arrival_async(&mut rows).await;

	let stream = ctx.catalog.stream(stream_id)?;
	let readers = ctx.catalog.readers_of(stream_id)?;
	let row_count = rows.len() as u64;
	let byte_count: u64 = rows.iter().map(|r| r.approx_bytes() as u64).sum();

	if readers.is_empty() {
		ctx.stats.record_stream_input(stream_id, row_count, 0, byte_count);
		return Ok(());
	}
	let reader_ids: Vec<crate::catalog::CqId> = readers.iter().map(crate::catalog::CqId).collect();

	let dst = match ctx.routes.pick(stream_id) {
		Some(d) => d,
		None => return Ok(()),
	};
	let ack_ref = AckRef {
		id: ack.id,
		level,
		batch_seq: next_batch_seq(),
		tuple_count: row_count,
	};
	let sent = flush_rows(&ctx.ipc, dst, reader_ids, stream.columns.clone(), rows, ack_ref)?;
	ctx.stats.record_stream_input(stream_id, row_count, sent, byte_count);
	Ok(())
}

pub fn stat_key(kind: ProcKind, task: u32, cq: crate::catalog::CqId) -> StatKey {
	StatKey { kind, task, cq }
}
