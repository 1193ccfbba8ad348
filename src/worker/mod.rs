//! Worker: applies each active CQ's partial-aggregate plan to a stream
//! micro-batch, hash-shards the result by group, and forwards partial
//! transition states to the owning combiner.
//!
//! The batch-collection loop enforces a `max_wait` cap, flushes immediately
//! on a synchronous ack, and checks for a pending shutdown every outer
//! iteration.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::batch::{AckRef, MicroBatch, Value};
use crate::catalog::{Cq, CqCatalog, CqId};
use crate::cnf;
use crate::ipc::{self, EndpointId};
use crate::obs::{ProcKind, StatKey, StatsRegistry};
use crate::sketch::{SketchKind, SketchState};
use crate::storage::{encode_group, hash_group};
use crate::wire::{CombinerRoutes, PartialBatch, PartialRow};

/// Per-group accumulator, keyed by the group's canonical byte encoding so
/// repeated rows for the same group within one micro-batch merge locally
/// before ever reaching the combiner.
type GroupAcc = HashMap<Vec<u8>, PartialRow>;

pub struct Worker {
	pub task_id: u32,
	endpoint: ipc::Endpoint,
	catalog: CqCatalog,
	combiner_routes: CombinerRoutes,
	queue_endpoint: Option<EndpointId>,
	acks: crate::batch::AckRegistry,
	stats: StatsRegistry,
	cancel: CancellationToken,
}

impl Worker {
	pub fn new(task_id: u32, endpoint: ipc::Endpoint, catalog: CqCatalog, combiner_routes: CombinerRoutes, queue_endpoint: Option<EndpointId>, acks: crate::batch::AckRegistry, stats: StatsRegistry, cancel: CancellationToken) -> Self {
		Worker {
			task_id,
			endpoint,
			catalog,
			combiner_routes,
			queue_endpoint,
			acks,
			stats,
			cancel,
		}
	}

	pub fn endpoint_id(&self) -> EndpointId {
		self.endpoint.id()
	}

	pub async fn run(mut self) {
		loop {
			if self.tick().await {
				break;
			}
		}
	}

	/// One outer iteration: collect inbound frames until `max_wait`
	/// elapses, sigterm is pending, or a synchronous-receive ack forces an
	/// immediate flush; then flush everything accumulated. Returns `true`
	/// once the worker should stop.
	pub async fn tick(&mut self) -> bool {
		if self.cancel.is_cancelled() {
			return true;
		}
		let mut acc: HashMap<CqId, GroupAcc> = HashMap::new();
		let mut pending_acks: Vec<AckRef> = Vec::new();
		let mut synchronous = false;

		let deadline = tokio::time::sleep(Duration::from_millis(*cnf::MAX_WAIT_MS));
		tokio::pin!(deadline);
		loop {
			tokio::select! {
				_ = self.cancel.cancelled() => break,
				_ = &mut deadline => break,
				frame = self.endpoint.recv_indefinite() => {
					match frame {
						None => break,
						Some(bytes) => {
							let batch = match MicroBatch::decode(&bytes) {
								Ok(b) => b,
								Err(e) => {
									tracing::warn!(target: "flowrelay::worker", error = %e, "failed to decode inbound micro-batch");
									continue;
								}
							};
							let sync_receive = batch.requires_sync_receive();
							pending_acks.extend(batch.acks.iter().cloned());
							self.apply_batch(&batch, &mut acc);
							if sync_receive {
								synchronous = true;
								break;
							}
						}
					}
				}
			}
		}

		self.flush(acc, &pending_acks, synchronous).await;
		for ack_ref in &pending_acks {
			if let Some(ack) = self.acks.get(ack_ref.id) {
				ack.bump_worker_received(ack_ref.tuple_count);
			}
		}
		self.cancel.is_cancelled()
	}

	/// Projects every row onto each active reader CQ's partial-aggregate
	/// plan. A plan error is isolated per CQ:
	/// log, bump the CQ's error counter, drop this CQ's contribution from
	/// the batch, and continue with the next reader.
	fn apply_batch(&self, batch: &MicroBatch, acc: &mut HashMap<CqId, GroupAcc>) {
		let batch_seq = batch.acks.iter().map(|a| a.batch_seq).max();
		for &cq_id in &batch.readers {
			let cq = match self.catalog.cq(cq_id) {
				Ok(c) if c.active => c,
				_ => continue,
			};
			let key = StatKey {
				kind: ProcKind::Worker,
				task: self.task_id,
				cq: cq_id,
			};
			match Self::project_rows(&cq, &batch.rows, batch_seq, acc.entry(cq_id).or_default()) {
				Ok(n) => self.stats.record_input(key, n, 0),
				Err(e) => {
					tracing::warn!(target: "flowrelay::worker", cq = %cq_id, error = %e, "partial-aggregate plan execution failed, discarding this cq's share of the batch");
					self.stats.record_error(key);
					acc.remove(&cq_id);
				}
			}
		}
	}

	fn project_rows(cq: &Cq, rows: &[crate::batch::Row], batch_seq: Option<crate::batch::BatchSeq>, group_acc: &mut GroupAcc) -> crate::err::Result<u64> {
		let plan = &cq.def.plan;
		for row in rows {
			let group: Vec<Value> = if plan.is_grouped() {
				plan.group_by.iter().map(|c| row.get(c)).collect()
			} else {
				vec![Value::I64(cq.id.0 as i64)]
			};
			let key = encode_group(&group);
			let group_hash = hash_group(&group);
			let arrival_ts = row.arrival_timestamp();

			let partial = group_acc.entry(key).or_insert_with(|| PartialRow {
				group: group.clone(),
				group_hash,
				state: plan.aggregates.iter().map(|a| (a.output_column.clone(), SketchState::init(a.kind))).collect(),
				arrival_ts,
				batch_seq,
			});
			if arrival_ts.is_some() {
				partial.arrival_ts = arrival_ts;
			}
			partial.batch_seq = partial.batch_seq.max(batch_seq);
			for agg in &plan.aggregates {
				let value = match &agg.input_column {
					Some(col) => Self::coerce(row.get(col), agg.kind),
					None => Value::Bool(true),
				};
				if let Some(state) = partial.state.get_mut(&agg.output_column) {
					state.add(&value);
				}
			}
		}
		Ok(rows.len() as u64)
	}

	/// Explicit-cast-then-text-reparse coercion, collapsed to
	/// the one coercion this crate's type system actually needs: numeric
	/// sketches get a best-effort float, everything else takes the raw
	/// value (hash-based sketches don't care about numeric type).
	fn coerce(value: Value, kind: SketchKind) -> Value {
		match kind {
			SketchKind::Sum | SketchKind::TDigest | SketchKind::BucketAgg => value.coerce_to_f64(),
			_ => value,
		}
	}

	/// Closes every non-empty outbound batch and sends it, hash-sharded by
	/// group to the owning combiner. When `synchronous`, also performs the
	/// sync-flush handshake: an empty flush batch carrying the
	/// same acks is sent to every combiner shard this worker knows about
	/// that wasn't otherwise touched this round, so the ack cannot be
	/// satisfied until all downstream shards have drained prior work.
	async fn flush(&self, acc: HashMap<CqId, GroupAcc>, pending_acks: &[AckRef], synchronous: bool) {
		let mut touched: HashMap<CqId, HashSet<u32>> = HashMap::new();

		for (cq_id, groups) in acc {
			let n_combiners = match self.combiner_routes.n_combiners(cq_id) {
				Some(n) if n > 0 => n as u64,
				_ => continue,
			};
			let mut shard_batches: HashMap<u32, PartialBatch> = HashMap::new();
			for partial in groups.into_values() {
				let shard = (partial.group_hash % n_combiners) as u32;
				let dst = match self.combiner_routes.shard_endpoint(cq_id, shard) {
					Some(d) => d,
					None => continue,
				};
				shard_batches.entry(shard).or_insert_with(|| PartialBatch::new(dst, cq_id)).rows.push(partial);
				touched.entry(cq_id).or_default().insert(shard);
			}
			for (_, mut batch) in shard_batches {
				batch.acks = pending_acks.to_vec();
				self.send_partial_batch(batch);
			}
		}

		if synchronous {
			for cq_id in self.combiner_routes.cqs() {
				let n_combiners = self.combiner_routes.n_combiners(cq_id).unwrap_or(0) as u32;
				for shard in 0..n_combiners {
					if touched.get(&cq_id).map(|s| s.contains(&shard)).unwrap_or(false) {
						continue;
					}
					if let Some(dst) = self.combiner_routes.shard_endpoint(cq_id, shard) {
						let mut flush_batch = PartialBatch::new(dst, cq_id);
						flush_batch.acks = pending_acks.to_vec();
						self.send_partial_batch(flush_batch);
					}
				}
			}
		}
	}

	/// Non-blocking send straight to the combiner endpoint; on back-
	/// pressure, re-frame for the queue process rather than dropping the
	/// batch outright.
	fn send_partial_batch(&self, batch: PartialBatch) {
		if batch.rows.is_empty() && batch.acks.is_empty() {
			return;
		}
		let dst = batch.dst;
		let bytes = match batch.encode() {
			Ok(b) => b,
			Err(e) => {
				tracing::warn!(target: "flowrelay::worker", error = %e, "failed to encode partial batch");
				return;
			}
		};
		if self.endpoint.send(dst, bytes.clone()) {
			return;
		}
		if let Some(queue) = self.queue_endpoint {
			let framed = crate::ipc::Frame::encode(dst, bytes);
			if !self.endpoint.send(queue, framed) {
				tracing::trace!(target: "flowrelay::worker", dst, "combiner and queue both back-pressured, dropping (transient-ipc)");
			}
		} else {
			tracing::trace!(target: "flowrelay::worker", dst, "combiner back-pressured and no queue configured, dropping (transient-ipc)");
		}
	}
}
