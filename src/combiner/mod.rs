//! Combiner: merges worker partials with on-disk matrel state for one CQ
//! shard, drives the SW overlay engine, and forwards output-stream tuples.
//!
//! The per-CQ group lookup plan is a `quick_cache` entry holding a snapshot
//! of the `Cq` row, refreshed every ten seconds rather than relying on
//! external invalidation.

pub mod overlay;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use quick_cache::sync::Cache;

use crate::batch::{Ack, AckLevel, AckRef, AckRegistry, Row, Value};
use crate::catalog::{Cq, CqCatalog, CqId, OsrelId};
use crate::cnf;
use crate::err::Result;
use crate::ipc;
use crate::obs::{ProcKind, StatKey, StatsRegistry};
use crate::sketch::SketchState;
use crate::storage::{self, GroupKey, MatrelStore};
use crate::stream::StreamInsertCtx;
use crate::time::SizedClock;
use crate::wire::{ChangeRow, PartialBatch};

const CQ_CACHE_TTL: Duration = Duration::from_secs(10);

/// This crate's matrels and output streams share one numeric id space:
/// an osrel is just a `Stream` row a downstream CQ
/// can read from, so its id is reused directly as a `StreamId`.
fn osrel_stream_id(osrel: OsrelId) -> crate::catalog::StreamId {
	crate::catalog::StreamId(osrel.0)
}

struct CachedCq {
	cq: Cq,
	cached_at: std::time::Instant,
}

pub struct Combiner {
	pub task_id: u32,
	pub shard: u32,
	pub n_combiners: u32,
	endpoint: ipc::Endpoint,
	catalog: CqCatalog,
	store: MatrelStore,
	stream_ctx: StreamInsertCtx,
	acks: AckRegistry,
	stats: StatsRegistry,
	clock: SizedClock,
	cancel: tokio_util::sync::CancellationToken,
	cq_cache: Cache<CqId, CachedCq>,
	overlay: overlay::SwOverlayEngine,
}

impl Combiner {
	#[allow(clippy::too_many_arguments)]
	pub fn new(task_id: u32, shard: u32, n_combiners: u32, endpoint: ipc::Endpoint, catalog: CqCatalog, store: MatrelStore, stream_ctx: StreamInsertCtx, acks: AckRegistry, stats: StatsRegistry, clock: SizedClock, cancel: tokio_util::sync::CancellationToken) -> Self {
		Combiner {
			task_id,
			shard,
			n_combiners,
			endpoint,
			catalog,
			store,
			stream_ctx,
			acks,
			stats,
			clock,
			cancel,
			cq_cache: Cache::new(*cnf::MAX_CQS),
			overlay: overlay::SwOverlayEngine::new(),
		}
	}

	pub fn endpoint_id(&self) -> ipc::EndpointId {
		self.endpoint.id()
	}

	pub async fn run(mut self) {
		loop {
			if self.tick().await {
				break;
			}
		}
	}

	fn resolve_cq(&self, id: CqId) -> Option<Cq> {
		if let Some(cached) = self.cq_cache.get(&id) {
			if cached.cached_at.elapsed() < CQ_CACHE_TTL {
				return Some(cached.cq);
			}
		}
		let cq = self.catalog.cq(id).ok()?;
		self.cq_cache.insert(
			id,
			CachedCq {
				cq: cq.clone(),
				cached_at: std::time::Instant::now(),
			},
		);
		Some(cq)
	}

	/// One outer iteration: accumulates
	/// incoming partials, grouped and pre-merged per CQ, until either a
	/// synchronous-commit ack is seen or `commit_interval` has elapsed
	/// since the first unflushed row, then flushes.
	pub async fn tick(&mut self) -> bool {
		if self.cancel.is_cancelled() {
			return true;
		}
		let mut pending: HashMap<CqId, HashMap<GroupKey, crate::wire::PartialRow>> = HashMap::new();
		let mut pending_acks: Vec<AckRef> = Vec::new();
		let mut sync_commit = false;
		let mut first_unflushed_at: Option<tokio::time::Instant> = None;

		'outer: loop {
			let sleep = match first_unflushed_at {
				Some(start) => tokio::time::sleep_until(start + Duration::from_millis(*cnf::COMMIT_INTERVAL_MS)),
				None => tokio::time::sleep(Duration::from_secs(3600)),
			};
			tokio::pin!(sleep);
			tokio::select! {
				_ = self.cancel.cancelled() => break,
				_ = &mut sleep => break,
				frame = self.endpoint.recv_indefinite() => {
					match frame {
						None => break,
						Some(bytes) => {
							self.ingest_frame(bytes, &mut pending, &mut pending_acks, &mut sync_commit, &mut first_unflushed_at);
							if sync_commit {
								break 'outer;
							}
							loop {
								match self.endpoint.recv(Duration::from_millis(0)).await {
									Some(more) => {
										self.ingest_frame(more, &mut pending, &mut pending_acks, &mut sync_commit, &mut first_unflushed_at);
										if sync_commit {
											break 'outer;
										}
									}
									None => break 'outer,
								}
							}
						}
					}
				}
			}
		}

		self.flush(pending, &pending_acks).await;
		self.cancel.is_cancelled()
	}

	fn ingest_frame(&self, bytes: Bytes, pending: &mut HashMap<CqId, HashMap<GroupKey, crate::wire::PartialRow>>, pending_acks: &mut Vec<AckRef>, sync_commit: &mut bool, first_unflushed_at: &mut Option<tokio::time::Instant>) {
		let batch = match PartialBatch::decode(&bytes) {
			Ok(b) => b,
			Err(e) => {
				tracing::warn!(target: "flowrelay::combiner", error = %e, "failed to decode inbound partial batch");
				return;
			}
		};
		if !batch.rows.is_empty() && first_unflushed_at.is_none() {
			*first_unflushed_at = Some(tokio::time::Instant::now());
		}
		if batch.acks.iter().any(|a| a.level == AckLevel::SyncCommit) {
			*sync_commit = true;
		}
		pending_acks.extend(batch.acks.iter().cloned());

		let group_acc = pending.entry(batch.cq).or_default();
		for row in batch.rows {
			let key = storage::encode_group(&row.group);
			match group_acc.get_mut(&key) {
				Some(existing) => {
					for (col, state) in row.state {
						match existing.state.get_mut(&col) {
							Some(s) => {
								if let Err(e) = s.combine(&state) {
									tracing::warn!(target: "flowrelay::combiner", error = %e, "incompatible sketch state on merge, keeping prior value");
								}
							}
							None => {
								existing.state.insert(col, state);
							}
						}
					}
					if row.arrival_ts.is_some() {
						existing.arrival_ts = row.arrival_ts;
					}
					existing.batch_seq = existing.batch_seq.max(row.batch_seq);
				}
				None => {
					group_acc.insert(key, row);
				}
			}
		}
	}

	/// Per-CQ transaction boundary: a failure aborts only
	/// this CQ's share of the flush and is logged + counted; other CQs in
	/// the same flush still commit.
	async fn flush(&mut self, pending: HashMap<CqId, HashMap<GroupKey, crate::wire::PartialRow>>, pending_acks: &[AckRef]) {
		let mut any_cq_failed = false;
		for (cq_id, groups) in pending {
			let cq = match self.resolve_cq(cq_id) {
				Some(c) if c.active => c,
				_ => continue,
			};
			let key = StatKey {
				kind: ProcKind::Combiner,
				task: self.task_id,
				cq: cq_id,
			};
			let mut tx = self.store.begin(true).await;
			let outcome = self.sync_cq_groups(&mut tx, &cq, groups, key, pending_acks).await;
			match outcome {
				Ok(()) => {
					if let Err(e) = tx.commit().await {
						tracing::warn!(target: "flowrelay::combiner", cq = %cq_id, error = %e, "matrel commit failed");
						any_cq_failed = true;
					}
				}
				Err(e) => {
					tracing::warn!(target: "flowrelay::combiner", cq = %cq_id, error = %e, "combine step failed, discarding this cq's share of the flush");
					self.stats.record_error(key);
					let _ = tx.cancel().await;
					any_cq_failed = true;
				}
			}
		}

		for ack_ref in pending_acks {
			if let Some(ack) = self.acks.get(ack_ref.id) {
				ack.bump_combiner_received(ack_ref.tuple_count);
				if !any_cq_failed {
					ack.bump_combiner_committed(ack_ref.tuple_count);
				}
			}
		}
	}

	async fn sync_cq_groups(&mut self, tx: &mut storage::Transaction, cq: &Cq, groups: HashMap<GroupKey, crate::wire::PartialRow>, key: StatKey, pending_acks: &[AckRef]) -> Result<()> {
		let plan = &cq.def.plan;
		let skip_suppression = plan.aggregates.iter().any(|a| a.distinct);
		let mut changes: Vec<ChangeRow> = Vec::new();
		let mut n_inserted = 0u64;
		let mut n_updated = 0u64;

		for partial in groups.into_values() {
			let existing = tx.get_by_group(cq.def.matrel, &partial.group)?;
			match existing {
				Some(row) => {
					if let (Some(seen), Some(incoming)) = (row.last_batch_seq, partial.batch_seq) {
						if incoming <= seen {
							tracing::trace!(target: "flowrelay::combiner", cq = %cq.id, "dropping replayed batch, already committed up to this sequence");
							continue;
						}
					}
					let mut combined = row.state.clone();
					for (col, state) in &partial.state {
						match combined.get_mut(col) {
							Some(s) => s.combine(state)?,
							None => {
								combined.insert(col.clone(), state.clone());
							}
						}
					}
					if !skip_suppression && row.state_equals(&combined) {
						continue;
					}
					let arrival_ts = partial.arrival_ts.or(row.arrival_ts);
					let last_batch_seq = partial.batch_seq.max(row.last_batch_seq);
					let updated = tx.update_row(cq.def.matrel, row.pk, combined, arrival_ts, last_batch_seq)?;
					n_updated += 1;
					changes.push(ChangeRow {
						old: Some(materialize_row(plan, &row.group, &row.state)),
						new: Some(materialize_row(plan, &updated.group, &updated.state)),
						delta: Some(materialize_row(plan, &partial.group, &partial.state)),
					});
					if cq.def.sw.is_some() {
						self.overlay.upsert_step(cq.id, updated.group.clone(), updated.state.clone(), updated.arrival_ts);
					}
				}
				None => {
					let inserted = tx.insert_row(cq.def.matrel, partial.group.clone(), partial.state.clone(), partial.arrival_ts, partial.batch_seq)?;
					n_inserted += 1;
					changes.push(ChangeRow {
						old: None,
						new: Some(materialize_row(plan, &inserted.group, &inserted.state)),
						delta: Some(materialize_row(plan, &partial.group, &partial.state)),
					});
					if cq.def.sw.is_some() {
						self.overlay.upsert_step(cq.id, inserted.group.clone(), inserted.state.clone(), inserted.arrival_ts);
					}
				}
			}
		}

		self.stats.record_insert(key, n_inserted, 0);
		self.stats.record_update(key, n_updated, 0);

		if cq.def.sw.is_some() {
			let now = self.clock.now().await;
			let sw = cq.def.sw.expect("checked by is_some above");
			if let Ok(cutoff) = now.checked_sub(sw.interval) {
				let since = cutoff;
				self.overlay.sync_from_matrel(cq.id, tx, cq.def.matrel, since, self.shard, self.n_combiners)?;
				changes.extend(self.overlay.tick(cq.id, plan, cutoff));
			}
		}

		if !changes.is_empty() {
			if let Some(osrel) = cq.def.osrel {
				self.emit_changes(osrel, changes, pending_acks).await?;
			}
		}
		Ok(())
	}

	async fn emit_changes(&self, osrel: OsrelId, changes: Vec<ChangeRow>, pending_acks: &[AckRef]) -> Result<()> {
		let stream_id = osrel_stream_id(osrel);
		let mut rows = Vec::with_capacity(changes.len());
		for change in &changes {
			rows.push(encode_change_row(change)?);
		}
		let chained: Option<Arc<Ack>> = pending_acks.first().and_then(|r| self.acks.get(r.id));
		match chained {
			Some(ack) => crate::stream::insert_into_stream_chained(&self.stream_ctx, stream_id, rows, &ack, AckLevel::Async).await,
			None => crate::stream::insert_into_stream(&self.stream_ctx, stream_id, rows, AckLevel::Async, None).await,
		}
	}
}

fn materialize_row(plan: &crate::catalog::WorkerPlanSpec, group: &[Value], state: &std::collections::BTreeMap<String, SketchState>) -> Row {
	let mut row = Row::new();
	for (col, v) in plan.group_by.iter().zip(group.iter()) {
		row.set(col.clone(), v.clone());
	}
	for (col, s) in state {
		row.set(col.clone(), finalized_to_value(s));
	}
	row
}

fn finalized_to_value(state: &SketchState) -> Value {
	match state.finalize() {
		crate::sketch::FinalizedValue::U64(n) => Value::I64(n as i64),
		crate::sketch::FinalizedValue::F64(f) => Value::F64(f),
		crate::sketch::FinalizedValue::Bool(b) => Value::Bool(b),
		crate::sketch::FinalizedValue::TopK(entries) => Value::Str(format!("{entries:?}")),
		crate::sketch::FinalizedValue::Buckets(entries) => Value::Str(format!("{entries:?}")),
	}
}

fn encode_change_row(change: &ChangeRow) -> Result<Row> {
	let mut row = Row::new();
	row.set("old", match &change.old {
		Some(r) => Value::Bytes(bincode::serialize(r)?),
		None => Value::Null,
	});
	row.set("new", match &change.new {
		Some(r) => Value::Bytes(bincode::serialize(r)?),
		None => Value::Null,
	});
	row.set("delta", match &change.delta {
		Some(r) => Value::Bytes(bincode::serialize(r)?),
		None => Value::Null,
	});
	Ok(row)
}
