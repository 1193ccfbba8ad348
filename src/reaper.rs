//! Reaper: periodically deletes matrel rows that have fallen outside a CQ's
//! TTL window.
//!
//! Deletes run through `storage::Transaction::delete_expired_batch`'s
//! `FOR UPDATE SKIP LOCKED` batch semantics. The matrel carries exactly one
//! timestamp field per row (`arrival_ts`), so every TTL check here is
//! against that field regardless of the CQ's configured column name; see
//! DESIGN.md.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::catalog::{Cq, CqCatalog, CqId};
use crate::cnf;
use crate::obs::{ProcKind, StatKey, StatsRegistry};
use crate::storage::MatrelStore;
use crate::time::{SizedClock, Timestamp};

/// Fallback sleep when no TTL CQs are currently registered.
const DEFAULT_SLEEP_SECS: u64 = 2;

#[derive(Default)]
struct ReaperCqState {
	last_expired: Option<Timestamp>,
	last_deleted: u64,
}

pub struct Reaper {
	pub task_id: u32,
	catalog: CqCatalog,
	store: MatrelStore,
	clock: SizedClock,
	stats: StatsRegistry,
	cancel: CancellationToken,
	state: HashMap<CqId, ReaperCqState>,
}

impl Reaper {
	pub fn new(task_id: u32, catalog: CqCatalog, store: MatrelStore, clock: SizedClock, stats: StatsRegistry, cancel: CancellationToken) -> Self {
		Reaper {
			task_id,
			catalog,
			store,
			clock,
			stats,
			cancel,
			state: HashMap::new(),
		}
	}

	pub async fn run(mut self) {
		loop {
			if self.tick().await {
				break;
			}
		}
	}

	/// One outer iteration: enumerate TTL CQs, run a delete
	/// cycle against every one due for expiration, then — if this pass
	/// deleted nothing anywhere — sleep `min_ttl` seconds and reset each
	/// CQ's `last_deleted` before returning to enumeration. A CQ whose prior
	/// pass deleted rows is revisited immediately without a sleep, mirroring
	/// `should_expire`'s `last_deleted > 0` condition.
	pub async fn tick(&mut self) -> bool {
		if self.cancel.is_cancelled() {
			return true;
		}

		let ttl_cqs = self.catalog.ttl_cqs();
		if ttl_cqs.is_empty() {
			return self.sleep_or_cancel(Duration::from_secs(DEFAULT_SLEEP_SECS)).await;
		}

		let min_ttl = ttl_cqs
			.iter()
			.filter_map(|cq| cq.def.ttl.as_ref())
			.map(|ttl| ttl.seconds)
			.min()
			.unwrap_or(DEFAULT_SLEEP_SECS)
			.max(1);

		let now = self.clock.now().await;
		let mut any_deleted = false;
		for cq in &ttl_cqs {
			if self.cancel.is_cancelled() {
				return true;
			}
			if self.should_expire(cq, now) {
				let deleted = self.delete_cycle(cq).await;
				if deleted > 0 {
					any_deleted = true;
				}
				self.record_pass(cq.id, deleted).await;
			}
		}

		if !any_deleted {
			for entry in self.state.values_mut() {
				entry.last_deleted = 0;
			}
			return self.sleep_or_cancel(Duration::from_secs(min_ttl)).await;
		}
		false
	}

	async fn sleep_or_cancel(&self, d: Duration) -> bool {
		tokio::select! {
			_ = self.cancel.cancelled() => true,
			_ = tokio::time::sleep(d) => false,
		}
	}

	/// `should_expire`: true on a CQ whose previous pass deleted rows (there
	/// may be more past the batch limit), or whose last expiration check is
	/// older than `ttl_expiration_threshold_pct` of its TTL.
	fn should_expire(&self, cq: &Cq, now: Timestamp) -> bool {
		let Some(ttl) = &cq.def.ttl else { return false };
		let Some(entry) = self.state.get(&cq.id) else { return true };
		if entry.last_deleted > 0 {
			return true;
		}
		match entry.last_expired {
			None => true,
			Some(last) => {
				let threshold_ms = ttl.seconds * 1000 * *cnf::TTL_EXPIRATION_THRESHOLD_PCT as u64 / 100;
				now.value.saturating_sub(last.value) >= threshold_ms
			}
		}
	}

	/// Runs one TTL expiration cycle for `cq` in its own transaction,
	/// draining batches until one returns zero rows. Returns the total rows
	/// deleted this cycle.
	async fn delete_cycle(&mut self, cq: &Cq) -> u64 {
		let Some(ttl) = &cq.def.ttl else { return 0 };
		let now = self.clock.now().await;
		let cutoff = match now.checked_sub(Duration::from_secs(ttl.seconds)) {
			Ok(ts) => ts,
			Err(_) => return 0,
		};

		let mut tx = self.store.begin(true).await;
		let mut total = 0u64;
		loop {
			let batch = match tx.delete_expired_batch(cq.def.matrel, cutoff, *cnf::TTL_EXPIRATION_BATCH_SIZE) {
				Ok(rows) => rows,
				Err(e) => {
					tracing::warn!(target: "flowrelay::reaper", cq = %cq.id, error = %e, "ttl delete batch failed");
					let _ = tx.cancel().await;
					self.stats.record_error(StatKey { kind: ProcKind::Reaper, task: self.task_id, cq: cq.id });
					return total;
				}
			};
			let n = batch.len() as u64;
			total += n;
			if n == 0 {
				break;
			}
		}
		if let Err(e) = tx.commit().await {
			tracing::warn!(target: "flowrelay::reaper", cq = %cq.id, error = %e, "ttl delete commit failed");
		}
		self.stats.record_execution(StatKey { kind: ProcKind::Reaper, task: self.task_id, cq: cq.id }, 0);
		total
	}

	async fn record_pass(&mut self, cq: CqId, deleted: u64) {
		let now = self.clock.now().await;
		let entry = self.state.entry(cq).or_default();
		entry.last_expired = Some(now);
		entry.last_deleted = deleted;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::batch::Value;
	use crate::catalog::{AggregateSpec, CqAction, CqDefinition, CqKind, MatrelId, TtlSpec, WorkerPlanSpec};
	use crate::sketch::SketchKind;
	use crate::time::FakeClock;

	fn plan() -> WorkerPlanSpec {
		WorkerPlanSpec {
			group_by: vec!["x".to_string()],
			aggregates: vec![AggregateSpec {
				output_column: "count".to_string(),
				input_column: None,
				kind: SketchKind::Count,
				distinct: false,
			}],
		}
	}

	fn ttl_cq(catalog: &CqCatalog, seconds: u64) -> CqId {
		let stream = catalog.create_stream("events", vec!["x".to_string()]);
		let def = CqDefinition {
			kind: CqKind::View,
			action: CqAction::Materialize,
			source_stream: stream,
			matrel: MatrelId(1),
			osrel: None,
			pk_index: "pk".into(),
			lookup_index: None,
			seqrel: None,
			ttl: Some(TtlSpec { column: "arrival_timestamp".into(), seconds }),
			sw: None,
			fillfactor: 50,
			tgfn: None,
			tgargs: vec![],
			definition: serde_json::json!({}),
			plan: plan(),
		};
		catalog.create_cq(def).unwrap()
	}

	#[tokio::test]
	async fn expires_rows_past_the_ttl_cutoff() {
		let catalog = CqCatalog::new();
		let cq_id = ttl_cq(&catalog, 10);
		let store = MatrelStore::new();

		let mut tx = store.begin(true).await;
		tx.insert_row(MatrelId(1), vec![Value::I64(1)], Default::default(), Some(Timestamp::from_millis(0)), None).unwrap();
		tx.insert_row(MatrelId(1), vec![Value::I64(2)], Default::default(), Some(Timestamp::from_millis(20_000)), None).unwrap();
		tx.commit().await.unwrap();

		let clock = SizedClock::Fake(FakeClock::new(Timestamp::from_millis(15_000)));
		let mut reaper = Reaper::new(0, catalog, store.clone(), clock, StatsRegistry::new(), CancellationToken::new());
		reaper.tick().await;

		let mut tx = store.begin(false).await;
		assert_eq!(tx.row_count(MatrelId(1)).unwrap(), 1);
		assert!(tx.get_by_group(MatrelId(1), &[Value::I64(1)]).unwrap().is_none());
		assert!(tx.get_by_group(MatrelId(1), &[Value::I64(2)]).unwrap().is_some());
	}

	#[tokio::test]
	async fn no_ttl_cqs_does_not_panic() {
		let catalog = CqCatalog::new();
		let mut reaper = Reaper::new(0, catalog, MatrelStore::new(), SizedClock::Fake(FakeClock::new(Timestamp::ZERO)), StatsRegistry::new(), CancellationToken::new());
		assert!(!reaper.tick().await);
	}

	#[tokio::test]
	async fn cancellation_stops_the_loop() {
		let catalog = CqCatalog::new();
		let cancel = CancellationToken::new();
		let mut reaper = Reaper::new(0, catalog, MatrelStore::new(), SizedClock::Fake(FakeClock::new(Timestamp::ZERO)), StatsRegistry::new(), cancel.clone());
		cancel.cancel();
		assert!(reaper.tick().await);
	}
}
