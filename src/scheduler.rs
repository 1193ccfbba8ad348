//! Scheduler: owns each database's process table, spawning and restarting
//! its worker/combiner/queue/reaper tasks and bumping the generation counter
//! producers use to detect a lost ack.
//!
//! "Processes" here are tokio tasks rather than forked postmaster
//! background workers — see DESIGN.md.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batch::AckRegistry;
use crate::catalog::{CqCatalog, CqId, StreamId};
use crate::cnf;
use crate::combiner::Combiner;
use crate::err::{Error, Result};
use crate::ipc::{self, EndpointId};
use crate::obs::{heartbeat, StatsRegistry};
use crate::queue::Queue;
use crate::reaper::Reaper;
use crate::storage::MatrelStore;
use crate::stream::{StreamInsertCtx, StreamRoutes};
use crate::time::SizedClock;
use crate::wire::CombinerRoutes;
use crate::worker::Worker;

const TARGET: &str = "flowrelay::scheduler";
const TICK: Duration = Duration::from_secs(1);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3600);

struct TaskSlot {
	endpoint: EndpointId,
	cancel: CancellationToken,
	handle: JoinHandle<()>,
}

impl TaskSlot {
	fn is_dead(&self) -> bool {
		self.handle.is_finished()
	}
}

/// Per-database runtime: the catalog, matrel store, routing tables, and
/// ack/stats registries a database's tasks share, plus the live process
/// table.
pub struct DbRuntime {
	pub name: String,
	pub catalog: CqCatalog,
	pub store: MatrelStore,
	pub stream_routes: StreamRoutes,
	pub combiner_routes: CombinerRoutes,
	pub acks: AckRegistry,
	pub stats: StatsRegistry,
	pub generation: Arc<AtomicU64>,
	ipc: ipc::Registry,
	clock: SizedClock,
	workers: std::sync::Mutex<Vec<TaskSlot>>,
	combiners: std::sync::Mutex<Vec<TaskSlot>>,
	queues: std::sync::Mutex<Vec<TaskSlot>>,
	reapers: std::sync::Mutex<Vec<TaskSlot>>,
}

impl DbRuntime {
	fn stream_insert_ctx(&self) -> StreamInsertCtx {
		StreamInsertCtx {
			catalog: self.catalog.clone(),
			routes: self.stream_routes.clone(),
			ipc: self.ipc.clone(),
			acks: self.acks.clone(),
			stats: self.stats.clone(),
			clock: self.clock.clone(),
			generation: self.generation.clone(),
		}
	}

	/// Wires a newly created stream to every worker endpoint this database
	/// currently runs, round-robin. The scheduler is the only
	/// component that knows the live worker pool; query-definition handling
	/// is expected to call this right after `CqCatalog::create_stream`.
	pub fn register_stream(&self, stream: StreamId) {
		for slot in self.workers.lock().unwrap().iter() {
			self.stream_routes.register(stream, slot.endpoint);
		}
	}

	/// Wires a newly created CQ's shards to this database's fixed combiner
	/// endpoint list (shard = `hash(group) mod n_combiners`, so a worker's
	/// sharding and a combiner's own shard index always agree). Called by
	/// the same seam as [`Self::register_stream`], right after
	/// `CqCatalog::create_cq`.
	pub fn register_cq(&self, cq: CqId) {
		for (shard, slot) in self.combiners.lock().unwrap().iter().enumerate() {
			self.combiner_routes.register(cq, shard as u32, slot.endpoint);
		}
	}

	fn bump_generation(&self) {
		self.generation.fetch_add(1, Ordering::SeqCst);
	}

	fn queue_endpoint(&self) -> Option<EndpointId> {
		self.queues.lock().unwrap().first().map(|s| s.endpoint)
	}

	fn spawn_worker(self: &Arc<Self>, task_id: u32) -> TaskSlot {
		let endpoint = self.ipc.bind(*cnf::IPC_HWM);
		let endpoint_id = endpoint.id();
		let cancel = CancellationToken::new();
		let worker = Worker::new(
			task_id,
			endpoint,
			self.catalog.clone(),
			self.combiner_routes.clone(),
			self.queue_endpoint(),
			self.acks.clone(),
			self.stats.clone(),
			cancel.clone(),
		);
		let handle = tokio::spawn(worker.run());
		TaskSlot { endpoint: endpoint_id, cancel, handle }
	}

	fn spawn_combiner(self: &Arc<Self>, shard: u32, n_combiners: u32) -> TaskSlot {
		let endpoint = self.ipc.bind(*cnf::IPC_HWM);
		let endpoint_id = endpoint.id();
		let cancel = CancellationToken::new();
		let combiner = Combiner::new(
			shard,
			shard,
			n_combiners,
			endpoint,
			self.catalog.clone(),
			self.store.clone(),
			self.stream_insert_ctx(),
			self.acks.clone(),
			self.stats.clone(),
			self.clock.clone(),
			cancel.clone(),
		);
		let handle = tokio::spawn(combiner.run());
		TaskSlot { endpoint: endpoint_id, cancel, handle }
	}

	fn spawn_queue(self: &Arc<Self>, task_id: u32) -> TaskSlot {
		let endpoint = self.ipc.bind(*cnf::IPC_HWM);
		let endpoint_id = endpoint.id();
		let cancel = CancellationToken::new();
		let queue = Queue::new(task_id, endpoint, cancel.clone());
		let handle = tokio::spawn(queue.run());
		TaskSlot { endpoint: endpoint_id, cancel, handle }
	}

	/// Reapers don't take part in the data-plane IPC mesh, so this slot's endpoint id is a placeholder —
	/// `0`, never allocated by [`crate::ipc::Registry`] — kept only so every
	/// process-table entry has the same shape.
	fn spawn_reaper(self: &Arc<Self>, task_id: u32) -> TaskSlot {
		let cancel = CancellationToken::new();
		let reaper = Reaper::new(task_id, self.catalog.clone(), self.store.clone(), self.clock.clone(), self.stats.clone(), cancel.clone());
		let handle = tokio::spawn(reaper.run());
		TaskSlot { endpoint: 0, cancel, handle }
	}

	fn reap_and_respawn(self: &Arc<Self>) {
		self.respawn(&self.workers, |task_id| self.spawn_worker(task_id), |old, new| self.stream_routes.replace_endpoint(old, new));
		let n_combiners = self.combiners.lock().unwrap().len() as u32;
		self.respawn(&self.combiners, |shard| self.spawn_combiner(shard, n_combiners), |old, new| self.combiner_routes.replace_endpoint(old, new));
		self.respawn(&self.queues, |task_id| self.spawn_queue(task_id), |_, _| {});
		self.respawn(&self.reapers, |task_id| self.spawn_reaper(task_id), |_, _| {});
	}

	/// Replaces every dead slot, bumping the generation counter around the
	/// swap so a waiting ack sees it even if it samples mid-respawn. A
	/// worker or combiner's old endpoint may already be wired into a
	/// routing table by the time it dies, so `on_replace` is given the
	/// chance to repoint those entries at the freshly spawned endpoint.
	fn respawn(self: &Arc<Self>, slots: &std::sync::Mutex<Vec<TaskSlot>>, spawn: impl Fn(u32) -> TaskSlot, on_replace: impl Fn(EndpointId, EndpointId)) {
		let mut guard = slots.lock().unwrap();
		for (task_id, slot) in guard.iter_mut().enumerate() {
			if slot.is_dead() {
				tracing::warn!(target: TARGET, db = %self.name, task_id, "process exited, respawning");
				self.bump_generation();
				let old_endpoint = slot.endpoint;
				*slot = spawn(task_id as u32);
				on_replace(old_endpoint, slot.endpoint);
				self.bump_generation();
			}
		}
	}

	/// Requests graceful shutdown of every task this database runs, waiting
	/// up to 5 seconds for every task to exit before giving up.
	pub async fn shutdown(&self) {
		let mut handles = Vec::new();
		for slots in [&self.workers, &self.combiners, &self.queues, &self.reapers] {
			for slot in slots.lock().unwrap().drain(..) {
				slot.cancel.cancel();
				handles.push(slot.handle);
			}
		}
		if tokio::time::timeout(Duration::from_secs(5), futures::future::join_all(handles)).await.is_err() {
			tracing::warn!(target: TARGET, db = %self.name, "processes did not exit within the shutdown timeout");
		}
	}
}

/// Owns every scheduled database's [`DbRuntime`] and the periodic tick that
/// reaps and respawns their process tables.
pub struct Scheduler {
	ipc: ipc::Registry,
	clock: SizedClock,
	dbs: DashMap<String, Arc<DbRuntime>>,
	last_heartbeat: tokio::sync::Mutex<Option<tokio::time::Instant>>,
	rescan_pending: AtomicBool,
}

/// Per-database process complement requested at startup.
#[derive(Debug, Clone, Copy)]
pub struct DbComplement {
	pub num_workers: u32,
	pub num_combiners: u32,
	pub num_queues: u32,
	pub num_reapers: u32,
}

impl DbComplement {
	pub fn total(&self) -> usize {
		self.num_workers as usize + self.num_combiners as usize + self.num_queues as usize + self.num_reapers as usize
	}
}

impl Scheduler {
	pub fn new() -> Self {
		Scheduler {
			ipc: ipc::Registry::new(),
			clock: SizedClock::default(),
			dbs: DashMap::new(),
			last_heartbeat: tokio::sync::Mutex::new(None),
			rescan_pending: AtomicBool::new(false),
		}
	}

	/// Fails fast if the requested per-db process complement, summed across
	/// every database to be scheduled, would exceed the host's task budget.
	/// `host_budget` is `cnf::TASK_BUDGET`, reserving 2 slots for the
	/// scheduler's own tick loop and the heartbeat task.
	pub fn check_capacity(n_databases: usize, per_db: DbComplement, host_budget: usize) -> Result<()> {
		let needed = n_databases * per_db.total() + 2;
		if needed > host_budget {
			return Err(Error::InsufficientTaskBudget { needed, available: host_budget });
		}
		Ok(())
	}

	/// Starts a new database's process table: `num_workers + num_combiners +
	/// num_queues + num_reapers` tasks.
	pub fn start_db(&self, name: impl Into<String>, complement: DbComplement) -> Arc<DbRuntime> {
		let name = name.into();
		let db = Arc::new(DbRuntime {
			name: name.clone(),
			catalog: CqCatalog::new(),
			store: MatrelStore::new(),
			stream_routes: StreamRoutes::new(),
			combiner_routes: CombinerRoutes::new(),
			acks: AckRegistry::new(),
			stats: StatsRegistry::new(),
			generation: Arc::new(AtomicU64::new(0)),
			ipc: self.ipc.clone(),
			clock: self.clock.clone(),
			workers: std::sync::Mutex::new(Vec::new()),
			combiners: std::sync::Mutex::new(Vec::new()),
			queues: std::sync::Mutex::new(Vec::new()),
			reapers: std::sync::Mutex::new(Vec::new()),
		});

		{
			let mut queues = db.queues.lock().unwrap();
			for i in 0..complement.num_queues {
				queues.push(db.spawn_queue(i));
			}
		}
		{
			let mut workers = db.workers.lock().unwrap();
			for i in 0..complement.num_workers {
				workers.push(db.spawn_worker(i));
			}
		}
		{
			let mut combiners = db.combiners.lock().unwrap();
			for shard in 0..complement.num_combiners {
				combiners.push(db.spawn_combiner(shard, complement.num_combiners));
			}
		}
		{
			let mut reapers = db.reapers.lock().unwrap();
			for i in 0..complement.num_reapers {
				reapers.push(db.spawn_reaper(i));
			}
		}

		tracing::info!(target: TARGET, db = %name, workers = complement.num_workers, combiners = complement.num_combiners, queues = complement.num_queues, reapers = complement.num_reapers, "database scheduled");
		self.dbs.insert(name, db.clone());
		db
	}

	pub fn db(&self, name: &str) -> Option<Arc<DbRuntime>> {
		self.dbs.get(name).map(|e| e.clone())
	}

	pub fn db_names(&self) -> Vec<String> {
		self.dbs.iter().map(|e| e.key().clone()).collect()
	}

	/// Tears down a database's process table.
	pub async fn drop_db(&self, name: &str) {
		if let Some((_, db)) = self.dbs.remove(name) {
			tracing::info!(target: TARGET, db = %name, "dropping database");
			db.shutdown().await;
		}
	}

	/// Marks every scheduled database for a full process-table rescan on
	/// the next tick. A rescan here just means "re-check every slot", since
	/// this crate has no separate db-discovery step to rerun.
	pub fn request_rescan(&self) {
		self.rescan_pending.store(true, Ordering::SeqCst);
	}

	/// Runs the scheduler's tick loop until `cancel` fires, reaping and
	/// respawning dead tasks and firing the anonymous heartbeat at most
	/// hourly.
	pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
		loop {
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = tokio::time::sleep(TICK) => {}
			}
			self.tick().await;
		}
	}

	async fn tick(&self) {
		self.rescan_pending.store(false, Ordering::SeqCst);
		for entry in self.dbs.iter() {
			entry.value().reap_and_respawn();
		}
		self.maybe_heartbeat().await;
	}

	async fn maybe_heartbeat(&self) {
		if !heartbeat::enabled() {
			return;
		}
		let url = cnf::ANONYMOUS_HEARTBEAT_URL.as_str();
		if url.is_empty() {
			return;
		}
		let mut guard = self.last_heartbeat.lock().await;
		let due = guard.map(|t| t.elapsed() >= HEARTBEAT_INTERVAL).unwrap_or(true);
		if !due {
			return;
		}
		*guard = Some(tokio::time::Instant::now());
		drop(guard);

		let body = self.build_heartbeat_body();
		heartbeat::send(url, &body).await;
	}

	fn build_heartbeat_body(&self) -> heartbeat::HeartbeatBody {
		let mut num_workers = 0usize;
		let mut num_combiners = 0usize;
		let mut num_cqs = 0u64;
		for entry in self.dbs.iter() {
			let db = entry.value();
			num_workers += db.workers.lock().unwrap().len();
			num_combiners += db.combiners.lock().unwrap().len();
			num_cqs += db.catalog.active_cq_ids().len() as u64;
		}
		heartbeat::HeartbeatBody {
			e: "up".into(),
			v: env!("CARGO_PKG_VERSION").into(),
			r: std::env::consts::ARCH.into(),
			s: 0,
			sr: 0,
			sv: 0,
			ri: 0,
			ba: 0,
			bi: 0,
			er: 0,
			cq: num_cqs,
			id: "flowrelayd".into(),
			pg: "0".into(),
			nw: num_workers,
			nc: num_combiners,
		}
	}
}

impl Default for Scheduler {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn complement() -> DbComplement {
		DbComplement {
			num_workers: 1,
			num_combiners: 1,
			num_queues: 1,
			num_reapers: 1,
		}
	}

	#[test]
	fn capacity_check_rejects_an_undersized_budget() {
		let result = Scheduler::check_capacity(4, complement(), 10);
		assert!(matches!(result, Err(Error::InsufficientTaskBudget { .. })));
	}

	#[test]
	fn capacity_check_passes_with_enough_budget() {
		assert!(Scheduler::check_capacity(1, complement(), 64).is_ok());
	}

	#[tokio::test]
	async fn start_db_spawns_the_full_complement() {
		let scheduler = Scheduler::new();
		let db = scheduler.start_db("events", complement());
		assert_eq!(db.workers.lock().unwrap().len(), 1);
		assert_eq!(db.combiners.lock().unwrap().len(), 1);
		assert_eq!(db.queues.lock().unwrap().len(), 1);
		assert_eq!(db.reapers.lock().unwrap().len(), 1);
		scheduler.drop_db("events").await;
		assert!(scheduler.db("events").is_none());
	}

	#[tokio::test]
	async fn register_stream_wires_every_worker() {
		let scheduler = Scheduler::new();
		let db = scheduler.start_db("events", complement());
		let stream = db.catalog.create_stream("clicks", vec!["x".to_string()]);
		db.register_stream(stream);
		assert!(db.stream_routes.pick(stream).is_some());
		scheduler.drop_db("events").await;
	}

	#[tokio::test]
	async fn register_cq_wires_every_combiner_shard() {
		let scheduler = Scheduler::new();
		let db = scheduler.start_db("events", complement());
		let stream = db.catalog.create_stream("clicks", vec!["x".to_string()]);
		let def = crate::catalog::CqDefinition {
			kind: crate::catalog::CqKind::View,
			action: crate::catalog::CqAction::Materialize,
			source_stream: stream,
			matrel: crate::catalog::MatrelId(1),
			osrel: None,
			pk_index: "pk".into(),
			lookup_index: None,
			seqrel: None,
			ttl: None,
			sw: None,
			fillfactor: 50,
			tgfn: None,
			tgargs: vec![],
			definition: serde_json::json!({}),
			plan: crate::catalog::WorkerPlanSpec {
				group_by: vec!["x".to_string()],
				aggregates: vec![crate::catalog::AggregateSpec {
					output_column: "count".to_string(),
					input_column: None,
					kind: crate::sketch::SketchKind::Count,
					distinct: false,
				}],
			},
		};
		let cq = db.catalog.create_cq(def).unwrap();
		db.register_cq(cq);
		assert_eq!(db.combiner_routes.n_combiners(cq), Some(1));
		assert!(db.combiner_routes.shard_endpoint(cq, 0).is_some());
		scheduler.drop_db("events").await;
	}

	#[tokio::test]
	async fn respawned_worker_keeps_stream_routes_pointing_at_a_live_endpoint() {
		let scheduler = Scheduler::new();
		let db = scheduler.start_db("events", complement());
		let stream = db.catalog.create_stream("clicks", vec!["x".to_string()]);
		db.register_stream(stream);
		let before = db.workers.lock().unwrap()[0].endpoint;

		db.workers.lock().unwrap()[0].cancel.cancel();
		tokio::time::sleep(Duration::from_millis(50)).await;
		db.reap_and_respawn();

		let after = db.workers.lock().unwrap()[0].endpoint;
		assert_ne!(before, after);
		assert_eq!(db.stream_routes.pick(stream), Some(after));
		scheduler.drop_db("events").await;
	}

	#[tokio::test]
	async fn respawned_combiner_keeps_combiner_routes_pointing_at_a_live_endpoint() {
		let scheduler = Scheduler::new();
		let db = scheduler.start_db("events", complement());
		let stream = db.catalog.create_stream("clicks", vec!["x".to_string()]);
		let def = crate::catalog::CqDefinition {
			kind: crate::catalog::CqKind::View,
			action: crate::catalog::CqAction::Materialize,
			source_stream: stream,
			matrel: crate::catalog::MatrelId(1),
			osrel: None,
			pk_index: "pk".into(),
			lookup_index: None,
			seqrel: None,
			ttl: None,
			sw: None,
			fillfactor: 50,
			tgfn: None,
			tgargs: vec![],
			definition: serde_json::json!({}),
			plan: crate::catalog::WorkerPlanSpec {
				group_by: vec!["x".to_string()],
				aggregates: vec![crate::catalog::AggregateSpec {
					output_column: "count".to_string(),
					input_column: None,
					kind: crate::sketch::SketchKind::Count,
					distinct: false,
				}],
			},
		};
		let cq = db.catalog.create_cq(def).unwrap();
		db.register_cq(cq);
		let before = db.combiners.lock().unwrap()[0].endpoint;

		db.combiners.lock().unwrap()[0].cancel.cancel();
		tokio::time::sleep(Duration::from_millis(50)).await;
		db.reap_and_respawn();

		let after = db.combiners.lock().unwrap()[0].endpoint;
		assert_ne!(before, after);
		assert_eq!(db.combiner_routes.shard_endpoint(cq, 0), Some(after));
		scheduler.drop_db("events").await;
	}

	#[tokio::test]
	async fn reap_and_respawn_replaces_a_finished_task() {
		let scheduler = Scheduler::new();
		let db = scheduler.start_db("events", complement());
		let before = db.queues.lock().unwrap()[0].endpoint;
		let before_gen = db.generation.load(Ordering::SeqCst);
		db.queues.lock().unwrap()[0].cancel.cancel();
		tokio::time::sleep(Duration::from_millis(50)).await;
		db.reap_and_respawn();
		let after = db.queues.lock().unwrap()[0].endpoint;
		assert_ne!(before, after);
		assert_eq!(db.generation.load(Ordering::SeqCst), before_gen + 2);
		scheduler.drop_db("events").await;
	}
}
