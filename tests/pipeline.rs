//! End-to-end coverage across worker/queue/combiner/reaper process
//! boundaries, driven entirely through real IPC endpoints and a shared
//! matrel store rather than by calling one module's internals directly —
//! each module already has its own `#[cfg(test)]` suite for that.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use flowrelay_core::batch::{AckLevel, AckRegistry, Row, Value};
use flowrelay_core::catalog::{AggregateSpec, CqAction, CqDefinition, CqCatalog, CqKind, MatrelId, OsrelId, StreamId, SwSpec, TtlSpec, WorkerPlanSpec};
use flowrelay_core::cnf;
use flowrelay_core::combiner::Combiner;
use flowrelay_core::ipc::{self, Frame};
use flowrelay_core::obs::StatsRegistry;
use flowrelay_core::queue::Queue;
use flowrelay_core::reaper::Reaper;
use flowrelay_core::sketch::{SketchKind, SketchState};
use flowrelay_core::storage::MatrelStore;
use flowrelay_core::stream::{insert_into_stream, StreamInsertCtx, StreamRoutes};
use flowrelay_core::time::{FakeClock, SizedClock, Timestamp};
use flowrelay_core::wire::{CombinerRoutes, PartialBatch, PartialRow};
use flowrelay_core::worker::Worker;

fn count_plan() -> WorkerPlanSpec {
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

fn base_def(stream: StreamId, matrel: MatrelId, plan: WorkerPlanSpec) -> CqDefinition {
	CqDefinition {
		kind: CqKind::View,
		action: CqAction::Materialize,
		source_stream: stream,
		matrel,
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
		plan,
	}
}

fn stream_ctx(catalog: CqCatalog, routes: StreamRoutes, ipc: ipc::Registry, clock: SizedClock) -> StreamInsertCtx {
	StreamInsertCtx {
		catalog,
		routes,
		ipc,
		acks: AckRegistry::new(),
		stats: StatsRegistry::new(),
		clock,
		generation: Arc::new(AtomicU64::new(0)),
	}
}

/// A plain grouped count CQ materializes correctly once a row has
/// traveled stream-insert -> worker -> combiner -> matrel.
#[test_log::test(tokio::test)]
async fn grouped_count_reaches_the_matrel_through_the_full_pipeline() {
	let registry = ipc::Registry::new();
	let catalog = CqCatalog::new();
	let stream = catalog.create_stream("events", vec!["x".to_string()]);
	let cq_id = catalog.create_cq(base_def(stream, MatrelId(1), count_plan())).unwrap();

	let combiner_routes = CombinerRoutes::new();
	let combiner_ep = registry.bind(*cnf::IPC_HWM);
	combiner_routes.register(cq_id, 0, combiner_ep.id());

	let worker_ep = registry.bind(*cnf::IPC_HWM);
	let ingest_routes = StreamRoutes::new();
	ingest_routes.register(stream, worker_ep.id());

	let acks = AckRegistry::new();
	let stats = StatsRegistry::new();
	let ctx = stream_ctx(catalog.clone(), ingest_routes, registry.clone(), SizedClock::default());
	let mut worker = Worker::new(0, worker_ep, catalog.clone(), combiner_routes, None, acks.clone(), stats.clone(), CancellationToken::new());

	let matrel_store = MatrelStore::new();
	let combiner_ctx = stream_ctx(catalog.clone(), StreamRoutes::new(), registry.clone(), SizedClock::default());
	let mut combiner = Combiner::new(0, 0, 1, combiner_ep, catalog, matrel_store.clone(), combiner_ctx, acks, stats, SizedClock::default(), CancellationToken::new());

	let mut rows = Vec::new();
	for x in [1, 1, 2] {
		let mut row = Row::new();
		row.set("x", Value::I64(x));
		rows.push(row);
	}
	insert_into_stream(&ctx, stream, rows, AckLevel::Async, None).await.unwrap();

	worker.tick().await;
	combiner.tick().await;

	let mut tx = matrel_store.begin(false).await;
	let group_one = tx.get_by_group(MatrelId(1), &[Value::I64(1)]).unwrap().unwrap();
	match group_one.state.get("count").unwrap() {
		SketchState::Count(c) => assert_eq!(c.0, 2),
		_ => panic!("wrong sketch kind"),
	}
	let group_two = tx.get_by_group(MatrelId(1), &[Value::I64(2)]).unwrap().unwrap();
	match group_two.state.get("count").unwrap() {
		SketchState::Count(c) => assert_eq!(c.0, 1),
		_ => panic!("wrong sketch kind"),
	}
}

/// An ungrouped HyperLogLog CQ produces a distinct-count estimate in the
/// right ballpark after every row has passed through worker merging and
/// combiner merging.
#[tokio::test]
async fn hyperloglog_cq_estimates_distinct_values_through_the_pipeline() {
	let registry = ipc::Registry::new();
	let catalog = CqCatalog::new();
	let stream = catalog.create_stream("events", vec!["x".to_string()]);
	let plan = WorkerPlanSpec {
		group_by: vec![],
		aggregates: vec![AggregateSpec {
			output_column: "distinct_x".to_string(),
			input_column: Some("x".to_string()),
			kind: SketchKind::HyperLogLog,
			distinct: true,
		}],
	};
	let cq_id = catalog.create_cq(base_def(stream, MatrelId(1), plan)).unwrap();

	let combiner_routes = CombinerRoutes::new();
	let combiner_ep = registry.bind(*cnf::IPC_HWM);
	combiner_routes.register(cq_id, 0, combiner_ep.id());

	let worker_ep = registry.bind(*cnf::IPC_HWM);
	let ingest_routes = StreamRoutes::new();
	ingest_routes.register(stream, worker_ep.id());

	let acks = AckRegistry::new();
	let stats = StatsRegistry::new();
	let ctx = stream_ctx(catalog.clone(), ingest_routes, registry.clone(), SizedClock::default());
	let mut worker = Worker::new(0, worker_ep, catalog.clone(), combiner_routes, None, acks.clone(), stats.clone(), CancellationToken::new());

	let matrel_store = MatrelStore::new();
	let combiner_ctx = stream_ctx(catalog.clone(), StreamRoutes::new(), registry.clone(), SizedClock::default());
	let mut combiner = Combiner::new(0, 0, 1, combiner_ep, catalog, matrel_store.clone(), combiner_ctx, acks, stats, SizedClock::default(), CancellationToken::new());

	// 1000 distinct values, each repeated twice, split across two stream inserts
	// so the merge happens both within a worker batch and across combiner flushes.
	let mut first_half = Vec::new();
	for x in 0..500i64 {
		let mut row = Row::new();
		row.set("x", Value::I64(x));
		first_half.push(row.clone());
		first_half.push(row);
	}
	insert_into_stream(&ctx, stream, first_half, AckLevel::Async, None).await.unwrap();
	worker.tick().await;
	combiner.tick().await;

	let mut second_half = Vec::new();
	for x in 500..1000i64 {
		let mut row = Row::new();
		row.set("x", Value::I64(x));
		second_half.push(row.clone());
		second_half.push(row);
	}
	insert_into_stream(&ctx, stream, second_half, AckLevel::Async, None).await.unwrap();
	worker.tick().await;
	combiner.tick().await;

	let mut tx = matrel_store.begin(false).await;
	let row = tx.get_by_group(MatrelId(1), &[Value::I64(cq_id.0 as i64)]).unwrap().unwrap();
	let estimate = match row.state.get("distinct_x").unwrap() {
		SketchState::HyperLogLog(h) => match h.finalize() {
			flowrelay_core::sketch::FinalizedValue::U64(n) => n,
			_ => panic!("expected u64"),
		},
		_ => panic!("wrong sketch kind"),
	};
	let err = (estimate as f64 - 1000.0).abs() / 1000.0;
	assert!(err < 0.1, "distinct estimate {estimate} too far from 1000");
}

/// A TTL CQ's matrel rows are reclaimed by the reaper once they fall
/// outside the configured window, but rows still inside it survive.
#[tokio::test]
async fn ttl_cq_rows_are_reaped_once_they_expire() {
	let registry = ipc::Registry::new();
	let catalog = CqCatalog::new();
	let stream = catalog.create_stream("events", vec!["x".to_string()]);
	let mut def = base_def(stream, MatrelId(1), count_plan());
	def.ttl = Some(TtlSpec { column: "arrival_timestamp".into(), seconds: 10 });
	let cq_id = catalog.create_cq(def).unwrap();

	let combiner_routes = CombinerRoutes::new();
	let combiner_ep = registry.bind(*cnf::IPC_HWM);
	combiner_routes.register(cq_id, 0, combiner_ep.id());

	let worker_ep = registry.bind(*cnf::IPC_HWM);
	let ingest_routes = StreamRoutes::new();
	ingest_routes.register(stream, worker_ep.id());

	let acks = AckRegistry::new();
	let stats = StatsRegistry::new();
	let ingest_clock = SizedClock::Fake(FakeClock::new(Timestamp::from_millis(0)));
	let ctx = stream_ctx(catalog.clone(), ingest_routes, registry.clone(), ingest_clock.clone());
	let mut worker = Worker::new(0, worker_ep, catalog.clone(), combiner_routes, None, acks.clone(), stats.clone(), CancellationToken::new());

	let matrel_store = MatrelStore::new();
	let combiner_ctx = stream_ctx(catalog.clone(), StreamRoutes::new(), registry.clone(), SizedClock::default());
	let mut combiner = Combiner::new(0, 0, 1, combiner_ep, catalog.clone(), matrel_store.clone(), combiner_ctx, acks, stats, SizedClock::default(), CancellationToken::new());

	let mut stale_row = Row::new();
	stale_row.set("x", Value::I64(1));
	insert_into_stream(&ctx, stream, vec![stale_row], AckLevel::Async, None).await.unwrap();
	worker.tick().await;
	combiner.tick().await;

	if let SizedClock::Fake(fake) = &ingest_clock {
		fake.set(Timestamp::from_millis(20_000)).await;
	}
	let mut fresh_row = Row::new();
	fresh_row.set("x", Value::I64(2));
	insert_into_stream(&ctx, stream, vec![fresh_row], AckLevel::Async, None).await.unwrap();
	worker.tick().await;
	combiner.tick().await;

	let reaper_clock = SizedClock::Fake(FakeClock::new(Timestamp::from_millis(25_000)));
	let mut reaper = Reaper::new(0, catalog, matrel_store.clone(), reaper_clock, StatsRegistry::new(), CancellationToken::new());
	reaper.tick().await;

	let mut tx = matrel_store.begin(false).await;
	assert!(tx.get_by_group(MatrelId(1), &[Value::I64(1)]).unwrap().is_none(), "stale row should have been reaped");
	assert!(tx.get_by_group(MatrelId(1), &[Value::I64(2)]).unwrap().is_some(), "fresh row should still be present");
}

/// A sliding-window CQ emits an insert change when a group first
/// enters the window and a delete change once its step row ages out, and
/// both reach the downstream output stream (transform fan-out).
#[tokio::test]
async fn sliding_window_cq_emits_insert_then_delete_as_its_group_ages_out() {
	let registry = ipc::Registry::new();
	let catalog = CqCatalog::new();
	let source = catalog.create_stream("events", vec!["x".to_string()]);
	let out = catalog.create_stream("out", vec!["old".to_string(), "new".to_string(), "delta".to_string()]);

	let mut def = base_def(source, MatrelId(1), count_plan());
	def.sw = Some(SwSpec { interval: Duration::from_secs(10), step_factor_pct: 50 });
	def.osrel = Some(OsrelId(out.0));
	let cq_id = catalog.create_cq(def).unwrap();

	let combiner_ep = registry.bind(*cnf::IPC_HWM);
	let osrel_ep = registry.bind(*cnf::IPC_HWM);

	let clock = SizedClock::Fake(FakeClock::new(Timestamp::from_millis(11_000)));
	let combiner_ctx = stream_ctx(catalog.clone(), StreamRoutes::new(), registry.clone(), SizedClock::default());
	combiner_ctx.routes.register(out, osrel_ep.id());

	let matrel_store = MatrelStore::new();
	let mut combiner = Combiner::new(0, 0, 1, combiner_ep, catalog, matrel_store, combiner_ctx, AckRegistry::new(), StatsRegistry::new(), clock.clone(), CancellationToken::new());

	let mut state = std::collections::BTreeMap::new();
	state.insert("count".to_string(), SketchState::Count(flowrelay_core::sketch::Count(1)));
	let mut first = PartialBatch::new(combiner.endpoint_id(), cq_id);
	first.rows.push(PartialRow {
		group: vec![Value::I64(1)],
		group_hash: flowrelay_core::storage::hash_group(&[Value::I64(1)]),
		state,
		arrival_ts: Some(Timestamp::from_millis(5_000)),
		batch_seq: None,
	});
	registry.send(combiner.endpoint_id(), first.encode().unwrap());
	combiner.tick().await;

	let insert_frame = osrel_ep.recv(Duration::from_millis(200)).await.expect("insert change should reach the osrel stream");
	let insert_batch = flowrelay_core::batch::MicroBatch::decode(&insert_frame).unwrap();
	let insert_row = &insert_batch.rows[0];
	assert!(matches!(insert_row.get("old"), Value::Null));
	assert!(!matches!(insert_row.get("new"), Value::Null));

	if let SizedClock::Fake(fake) = &clock {
		fake.set(Timestamp::from_millis(20_000)).await;
	}
	let mut second = PartialBatch::new(combiner.endpoint_id(), cq_id);
	second.rows.push(PartialRow {
		group: vec![Value::I64(1)],
		group_hash: flowrelay_core::storage::hash_group(&[Value::I64(1)]),
		state: std::collections::BTreeMap::new(),
		arrival_ts: Some(Timestamp::from_millis(5_000)),
		batch_seq: None,
	});
	registry.send(combiner.endpoint_id(), second.encode().unwrap());
	combiner.tick().await;

	let delete_frame = osrel_ep.recv(Duration::from_millis(200)).await.expect("delete change should reach the osrel stream once the step ages out");
	let delete_batch = flowrelay_core::batch::MicroBatch::decode(&delete_frame).unwrap();
	let delete_row = &delete_batch.rows[0];
	assert!(!matches!(delete_row.get("old"), Value::Null));
	assert!(matches!(delete_row.get("new"), Value::Null));
}

/// Worker -> queue -> combiner back-pressure recovery: the worker's direct
/// send to a full combiner mailbox fails over to its queue endpoint, and the
/// queue delivers the held frame once the combiner drains.
#[test_log::test(tokio::test)]
async fn a_backpressured_combiner_is_reached_through_the_queue() {
	let registry = ipc::Registry::new();
	let catalog = CqCatalog::new();
	let stream = catalog.create_stream("events", vec!["x".to_string()]);
	let cq_id = catalog.create_cq(base_def(stream, MatrelId(1), count_plan())).unwrap();

	let combiner_ep = registry.bind(1);
	// Occupy the combiner's one mailbox slot so the worker's first send fails.
	registry.send(combiner_ep.id(), Frame::encode(0, bytes::Bytes::from_static(b"placeholder")));

	let combiner_routes = CombinerRoutes::new();
	combiner_routes.register(cq_id, 0, combiner_ep.id());

	let queue_ep = registry.bind(*cnf::IPC_HWM);
	let mut queue = Queue::new(0, queue_ep, CancellationToken::new());

	let worker_ep = registry.bind(*cnf::IPC_HWM);
	let worker_id = worker_ep.id();
	let mut worker = Worker::new(0, worker_ep, catalog, combiner_routes, Some(queue.endpoint_id()), AckRegistry::new(), StatsRegistry::new(), CancellationToken::new());

	let mut batch = flowrelay_core::batch::MicroBatch::new(worker_id, None, vec!["x".to_string()]);
	batch.readers = vec![cq_id];
	let mut row = Row::new();
	row.set("x", Value::I64(1));
	batch.try_push(row);
	registry.send(worker_id, batch.encode().unwrap());
	worker.tick().await;

	// Combiner mailbox still full: the queue holds the frame on its first pass.
	queue.tick().await;
	assert_eq!(queue.pending_count(), 1);

	// Drain the placeholder frame so the combiner has room again.
	let drained = combiner_ep.recv(Duration::from_millis(50)).await;
	assert!(drained.is_some());

	queue.tick().await;
	assert_eq!(queue.pending_count(), 0);

	let delivered = combiner_ep.recv(Duration::from_millis(200)).await.expect("queue should have delivered the held partial batch");
	let decoded = PartialBatch::decode(&delivered).unwrap();
	assert_eq!(decoded.rows.len(), 1);
}
