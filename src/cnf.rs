//! Process-wide configuration.
//!
//! Every knob is a `once_cell::sync::Lazy` static parsed from an environment
//! variable named `CQ_<NAME>` via [`crate::lazy_env_parse`]. [`Cli`]
//! overlays these with CLI flags for the server binary: CLI > env >
//! hardcoded default.

use once_cell::sync::Lazy;

pub static NUM_WORKERS: Lazy<usize> = crate::lazy_env_parse!("CQ_NUM_WORKERS", usize, 4);
pub static NUM_COMBINERS: Lazy<usize> = crate::lazy_env_parse!("CQ_NUM_COMBINERS", usize, 4);
pub static NUM_QUEUES: Lazy<usize> = crate::lazy_env_parse!("CQ_NUM_QUEUES", usize, 1);
pub static NUM_REAPERS: Lazy<usize> = crate::lazy_env_parse!("CQ_NUM_REAPERS", usize, 1);

pub static CONTINUOUS_QUERIES_ENABLED: Lazy<bool> =
	crate::lazy_env_parse!("CQ_CONTINUOUS_QUERIES_ENABLED", bool, true);

pub static BATCH_MEM_KIB: Lazy<usize> = crate::lazy_env_parse!("CQ_BATCH_MEM", usize, 256);
pub static BATCH_SIZE: Lazy<usize> = crate::lazy_env_parse!("CQ_BATCH_SIZE", usize, 10_000);

pub static COMMIT_INTERVAL_MS: Lazy<u64> = crate::lazy_env_parse!("CQ_COMMIT_INTERVAL", u64, 50);
pub static MAX_WAIT_MS: Lazy<u64> = crate::lazy_env_parse!("CQ_MAX_WAIT", u64, 250);

pub static IPC_HWM: Lazy<usize> = crate::lazy_env_parse!("CQ_IPC_HWM", usize, 1024);

pub static QUEUE_MEM_KIB: Lazy<usize> = crate::lazy_env_parse!("CQ_QUEUE_MEM", usize, 256 * 1024);
pub static QUEUE_RECV_TIMEOUT_MS: Lazy<u64> = crate::lazy_env_parse!("CQ_QUEUE_RECV_TIMEOUT", u64, 2000);
pub const MAX_QUEUE_FLUSH_ATTEMPTS: u32 = 10;

pub static TTL_EXPIRATION_BATCH_SIZE: Lazy<usize> =
	crate::lazy_env_parse!("CQ_TTL_EXPIRATION_BATCH_SIZE", usize, 10_000);
pub static TTL_EXPIRATION_THRESHOLD_PCT: Lazy<u32> =
	crate::lazy_env_parse!("CQ_TTL_EXPIRATION_THRESHOLD", u32, 5);

pub static FILLFACTOR: Lazy<u32> = crate::lazy_env_parse!("CQ_FILLFACTOR", u32, 50);

pub static COMBINER_WORK_MEM_KIB: Lazy<usize> =
	crate::lazy_env_parse!("CQ_COMBINER_WORK_MEM", usize, 64 * 1024);

pub static MATRELS_WRITABLE: Lazy<bool> = crate::lazy_env_parse!("CQ_MATRELS_WRITABLE", bool, false);

pub static ANONYMOUS_UPDATE_CHECKS: Lazy<bool> =
	crate::lazy_env_parse!("CQ_ANONYMOUS_UPDATE_CHECKS", bool, false);

pub static TASK_BUDGET: Lazy<usize> = crate::lazy_env_parse!("CQ_TASK_BUDGET", usize, 4096);

/// Target URL for the anonymous version-check heartbeat. Empty by default —
/// the scheduler never posts anywhere unless an operator opts in by setting
/// this, so no destination is ever guessed at by this crate.
pub static ANONYMOUS_HEARTBEAT_URL: Lazy<String> =
	crate::lazy_env_parse!("CQ_ANONYMOUS_HEARTBEAT_URL", String, String::new());

pub const MAX_CQS: usize = 1024;

/// Default ack level for a session's inserts when not overridden per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamInsertLevel {
	Async,
	SyncReceive,
	SyncCommit,
}

impl Default for StreamInsertLevel {
	fn default() -> Self {
		StreamInsertLevel::Async
	}
}

/// Server binary CLI. Every field defaults to the matching environment
/// variable's parsed value, which in turn defaults to the hardcoded
/// constant above — `clap`'s `env` feature handles the env layer, so this
/// struct only needs to name the variable and default.
#[derive(clap::Parser, Debug)]
#[command(name = "flowrelayd", about = "Continuous-query engine server")]
pub struct Cli {
	#[arg(long, env = "CQ_NUM_WORKERS", default_value_t = *NUM_WORKERS)]
	pub num_workers: usize,

	#[arg(long, env = "CQ_NUM_COMBINERS", default_value_t = *NUM_COMBINERS)]
	pub num_combiners: usize,

	#[arg(long, env = "CQ_NUM_QUEUES", default_value_t = *NUM_QUEUES)]
	pub num_queues: usize,

	#[arg(long, env = "CQ_NUM_REAPERS", default_value_t = *NUM_REAPERS)]
	pub num_reapers: usize,

	#[arg(long, env = "CQ_CONTINUOUS_QUERIES_ENABLED", default_value_t = *CONTINUOUS_QUERIES_ENABLED)]
	pub continuous_queries_enabled: bool,

	#[arg(long, value_enum, default_value_t = StreamInsertLevel::Async)]
	pub stream_insert_level: StreamInsertLevel,

	#[arg(long, env = "CQ_TASK_BUDGET", default_value_t = *TASK_BUDGET)]
	pub task_budget: usize,

	#[arg(long, env = "CQ_ANONYMOUS_UPDATE_CHECKS", default_value_t = *ANONYMOUS_UPDATE_CHECKS)]
	pub anonymous_update_checks: bool,

	/// Comma-separated list of database names to schedule. Empty means "all
	/// registered databases" as discovered by the catalog.
	#[arg(long, value_delimiter = ',')]
	pub databases: Vec<String>,
}
