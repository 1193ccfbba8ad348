//! flowrelay-core: a continuous-query engine — a worker/combiner/queue/
//! reaper/scheduler pipeline that incrementally maintains materialized
//! aggregate state over append-only stream events.
//!
//! One top-level module per subsystem; `#[macro_use]` brings in the shared
//! macro set so every other module can reach `lazy_env_parse!` without an
//! explicit `use`.

#[macro_use]
mod mac;

pub mod batch;
pub mod catalog;
pub mod cnf;
pub mod combiner;
pub mod err;
pub mod ipc;
pub mod obs;
pub mod queue;
pub mod reaper;
pub mod scheduler;
pub mod sketch;
pub mod storage;
pub mod stream;
pub mod time;
pub mod wire;
pub mod worker;

pub use err::{Error, Result};
