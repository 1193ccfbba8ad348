//! The worker plan: the part of a CQ's definition that determines how a
//! stream tuple is projected into a partial transition-state row.
//!
//! The host database's version of this is an executor tree rooted at an
//! aggregate node in "emit transition state" mode; full SQL planning is out
//! of scope here, so this is the minimal typed description the worker and
//! combiner both need: which columns form the group key, and which output
//! columns hold which kind of transition state over which input column.

use serde::{Deserialize, Serialize};

use crate::sketch::SketchKind;

/// One aggregate target column in the partial-aggregate projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateSpec {
	pub output_column: String,
	/// `None` for `count(*)`, which needs no input value.
	pub input_column: Option<String>,
	pub kind: SketchKind,
	/// Distinct-only aggregates skip the no-op update suppression check
	/// because their transition state is monotonic-only.
	pub distinct: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPlanSpec {
	/// Empty means ungrouped — a single row keyed by the CQ's own identity.
	pub group_by: Vec<String>,
	pub aggregates: Vec<AggregateSpec>,
}

impl WorkerPlanSpec {
	pub fn is_grouped(&self) -> bool {
		!self.group_by.is_empty()
	}

	pub fn ungrouped_count() -> Self {
		WorkerPlanSpec {
			group_by: vec![],
			aggregates: vec![AggregateSpec {
				output_column: "count".to_string(),
				input_column: None,
				kind: SketchKind::Count,
				distinct: false,
			}],
		}
	}
}
