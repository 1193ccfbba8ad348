//! Filtered Space-Saving (FSS): a bounded-memory approximate top-k counter.
//! The eviction rule (replace the minimum-count entry, carrying its count
//! forward as the new entry's error bound) follows Metwally et al.'s
//! Space-Saving algorithm.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Aggregate, FinalizedValue};
use crate::batch::Value;
use crate::err::{Error, Result};

const DEFAULT_CAPACITY: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Counter {
	count: u64,
	error: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceSaving {
	capacity: usize,
	counters: HashMap<String, Counter>,
}

impl SpaceSaving {
	fn key_str(value: &Value) -> String {
		match value {
			Value::Null => String::new(),
			Value::Bool(b) => b.to_string(),
			Value::I64(i) => i.to_string(),
			Value::F64(f) => f.to_string(),
			Value::Str(s) => s.clone(),
			Value::Bytes(b) => hex::encode_bytes(b),
			Value::Timestamp(t) => t.value.to_string(),
		}
	}

	fn min_entry(&self) -> Option<String> {
		self.counters.iter().min_by_key(|(_, c)| c.count).map(|(k, _)| k.clone())
	}

	fn observe(&mut self, key: String) {
		if let Some(c) = self.counters.get_mut(&key) {
			c.count += 1;
			return;
		}
		if self.counters.len() < self.capacity {
			self.counters.insert(key, Counter { count: 1, error: 0 });
			return;
		}
		if let Some(min_key) = self.min_entry() {
			let min_count = self.counters.get(&min_key).map(|c| c.count).unwrap_or(0);
			self.counters.remove(&min_key);
			self.counters.insert(
				key,
				Counter {
					count: min_count + 1,
					error: min_count,
				},
			);
		}
	}

	/// Top-k by count, descending, ties broken by key for determinism.
	pub fn top(&self, k: usize) -> Vec<(String, u64)> {
		let mut entries: Vec<(String, u64)> = self.counters.iter().map(|(k, c)| (k.clone(), c.count)).collect();
		entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
		entries.truncate(k);
		entries
	}
}

/// Minimal hex encoding local to this module, to avoid pulling in a crate
/// for the rare bytes-as-topk-key case.
mod hex {
	pub fn encode_bytes(bytes: &[u8]) -> String {
		bytes.iter().map(|b| format!("{:02x}", b)).collect()
	}
}

impl Aggregate for SpaceSaving {
	fn init() -> Self {
		SpaceSaving {
			capacity: DEFAULT_CAPACITY,
			counters: HashMap::new(),
		}
	}

	fn add(&mut self, value: &Value) {
		let key = Self::key_str(value);
		self.observe(key);
	}

	/// Merges two Space-Saving summaries by unioning counters (summing
	/// shared keys, keeping the rest) and re-trimming to capacity, evicting
	/// the lowest counts first. Associative/commutative to the same
	/// approximation bound as the single-stream algorithm.
	fn combine(&mut self, other: &Self) -> Result<()> {
		if self.capacity != other.capacity {
			return Err(Error::SketchMismatch("spacesaving", "spacesaving"));
		}
		for (k, c) in &other.counters {
			self.counters
				.entry(k.clone())
				.and_modify(|existing| {
					existing.count += c.count;
					existing.error = existing.error.max(c.error);
				})
				.or_insert_with(|| c.clone());
		}
		while self.counters.len() > self.capacity {
			if let Some(min_key) = self.min_entry() {
				self.counters.remove(&min_key);
			} else {
				break;
			}
		}
		Ok(())
	}

	fn serialize(&self) -> Vec<u8> {
		bincode::serialize(self).unwrap_or_default()
	}

	fn deserialize(bytes: &[u8]) -> Result<Self> {
		bincode::deserialize(bytes).map_err(|e| Error::SketchDecode(e.to_string()))
	}

	fn finalize(&self) -> FinalizedValue {
		FinalizedValue::TopK(self.top(10))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn frequent_key_surfaces_in_top_k() {
		let mut ss = SpaceSaving::init();
		for _ in 0..100 {
			ss.add(&Value::Str("hot".into()));
		}
		for i in 0..200 {
			ss.add(&Value::Str(format!("cold-{i}")));
		}
		let top = ss.top(1);
		assert_eq!(top[0].0, "hot");
	}

	#[test]
	fn combine_sums_shared_keys() {
		let mut a = SpaceSaving::init();
		let mut b = SpaceSaving::init();
		for _ in 0..10 {
			a.add(&Value::Str("k".into()));
		}
		for _ in 0..5 {
			b.add(&Value::Str("k".into()));
		}
		a.combine(&b).unwrap();
		let top = a.top(1);
		assert_eq!(top[0], ("k".to_string(), 15));
	}

	#[test]
	fn capacity_is_bounded() {
		let mut ss = SpaceSaving::init();
		for i in 0..1000 {
			ss.add(&Value::Str(format!("k-{i}")));
		}
		assert!(ss.counters.len() <= DEFAULT_CAPACITY);
	}
}
