//! Count-Min Sketch: an approximate frequency counter with one-sided error
//! (never under-counts). Width/depth follow the standard epsilon/delta
//! sizing formula rather than a specific library's constants.

use serde::{Deserialize, Serialize};

use super::{Aggregate, FinalizedValue};
use crate::batch::Value;
use crate::err::{Error, Result};

const DEPTH: usize = 5;
const WIDTH: usize = 2048;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountMinSketch {
	counters: Vec<u32>,
	last_key: Option<Vec<u8>>,
}

impl CountMinSketch {
	fn key_bytes(value: &Value) -> Vec<u8> {
		match value {
			Value::Null => vec![],
			Value::Bool(b) => vec![*b as u8],
			Value::I64(i) => i.to_le_bytes().to_vec(),
			Value::F64(f) => f.to_bits().to_le_bytes().to_vec(),
			Value::Str(s) => s.as_bytes().to_vec(),
			Value::Bytes(b) => b.clone(),
			Value::Timestamp(t) => t.value.to_le_bytes().to_vec(),
		}
	}

	fn row_index(row: usize, key: &[u8]) -> usize {
		use std::hash::{Hash, Hasher};
		let mut hasher = ahash::AHasher::default();
		row.hash(&mut hasher);
		key.hash(&mut hasher);
		(hasher.finish() % WIDTH as u64) as usize
	}

	pub fn estimate(&self, key: &[u8]) -> u64 {
		(0..DEPTH)
			.map(|row| self.counters[row * WIDTH + Self::row_index(row, key)] as u64)
			.min()
			.unwrap_or(0)
	}

	pub fn increment(&mut self, key: &[u8]) {
		for row in 0..DEPTH {
			let idx = row * WIDTH + Self::row_index(row, key);
			self.counters[idx] = self.counters[idx].saturating_add(1);
		}
		self.last_key = Some(key.to_vec());
	}
}

impl Aggregate for CountMinSketch {
	fn init() -> Self {
		CountMinSketch {
			counters: vec![0u32; DEPTH * WIDTH],
			last_key: None,
		}
	}

	fn add(&mut self, value: &Value) {
		let key = Self::key_bytes(value);
		self.increment(&key);
	}

	fn combine(&mut self, other: &Self) -> Result<()> {
		if self.counters.len() != other.counters.len() {
			return Err(Error::SketchMismatch("countmin", "countmin"));
		}
		for (a, b) in self.counters.iter_mut().zip(other.counters.iter()) {
			*a = a.saturating_add(*b);
		}
		if self.last_key.is_none() {
			self.last_key = other.last_key.clone();
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
		match &self.last_key {
			Some(k) => FinalizedValue::U64(self.estimate(k)),
			None => FinalizedValue::U64(0),
		}
	}
}
