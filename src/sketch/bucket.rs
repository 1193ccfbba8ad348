//! Bucket-agg: a fixed-boundary histogram transition state. Bucket edges
//! are a crate-wide default rather than per-CQ configurable; a DDL surface
//! for custom bucket boundaries is out of scope.

use serde::{Deserialize, Serialize};

use super::{Aggregate, FinalizedValue};
use crate::batch::Value;
use crate::err::{Error, Result};

/// Upper bound (exclusive) of each bucket; the last bucket catches
/// everything at or above `EDGES`'s final value.
const EDGES: &[f64] = &[0.0, 1.0, 10.0, 100.0, 1_000.0, 10_000.0];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketAgg {
	counts: Vec<u64>,
}

impl BucketAgg {
	fn bucket_index(v: f64) -> usize {
		EDGES.iter().position(|&edge| v < edge).unwrap_or(EDGES.len()).saturating_sub(1).min(EDGES.len() - 1)
	}

	fn label(i: usize) -> String {
		if i + 1 < EDGES.len() {
			format!("[{},{})", EDGES[i], EDGES[i + 1])
		} else {
			format!("[{},inf)", EDGES[i])
		}
	}
}

impl Aggregate for BucketAgg {
	fn init() -> Self {
		BucketAgg {
			counts: vec![0u64; EDGES.len()],
		}
	}

	fn add(&mut self, value: &Value) {
		if let Some(v) = value.as_f64() {
			let idx = Self::bucket_index(v);
			self.counts[idx] += 1;
		}
	}

	fn combine(&mut self, other: &Self) -> Result<()> {
		if self.counts.len() != other.counts.len() {
			return Err(Error::SketchMismatch("bucketagg", "bucketagg"));
		}
		for (a, b) in self.counts.iter_mut().zip(other.counts.iter()) {
			*a = a.saturating_add(*b);
		}
		Ok(())
	}

	fn serialize(&self) -> Vec<u8> {
		self.counts.iter().flat_map(|c| c.to_le_bytes()).collect()
	}

	fn deserialize(bytes: &[u8]) -> Result<Self> {
		if bytes.len() != EDGES.len() * 8 {
			return Err(Error::SketchDecode("bucketagg: wrong length".into()));
		}
		let counts = bytes.chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap())).collect();
		Ok(BucketAgg { counts })
	}

	fn finalize(&self) -> FinalizedValue {
		let buckets = self.counts.iter().enumerate().map(|(i, &c)| (Self::label(i), c as f64)).collect();
		FinalizedValue::Buckets(buckets)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn values_land_in_expected_buckets() {
		let mut b = BucketAgg::init();
		b.add(&Value::F64(0.5));
		b.add(&Value::F64(50.0));
		b.add(&Value::F64(50_000.0));
		let FinalizedValue::Buckets(buckets) = b.finalize() else {
			panic!("expected buckets");
		};
		assert_eq!(buckets[0].1, 1.0);
		assert!(buckets.iter().any(|(_, c)| *c == 1.0));
	}

	#[test]
	fn combine_sums_bucket_counts() {
		let mut a = BucketAgg::init();
		let mut b = BucketAgg::init();
		a.add(&Value::F64(5.0));
		b.add(&Value::F64(5.0));
		a.combine(&b).unwrap();
		let FinalizedValue::Buckets(buckets) = a.finalize() else {
			panic!("expected buckets");
		};
		let total: f64 = buckets.iter().map(|(_, c)| c).sum();
		assert_eq!(total, 2.0);
	}

	#[test]
	fn roundtrips_through_bytes() {
		let mut b = BucketAgg::init();
		b.add(&Value::F64(5.0));
		let bytes = b.serialize();
		let restored = BucketAgg::deserialize(&bytes).unwrap();
		assert_eq!(restored.finalize(), b.finalize());
	}
}
