//! t-digest: a mergeable quantile sketch. This is a simplified
//! fixed-capacity centroid list (Dunning's algorithm, unscaled) rather than
//! a full scaling-function implementation.

use serde::{Deserialize, Serialize};

use super::{Aggregate, FinalizedValue};
use crate::batch::Value;
use crate::err::{Error, Result};

const MAX_CENTROIDS: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Centroid {
	mean: f64,
	weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TDigest {
	centroids: Vec<Centroid>,
}

impl TDigest {
	/// Merges nearest-neighbor centroids until within `MAX_CENTROIDS`,
	/// always merging the closest-mean pair first to minimize quantile
	/// distortion.
	fn compress(&mut self) {
		self.centroids.sort_by(|a, b| a.mean.partial_cmp(&b.mean).unwrap());
		while self.centroids.len() > MAX_CENTROIDS {
			let mut best = (0usize, f64::MAX);
			for i in 0..self.centroids.len() - 1 {
				let gap = self.centroids[i + 1].mean - self.centroids[i].mean;
				if gap < best.1 {
					best = (i, gap);
				}
			}
			let (i, _) = best;
			let a = self.centroids[i];
			let b = self.centroids[i + 1];
			let total = a.weight + b.weight;
			let merged = Centroid {
				mean: (a.mean * a.weight + b.mean * b.weight) / total,
				weight: total,
			};
			self.centroids.splice(i..=i + 1, [merged]);
		}
	}

	pub fn quantile(&self, q: f64) -> f64 {
		if self.centroids.is_empty() {
			return 0.0;
		}
		let total_weight: f64 = self.centroids.iter().map(|c| c.weight).sum();
		let target = q * total_weight;
		let mut cumulative = 0.0;
		for c in &self.centroids {
			cumulative += c.weight;
			if cumulative >= target {
				return c.mean;
			}
		}
		self.centroids.last().map(|c| c.mean).unwrap_or(0.0)
	}
}

impl Aggregate for TDigest {
	fn init() -> Self {
		TDigest {
			centroids: Vec::new(),
		}
	}

	fn add(&mut self, value: &Value) {
		if let Some(v) = value.as_f64() {
			self.centroids.push(Centroid { mean: v, weight: 1.0 });
			if self.centroids.len() > MAX_CENTROIDS * 2 {
				self.compress();
			}
		}
	}

	fn combine(&mut self, other: &Self) -> Result<()> {
		self.centroids.extend_from_slice(&other.centroids);
		self.compress();
		Ok(())
	}

	fn serialize(&self) -> Vec<u8> {
		bincode::serialize(&self.centroids).unwrap_or_default()
	}

	fn deserialize(bytes: &[u8]) -> Result<Self> {
		let centroids = bincode::deserialize(bytes).map_err(|e| Error::SketchDecode(e.to_string()))?;
		Ok(TDigest { centroids })
	}

	fn finalize(&self) -> FinalizedValue {
		FinalizedValue::F64(self.quantile(0.5))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn median_of_uniform_range_is_near_midpoint() {
		let mut td = TDigest::init();
		for i in 0..1000 {
			td.add(&Value::F64(i as f64));
		}
		let median = td.quantile(0.5);
		assert!((median - 500.0).abs() < 50.0, "median {median} too far from 500");
	}

	#[test]
	fn combine_preserves_rough_distribution() {
		let mut a = TDigest::init();
		let mut b = TDigest::init();
		for i in 0..500 {
			a.add(&Value::F64(i as f64));
		}
		for i in 500..1000 {
			b.add(&Value::F64(i as f64));
		}
		a.combine(&b).unwrap();
		let median = a.quantile(0.5);
		assert!((median - 500.0).abs() < 100.0);
	}

	#[test]
	fn compression_bounds_centroid_count() {
		let mut td = TDigest::init();
		for i in 0..10_000 {
			td.add(&Value::F64(i as f64));
		}
		td.compress();
		assert!(td.centroids.len() <= MAX_CENTROIDS);
	}

	#[test]
	fn empty_digest_quantile_is_zero() {
		let td = TDigest::init();
		assert_eq!(td.quantile(0.5), 0.0);
	}
}
