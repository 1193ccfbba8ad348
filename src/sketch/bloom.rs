//! Bloom filter: approximate set membership with one-sided error (never a
//! false negative).

use serde::{Deserialize, Serialize};

use super::{Aggregate, FinalizedValue};
use crate::batch::Value;
use crate::err::{Error, Result};

const NUM_BITS: usize = 1 << 20; // 1Mbit ~ 131KiB, fixed size shared across instances
const NUM_HASHES: usize = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
	bits: Vec<u64>,
	contains_probe: Option<Vec<u8>>,
}

impl BloomFilter {
	fn words() -> usize {
		NUM_BITS / 64
	}

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

	/// Double hashing (Kirsch-Mitzenmacher): derives `NUM_HASHES` bit
	/// positions from two independent hashes rather than `NUM_HASHES`
	/// distinct hash functions.
	fn bit_positions(key: &[u8]) -> [usize; NUM_HASHES] {
		use std::hash::{Hash, Hasher};
		let mut h1 = ahash::AHasher::default();
		key.hash(&mut h1);
		let a = h1.finish();
		let mut h2 = ahash::AHasher::default();
		a.hash(&mut h2);
		key.hash(&mut h2);
		let b = h2.finish();
		let mut out = [0usize; NUM_HASHES];
		for (i, slot) in out.iter_mut().enumerate() {
			*slot = (a.wrapping_add((i as u64).wrapping_mul(b)) % NUM_BITS as u64) as usize;
		}
		out
	}

	pub fn insert(&mut self, key: &[u8]) {
		for pos in Self::bit_positions(key) {
			self.bits[pos / 64] |= 1 << (pos % 64);
		}
		self.contains_probe = Some(key.to_vec());
	}

	pub fn contains(&self, key: &[u8]) -> bool {
		Self::bit_positions(key).iter().all(|&pos| self.bits[pos / 64] & (1 << (pos % 64)) != 0)
	}
}

impl Aggregate for BloomFilter {
	fn init() -> Self {
		BloomFilter {
			bits: vec![0u64; Self::words()],
			contains_probe: None,
		}
	}

	fn add(&mut self, value: &Value) {
		let key = Self::key_bytes(value);
		self.insert(&key);
	}

	fn combine(&mut self, other: &Self) -> Result<()> {
		if self.bits.len() != other.bits.len() {
			return Err(Error::SketchMismatch("bloom", "bloom"));
		}
		for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
			*a |= *b;
		}
		if self.contains_probe.is_none() {
			self.contains_probe = other.contains_probe.clone();
		}
		Ok(())
	}

	fn serialize(&self) -> Vec<u8> {
		self.bits.iter().flat_map(|w| w.to_le_bytes()).collect()
	}

	fn deserialize(bytes: &[u8]) -> Result<Self> {
		if bytes.len() != Self::words() * 8 {
			return Err(Error::SketchDecode("bloom: wrong length".into()));
		}
		let bits = bytes.chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap())).collect();
		Ok(BloomFilter {
			bits,
			contains_probe: None,
		})
	}

	fn finalize(&self) -> FinalizedValue {
		match &self.contains_probe {
			Some(k) => FinalizedValue::Bool(self.contains(k)),
			None => FinalizedValue::Bool(false),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn inserted_keys_are_always_contained() {
		let mut bf = BloomFilter::init();
		let key = BloomFilter::key_bytes(&Value::Str("present".into()));
		bf.insert(&key);
		assert!(bf.contains(&key));
	}

	#[test]
	fn absent_keys_are_usually_not_contained() {
		let bf = BloomFilter::init();
		let key = BloomFilter::key_bytes(&Value::Str("absent".into()));
		assert!(!bf.contains(&key));
	}

	#[test]
	fn combine_is_bitwise_or() {
		let mut a = BloomFilter::init();
		let mut b = BloomFilter::init();
		let ka = BloomFilter::key_bytes(&Value::Str("a".into()));
		let kb = BloomFilter::key_bytes(&Value::Str("b".into()));
		a.insert(&ka);
		b.insert(&kb);
		a.combine(&b).unwrap();
		assert!(a.contains(&ka));
		assert!(a.contains(&kb));
	}
}
