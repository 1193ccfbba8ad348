//! Aggregate state representations: the transition-state payload carried in
//! matrel rows and micro-batches.
//!
//! One enum variant per aggregate kind, each implementing a shared trait for
//! the common operations, rather than a trait object — every matrel column
//! has exactly one declared kind, known at plan time, so static dispatch
//! through the enum is enough.

pub mod bloom;
pub mod bucket;
pub mod cms;
pub mod hll;
pub mod spacesaving;
pub mod tdigest;

use serde::{Deserialize, Serialize};

use crate::batch::Value;
use crate::err::{Error, Result};

/// The scalar(s) a sketch reduces to once a query wants a final answer. A
/// matrel row never stores this — only the pre-finalize transition state,
/// i.e. the sketch itself rather than its finalized scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FinalizedValue {
	U64(u64),
	F64(f64),
	Bool(bool),
	TopK(Vec<(String, u64)>),
	Buckets(Vec<(String, f64)>),
}

/// Common contract every sketch implements. `combine` must be associative
/// and commutative — the combiner relies on this to merge partials from any
/// number of workers in any order.
pub trait Aggregate: Sized + Clone {
	fn init() -> Self;
	fn add(&mut self, value: &Value);
	fn combine(&mut self, other: &Self) -> Result<()>;
	fn serialize(&self) -> Vec<u8>;
	fn deserialize(bytes: &[u8]) -> Result<Self>;
	fn finalize(&self) -> FinalizedValue;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SketchKind {
	Count,
	Sum,
	HyperLogLog,
	CountMin,
	Bloom,
	TDigest,
	SpaceSaving,
	BucketAgg,
	Raw,
}

/// A plain running count; the simplest possible `Aggregate` impl, kept
/// alongside the sketch types since every grouped CQ needs one.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Count(pub u64);

impl Aggregate for Count {
	fn init() -> Self {
		Count(0)
	}
	fn add(&mut self, _value: &Value) {
		self.0 += 1;
	}
	fn combine(&mut self, other: &Self) -> Result<()> {
		self.0 += other.0;
		Ok(())
	}
	fn serialize(&self) -> Vec<u8> {
		self.0.to_le_bytes().to_vec()
	}
	fn deserialize(bytes: &[u8]) -> Result<Self> {
		let arr: [u8; 8] = bytes.try_into().map_err(|_| Error::SketchDecode("count".into()))?;
		Ok(Count(u64::from_le_bytes(arr)))
	}
	fn finalize(&self) -> FinalizedValue {
		FinalizedValue::U64(self.0)
	}
}

/// A running floating-point sum.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Sum(pub f64);

impl Aggregate for Sum {
	fn init() -> Self {
		Sum(0.0)
	}
	fn add(&mut self, value: &Value) {
		if let Some(f) = value.as_f64() {
			self.0 += f;
		}
	}
	fn combine(&mut self, other: &Self) -> Result<()> {
		self.0 += other.0;
		Ok(())
	}
	fn serialize(&self) -> Vec<u8> {
		self.0.to_le_bytes().to_vec()
	}
	fn deserialize(bytes: &[u8]) -> Result<Self> {
		let arr: [u8; 8] = bytes.try_into().map_err(|_| Error::SketchDecode("sum".into()))?;
		Ok(Sum(f64::from_le_bytes(arr)))
	}
	fn finalize(&self) -> FinalizedValue {
		FinalizedValue::F64(self.0)
	}
}

/// Dynamically-dispatched aggregate transition state. One variant per
/// `SketchKind`; `Raw` is the escape hatch for a column whose kind isn't
/// known yet (e.g. mid-migration), carrying opaque bytes that combine by
/// concatenation-then-truncation is *not* attempted — combining two `Raw`
/// states is an error, since there is no safe generic merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SketchState {
	Count(Count),
	Sum(Sum),
	HyperLogLog(hll::HyperLogLog),
	CountMin(cms::CountMinSketch),
	Bloom(bloom::BloomFilter),
	TDigest(tdigest::TDigest),
	SpaceSaving(spacesaving::SpaceSaving),
	BucketAgg(bucket::BucketAgg),
	Raw(Vec<u8>),
}

impl SketchState {
	pub fn kind(&self) -> SketchKind {
		match self {
			SketchState::Count(_) => SketchKind::Count,
			SketchState::Sum(_) => SketchKind::Sum,
			SketchState::HyperLogLog(_) => SketchKind::HyperLogLog,
			SketchState::CountMin(_) => SketchKind::CountMin,
			SketchState::Bloom(_) => SketchKind::Bloom,
			SketchState::TDigest(_) => SketchKind::TDigest,
			SketchState::SpaceSaving(_) => SketchKind::SpaceSaving,
			SketchState::BucketAgg(_) => SketchKind::BucketAgg,
			SketchState::Raw(_) => SketchKind::Raw,
		}
	}

	pub fn init(kind: SketchKind) -> Self {
		match kind {
			SketchKind::Count => SketchState::Count(Count::init()),
			SketchKind::Sum => SketchState::Sum(Sum::init()),
			SketchKind::HyperLogLog => SketchState::HyperLogLog(hll::HyperLogLog::init()),
			SketchKind::CountMin => SketchState::CountMin(cms::CountMinSketch::init()),
			SketchKind::Bloom => SketchState::Bloom(bloom::BloomFilter::init()),
			SketchKind::TDigest => SketchState::TDigest(tdigest::TDigest::init()),
			SketchKind::SpaceSaving => SketchState::SpaceSaving(spacesaving::SpaceSaving::init()),
			SketchKind::BucketAgg => SketchState::BucketAgg(bucket::BucketAgg::init()),
			SketchKind::Raw => SketchState::Raw(Vec::new()),
		}
	}

	pub fn add(&mut self, value: &Value) {
		match self {
			SketchState::Count(s) => s.add(value),
			SketchState::Sum(s) => s.add(value),
			SketchState::HyperLogLog(s) => s.add(value),
			SketchState::CountMin(s) => s.add(value),
			SketchState::Bloom(s) => s.add(value),
			SketchState::TDigest(s) => s.add(value),
			SketchState::SpaceSaving(s) => s.add(value),
			SketchState::BucketAgg(s) => s.add(value),
			SketchState::Raw(_) => {}
		}
	}

	pub fn combine(&mut self, other: &SketchState) -> Result<()> {
		match (self, other) {
			(SketchState::Count(a), SketchState::Count(b)) => a.combine(b),
			(SketchState::Sum(a), SketchState::Sum(b)) => a.combine(b),
			(SketchState::HyperLogLog(a), SketchState::HyperLogLog(b)) => a.combine(b),
			(SketchState::CountMin(a), SketchState::CountMin(b)) => a.combine(b),
			(SketchState::Bloom(a), SketchState::Bloom(b)) => a.combine(b),
			(SketchState::TDigest(a), SketchState::TDigest(b)) => a.combine(b),
			(SketchState::SpaceSaving(a), SketchState::SpaceSaving(b)) => a.combine(b),
			(SketchState::BucketAgg(a), SketchState::BucketAgg(b)) => a.combine(b),
			(a, b) => Err(Error::SketchMismatch(a.kind_name(), b.kind_name())),
		}
	}

	fn kind_name(&self) -> &'static str {
		match self {
			SketchState::Count(_) => "count",
			SketchState::Sum(_) => "sum",
			SketchState::HyperLogLog(_) => "hyperloglog",
			SketchState::CountMin(_) => "countmin",
			SketchState::Bloom(_) => "bloom",
			SketchState::TDigest(_) => "tdigest",
			SketchState::SpaceSaving(_) => "spacesaving",
			SketchState::BucketAgg(_) => "bucketagg",
			SketchState::Raw(_) => "raw",
		}
	}

	pub fn serialize(&self) -> Vec<u8> {
		match self {
			SketchState::Count(s) => s.serialize(),
			SketchState::Sum(s) => s.serialize(),
			SketchState::HyperLogLog(s) => s.serialize(),
			SketchState::CountMin(s) => s.serialize(),
			SketchState::Bloom(s) => s.serialize(),
			SketchState::TDigest(s) => s.serialize(),
			SketchState::SpaceSaving(s) => s.serialize(),
			SketchState::BucketAgg(s) => s.serialize(),
			SketchState::Raw(b) => b.clone(),
		}
	}

	pub fn deserialize(kind: SketchKind, bytes: &[u8]) -> Result<Self> {
		Ok(match kind {
			SketchKind::Count => SketchState::Count(Count::deserialize(bytes)?),
			SketchKind::Sum => SketchState::Sum(Sum::deserialize(bytes)?),
			SketchKind::HyperLogLog => SketchState::HyperLogLog(hll::HyperLogLog::deserialize(bytes)?),
			SketchKind::CountMin => SketchState::CountMin(cms::CountMinSketch::deserialize(bytes)?),
			SketchKind::Bloom => SketchState::Bloom(bloom::BloomFilter::deserialize(bytes)?),
			SketchKind::TDigest => SketchState::TDigest(tdigest::TDigest::deserialize(bytes)?),
			SketchKind::SpaceSaving => SketchState::SpaceSaving(spacesaving::SpaceSaving::deserialize(bytes)?),
			SketchKind::BucketAgg => SketchState::BucketAgg(bucket::BucketAgg::deserialize(bytes)?),
			SketchKind::Raw => SketchState::Raw(bytes.to_vec()),
		})
	}

	pub fn finalize(&self) -> FinalizedValue {
		match self {
			SketchState::Count(s) => s.finalize(),
			SketchState::Sum(s) => s.finalize(),
			SketchState::HyperLogLog(s) => s.finalize(),
			SketchState::CountMin(s) => s.finalize(),
			SketchState::Bloom(s) => s.finalize(),
			SketchState::TDigest(s) => s.finalize(),
			SketchState::SpaceSaving(s) => s.finalize(),
			SketchState::BucketAgg(s) => s.finalize(),
			SketchState::Raw(b) => FinalizedValue::U64(b.len() as u64),
		}
	}
}
