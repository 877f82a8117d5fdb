//! Window accumulator: folds valid shares into a running partial sum.

use std::collections::BTreeSet;

use facilitator_codec::SumRecord;
use facilitator_field::{Field32, FieldError, ShareScheme};
use uuid::Uuid;

/// Partial aggregate for one window, or for the part of it one batch covers.
///
/// Every operation is order independent, so per-batch states may be built
/// concurrently and merged in any order.
#[derive(Debug, Clone)]
pub struct WindowState<S: ShareScheme> {
    scheme: S,
    sum: S::Share,
    valid: u64,
    invalid: u64,
    ingestion_batches: BTreeSet<Uuid>,
}

impl<S: ShareScheme + Clone> WindowState<S> {
    pub fn new(scheme: S) -> Self {
        let sum = scheme.zero();
        Self {
            scheme,
            sum,
            valid: 0,
            invalid: 0,
            ingestion_batches: BTreeSet::new(),
        }
    }

    /// Add one valid share.
    pub fn accumulate(self, share: &S::Share) -> Result<Self, FieldError> {
        let sum = self.scheme.add(&self.sum, share)?;
        Ok(Self {
            sum,
            valid: self.valid + 1,
            ..self
        })
    }

    /// Count `count` rejected packets.
    pub fn reject(self, count: u64) -> Self {
        Self {
            invalid: self.invalid + count,
            ..self
        }
    }

    /// Record an ingestion batch as contributing to this state.
    pub fn with_batch(mut self, batch_uuid: Uuid) -> Self {
        self.ingestion_batches.insert(batch_uuid);
        self
    }

    /// Combine two partial states over disjoint batches.
    pub fn merge(self, other: Self) -> Result<Self, FieldError> {
        let sum = self.scheme.add(&self.sum, &other.sum)?;
        let mut ingestion_batches = self.ingestion_batches;
        ingestion_batches.extend(other.ingestion_batches);
        Ok(Self {
            scheme: self.scheme,
            sum,
            valid: self.valid + other.valid,
            invalid: self.invalid + other.invalid,
            ingestion_batches,
        })
    }

    pub fn sum(&self) -> &S::Share {
        &self.sum
    }

    pub fn valid(&self) -> u64 {
        self.valid
    }

    pub fn invalid(&self) -> u64 {
        self.invalid
    }
}

impl<S: ShareScheme<Share = Vec<Field32>> + Clone> WindowState<S> {
    pub fn finalize(self) -> SumRecord {
        SumRecord {
            sum: self.sum,
            valid_packets: self.valid,
            invalid_packets: self.invalid,
            ingestion_batches: self.ingestion_batches.into_iter().collect(),
        }
    }
}
