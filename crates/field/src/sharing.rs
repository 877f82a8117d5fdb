//! Additive secret sharing over vectors of [`Field32`].

use std::fmt::Debug;

use rand::{CryptoRng, Rng};

use crate::{Field32, FieldError, Result, MODULUS};

/// The share operations the accumulator needs, independent of the concrete scheme.
pub trait ShareScheme: Send + Sync {
    type Share: Clone + Debug + PartialEq + Send + Sync;

    /// Number of field elements in one share.
    fn dimension(&self) -> usize;

    /// Additive identity.
    fn zero(&self) -> Self::Share;

    /// Accumulate `share` into `acc`. Associative and commutative.
    fn add(&self, acc: &Self::Share, share: &Self::Share) -> Result<Self::Share>;

    /// Recombine the two processors' halves into the underlying value.
    fn combine(&self, first: &Self::Share, second: &Self::Share) -> Result<Self::Share>;
}

/// Two-party additive sharing of fixed-length vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorShares {
    dimension: usize,
}

impl VectorShares {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn check(&self, share: &[Field32]) -> Result<()> {
        if share.len() != self.dimension {
            return Err(FieldError::DimensionMismatch {
                expected: self.dimension,
                actual: share.len(),
            });
        }
        Ok(())
    }
}

impl ShareScheme for VectorShares {
    type Share = Vec<Field32>;

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn zero(&self) -> Vec<Field32> {
        vec![Field32::ZERO; self.dimension]
    }

    fn add(&self, acc: &Vec<Field32>, share: &Vec<Field32>) -> Result<Vec<Field32>> {
        self.check(acc)?;
        self.check(share)?;
        Ok(acc.iter().zip(share).map(|(a, b)| *a + *b).collect())
    }

    fn combine(&self, first: &Vec<Field32>, second: &Vec<Field32>) -> Result<Vec<Field32>> {
        // Additive shares reconstruct by addition.
        self.add(first, second)
    }
}

/// Split `secret` into two uniformly random additive shares.
pub fn split<R: Rng + CryptoRng>(secret: &[Field32], rng: &mut R) -> (Vec<Field32>, Vec<Field32>) {
    let first: Vec<Field32> = secret
        .iter()
        .map(|_| Field32::new(rng.gen_range(0..MODULUS) as u64))
        .collect();
    let second = secret.iter().zip(&first).map(|(s, a)| *s - *a).collect();
    (first, second)
}
