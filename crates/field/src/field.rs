//! Prime field GF(p) with p = 2^32 - 2^20 + 1.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

use crate::FieldError;

/// Field modulus: 4293918721 = 2^32 - 2^20 + 1.
pub const MODULUS: u32 = 4_293_918_721;

/// An element of GF(MODULUS), always stored in canonical form `[0, MODULUS)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Field32(u32);

impl Field32 {
    pub const ZERO: Field32 = Field32(0);
    pub const ONE: Field32 = Field32(1);

    /// Reduce an arbitrary integer into the field.
    pub fn new(value: u64) -> Self {
        Self((value % MODULUS as u64) as u32)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for Field32 {
    type Error = FieldError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value >= MODULUS {
            return Err(FieldError::NonCanonical(value));
        }
        Ok(Self(value))
    }
}

impl From<Field32> for u32 {
    fn from(value: Field32) -> Self {
        value.0
    }
}

impl fmt::Debug for Field32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Field32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Field32 {
    type Output = Field32;

    #[inline]
    fn add(self, rhs: Field32) -> Field32 {
        Field32::new(self.0 as u64 + rhs.0 as u64)
    }
}

impl AddAssign for Field32 {
    #[inline]
    fn add_assign(&mut self, rhs: Field32) {
        *self = *self + rhs;
    }
}

impl Sub for Field32 {
    type Output = Field32;

    #[inline]
    fn sub(self, rhs: Field32) -> Field32 {
        Field32::new(self.0 as u64 + MODULUS as u64 - rhs.0 as u64)
    }
}

impl Neg for Field32 {
    type Output = Field32;

    #[inline]
    fn neg(self) -> Field32 {
        Field32::ZERO - self
    }
}

impl Mul for Field32 {
    type Output = Field32;

    #[inline]
    fn mul(self, rhs: Field32) -> Field32 {
        Field32::new(self.0 as u64 * rhs.0 as u64)
    }
}

impl Sum for Field32 {
    fn sum<I: Iterator<Item = Field32>>(iter: I) -> Field32 {
        iter.fold(Field32::ZERO, |acc, x| acc + x)
    }
}
