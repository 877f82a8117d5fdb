//! Facilitator Field
//!
//! Arithmetic the pipeline performs on secret shares:
//! - [`Field32`]: the prime field shares live in
//! - [`ShareScheme`]: the opaque `zero` / `add` / `combine` capability the
//!   accumulator is written against
//! - [`sketch`]: linear sketches used to cross-check a packet's two halves

pub mod field;
pub mod sharing;
pub mod sketch;

pub use field::{Field32, MODULUS};
pub use sharing::{split, ShareScheme, VectorShares};
pub use sketch::{dot, projection, sketch as linear_sketch, SKETCH_PROJECTIONS};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("value {0} is not a canonical field element")]
    NonCanonical(u32),
}

pub type Result<T> = std::result::Result<T, FieldError>;
