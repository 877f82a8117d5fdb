//! Linear sketches over [`Field32`].
//!
//! A sketch is a handful of inner products of a vector with pseudo-random
//! projection vectors derived from a seed. Sketches are linear: if
//! `x = x_a + x_b` then `sketch(x) = sketch(x_a) + sketch(x_b)`, which lets
//! two processors holding additive shares check a claim about `x` without
//! either one seeing it.

use crate::{Field32, MODULUS};

/// Number of projections per sketch. A forged packet passes with
/// probability about `(1/p)^SKETCH_PROJECTIONS`.
pub const SKETCH_PROJECTIONS: usize = 4;

/// Derive a projection vector of `len` uniform field elements.
///
/// Uses blake3 as a PRG over `seed || context || index || block` and rejection
/// samples 4-byte words into the field.
pub fn projection(seed: &[u8; 32], context: &[u8], index: u8, len: usize) -> Vec<Field32> {
    let mut projection = Vec::with_capacity(len);
    let mut block: u32 = 0;

    while projection.len() < len {
        let mut input = Vec::with_capacity(32 + context.len() + 1 + 4);
        input.extend_from_slice(seed);
        input.extend_from_slice(context);
        input.push(index);
        input.extend_from_slice(&block.to_le_bytes());
        block += 1;

        let hash = blake3::hash(&input);
        for word in hash.as_bytes().chunks_exact(4) {
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            if value < MODULUS {
                projection.push(Field32::new(value as u64));
                if projection.len() == len {
                    break;
                }
            }
        }
    }

    projection
}

/// Inner product of two equal-length vectors.
pub fn dot(a: &[Field32], b: &[Field32]) -> Field32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| *x * *y).sum()
}

/// Sketch `data` under projections derived from `seed` and `context`.
pub fn sketch(seed: &[u8; 32], context: &[u8], data: &[Field32]) -> [Field32; SKETCH_PROJECTIONS] {
    let mut out = [Field32::ZERO; SKETCH_PROJECTIONS];
    for (index, value) in out.iter_mut().enumerate() {
        let r = projection(seed, context, index as u8, data.len());
        *value = dot(&r, data);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split;
    use rand::rngs::OsRng;

    #[test]
    fn test_projection_deterministic() {
        let seed = [42u8; 32];
        assert_eq!(projection(&seed, b"p", 0, 100), projection(&seed, b"p", 0, 100));
    }

    #[test]
    fn test_projection_depends_on_inputs() {
        let seed = [42u8; 32];
        let base = projection(&seed, b"p", 0, 16);
        assert_ne!(base, projection(&[43u8; 32], b"p", 0, 16));
        assert_ne!(base, projection(&seed, b"q", 0, 16));
        assert_ne!(base, projection(&seed, b"p", 1, 16));
    }

    #[test]
    fn test_projection_length() {
        let seed = [7u8; 32];
        for len in [0usize, 1, 7, 8, 9, 100] {
            assert_eq!(projection(&seed, b"", 0, len).len(), len);
        }
    }

    #[test]
    fn test_dot_basic() {
        let a: Vec<Field32> = [1u64, 2, 3].iter().map(|v| Field32::new(*v)).collect();
        let b: Vec<Field32> = [4u64, 5, 6].iter().map(|v| Field32::new(*v)).collect();
        assert_eq!(dot(&a, &b), Field32::new(32));
    }

    #[test]
    fn test_sketch_is_linear_over_shares() {
        let seed = [9u8; 32];
        let data: Vec<Field32> = (0..10u64).map(Field32::new).collect();
        let (a, b) = split(&data, &mut OsRng);

        let whole = sketch(&seed, b"packet", &data);
        let sa = sketch(&seed, b"packet", &a);
        let sb = sketch(&seed, b"packet", &b);
        for i in 0..SKETCH_PROJECTIONS {
            assert_eq!(sa[i] + sb[i], whole[i]);
        }
    }
}
