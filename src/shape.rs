//! Shape arithmetic shared by builders, executors and the code generator:
//! broadcast compatibility, accumulated (row-major) strides and the index
//! wrap used to read a broadcast operand out of a flat buffer.

use crate::errors::{FlintError, FlintResult};

/// Number of elements of a shape. The empty shape is not representable;
/// every tensor has rank >= 1 and no zero-sized dimensions.
pub fn num_elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major accumulated strides: `acc[d]` is the number of elements one
/// step along dimension `d` advances in the flat buffer.
pub fn accumulated_strides(shape: &[usize]) -> Vec<usize> {
    let mut acc = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        acc[d] = acc[d + 1] * shape[d + 1];
    }
    acc
}

/// How a binary operand lines up against the result shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastKind {
    /// Shapes are identical, the operand is read directly.
    Identity,
    /// The operand is a suffix of the result shape and repeats along the
    /// leading dimensions.
    Normal,
    /// The operand is a prefix of the result shape and repeats along the
    /// trailing dimensions.
    Inverse,
}

fn is_suffix(longer: &[usize], shorter: &[usize]) -> bool {
    shorter.len() <= longer.len() && longer[longer.len() - shorter.len()..] == *shorter
}

fn is_prefix(longer: &[usize], shorter: &[usize]) -> bool {
    shorter.len() <= longer.len() && longer[..shorter.len()] == *shorter
}

/// Result shape of an elementwise binary operation, or an error when the
/// operands are neither normal- nor inverse-broadcastable. `force_inverse`
/// is set per operand (spec: a node may be marked for inverse
/// broadcasting, in which case the prefix alignment must hold).
pub fn broadcast_shape(
    a: &[usize],
    b: &[usize],
    a_inverse: bool,
    b_inverse: bool,
) -> FlintResult<Vec<usize>> {
    let (longer, shorter, shorter_inverse) = if a.len() >= b.len() {
        (a, b, b_inverse)
    } else {
        (b, a, a_inverse)
    };
    let compatible = if shorter_inverse {
        is_prefix(longer, shorter)
    } else {
        is_suffix(longer, shorter) || is_prefix(longer, shorter)
    };
    if !compatible {
        return Err(FlintError::incompatible_shapes(
            a,
            b,
            "operands are not broadcastable",
        ));
    }
    Ok(longer.to_vec())
}

/// Alignment of an operand of shape `operand` against `result`, taking a
/// forced-inverse mark into account. Normal wins when both alignments are
/// legal and no mark is set; identical shapes are never wrapped, which
/// keeps the inverse mark advisory in that case.
pub fn broadcast_kind(result: &[usize], operand: &[usize], force_inverse: bool) -> BroadcastKind {
    if result == operand {
        BroadcastKind::Identity
    } else if force_inverse || !is_suffix(result, operand) {
        BroadcastKind::Inverse
    } else {
        BroadcastKind::Normal
    }
}

/// Flat-index parameters for reading a broadcast operand: the operand
/// element for result index `i` is `data[(i / inv_stride) % modulus]`.
pub fn broadcast_wrap(
    result_size: usize,
    operand_size: usize,
    kind: BroadcastKind,
) -> (usize, usize) {
    match kind {
        BroadcastKind::Inverse => (result_size / operand_size, operand_size),
        BroadcastKind::Identity | BroadcastKind::Normal => (1, operand_size),
    }
}

/// Restores the flat index of the element `(i / inv_stride) % modulus`.
#[inline]
pub fn wrap_index(i: usize, inv_stride: usize, modulus: usize) -> usize {
    (i / inv_stride) % modulus
}

/// Decomposes flat index `i` into the coordinate along dimension `d`,
/// given the accumulated strides of the shape.
#[inline]
pub fn coordinate(i: usize, acc: &[usize], d: usize, shape: &[usize]) -> usize {
    (i / acc[d]) % shape[d]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_are_row_major() {
        assert_eq!(accumulated_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(accumulated_strides(&[7]), vec![1]);
    }

    #[test]
    fn suffix_broadcast_wins_over_prefix() {
        // [2, 2] against [2, 2, 2] is both a prefix and a suffix; normal
        // (suffix) alignment is preferred unless forced.
        let kind = broadcast_kind(&[2, 2, 2], &[2, 2], false);
        assert_eq!(kind, BroadcastKind::Normal);
        let kind = broadcast_kind(&[2, 2, 2], &[2, 2], true);
        assert_eq!(kind, BroadcastKind::Inverse);
    }

    #[test]
    fn incompatible_shapes_are_rejected() {
        assert!(broadcast_shape(&[2, 3], &[4], false, false).is_err());
        assert!(broadcast_shape(&[2, 3], &[3], false, false).is_ok());
        assert!(broadcast_shape(&[2, 3], &[2], false, true).is_ok());
        // [2] is a valid suffix but not a prefix of [3, 2]; forcing
        // inverse must fail.
        assert!(broadcast_shape(&[3, 2], &[2], false, true).is_err());
    }

    #[test]
    fn inverse_wrap_repeats_trailing() {
        let (inv, m) = broadcast_wrap(6, 2, BroadcastKind::Inverse);
        let reads: Vec<usize> = (0..6).map(|i| wrap_index(i, inv, m)).collect();
        assert_eq!(reads, vec![0, 0, 0, 1, 1, 1]);
    }
}
