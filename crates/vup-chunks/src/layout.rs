//! Block layout: the deterministic partition of a file size into blocks.
//!
//! `block_sizes` is the oracle. Every block's cleartext size, on read and
//! again before commit, is compared against its output.

use std::num::NonZeroU64;

use crate::error::IntegrityError;

/// Partition `total` bytes into `total / max` full blocks followed by one
/// remainder block when `total % max > 0`. Zero bytes yields no blocks.
pub fn block_sizes(total: u64, max_block_size: NonZeroU64) -> Vec<u64> {
    let max = max_block_size.get();
    let quotient = total / max;
    let remainder = total % max;

    let mut sizes = Vec::with_capacity(quotient as usize + usize::from(remainder > 0));
    sizes.extend(std::iter::repeat(max).take(quotient as usize));
    if remainder > 0 {
        sizes.push(remainder);
    }
    sizes
}

/// Check an ordered list of `(index, clear_size)` pairs against the layout.
///
/// Indices must be contiguous from 1 and every size must match the oracle.
pub fn check_layout<I>(expected: &[u64], blocks: I) -> Result<(), IntegrityError>
where
    I: IntoIterator<Item = (u32, u64)>,
{
    let mut count = 0usize;
    for (position, (index, clear_size)) in blocks.into_iter().enumerate() {
        count += 1;
        if clear_size == 0 {
            return Err(IntegrityError::EmptyBlock { index });
        }
        let want = expected.get(position).copied();
        if index as usize != position + 1 || want != Some(clear_size) {
            return Err(IntegrityError::SizeMismatch {
                index,
                expected: want.unwrap_or(0),
                actual: clear_size,
            });
        }
    }
    if count != expected.len() {
        return Err(IntegrityError::CountMismatch {
            expected: expected.len(),
            actual: count,
        });
    }
    Ok(())
}
