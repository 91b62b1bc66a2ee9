use std::ops::Range;

/// Splits `total` samples among `world_size` workers and returns the range of `rank`.
///
/// Ranges are contiguous, disjoint, cover `0..total` and differ in length by at most one.
///
/// # Panics
/// If `world_size` is zero or `rank` is out of range.
pub fn shard_range(total: usize, rank: usize, world_size: usize) -> Range<usize> {
    assert!(world_size > 0);
    assert!(rank < world_size);

    let base = total / world_size;
    let rem = total % world_size;

    let start = rank * base + rank.min(rem);
    let end = start + base + usize::from(rank < rem);

    start..end
}
