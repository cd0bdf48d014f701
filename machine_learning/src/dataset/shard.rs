use std::ops::Range;

/// Splits `total` samples among `replicas` and returns the range for `replica_id`.
///
/// Properties:
/// - Ranges are contiguous, disjoint and cover `[0..total)`.
/// - Sizes differ by at most 1 (balanced partition).
/// - When `total < replicas` the trailing replicas get empty ranges.
pub fn shard_range(total: usize, replica_id: usize, replicas: usize) -> Range<usize> {
    assert!(replicas > 0);
    assert!(replica_id < replicas);

    let base = total / replicas;
    let rem = total % replicas;

    let start = replica_id * base + replica_id.min(rem);
    let extra = if replica_id < rem { 1 } else { 0 };
    let end = start + base + extra;

    start..end
}
