//! Deterministic division of the integer key space among workers and their threads.
//!
//! Every worker computes the same partitioning independently, so no coordination is needed to
//! agree on which thread owns which key.

use eyre::bail;
use std::fmt;

/// A half-open interval `[start, end)` of key indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct KeyRange {
    start: i64,
    end: i64,
}

impl KeyRange {
    /// Creates the range `[start, end)`.
    ///
    /// Panics if `end < start`.
    pub fn new(start: i64, end: i64) -> Self {
        assert!(start <= end, "invalid key range [{}, {})", start, end);
        Self { start, end }
    }

    /// The first key index of the range.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// The first key index after the range.
    pub fn end(&self) -> i64 {
        self.end
    }

    /// The number of keys in the range.
    pub fn size(&self) -> i64 {
        self.end - self.start
    }

    /// Returns `true` if the range contains no keys.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns `true` if `key_id` lies inside the range.
    pub fn contains(&self, key_id: i64) -> bool {
        self.start <= key_id && key_id < self.end
    }

    /// Moves the range by `offset` keys.
    pub fn shift(self, offset: i64) -> Self {
        Self::new(self.start + offset, self.end + offset)
    }

    /// Iterates over all key indices of the range.
    pub fn iter(&self) -> std::ops::Range<i64> {
        self.start..self.end
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Splits `[0, total)` into `parts` contiguous ranges and returns the one with the given index.
///
/// The first `total % parts` ranges are one key larger than the rest, so that the ranges of all
/// indices are disjoint and together cover `[0, total)` exactly.
///
/// ## Examples
///
/// ```
/// use cachestress::range::{divide, KeyRange};
///
/// assert_eq!(divide(10, 3, 0), KeyRange::new(0, 4));
/// assert_eq!(divide(10, 3, 1), KeyRange::new(4, 7));
/// assert_eq!(divide(10, 3, 2), KeyRange::new(7, 10));
/// ```
pub fn divide(total: i64, parts: u32, index: u32) -> KeyRange {
    assert!(parts > 0, "cannot divide a range into zero parts");
    assert!(index < parts, "part index {} out of bounds ({})", index, parts);
    let parts = i64::from(parts);
    let index = i64::from(index);

    let base = total / parts + 1;
    let larger = total % parts;
    if index < larger {
        KeyRange::new(index * base, index * base + base)
    } else {
        let start = base * larger + (index - larger) * (base - 1);
        KeyRange::new(start, start + base - 1)
    }
}

/// Computes the range of a whole worker.
pub fn worker_range(num_entries: i64, num_workers: u32, worker_index: u32) -> KeyRange {
    divide(num_entries, num_workers, worker_index)
}

/// Computes the range of thread `thread_index` of worker `worker_index`.
///
/// The worker range is divided among its threads with the same rule as [`divide`] and the result
/// is shifted to the start of the worker range.
pub fn thread_range(
    num_entries: i64,
    num_workers: u32,
    threads_per_worker: u32,
    worker_index: u32,
    thread_index: u32,
) -> KeyRange {
    let worker = worker_range(num_entries, num_workers, worker_index);
    divide(worker.size(), threads_per_worker, thread_index).shift(worker.start())
}

/// Redistributes the given ranges among `parts` receivers.
///
/// The ranges are treated as one concatenated sequence of keys that is split into `parts`
/// contiguous chunks with [`divide`]. A chunk that spans the border of two input ranges is
/// returned as two fragments, so every returned fragment lies completely inside one input
/// range. Empty fragments are omitted.
///
/// The returned vector has exactly `parts` entries; entry `i` lists the fragments of receiver `i`.
pub fn balance(ranges: &[KeyRange], parts: u32) -> Vec<Vec<KeyRange>> {
    let total: i64 = ranges.iter().map(KeyRange::size).sum();
    let mut assignments = Vec::with_capacity(parts as usize);
    for part in 0..parts {
        let chunk = divide(total, parts, part);
        let mut fragments = Vec::new();
        let mut offset = 0;
        for range in ranges {
            // position of `range` in the concatenated sequence
            let virtual_start = offset;
            let virtual_end = offset + range.size();
            offset = virtual_end;

            let from = chunk.start().max(virtual_start);
            let to = chunk.end().min(virtual_end);
            if from < to {
                fragments.push(KeyRange::new(
                    range.start() + (from - virtual_start),
                    range.start() + (to - virtual_start),
                ));
            }
        }
        assignments.push(fragments);
    }
    assignments
}

/// Computes the fragments of dead workers' ranges that a live thread has to take over.
///
/// The full ranges of all `dead_workers` are [balanced](balance) across the threads of the
/// remaining live workers. Live threads are numbered `live_index * threads_per_worker + thread`,
/// where `live_index` is the worker index minus the number of dead workers with a lower index.
///
/// Errors if `worker_index` is itself listed as dead or if no worker is left alive.
pub fn dead_worker_fragments(
    num_entries: i64,
    num_workers: u32,
    threads_per_worker: u32,
    dead_workers: &[u32],
    worker_index: u32,
    thread_index: u32,
) -> eyre::Result<Vec<KeyRange>> {
    if dead_workers.is_empty() {
        return Ok(Vec::new());
    }
    if dead_workers.contains(&worker_index) {
        bail!("worker {} is listed as dead and cannot load data", worker_index);
    }
    let mut dead: Vec<u32> = dead_workers.to_vec();
    dead.sort_unstable();
    dead.dedup();
    if let Some(invalid) = dead.iter().find(|&&w| w >= num_workers) {
        bail!(
            "dead worker index {} out of bounds (cluster has {} workers)",
            invalid,
            num_workers
        );
    }
    let live_workers = num_workers - dead.len() as u32;
    if live_workers == 0 {
        bail!("all workers are marked as dead");
    }

    let dead_ranges: Vec<_> = dead
        .iter()
        .map(|&w| worker_range(num_entries, num_workers, w))
        .collect();
    let live_index = worker_index - dead.iter().filter(|&&w| w < worker_index).count() as u32;
    let mut assignments = balance(&dead_ranges, live_workers * threads_per_worker);
    Ok(assignments.swap_remove((live_index * threads_per_worker + thread_index) as usize))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_exhaustive(mut ranges: Vec<KeyRange>, total: i64) {
        ranges.retain(|r| !r.is_empty());
        ranges.sort_by_key(|r| r.start());
        let mut expected_start = 0;
        for range in ranges {
            assert_eq!(range.start(), expected_start, "gap or overlap at {}", range);
            expected_start = range.end();
        }
        assert_eq!(expected_start, total);
    }

    #[test]
    fn divide_assigns_remainder_to_lowest_indices() {
        let sizes: Vec<_> = (0..4).map(|i| divide(10, 4, i).size()).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2]);
        assert_exhaustive((0..4).map(|i| divide(10, 4, i)).collect(), 10);
    }

    #[test]
    fn divide_more_parts_than_keys() {
        assert_eq!(divide(2, 4, 1), KeyRange::new(1, 2));
        assert_eq!(divide(2, 4, 3), KeyRange::new(2, 2));
        assert_exhaustive((0..4).map(|i| divide(2, 4, i)).collect(), 2);
    }

    #[test]
    fn worker_and_thread_ranges() {
        assert_eq!(worker_range(100, 4, 2), KeyRange::new(50, 75));
        assert_eq!(thread_range(100, 4, 5, 2, 3), KeyRange::new(65, 70));

        for &(n, w, t) in &[(100, 4, 5), (1001, 3, 7), (5, 2, 4), (0, 3, 2)] {
            let ranges = (0..w)
                .flat_map(|worker| (0..t).map(move |thread| thread_range(n, w, t, worker, thread)))
                .collect();
            assert_exhaustive(ranges, n);
        }
    }

    #[test]
    fn balance_splits_at_range_borders() {
        let ranges = [KeyRange::new(0, 3), KeyRange::new(10, 13)];
        let balanced = balance(&ranges, 4);
        assert_eq!(
            balanced,
            vec![
                vec![KeyRange::new(0, 2)],
                vec![KeyRange::new(2, 3), KeyRange::new(10, 11)],
                vec![KeyRange::new(11, 12)],
                vec![KeyRange::new(12, 13)],
            ]
        );
    }

    #[test]
    fn dead_worker_redistribution() {
        let dead_range = worker_range(100, 4, 2);
        let mut fragments = Vec::new();
        for worker in [0, 1, 3] {
            for thread in 0..3 {
                let assigned = dead_worker_fragments(100, 4, 3, &[2], worker, thread).unwrap();
                assert_eq!(assigned.len(), 1);
                fragments.extend(assigned);
            }
        }
        assert_eq!(fragments.len(), 9);
        for fragment in &fragments {
            assert!(dead_range.start() <= fragment.start() && fragment.end() <= dead_range.end());
        }
        let shifted = fragments.into_iter().map(|f| f.shift(-dead_range.start())).collect();
        assert_exhaustive(shifted, dead_range.size());
    }

    #[test]
    fn dead_worker_cannot_load() {
        assert!(dead_worker_fragments(100, 4, 3, &[2], 2, 0).is_err());
        assert!(dead_worker_fragments(100, 2, 3, &[0, 1], 0, 0).is_err());
        assert_eq!(
            dead_worker_fragments(100, 4, 3, &[], 2, 0).unwrap(),
            Vec::<KeyRange>::new()
        );
    }
}
