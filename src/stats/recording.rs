use super::{HistogramLayout, Operation, OperationStats, ResultsMap, BUCKETS};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
struct Sample {
    response_time: i64,
    with_tx_overhead: i64,
}

/// Keeps every recorded sample in memory.
///
/// Only meant for short calibration runs that compute the boundaries of later
/// [histogram](super::Histogram) runs, since memory grows with every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RecordedSamples {
    successful: BTreeMap<Operation, Vec<Sample>>,
    errors: BTreeMap<Operation, Vec<Sample>>,
}

impl RecordedSamples {
    fn sample(response_time: i64, tx_overhead: i64) -> Sample {
        Sample {
            response_time,
            with_tx_overhead: response_time + tx_overhead,
        }
    }

    /// Records a successful request.
    pub fn register(&mut self, response_time: i64, tx_overhead: i64, operation: Operation) {
        self.successful
            .entry(operation)
            .or_default()
            .push(Self::sample(response_time, tx_overhead));
    }

    /// Records a failed request.
    pub fn register_error(&mut self, response_time: i64, tx_overhead: i64, operation: Operation) {
        self.errors
            .entry(operation)
            .or_default()
            .push(Self::sample(response_time, tx_overhead));
    }

    /// The number of successful samples of the given operation.
    pub fn len(&self, operation: Operation) -> usize {
        self.successful.get(&operation).map_or(0, Vec::len)
    }

    /// The number of failed samples of the given operation.
    pub fn error_len(&self, operation: Operation) -> usize {
        self.errors.get(&operation).map_or(0, Vec::len)
    }

    /// Replays the samples of one operation into running moments.
    pub fn moments(&self, operation: Operation) -> OperationStats {
        let mut stats = OperationStats::default();
        for s in self.successful.get(&operation).into_iter().flatten() {
            stats.register(s.response_time, s.with_tx_overhead - s.response_time);
        }
        for s in self.errors.get(&operation).into_iter().flatten() {
            stats.register_error(s.response_time, s.with_tx_overhead - s.response_time);
        }
        stats
    }

    /// Forgets all samples.
    pub fn reset(&mut self) {
        self.successful.clear();
        self.errors.clear();
    }

    /// Appends the samples of `other`.
    pub fn merge(&mut self, other: &RecordedSamples) {
        for (op, samples) in &other.successful {
            self.successful.entry(*op).or_default().extend(samples);
        }
        for (op, samples) in &other.errors {
            self.errors.entry(*op).or_default().extend(samples);
        }
    }

    /// Computes `buckets - 1` boundaries per operation so that every bucket receives roughly the
    /// same number of the recorded successful samples.
    ///
    /// Operations without samples are left out of the layout.
    pub fn layout(&self, buckets: usize) -> HistogramLayout {
        let mut layout = HistogramLayout::default();
        for (op, samples) in &self.successful {
            if samples.is_empty() || buckets == 0 {
                continue;
            }
            layout
                .net
                .insert(*op, boundaries(samples, buckets, |s| s.response_time));
            layout
                .tx
                .insert(*op, boundaries(samples, buckets, |s| s.with_tx_overhead));
        }
        layout
    }

    /// Exports the boundaries of a [`BUCKETS`]-bucket layout.
    pub fn results(&self) -> ResultsMap {
        self.layout(BUCKETS).results()
    }
}

fn boundaries(samples: &[Sample], buckets: usize, time: impl Fn(&Sample) -> i64) -> Vec<i64> {
    let mut sorted: Vec<i64> = samples.iter().map(time).collect();
    sorted.sort_unstable();
    (0..buckets - 1)
        .map(|i| sorted[(i + 1) * sorted.len() / buckets])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_depth_boundaries() {
        let mut samples = RecordedSamples::default();
        for t in (1..=100).rev() {
            samples.register(t, 10, Operation::Get);
        }
        samples.register_error(1000, 0, Operation::Get);

        let layout = samples.layout(4);
        assert_eq!(layout.net[&Operation::Get], vec![26, 51, 76]);
        assert_eq!(layout.tx[&Operation::Get], vec![36, 61, 86]);
        assert!(!layout.net.contains_key(&Operation::Put));
        assert_eq!(samples.error_len(Operation::Get), 1);

        let moments = samples.moments(Operation::Get);
        assert_eq!(moments.requests, 101);
        assert_eq!(moments.errors, 1);
        assert_eq!(moments.tx_overhead, 1000);
    }

    #[test]
    fn merge_appends() {
        let mut a = RecordedSamples::default();
        a.register(1, 0, Operation::Put);
        let mut b = RecordedSamples::default();
        b.register(2, 0, Operation::Put);
        b.register(3, 0, Operation::Remove);
        a.merge(&b);
        assert_eq!(a.len(Operation::Put), 2);
        assert_eq!(a.len(Operation::Remove), 1);

        let results = a.results();
        assert_eq!(
            results["PUT_NET"].as_str().map(|s| s.split(':').count()),
            Some(BUCKETS - 1)
        );
    }
}
