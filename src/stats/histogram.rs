use super::{Operation, ResultsMap, StatsError};
use std::{collections::BTreeMap, fmt};

/// Default number of buckets computed during calibration runs.
pub const BUCKETS: usize = 32;

/// Counts samples in `K` buckets delimited by `K - 1` fixed boundaries.
///
/// Bucket `i` holds the samples `x` with `boundaries[i - 1] <= x < boundaries[i]`; the first
/// bucket is unbounded below and the last one unbounded above. Bucket lookup is a binary search
/// over the boundaries.
///
/// ## Examples
///
/// ```
/// use cachestress::stats::Histogram;
///
/// let mut histogram = Histogram::new(vec![10, 20, 30]);
/// for sample in [5, 15, 25, 35] {
///     histogram.add(sample);
/// }
/// assert_eq!(histogram.counts(), &[1, 1, 1, 1]);
/// assert_eq!(histogram.to_string(), "5:10:20:30:35=1:1:1:1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Histogram {
    boundaries: Vec<i64>,
    counts: Vec<u64>,
    min: i64,
    max: i64,
}

impl Histogram {
    /// Creates an empty histogram with the given sorted boundaries.
    pub fn new(boundaries: Vec<i64>) -> Self {
        debug_assert!(boundaries.windows(2).all(|w| w[0] <= w[1]));
        let counts = vec![0; boundaries.len() + 1];
        Self {
            boundaries,
            counts,
            min: i64::MAX,
            max: i64::MIN,
        }
    }

    /// Records one sample.
    pub fn add(&mut self, value: i64) {
        let bucket = self.boundaries.partition_point(|&b| b <= value);
        self.counts[bucket] += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// The bucket boundaries.
    pub fn boundaries(&self) -> &[i64] {
        &self.boundaries
    }

    /// The number of samples per bucket.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Returns `true` if no sample was recorded.
    pub fn is_empty(&self) -> bool {
        self.max == i64::MIN
    }

    /// Forgets all samples, keeping the boundaries.
    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
        self.min = i64::MAX;
        self.max = i64::MIN;
    }

    /// Adds the counts of `other`, which must have the same number of boundaries.
    pub fn merge(&mut self, other: &Histogram) -> Result<(), StatsError> {
        if self.boundaries.len() != other.boundaries.len() {
            return Err(StatsError::IllegalArgument(format!(
                "cannot merge histograms with {} and {} boundaries",
                self.boundaries.len(),
                other.boundaries.len()
            )));
        }
        for (count, other) in self.counts.iter_mut().zip(&other.counts) {
            *count += other;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        Ok(())
    }
}

/// Formats the histogram as `min:b1:...:bk:max=c1:...:cn`, or as an empty string if no sample
/// was recorded.
impl fmt::Display for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        write!(f, "{}:", self.min)?;
        for boundary in &self.boundaries {
            write!(f, "{}:", boundary)?;
        }
        write!(f, "{}=", self.max)?;
        let counts: Vec<_> = self.counts.iter().map(u64::to_string).collect();
        f.write_str(&counts.join(":"))
    }
}

/// The bucket boundaries for every operation, for net response times and for response times
/// including transaction overhead.
///
/// Usually computed by an [`AllRecording`][super::Statistics::all_recording] calibration run.
/// Operations without boundaries get a single bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HistogramLayout {
    /// Boundaries for net response times.
    #[serde(default)]
    pub net: BTreeMap<Operation, Vec<i64>>,
    /// Boundaries for response times including transaction overhead.
    #[serde(default)]
    pub tx: BTreeMap<Operation, Vec<i64>>,
}

impl HistogramLayout {
    /// Exports the boundaries as `<OP>_NET` and `<OP>_TX` entries.
    pub fn results(&self) -> ResultsMap {
        let mut results = ResultsMap::new();
        let join = |b: &Vec<i64>| {
            b.iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(":")
        };
        for (op, boundaries) in &self.net {
            results.insert(format!("{}_NET", op.name()), join(boundaries).into());
        }
        for (op, boundaries) in &self.tx {
            results.insert(format!("{}_TX", op.name()), join(boundaries).into());
        }
        results
    }
}

/// Histograms of all operations.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HistogramStatistics {
    net: Vec<Histogram>,
    tx: Vec<Histogram>,
}

impl HistogramStatistics {
    /// Creates empty histograms with the boundaries of the given layout.
    pub fn new(layout: &HistogramLayout) -> Self {
        let histograms = |map: &BTreeMap<Operation, Vec<i64>>| {
            Operation::ALL
                .iter()
                .map(|op| Histogram::new(map.get(op).cloned().unwrap_or_default()))
                .collect()
        };
        Self {
            net: histograms(&layout.net),
            tx: histograms(&layout.tx),
        }
    }

    /// Records a successful request. Failed requests are not recorded in histograms.
    pub fn register(&mut self, response_time: i64, tx_overhead: i64, operation: Operation) {
        self.net[operation.index()].add(response_time);
        self.tx[operation.index()].add(response_time + tx_overhead);
    }

    /// The histogram of the net response times of the given operation.
    pub fn net(&self, operation: Operation) -> &Histogram {
        &self.net[operation.index()]
    }

    /// The histogram of the response times including transaction overhead.
    pub fn tx(&self, operation: Operation) -> &Histogram {
        &self.tx[operation.index()]
    }

    /// Forgets all samples.
    pub fn reset(&mut self) {
        self.net.iter_mut().chain(self.tx.iter_mut()).for_each(Histogram::reset);
    }

    /// Merges the histograms of all operations.
    pub fn merge(&mut self, other: &HistogramStatistics) -> Result<(), StatsError> {
        for (mine, theirs) in self
            .net
            .iter_mut()
            .zip(&other.net)
            .chain(self.tx.iter_mut().zip(&other.tx))
        {
            mine.merge(theirs)?;
        }
        Ok(())
    }

    /// Exports `<prefix><OP>_NET_HISTOGRAM` and `<prefix><OP>_TX_HISTOGRAM` for all used
    /// operations.
    pub fn results(&self, prefix: &str, results: &mut ResultsMap) {
        for op in Operation::ALL {
            let net = &self.net[op.index()];
            if !net.is_empty() {
                results.insert(
                    format!("{}{}_NET_HISTOGRAM", prefix, op.name()),
                    net.to_string().into(),
                );
            }
            let tx = &self.tx[op.index()];
            if !tx.is_empty() {
                results.insert(
                    format!("{}{}_TX_HISTOGRAM", prefix, op.name()),
                    tx.to_string().into(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_values_belong_to_upper_bucket() {
        let mut histogram = Histogram::new(vec![10, 20]);
        histogram.add(10);
        histogram.add(19);
        histogram.add(20);
        histogram.add(i64::MIN);
        assert_eq!(histogram.counts(), &[1, 2, 1]);
    }

    #[test]
    fn empty_export() {
        let histogram = Histogram::new(vec![1, 2]);
        assert!(histogram.is_empty());
        assert_eq!(histogram.to_string(), "");
    }

    #[test]
    fn merge_requires_same_layout() {
        let mut a = Histogram::new(vec![10, 20, 30]);
        let mut b = Histogram::new(vec![10, 20, 30]);
        a.add(1);
        b.add(100);
        a.merge(&b).unwrap();
        assert_eq!(a.to_string(), "1:10:20:30:100=1:0:0:1");

        let c = Histogram::new(vec![10]);
        assert!(matches!(a.merge(&c), Err(StatsError::IllegalArgument(_))));
    }

    #[test]
    fn statistics_export() {
        let mut layout = HistogramLayout::default();
        layout.net.insert(Operation::Put, vec![100]);
        layout.tx.insert(Operation::Put, vec![150]);
        let mut stats = HistogramStatistics::new(&layout);
        stats.register(50, 100, Operation::Put);
        stats.register(200, 0, Operation::Put);

        let mut results = ResultsMap::new();
        stats.results("W0.", &mut results);
        assert_eq!(results.len(), 2);
        assert_eq!(results["W0.PUT_NET_HISTOGRAM"], "50:100:200=1:1");
        assert_eq!(results["W0.PUT_TX_HISTOGRAM"], "150:150:200=0:2");
        assert_eq!(layout.results()["PUT_NET"], "100");
    }
}
