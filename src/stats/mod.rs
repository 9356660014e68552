//! Running statistics of stressor requests with snapshot and merge support.
//!
//! All statistics variants are represented by the single [`Statistics`] type. Each stressor
//! thread records into its own instance; the statistics thread periodically takes a
//! [snapshot](Statistics::snapshot) of every stressor's instance and
//! [merges](Statistics::merge) them into one record per interval.
//!
//! The supported variants are:
//!
//! - **Simple:** running mean and second moment per [`Operation`], see [`OperationStats`].
//! - **Histogram:** a [`Histogram`] with fixed boundaries per operation.
//! - **Multi:** simple moments and histograms recorded side by side.
//! - **AllRecording:** keeps every sample, used to calibrate histogram boundaries.
//! - **Periodic:** a time-bucketed sequence of one of the variants above.

pub use self::{
    histogram::{Histogram, HistogramLayout, HistogramStatistics, BUCKETS},
    operation::Operation,
    operation_stats::{BoxAndWhiskers, MeanAndDev, OperationStats},
    periodic::PeriodicStatistics,
    recording::RecordedSamples,
};
use crate::config::StatisticsKind;
use std::{collections::BTreeMap, error::Error, fmt, time::Duration};

mod histogram;
mod operation;
mod operation_stats;
mod periodic;
mod recording;

/// Nanoseconds per second.
pub const NS_IN_SEC: i64 = 1_000_000_000;

/// Nanoseconds per millisecond.
pub const NS_IN_MS: i64 = 1_000_000;

/// Flat export format of statistics, consumed by report generators.
pub type ResultsMap = BTreeMap<String, serde_json::Value>;

/// The current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Misuse of the statistics API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsError {
    /// The operation is not allowed in the current state, e.g. recording into a snapshot.
    IllegalState(String),
    /// The arguments are incompatible, e.g. merging different statistics variants.
    IllegalArgument(String),
}

impl fmt::Display for StatsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalState(msg) => write!(f, "illegal state: {}", msg),
            Self::IllegalArgument(msg) => write!(f, "illegal argument: {}", msg),
        }
    }
}

impl Error for StatsError {}

/// Identifies the variant of a [`Statistics`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    /// Moments only.
    Simple,
    /// Histograms only.
    Histogram,
    /// Moments and histograms.
    Multi,
    /// Raw samples.
    AllRecording,
    /// Time-bucketed statistics.
    Periodic,
}

#[derive(Debug, Clone, PartialEq)]
enum Recorder {
    Simple(Vec<OperationStats>),
    Histogram(HistogramStatistics),
    Multi(Vec<OperationStats>, HistogramStatistics),
    AllRecording(RecordedSamples),
    Periodic(PeriodicStatistics),
}

/// Statistics recorded during one interval.
///
/// An instance is either _live_, recording requests of a single stressor thread, or a sealed
/// _snapshot_. Snapshots reject [`register_request`](Self::register_request),
/// [`register_error`](Self::register_error) and [`reset`](Self::reset) with
/// [`StatsError::IllegalState`]; only snapshots can be [merged](Self::merge).
///
/// Interval timestamps are milliseconds since the Unix epoch, response times are nanoseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    recorder: Recorder,
    interval_begin: i64,
    interval_end: i64,
    node_up: bool,
    cache_size: i64,
    snapshot: bool,
}

impl Statistics {
    fn with_recorder(recorder: Recorder) -> Self {
        let now = now_millis();
        Self {
            recorder,
            interval_begin: now,
            interval_end: now,
            node_up: true,
            cache_size: -1,
            snapshot: false,
        }
    }

    /// Creates statistics that track running moments only.
    pub fn simple() -> Self {
        Self::with_recorder(Recorder::Simple(empty_moments()))
    }

    /// Creates statistics that only track histograms with the given boundaries.
    pub fn histogram(layout: &HistogramLayout) -> Self {
        Self::with_recorder(Recorder::Histogram(HistogramStatistics::new(layout)))
    }

    /// Creates statistics that track both running moments and histograms.
    pub fn multi(layout: &HistogramLayout) -> Self {
        Self::with_recorder(Recorder::Multi(
            empty_moments(),
            HistogramStatistics::new(layout),
        ))
    }

    /// Creates statistics that keep every sample.
    pub fn all_recording() -> Self {
        Self::with_recorder(Recorder::AllRecording(RecordedSamples::default()))
    }

    /// Creates time-bucketed statistics; every bucket is a copy of `prototype`.
    pub fn periodic(prototype: Statistics, period: Duration) -> Self {
        let period = (period.as_millis() as i64).max(1);
        Self::with_recorder(Recorder::Periodic(PeriodicStatistics::new(
            prototype, period,
        )))
    }

    /// Creates statistics of the configured variant.
    pub fn from_kind(kind: &StatisticsKind) -> Self {
        match kind {
            StatisticsKind::Simple => Self::simple(),
            StatisticsKind::Histogram(layout) => Self::histogram(layout),
            StatisticsKind::Multi(layout) => Self::multi(layout),
            StatisticsKind::AllRecording => Self::all_recording(),
            StatisticsKind::Periodic { bucket } => Self::periodic(Self::simple(), *bucket),
        }
    }

    /// Returns an empty, live instance of the same variant.
    pub fn empty_copy(&self) -> Self {
        let recorder = match &self.recorder {
            Recorder::Simple(_) => Recorder::Simple(empty_moments()),
            Recorder::Histogram(h) => {
                let mut h = h.clone();
                h.reset();
                Recorder::Histogram(h)
            }
            Recorder::Multi(_, h) => {
                let mut h = h.clone();
                h.reset();
                Recorder::Multi(empty_moments(), h)
            }
            Recorder::AllRecording(_) => Recorder::AllRecording(RecordedSamples::default()),
            Recorder::Periodic(p) => {
                let mut p = p.clone();
                p.reset();
                Recorder::Periodic(p)
            }
        };
        Self::with_recorder(recorder)
    }

    /// Creates a sealed, empty record of the same variant that marks `[begin, end)` as a period
    /// in which the node was down.
    pub fn node_down(&self, begin: i64, end: i64) -> Self {
        let mut stats = self.empty_copy();
        stats.interval_begin = begin;
        stats.interval_end = end;
        stats.node_up = false;
        stats.snapshot = true;
        stats
    }

    /// The variant of this instance.
    pub fn variant(&self) -> Variant {
        match self.recorder {
            Recorder::Simple(_) => Variant::Simple,
            Recorder::Histogram(_) => Variant::Histogram,
            Recorder::Multi(_, _) => Variant::Multi,
            Recorder::AllRecording(_) => Variant::AllRecording,
            Recorder::Periodic(_) => Variant::Periodic,
        }
    }

    fn check_live(&self, action: &str) -> Result<(), StatsError> {
        if self.snapshot {
            Err(StatsError::IllegalState(format!(
                "cannot {} a statistics snapshot",
                action
            )))
        } else {
            Ok(())
        }
    }

    /// Records a successful request of the given operation.
    pub fn register_request(
        &mut self,
        response_time: i64,
        tx_overhead: i64,
        operation: Operation,
    ) -> Result<(), StatsError> {
        self.register_at(now_millis(), response_time, tx_overhead, operation, false)
    }

    /// Records a failed request of the given operation.
    pub fn register_error(
        &mut self,
        response_time: i64,
        tx_overhead: i64,
        operation: Operation,
    ) -> Result<(), StatsError> {
        self.register_at(now_millis(), response_time, tx_overhead, operation, true)
    }

    /// Records a request that was issued at `now` (milliseconds since the epoch).
    ///
    /// Only the periodic variant uses the timestamp, to choose the bucket.
    pub fn register_at(
        &mut self,
        now: i64,
        response_time: i64,
        tx_overhead: i64,
        operation: Operation,
        error: bool,
    ) -> Result<(), StatsError> {
        self.check_live("register requests into")?;
        match &mut self.recorder {
            Recorder::Simple(moments) => {
                register_moments(moments, response_time, tx_overhead, operation, error)
            }
            Recorder::Histogram(histograms) => {
                if !error {
                    histograms.register(response_time, tx_overhead, operation);
                }
            }
            Recorder::Multi(moments, histograms) => {
                register_moments(moments, response_time, tx_overhead, operation, error);
                if !error {
                    histograms.register(response_time, tx_overhead, operation);
                }
            }
            Recorder::AllRecording(samples) => {
                if error {
                    samples.register_error(response_time, tx_overhead, operation);
                } else {
                    samples.register(response_time, tx_overhead, operation);
                }
            }
            Recorder::Periodic(periodic) => {
                return periodic.register(
                    self.interval_begin,
                    now,
                    response_time,
                    tx_overhead,
                    operation,
                    error,
                );
            }
        }
        Ok(())
    }

    /// Forgets all recorded requests and starts a new interval at `time`.
    pub fn reset(&mut self, time: i64) -> Result<(), StatsError> {
        self.check_live("reset")?;
        self.clear(time);
        Ok(())
    }

    fn clear(&mut self, time: i64) {
        self.interval_begin = time;
        self.interval_end = time;
        match &mut self.recorder {
            Recorder::Simple(moments) => *moments = empty_moments(),
            Recorder::Histogram(histograms) => histograms.reset(),
            Recorder::Multi(moments, histograms) => {
                *moments = empty_moments();
                histograms.reset();
            }
            Recorder::AllRecording(samples) => samples.reset(),
            Recorder::Periodic(periodic) => periodic.reset(),
        }
    }

    /// Closes the current interval at `time`.
    ///
    /// Periodic statistics drop a trailing bucket that covers less than 5% of the period.
    pub fn end(&mut self, time: i64) {
        self.interval_end = time;
        if let Recorder::Periodic(periodic) = &mut self.recorder {
            periodic.finish(time);
        }
    }

    /// Returns a sealed copy of the statistics recorded until `time`.
    ///
    /// If `reset` is set, the live instance starts a new interval at `time` afterwards.
    pub fn snapshot(&mut self, reset: bool, time: i64) -> Result<Statistics, StatsError> {
        self.check_live("snapshot")?;
        let mut snapshot = self.clone();
        snapshot.end(time);
        snapshot.snapshot = true;
        if reset {
            self.clear(time);
        }
        Ok(snapshot)
    }

    /// Returns an unsealed copy, which can be used to continue recording.
    pub fn copy(&self) -> Statistics {
        let mut copy = self.clone();
        copy.snapshot = false;
        copy
    }

    /// Merges the snapshot `other` into this snapshot.
    ///
    /// Errors with [`StatsError::IllegalArgument`] if either operand is not a snapshot, if the
    /// variants differ or if histogram boundaries are incompatible. The merged interval spans
    /// both intervals.
    pub fn merge(&mut self, other: &Statistics) -> Result<(), StatsError> {
        if !self.snapshot || !other.snapshot {
            return Err(StatsError::IllegalArgument(
                "only statistics snapshots can be merged".to_owned(),
            ));
        }
        self.merge_bucket(other)
    }

    fn merge_bucket(&mut self, other: &Statistics) -> Result<(), StatsError> {
        let (mine_variant, their_variant) = (self.variant(), other.variant());
        match (&mut self.recorder, &other.recorder) {
            (Recorder::Simple(mine), Recorder::Simple(theirs)) => merge_moments(mine, theirs),
            (Recorder::Histogram(mine), Recorder::Histogram(theirs)) => mine.merge(theirs)?,
            (Recorder::Multi(mine, mine_h), Recorder::Multi(theirs, theirs_h)) => {
                mine_h.merge(theirs_h)?;
                merge_moments(mine, theirs);
            }
            (Recorder::AllRecording(mine), Recorder::AllRecording(theirs)) => mine.merge(theirs),
            (Recorder::Periodic(mine), Recorder::Periodic(theirs)) => {
                mine.merge(self.interval_begin, theirs, other.interval_begin)?
            }
            _ => {
                return Err(StatsError::IllegalArgument(format!(
                    "cannot merge {:?} statistics into {:?} statistics",
                    their_variant, mine_variant
                )))
            }
        }
        self.interval_begin = self.interval_begin.min(other.interval_begin);
        self.interval_end = self.interval_end.max(other.interval_end);
        self.cache_size = match (self.cache_size, other.cache_size) {
            (a, b) if a >= 0 && b >= 0 => a + b,
            (a, b) => a.max(b),
        };
        Ok(())
    }

    /// Returns `true` if the instance is a sealed snapshot.
    pub fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    /// Returns `false` for records substituted while no stressor was running.
    pub fn is_node_up(&self) -> bool {
        self.node_up
    }

    /// The sampled number of entries in the local cache, `-1` if not sampled.
    pub fn cache_size(&self) -> i64 {
        self.cache_size
    }

    /// Attaches a cache size sample.
    pub fn set_cache_size(&mut self, cache_size: i64) {
        self.cache_size = cache_size;
    }

    /// Begin of the interval in milliseconds since the epoch.
    pub fn interval_begin(&self) -> i64 {
        self.interval_begin
    }

    /// End of the interval in milliseconds since the epoch.
    pub fn interval_end(&self) -> i64 {
        self.interval_end
    }

    fn set_interval(&mut self, begin: i64, end: i64) {
        self.interval_begin = begin;
        self.interval_end = end;
    }

    /// The length of the interval.
    pub fn duration(&self) -> Duration {
        Duration::from_millis((self.interval_end - self.interval_begin).max(0) as u64)
    }

    /// The aggregated statistics of one operation.
    ///
    /// Histogram-only statistics carry no moments and return empty statistics.
    pub fn operation_stats(&self, operation: Operation) -> OperationStats {
        match &self.recorder {
            Recorder::Simple(moments) | Recorder::Multi(moments, _) => {
                moments[operation.index()].clone()
            }
            Recorder::Histogram(_) => OperationStats::default(),
            Recorder::AllRecording(samples) => samples.moments(operation),
            Recorder::Periodic(periodic) => {
                let mut stats = OperationStats::default();
                for bucket in periodic.buckets() {
                    stats.merge(&bucket.operation_stats(operation));
                }
                stats
            }
        }
    }

    /// The histograms, for the histogram and multi variants.
    pub fn histograms(&self) -> Option<&HistogramStatistics> {
        match &self.recorder {
            Recorder::Histogram(h) | Recorder::Multi(_, h) => Some(h),
            _ => None,
        }
    }

    /// The time buckets, for the periodic variant.
    pub fn periods(&self) -> Option<&[Statistics]> {
        match &self.recorder {
            Recorder::Periodic(p) => Some(p.buckets()),
            _ => None,
        }
    }

    /// The recorded samples, for the all-recording variant.
    pub fn samples(&self) -> Option<&RecordedSamples> {
        match &self.recorder {
            Recorder::AllRecording(samples) => Some(samples),
            _ => None,
        }
    }

    fn requests_sum(&self, field: impl Fn(&OperationStats) -> i64) -> i64 {
        Operation::ALL
            .iter()
            .filter(|op| op.is_request())
            .map(|&op| field(&self.operation_stats(op)))
            .sum()
    }

    /// Total number of requests, excluding transaction records.
    pub fn num_requests(&self) -> u64 {
        self.requests_sum(|s| s.requests as i64) as u64
    }

    /// Total number of failed requests, excluding transaction records.
    pub fn num_errors(&self) -> u64 {
        self.requests_sum(|s| s.errors as i64) as u64
    }

    /// Sum of the net response times of all requests.
    pub fn response_time_sum(&self) -> i64 {
        self.requests_sum(|s| s.response_time_sum)
    }

    /// Sum of the transaction overheads of all requests.
    pub fn tx_overhead_sum(&self) -> i64 {
        self.requests_sum(|s| s.tx_overhead)
    }

    /// Requests per second of a single thread, derived from the response time sums.
    pub fn operations_per_second(&self, include_overhead: bool) -> f64 {
        let mut sum = self.response_time_sum();
        if include_overhead {
            sum += self.tx_overhead_sum();
        }
        if sum == 0 {
            return 0.0;
        }
        (NS_IN_SEC as f64 * self.num_requests() as f64) / sum as f64
    }

    /// Requests per second of wall-clock time over the interval, `NaN` for empty intervals.
    pub fn throughput(&self) -> f64 {
        let duration = self.duration().as_secs_f64();
        if duration == 0.0 {
            f64::NAN
        } else {
            self.num_requests() as f64 / duration
        }
    }

    /// Exports the statistics as a flat map whose keys start with `prefix`.
    ///
    /// `threads` scales the per-thread throughput figures to the whole worker.
    pub fn results(&self, threads: u32, prefix: &str) -> ResultsMap {
        let mut results = ResultsMap::new();
        match &self.recorder {
            Recorder::Simple(moments) => self.moment_results(moments, threads, prefix, &mut results),
            Recorder::Histogram(histograms) => histograms.results(prefix, &mut results),
            Recorder::Multi(moments, histograms) => {
                self.moment_results(moments, threads, prefix, &mut results);
                histograms.results(prefix, &mut results);
            }
            Recorder::AllRecording(samples) => {
                let moments: Vec<_> = Operation::ALL
                    .iter()
                    .map(|&op| samples.moments(op))
                    .collect();
                self.moment_results(&moments, threads, prefix, &mut results);
                for (key, value) in samples.results() {
                    results.insert(format!("{}{}", prefix, key), value);
                }
            }
            Recorder::Periodic(periodic) => periodic.results(threads, prefix, &mut results),
        }
        if self.cache_size >= 0 {
            results.insert(format!("{}CACHE_SIZE", prefix), self.cache_size.into());
        }
        results
    }

    fn moment_results(
        &self,
        moments: &[OperationStats],
        threads: u32,
        prefix: &str,
        results: &mut ResultsMap,
    ) {
        let threads_f = f64::from(threads);
        let mut put = |key: String, value: serde_json::Value| {
            results.insert(format!("{}{}", prefix, key), value);
        };
        put(
            "DURATION".into(),
            (self.response_time_sum() + self.tx_overhead_sum()).into(),
        );
        put("FAILURES".into(), self.num_errors().into());
        put("THREADS".into(), threads.into());
        put(
            "REQ_PER_SEC_NET".into(),
            (threads_f * self.operations_per_second(false)).into(),
        );
        put(
            "REQ_PER_SEC".into(),
            (threads_f * self.operations_per_second(true)).into(),
        );
        for op in Operation::ALL {
            let os = &moments[op.index()];
            if os.requests == 0 {
                continue;
            }
            let name = op.name();
            let requests = os.requests as f64;
            put(format!("{}_COUNT", name), os.requests.into());
            if os.errors != 0 {
                put(format!("{}_ERRORS", name), os.errors.into());
            }
            put(
                format!("{}S_PER_SEC", name),
                (threads_f * os.per_second(true)).into(),
            );
            if os.tx_overhead != 0 {
                put(
                    format!("{}S_PER_SEC_NET", name),
                    (threads_f * os.per_second(false)).into(),
                );
            }
            put(
                format!("{}_AVG_NET", name),
                (os.response_time_sum as f64 / requests).into(),
            );
            put(
                format!("{}_AVG_TX", name),
                ((os.response_time_sum + os.tx_overhead) as f64 / requests).into(),
            );
            put(format!("{}_DURATION_NET", name), os.response_time_sum.into());
            put(format!("{}_TX_OVERHEAD", name), os.tx_overhead.into());
            put(format!("{}_MEAN_NET", name), os.response_time_mean.into());
            put(format!("{}_MEAN_TX", name), os.with_tx_overhead_mean.into());
            put(format!("{}_M2_NET", name), os.response_time_m2.into());
            put(format!("{}_M2_TX", name), os.with_tx_overhead_m2.into());
        }
    }

    /// Rebuilds simple statistics from a map exported by [`results`](Self::results) with an
    /// empty prefix.
    pub fn parse_results(results: &BTreeMap<String, String>) -> eyre::Result<Statistics> {
        let mut moments = empty_moments();
        for (key, value) in results {
            // longest names first, so that `GET_NULL_COUNT` is not parsed as `GET` + `NULL_COUNT`
            let mut ops = Operation::ALL;
            ops.sort_by_key(|op| std::cmp::Reverse(op.name().len()));
            for op in ops {
                if let Some(field) = key
                    .strip_prefix(op.name())
                    .and_then(|rest| rest.strip_prefix('_'))
                {
                    if moments[op.index()].parse_in(field, value)? {
                        break;
                    }
                }
            }
        }
        let mut stats = Self::with_recorder(Recorder::Simple(moments));
        stats.snapshot = true;
        Ok(stats)
    }
}

fn empty_moments() -> Vec<OperationStats> {
    vec![OperationStats::default(); Operation::COUNT]
}

fn register_moments(
    moments: &mut [OperationStats],
    response_time: i64,
    tx_overhead: i64,
    operation: Operation,
    error: bool,
) {
    let stats = &mut moments[operation.index()];
    if error {
        stats.register_error(response_time, tx_overhead);
    } else {
        stats.register(response_time, tx_overhead);
    }
}

fn merge_moments(mine: &mut [OperationStats], theirs: &[OperationStats]) {
    for (mine, theirs) in mine.iter_mut().zip(theirs) {
        mine.merge(theirs);
    }
}

/// Merges all snapshots into a copy of the first one.
///
/// Returns `Ok(None)` for an empty input.
pub fn merge_all<'a>(
    stats: impl IntoIterator<Item = &'a Statistics>,
) -> Result<Option<Statistics>, StatsError> {
    let mut stats = stats.into_iter();
    let mut merged = match stats.next() {
        Some(first) => first.clone(),
        None => return Ok(None),
    };
    for other in stats {
        merged.merge(other)?;
    }
    Ok(Some(merged))
}

/// The maximum deviation of the sampled cache sizes from their average, in percent of the
/// average.
///
/// Only records of running nodes with a cache size sample are considered. Returns `0` for less
/// than two records.
pub fn cache_size_max_relative_deviation(stats: &[Statistics]) -> f64 {
    let sizes: Vec<f64> = stats
        .iter()
        .filter(|s| s.is_node_up() && s.cache_size() >= 0)
        .map(|s| s.cache_size() as f64)
        .collect();
    if stats.len() < 2 || sizes.is_empty() {
        return 0.0;
    }
    let avg = sizes.iter().sum::<f64>() / sizes.len() as f64;
    let max_dev = sizes
        .iter()
        .map(|size| (avg - size).abs())
        .fold(0.0, f64::max);
    if avg == 0.0 {
        return 0.0;
    }
    max_dev / avg * 100.0
}

/// The earliest interval begin of the given records.
pub fn interval_begin_min(stats: &[Statistics]) -> Option<i64> {
    stats.iter().map(Statistics::interval_begin).min()
}

/// The latest interval end of the given records.
pub fn interval_end_max(stats: &[Statistics]) -> Option<i64> {
    stats.iter().map(Statistics::interval_end).max()
}

/// The sum of the interval throughputs of the given records.
pub fn total_throughput(stats: &[Statistics]) -> f64 {
    stats.iter().map(Statistics::throughput).sum()
}
