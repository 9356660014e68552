use super::{Operation, ResultsMap, Statistics, StatsError};

/// A sequence of statistics, one per time bucket of fixed length.
///
/// Used when response times are expected to drift during a run. Requests are recorded into the
/// bucket `(request_time - begin) / period`; buckets are created on demand as copies of the
/// prototype.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicStatistics {
    prototype: Box<Statistics>,
    period: i64,
    buckets: Vec<Statistics>,
}

impl PeriodicStatistics {
    /// Creates an empty sequence with buckets of `period` milliseconds.
    pub fn new(prototype: Statistics, period: i64) -> Self {
        assert!(period > 0, "period must be positive");
        Self {
            prototype: Box::new(prototype.empty_copy()),
            period,
            buckets: Vec::new(),
        }
    }

    /// The length of one bucket in milliseconds.
    pub fn period(&self) -> i64 {
        self.period
    }

    /// The buckets recorded so far.
    pub fn buckets(&self) -> &[Statistics] {
        &self.buckets
    }

    fn bucket(&mut self, begin: i64, now: i64) -> &mut Statistics {
        let index = ((now - begin).max(0) / self.period) as usize;
        while self.buckets.len() <= index {
            let bucket = self.empty_bucket(begin + self.buckets.len() as i64 * self.period);
            self.buckets.push(bucket);
        }
        &mut self.buckets[index]
    }

    pub(super) fn register(
        &mut self,
        begin: i64,
        now: i64,
        response_time: i64,
        tx_overhead: i64,
        operation: Operation,
        error: bool,
    ) -> Result<(), StatsError> {
        let bucket = self.bucket(begin, now);
        if error {
            bucket.register_error(response_time, tx_overhead, operation)
        } else {
            bucket.register_request(response_time, tx_overhead, operation)
        }
    }

    pub(super) fn reset(&mut self) {
        self.buckets.clear();
    }

    /// Drops the last bucket if it covers less than 5% of the period before `end`, as such
    /// leftovers only distort the time series.
    pub(super) fn finish(&mut self, end: i64) {
        if let Some(last) = self.buckets.last() {
            if end - last.interval_begin() < self.period / 20 {
                self.buckets.pop();
            }
        }
    }

    /// Merges `other`, aligning the buckets by the distance of the begin times.
    pub(super) fn merge(
        &mut self,
        begin: i64,
        other: &PeriodicStatistics,
        other_begin: i64,
    ) -> Result<(), StatsError> {
        if other.period != self.period {
            return Err(StatsError::IllegalArgument(format!(
                "different periods: {} vs. {}",
                self.period, other.period
            )));
        }
        let distance = (other_begin - begin).abs();
        let mut offset = (distance / self.period) as usize;
        if 2 * (distance - offset as i64 * self.period) > self.period {
            offset += 1;
        }

        if other_begin < begin && offset > 0 {
            let mut prefix: Vec<_> = other.buckets.iter().take(offset).cloned().collect();
            while prefix.len() < offset {
                prefix.push(self.empty_bucket(other_begin + prefix.len() as i64 * self.period));
            }
            self.buckets.splice(0..0, prefix);
            self.merge_buckets(other_begin, other.buckets.iter().enumerate().skip(offset))
        } else {
            let shifted = other.buckets.iter().enumerate().map(|(i, b)| (i + offset, b));
            self.merge_buckets(begin, shifted)
        }
    }

    /// Merges buckets by index; missing buckets up to an index are filled with empty ones so
    /// that the index keeps matching the elapsed periods since `begin`.
    fn merge_buckets<'a>(
        &mut self,
        begin: i64,
        theirs: impl Iterator<Item = (usize, &'a Statistics)>,
    ) -> Result<(), StatsError> {
        for (index, theirs) in theirs {
            while self.buckets.len() < index {
                let bucket = self.empty_bucket(begin + self.buckets.len() as i64 * self.period);
                self.buckets.push(bucket);
            }
            match self.buckets.get_mut(index) {
                Some(mine) => mine.merge_bucket(theirs)?,
                None => self.buckets.push(theirs.clone()),
            }
        }
        Ok(())
    }

    fn empty_bucket(&self, begin: i64) -> Statistics {
        let mut bucket = self.prototype.empty_copy();
        bucket.set_interval(begin, begin + self.period);
        bucket
    }

    pub(super) fn results(&self, threads: u32, prefix: &str, results: &mut ResultsMap) {
        results.insert(format!("{}PERIODS", prefix), self.buckets.len().into());
        results.insert(format!("{}PERIOD_MS", prefix), self.period.into());
        for (i, bucket) in self.buckets.iter().enumerate() {
            results.extend(bucket.results(threads, &format!("{}PERIOD_{}.", prefix, i)));
        }
    }
}
