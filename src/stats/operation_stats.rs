use super::NS_IN_SEC;

const INVERSE_NORMAL_95: f64 = 1.96;
const INVERSE_NORMAL_50: f64 = 0.67448;

/// Running statistics of the requests of one [`Operation`][super::Operation].
///
/// Mean and second moment of the response times are updated with Welford's online algorithm, so
/// the memory consumption does not grow with the number of requests. Two moments are tracked:
/// the _net_ response time and the response time _including transaction overhead_.
///
/// ## Implementation Notes
///
/// The variance is `m2 / (requests - 1)`; it is only defined for two or more requests. All
/// times are in nanoseconds.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OperationStats {
    /// Number of recorded requests, including failed ones.
    pub requests: u64,
    /// Number of failed requests.
    pub errors: u64,
    /// The slowest net response time, `i64::MIN` if nothing was recorded.
    pub response_time_max: i64,
    /// Sum of all net response times.
    pub response_time_sum: i64,
    /// Sum of all transaction overheads.
    pub tx_overhead: i64,
    /// Running mean of the net response time.
    pub response_time_mean: f64,
    /// Running second moment of the net response time.
    pub response_time_m2: f64,
    /// Running mean of the response time including transaction overhead.
    pub with_tx_overhead_mean: f64,
    /// Running second moment of the response time including transaction overhead.
    pub with_tx_overhead_m2: f64,
}

impl Default for OperationStats {
    fn default() -> Self {
        Self {
            requests: 0,
            errors: 0,
            response_time_max: i64::MIN,
            response_time_sum: 0,
            tx_overhead: 0,
            response_time_mean: 0.0,
            response_time_m2: 0.0,
            with_tx_overhead_mean: 0.0,
            with_tx_overhead_m2: 0.0,
        }
    }
}

/// Five-number summary estimated from mean and standard deviation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxAndWhiskers {
    /// Upper end of the 95% interval.
    pub max_regular: f64,
    /// Upper quartile.
    pub q3: f64,
    /// The mean.
    pub mean: f64,
    /// Lower quartile.
    pub q1: f64,
    /// Lower end of the 95% interval.
    pub min_regular: f64,
}

/// Mean and standard deviation of a response time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeanAndDev {
    /// The mean.
    pub mean: f64,
    /// The sample standard deviation, zero for less than two requests.
    pub dev: f64,
}

impl OperationStats {
    /// Records one request.
    pub fn register(&mut self, response_time: i64, tx_overhead: i64) {
        self.requests += 1;
        let n = self.requests as f64;
        self.response_time_max = self.response_time_max.max(response_time);
        self.response_time_sum += response_time;
        self.tx_overhead += tx_overhead;

        let x = response_time as f64;
        let delta = x - self.response_time_mean;
        self.response_time_mean += delta / n;
        self.response_time_m2 += delta * (x - self.response_time_mean);

        let x_tx = (response_time + tx_overhead) as f64;
        let delta_tx = x_tx - self.with_tx_overhead_mean;
        self.with_tx_overhead_mean += delta_tx / n;
        self.with_tx_overhead_m2 += delta_tx * (x_tx - self.with_tx_overhead_mean);
    }

    /// Records one failed request.
    pub fn register_error(&mut self, response_time: i64, tx_overhead: i64) {
        self.register(response_time, tx_overhead);
        self.errors += 1;
    }

    /// Merges the statistics of an independently recorded group of requests into `self`.
    pub fn merge(&mut self, other: &OperationStats) {
        let n_a = self.requests as f64;
        let n_b = other.requests as f64;
        self.response_time_m2 = merge_m2(
            self.response_time_mean,
            self.response_time_m2,
            n_a,
            other.response_time_mean,
            other.response_time_m2,
            n_b,
        );
        self.response_time_mean =
            merge_mean(self.response_time_mean, n_a, other.response_time_mean, n_b);
        self.with_tx_overhead_m2 = merge_m2(
            self.with_tx_overhead_mean,
            self.with_tx_overhead_m2,
            n_a,
            other.with_tx_overhead_mean,
            other.with_tx_overhead_m2,
            n_b,
        );
        self.with_tx_overhead_mean = merge_mean(
            self.with_tx_overhead_mean,
            n_a,
            other.with_tx_overhead_mean,
            n_b,
        );

        self.requests += other.requests;
        self.errors += other.errors;
        self.response_time_max = self.response_time_max.max(other.response_time_max);
        self.response_time_sum += other.response_time_sum;
        self.tx_overhead += other.tx_overhead;
    }

    /// The sample variance, `None` for less than two requests.
    pub fn variance(&self, include_overhead: bool) -> Option<f64> {
        if self.requests < 2 {
            return None;
        }
        let m2 = if include_overhead {
            self.with_tx_overhead_m2
        } else {
            self.response_time_m2
        };
        Some(m2 / (self.requests - 1) as f64)
    }

    fn mean(&self, include_overhead: bool) -> f64 {
        if include_overhead {
            self.with_tx_overhead_mean
        } else {
            self.response_time_mean
        }
    }

    /// Requests per second of a single thread, derived from the mean response time.
    pub fn per_second(&self, include_overhead: bool) -> f64 {
        if self.response_time_mean == 0.0 || self.with_tx_overhead_mean == 0.0 {
            return 0.0;
        }
        NS_IN_SEC as f64 / self.mean(include_overhead)
    }

    /// Estimates quartiles and the 95% interval assuming normally distributed response times.
    pub fn box_and_whiskers(&self, include_overhead: bool) -> BoxAndWhiskers {
        let mean = self.mean(include_overhead);
        let stddev = self.variance(include_overhead).map_or(0.0, f64::sqrt);
        BoxAndWhiskers {
            max_regular: mean + INVERSE_NORMAL_95 * stddev,
            q3: mean + INVERSE_NORMAL_50 * stddev,
            mean,
            q1: mean - INVERSE_NORMAL_50 * stddev,
            min_regular: mean - INVERSE_NORMAL_95 * stddev,
        }
    }

    /// Returns the mean and the standard deviation.
    pub fn mean_and_dev(&self, include_overhead: bool) -> MeanAndDev {
        MeanAndDev {
            mean: self.mean(include_overhead),
            dev: self.variance(include_overhead).map_or(0.0, f64::sqrt),
        }
    }

    /// Restores one field from an exported result map entry.
    ///
    /// `field` is the part of the result key after the operation name, e.g. `MEAN_NET`. Returns
    /// `false` for unknown fields. Empty values reset the field to zero.
    pub fn parse_in(&mut self, field: &str, value: &str) -> eyre::Result<bool> {
        use eyre::Context;

        fn parse_or_default<T: std::str::FromStr + Default>(value: &str) -> Result<T, T::Err> {
            if value.is_empty() {
                Ok(T::default())
            } else {
                value.parse()
            }
        }

        let context = || format!("invalid value `{}` for field `{}`", value, field);
        match field {
            "COUNT" => self.requests = parse_or_default(value).with_context(context)?,
            "ERRORS" => self.errors = parse_or_default(value).with_context(context)?,
            "MEAN_NET" => self.response_time_mean = parse_or_default(value).with_context(context)?,
            "MEAN_TX" => self.with_tx_overhead_mean = parse_or_default(value).with_context(context)?,
            "M2_NET" => self.response_time_m2 = parse_or_default(value).with_context(context)?,
            "M2_TX" => self.with_tx_overhead_m2 = parse_or_default(value).with_context(context)?,
            "DURATION_NET" => self.response_time_sum = parse_or_default(value).with_context(context)?,
            "TX_OVERHEAD" => self.tx_overhead = parse_or_default(value).with_context(context)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

fn merge_mean(mean_a: f64, n_a: f64, mean_b: f64, n_b: f64) -> f64 {
    if n_a + n_b == 0.0 {
        return 0.0;
    }
    (mean_a * n_a + mean_b * n_b) / (n_a + n_b)
}

fn merge_m2(mean_a: f64, m2_a: f64, n_a: f64, mean_b: f64, m2_b: f64, n_b: f64) -> f64 {
    if n_a + n_b == 0.0 {
        return 0.0;
    }
    let delta = mean_a - mean_b;
    m2_a + m2_b + delta * delta * n_a * n_b / (n_a + n_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stats_of(samples: &[i64]) -> OperationStats {
        let mut stats = OperationStats::default();
        for &sample in samples {
            stats.register(sample, 0);
        }
        stats
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9 * a.abs().max(1.0), "{} != {}", a, b);
    }

    #[test]
    fn welford_matches_two_pass() {
        let samples = [4, 7, 13, 16, 21, 2];
        let stats = stats_of(&samples);
        let mean = samples.iter().sum::<i64>() as f64 / samples.len() as f64;
        let var = samples
            .iter()
            .map(|&x| (x as f64 - mean).powi(2))
            .sum::<f64>()
            / (samples.len() - 1) as f64;
        assert_close(stats.response_time_mean, mean);
        assert_close(stats.variance(false).unwrap(), var);
        assert_eq!(stats.response_time_max, 21);
        assert_eq!(stats.response_time_sum, 63);
    }

    #[test]
    fn variance_needs_two_requests() {
        assert_eq!(stats_of(&[]).variance(false), None);
        assert_eq!(stats_of(&[5]).variance(false), None);
        assert_eq!(stats_of(&[5]).mean_and_dev(false), MeanAndDev { mean: 5.0, dev: 0.0 });
    }

    #[test]
    fn merge_weights_means() {
        let a = stats_of(&[10; 5]);
        let b = stats_of(&[20; 15]);
        let mut merged = a.clone();
        merged.merge(&b);
        assert_eq!(merged.requests, 20);
        assert_close(merged.response_time_mean, 17.5);

        let mut reversed = b;
        reversed.merge(&a);
        assert_close(reversed.response_time_mean, merged.response_time_mean);
        assert_close(reversed.response_time_m2, merged.response_time_m2);
    }

    #[test]
    fn merge_equals_single_pass() {
        let mut merged = stats_of(&[1, 5, 9]);
        merged.merge(&stats_of(&[2, 30]));
        let single = stats_of(&[1, 5, 9, 2, 30]);
        assert_close(merged.response_time_mean, single.response_time_mean);
        assert_close(merged.response_time_m2, single.response_time_m2);
        assert_eq!(merged.response_time_max, 30);
    }

    #[test]
    fn merge_with_empty() {
        let mut empty = OperationStats::default();
        empty.merge(&OperationStats::default());
        assert_eq!(empty, OperationStats::default());

        empty.merge(&stats_of(&[3, 4]));
        assert_close(empty.response_time_mean, 3.5);
    }

    #[test]
    fn errors_and_overhead() {
        let mut stats = OperationStats::default();
        stats.register(100, 50);
        stats.register_error(300, 50);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.tx_overhead, 100);
        assert_close(stats.response_time_mean, 200.0);
        assert_close(stats.with_tx_overhead_mean, 250.0);
        assert_close(stats.per_second(true), 4_000_000.0);
    }

    #[test]
    fn box_and_whiskers_from_moments() {
        let empty = OperationStats::default().box_and_whiskers(false);
        assert_eq!(
            empty,
            BoxAndWhiskers {
                max_regular: 0.0,
                q3: 0.0,
                mean: 0.0,
                q1: 0.0,
                min_regular: 0.0,
            }
        );

        // a single request has no spread
        let single = stats_of(&[40]).box_and_whiskers(false);
        assert_eq!(single.q1, 40.0);
        assert_eq!(single.max_regular, 40.0);

        // mean 20, sample standard deviation 10
        let mut merged = stats_of(&[10, 20]);
        merged.merge(&stats_of(&[30]));
        let bw = merged.box_and_whiskers(false);
        assert_close(bw.mean, 20.0);
        assert_close(bw.q3, 20.0 + 6.7448);
        assert_close(bw.q1, 20.0 - 6.7448);
        assert_close(bw.max_regular, 39.6);
        assert_close(bw.min_regular, 0.4);

        let mut with_overhead = OperationStats::default();
        with_overhead.register(10, 5);
        with_overhead.register(30, 5);
        assert_close(with_overhead.box_and_whiskers(true).mean, 25.0);
        assert_close(with_overhead.box_and_whiskers(false).mean, 20.0);
    }

    #[test]
    fn parse_fields() {
        let mut stats = OperationStats::default();
        assert!(stats.parse_in("COUNT", "12").unwrap());
        assert!(stats.parse_in("MEAN_NET", "1.5").unwrap());
        assert!(stats.parse_in("ERRORS", "").unwrap());
        assert!(!stats.parse_in("HISTOGRAM", "x").unwrap());
        assert!(stats.parse_in("COUNT", "x").is_err());
        assert_eq!(stats.requests, 12);
        assert_close(stats.response_time_mean, 1.5);
    }
}
