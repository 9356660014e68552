//! Types for parsing configuration files.
//!
//! The top level config type is [`Config`].

use crate::{key_generator::KeyGenerator, stats::HistogramLayout};
use eyre::bail;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The top level config type.
///
/// This type can be read and written to config files using the [`serde::Serialize`] and
/// [`serde::Deserialize`] implementations.
#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Describes the position of this worker in the cluster.
    #[serde(default)]
    pub cluster: Cluster,
    /// Workload options shared by all stressor logics.
    #[serde(default)]
    pub general: GeneralConfiguration,
    /// Options of the legacy logic that issues random operations on a private key range.
    #[serde(default)]
    pub legacy_logic: LegacyLogicConfiguration,
    /// Options of the log logic and the log checkers.
    #[serde(default)]
    pub log_logic: LogLogicConfiguration,
    /// Controls how statistics are gathered.
    #[serde(default)]
    pub statistics: StatisticsConfiguration,
}

impl Config {
    /// Checks the cross-field constraints that serde cannot express.
    pub fn validate(&self) -> eyre::Result<()> {
        if self.cluster.size == 0 {
            bail!("cluster size must be positive");
        }
        if self.cluster.worker_index >= self.cluster.size {
            bail!(
                "worker index {} out of bounds (cluster size {})",
                self.cluster.worker_index,
                self.cluster.size
            );
        }
        if self.general.num_entries <= 0 {
            bail!("num-entries must be positive");
        }
        let general = &self.general;
        if general.puts + general.gets + general.removes == 0 && !self.log_logic.enabled {
            bail!("at least one of puts, gets and removes must have a positive ratio");
        }
        if self.log_logic.enabled {
            if general.gets != 0 {
                bail!("the log logic does not support GET operations, set gets to 0");
            }
            if general.puts + general.removes == 0 {
                bail!("the log logic requires a positive ratio of puts or removes");
            }
            if self.log_logic.counter_update_period == 0 {
                bail!("counter-update-period must be positive");
            }
            if general.transactions_enabled() && !general.commit_transactions {
                bail!("the log logic requires commit-transactions when transactions are enabled");
            }
            if self.log_logic.value_max_size == 0 {
                bail!("value-max-size must be positive");
            }
        }
        if self.statistics.period == Duration::ZERO {
            bail!("statistics period must be positive");
        }
        Ok(())
    }
}

/// Describes the position of this worker process in the cluster.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    /// The index of this worker, in `0..size`.
    pub worker_index: u32,
    /// The number of workers in the cluster.
    pub size: u32,
}

impl Default for Cluster {
    fn default() -> Self {
        Self {
            worker_index: 0,
            size: 1,
        }
    }
}

/// Workload options shared by all stressor logics.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GeneralConfiguration {
    /// Ratio of PUT requests.
    pub puts: u32,
    /// Ratio of GET requests.
    pub gets: u32,
    /// Ratio of REMOVE requests.
    pub removes: u32,
    /// Total number of key-value entries, shared by all workers.
    pub num_entries: i64,
    /// Offset added to every key index.
    pub key_id_offset: i64,
    /// Size of the values written by the legacy logic, in bytes.
    pub entry_size: usize,
    /// Number of stressor threads per worker.
    pub num_threads: u32,
    /// Number of operations per transaction. Zero or negative values disable transactions.
    pub transaction_size: i32,
    /// Commit (`true`) or roll back (`false`) finished transactions.
    pub commit_transactions: bool,
    /// Think time between two operations of a stressor thread.
    #[serde(with = "duration_millis")]
    pub delay_between_requests: Duration,
    /// The cache namespace the stressors operate on.
    pub bucket_id: Option<String>,
    /// Strategy for mapping key indices to keys.
    pub key_generator: KeyGenerator,
    /// Grace period between the soft termination request and the interruption of stressors.
    #[serde(with = "duration_millis")]
    pub termination_grace_period: Duration,
}

impl Default for GeneralConfiguration {
    fn default() -> Self {
        Self {
            puts: 1,
            gets: 2,
            removes: 0,
            num_entries: 1024,
            key_id_offset: 0,
            entry_size: 1024,
            num_threads: 10,
            transaction_size: -1,
            commit_transactions: true,
            delay_between_requests: Duration::ZERO,
            bucket_id: None,
            key_generator: KeyGenerator::default(),
            termination_grace_period: Duration::from_millis(1000),
        }
    }
}

impl GeneralConfiguration {
    /// Returns `true` if stressors wrap their operations in transactions.
    pub fn transactions_enabled(&self) -> bool {
        self.transaction_size > 0
    }
}

/// Options of the legacy logic.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LegacyLogicConfiguration {
    /// Skip the initial load phase of the stressors.
    pub no_loading: bool,
    /// Stop the stressors right after they loaded their data.
    pub load_only: bool,
    /// Block `start_stressors` until all stressors have loaded their data.
    pub wait_until_loaded: bool,
    /// Workers whose key ranges have to be loaded by the live workers.
    pub load_data_for_dead_workers: Vec<u32>,
    /// Number of load attempts per key before the key is skipped. Negative values retry until
    /// the stressor is terminated.
    pub load_attempts: i32,
}

impl Default for LegacyLogicConfiguration {
    fn default() -> Self {
        Self {
            no_loading: false,
            load_only: false,
            wait_until_loaded: true,
            load_data_for_dead_workers: Vec::new(),
            load_attempts: -1,
        }
    }
}

/// Options of the log logic and the log checkers.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LogLogicConfiguration {
    /// Use the log logic instead of the legacy logic.
    pub enabled: bool,
    /// Number of checker threads per worker.
    pub checking_threads: u32,
    /// Maximum number of operation ids stored in one log value.
    pub value_max_size: usize,
    /// Heartbeats and checker checkpoints are written every this many operations.
    pub counter_update_period: i64,
    /// Writes are guaranteed to be visible after this delay. Zero means stale reads are never
    /// expected.
    #[serde(with = "duration_millis")]
    pub write_apply_max_delay: Duration,
    /// Let stressors trim log values even if the checkers on dead workers did not confirm them.
    pub ignore_dead_checkers: bool,
    /// Maximum number of attempts to execute one transaction. Negative values mean no limit.
    pub max_transaction_attempts: i32,
    /// A worker whose keep-alive entry is older than this is considered dead.
    #[serde(with = "duration_millis")]
    pub dead_worker_timeout: Duration,
    /// Report a missing progress if a stressor did not finish an operation for this long.
    #[serde(with = "duration_millis")]
    pub no_progress_timeout: Duration,
}

impl Default for LogLogicConfiguration {
    fn default() -> Self {
        Self {
            enabled: false,
            checking_threads: 10,
            value_max_size: 50,
            counter_update_period: 50,
            write_apply_max_delay: Duration::ZERO,
            ignore_dead_checkers: false,
            max_transaction_attempts: -1,
            dead_worker_timeout: Duration::from_secs(10),
            no_progress_timeout: Duration::from_secs(60),
        }
    }
}

/// Selects the statistics variant that stressors record into.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatisticsKind {
    /// Only running moments.
    Simple,
    /// Moments and a histogram with fixed boundaries.
    Histogram(HistogramLayout),
    /// Moments and a histogram recorded side by side.
    Multi(HistogramLayout),
    /// Keep every sample, used for calibrating histogram boundaries.
    AllRecording,
    /// Time-bucketed simple statistics with the given bucket length.
    Periodic {
        /// Length of one time bucket.
        #[serde(with = "duration_millis")]
        bucket: Duration,
    },
}

impl Default for StatisticsKind {
    fn default() -> Self {
        Self::Simple
    }
}

/// Controls how statistics are gathered.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StatisticsConfiguration {
    /// The statistics variant each stressor records into.
    pub kind: StatisticsKind,
    /// Sampling period of the statistics thread.
    #[serde(with = "duration_millis")]
    pub period: Duration,
    /// Sample the local cache size with every statistics interval.
    pub sample_cache_size: bool,
}

impl Default for StatisticsConfiguration {
    fn default() -> Self {
        Self {
            kind: StatisticsKind::default(),
            period: Duration::from_secs(5),
            sample_cache_size: true,
        }
    }
}

/// (De)serializes a [`Duration`] as an integer number of milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_yaml() {
        let yaml = "
cluster:
  worker-index: 1
  size: 3
general:
  puts: 1
  gets: 0
  removes: 1
  num-entries: 500
  num-threads: 4
  transaction-size: 5
  delay-between-requests: 10
  key-generator: byte-array
legacy-logic:
  load-data-for-dead-workers: [2]
log-logic:
  enabled: true
  checking-threads: 2
statistics:
  kind:
    periodic:
      bucket: 1000
  period: 2000
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cluster.worker_index, 1);
        assert_eq!(config.general.num_entries, 500);
        assert_eq!(config.general.delay_between_requests, Duration::from_millis(10));
        assert_eq!(config.general.key_generator, KeyGenerator::ByteArray);
        assert!(config.general.transactions_enabled());
        assert_eq!(config.legacy_logic.load_data_for_dead_workers, vec![2]);
        assert_eq!(config.log_logic.checking_threads, 2);
        assert_eq!(config.log_logic.counter_update_period, 50);
        assert_eq!(
            config.statistics.kind,
            StatisticsKind::Periodic {
                bucket: Duration::from_secs(1)
            }
        );
        config.validate().unwrap();
    }

    #[test]
    fn log_logic_rejects_gets() {
        let mut config = Config::default();
        config.log_logic.enabled = true;
        assert!(config.validate().is_err());
        config.general.gets = 0;
        config.validate().unwrap();
    }
}
