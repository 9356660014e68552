//! Log checkers verify that no write of the log stressors was silently dropped by the cache.
//!
//! Every log stressor applies a deterministic sequence of operations: operation `i` touches a key
//! that both the stressor and the checkers derive from the same [`KeySelector`], and appends `i`
//! to the [`PrivateLogValue`] stored under that key (or under its complement key `!key` for
//! removals). Checker threads replay this sequence per stressor thread and look for every
//! operation id in the cache:
//!
//! - If the id is found, the operation is confirmed and the checker moves on. Every
//!   `counter-update-period` operations the progress is persisted as checkpoint, which allows the
//!   stressors to trim their logs and a restarted checker to resume.
//! - If the id is not found, the checker compares it with the last [heartbeat](LastOperation) of
//!   the stressor. A heartbeat at or beyond the id proves that the operation was written, so the
//!   operation is reported as missing. Otherwise the stressor simply has not got there yet.
//!
//! The checker moves on after reporting a missing operation, even if the loss could have been a
//! read racing with a concurrent move between a key and its complement. This keeps the checker
//! from stalling forever on a truly lost key; `write-apply-max-delay` narrows the window by
//! requiring the loss to persist for that long.

pub use self::{
    failure::FailureManager,
    pool::Pool,
    record::{KeySelector, StressorRecord},
};
use crate::{
    cache::CacheBackend,
    config::Config,
    control::ThreadControl,
    key_generator::KeyGenerator,
    keys::StressorThread,
    stats::now_millis,
};
use eyre::Context;
use std::{sync::Arc, time::Duration};

mod failure;
mod pool;
mod record;

/// Minimum delay between two unsuccessful checks of the same record.
const UNSUCCESSFUL_CHECK_MIN_DELAY: Duration = Duration::from_millis(10);

/// Sleep while no record is available.
const EMPTY_POOL_DELAY: Duration = Duration::from_millis(100);

/// The last operation of a stressor thread, or the last operation confirmed by a checker.
///
/// Stored as heartbeat under [`StressorThread::last_operation_key`] and as checkpoint under
/// [`StressorThread::checker_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LastOperation {
    /// The id of the operation.
    pub operation_id: i64,
    /// The position of the [`KeySelector`] after the key of the operation was drawn.
    pub seed: u64,
}

/// The ids of the recent operations of one stressor thread on one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PrivateLogValue {
    thread_id: u32,
    operation_ids: Vec<i64>,
}

impl PrivateLogValue {
    /// Creates a log containing a single operation.
    pub fn new(thread: StressorThread, operation_id: i64) -> Self {
        Self {
            thread_id: thread.thread_id,
            operation_ids: vec![operation_id],
        }
    }

    /// Returns a copy with the given operation appended.
    pub fn with(&self, operation_id: i64) -> Self {
        let mut next = self.clone();
        next.operation_ids.push(operation_id);
        next
    }

    /// Returns a copy without the `trimmed` oldest operations and with the given operation
    /// appended.
    pub fn shift(&self, trimmed: usize, operation_id: i64) -> Self {
        let mut operation_ids: Vec<_> = self.operation_ids.iter().skip(trimmed).copied().collect();
        operation_ids.push(operation_id);
        Self {
            thread_id: self.thread_id,
            operation_ids,
        }
    }

    /// Returns `true` if the log belongs to `thread` and contains the operation.
    pub fn contains(&self, thread: StressorThread, operation_id: i64) -> bool {
        self.thread_id == thread.thread_id && self.operation_ids.contains(&operation_id)
    }

    /// The thread that owns the log.
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// The logged operation ids, oldest first.
    pub fn operation_ids(&self) -> &[i64] {
        &self.operation_ids
    }

    /// The number of logged operations.
    pub fn len(&self) -> usize {
        self.operation_ids.len()
    }

    /// Returns `true` if no operation is logged.
    pub fn is_empty(&self) -> bool {
        self.operation_ids.is_empty()
    }
}

/// The settings shared by all checker threads of a worker.
#[derive(Debug, Clone)]
pub struct CheckerSettings {
    /// The index of the worker running the checkers.
    pub worker_index: u32,
    /// The cache namespace of the stressors.
    pub bucket: Option<String>,
    /// Maps key indices to keys, as the stressors do.
    pub key_generator: KeyGenerator,
    /// A checkpoint is written every this many confirmed operations.
    pub counter_update_period: i64,
    /// How long an operation may stay invisible after the heartbeat proved it written.
    pub write_apply_max_delay: Duration,
}

impl CheckerSettings {
    /// Extracts the checker settings from the config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_index: config.cluster.worker_index,
            bucket: config.general.bucket_id.clone(),
            key_generator: config.general.key_generator,
            counter_update_period: config.log_logic.counter_update_period.max(1),
            write_apply_max_delay: config.log_logic.write_apply_max_delay,
        }
    }
}

/// One checker thread.
pub struct LogChecker {
    id: u32,
    settings: Arc<CheckerSettings>,
    cache: Arc<dyn CacheBackend>,
    pool: Arc<Pool>,
    control: Arc<ThreadControl>,
}

impl LogChecker {
    /// Creates a checker that processes the records of the given pool.
    pub fn new(
        id: u32,
        settings: Arc<CheckerSettings>,
        cache: Arc<dyn CacheBackend>,
        pool: Arc<Pool>,
        control: Arc<ThreadControl>,
    ) -> Self {
        Self {
            id,
            settings,
            cache,
            pool,
            control,
        }
    }

    /// Checks records until termination is requested.
    ///
    /// Records are always returned to the pool, also when a check fails.
    pub fn run(&self) {
        log::debug!("Checker {} started", self.id);
        let mut delayed = 0;
        while !self.control.should_stop() {
            if delayed > self.pool.total_threads() {
                delayed = 0;
                if self.control.sleep(UNSUCCESSFUL_CHECK_MIN_DELAY).is_err() {
                    break;
                }
            }
            let mut record = match self.pool.take() {
                Some(record) => record,
                None => {
                    if self.control.sleep(EMPTY_POOL_DELAY).is_err() {
                        break;
                    }
                    continue;
                }
            };
            let throttled = record.last_unsuccessful_check().map_or(false, |last| {
                now_millis() < last + UNSUCCESSFUL_CHECK_MIN_DELAY.as_millis() as i64
            });
            if throttled {
                delayed += 1;
            } else if let Err(err) = self.check(&mut record) {
                log::error!(
                    "Cannot check operation {} of thread {} on key {}: {:?}",
                    record.operation_id(),
                    record.thread().thread_id,
                    record.key_id(),
                    err
                );
            }
            self.pool.add(record);
        }
        log::debug!("Checker {} stopped", self.id);
    }

    /// Checks the current operation of the record once.
    pub fn check(&self, record: &mut StressorRecord) -> eyre::Result<()> {
        let cache = &*self.cache;
        let bucket = self.settings.bucket.as_deref();
        let thread = record.thread();
        let failures = self.pool.failures();

        if record.last_unsuccessful_check().is_some() {
            // read the heartbeat before the value, so that a missing value is conclusive
            let read_at = now_millis();
            let heartbeat = cache
                .get(bucket, &thread.last_operation_key())
                .context("failed to read stressor heartbeat")?;
            if let Some(last) = heartbeat {
                record.set_last_stressor_operation(last.as_last_operation()?.operation_id);
            }
            record.set_heartbeat_read_at(read_at);
        }
        if record.is_fresh() {
            record.set_fresh(false);
            let checkpoint_key = thread.checker_key(self.settings.worker_index);
            if let Some(checkpoint) = cache
                .get(bucket, &checkpoint_key)
                .context("failed to read checkpoint")?
            {
                let checkpoint = checkpoint.as_last_operation()?;
                log::debug!(
                    "Check for thread {} continues from operation {}",
                    thread.thread_id,
                    checkpoint.operation_id + 1
                );
                record.resume(checkpoint);
            }
        }

        log::trace!(
            "Checking operation {} for thread {} on key {}",
            record.operation_id(),
            thread.thread_id,
            record.key_id()
        );
        let found = self.find_value(record)?;
        let now = now_millis();
        let contains = found
            .as_ref()
            .map_or(false, |log| log.contains(thread, record.operation_id()));

        if contains {
            log::trace!(
                "Found operation {} for thread {}",
                record.operation_id(),
                thread.thread_id
            );
            if record.operation_id() % self.settings.counter_update_period == 0 {
                self.write_checkpoint(record, record.checkpoint())?;
            }
            record.next();
            record.set_last_unsuccessful_check(None);
            record.set_last_successful_check(now);
            failures.report_stored_operation(now);
        } else if record.last_stressor_operation() >= record.operation_id() {
            if self.is_ignored(record)? {
                log::debug!(
                    "Operation {} of thread {} was ignored by the stressor",
                    record.operation_id(),
                    thread.thread_id
                );
                record.next();
                record.set_last_unsuccessful_check(None);
                record.set_last_successful_check(now);
                return Ok(());
            }
            record.set_loss_confirmed_at(now);
            let invisible_for = now - record.loss_confirmed_at().unwrap_or(now);
            if invisible_for >= self.settings.write_apply_max_delay.as_millis() as i64 {
                log::error!(
                    "Missing operation {} for thread {} on key {} ({}){}",
                    record.operation_id(),
                    thread.thread_id,
                    record.key_id(),
                    self.settings.key_generator.generate_key(record.key_id()),
                    if found.is_none() {
                        " - entry was completely lost"
                    } else {
                        ""
                    }
                );
                log::trace!("Not found in {:?}", found);
                failures.report_missing_operation();
                record.next();
            } else {
                failures.report_stale_read();
            }
            record.set_last_unsuccessful_check(Some(now));
        } else {
            // caught up with the stressor, publish the progress so that it can trim its logs
            if let Some(previous) = record.previous_checkpoint() {
                if previous.operation_id > record.last_checkpoint() {
                    self.write_checkpoint(record, previous)?;
                }
            }
            record.set_last_unsuccessful_check(Some(now));
        }
        Ok(())
    }

    fn write_checkpoint(
        &self,
        record: &mut StressorRecord,
        checkpoint: LastOperation,
    ) -> eyre::Result<()> {
        self.cache
            .put(
                self.settings.bucket.as_deref(),
                record.thread().checker_key(self.settings.worker_index),
                crate::cache::CacheValue::LastOperation(checkpoint),
            )
            .context("failed to write checkpoint")?;
        record.set_last_checkpoint(checkpoint.operation_id);
        Ok(())
    }

    fn is_ignored(&self, record: &StressorRecord) -> eyre::Result<bool> {
        let key = record.thread().ignored_key(self.settings.worker_index);
        match self.cache.get(self.settings.bucket.as_deref(), &key)? {
            Some(ignored) => Ok(ignored.as_last_operation()?.operation_id >= record.operation_id()),
            None => Ok(false),
        }
    }

    /// Reads the log of the current key, falling back to its complement key.
    fn find_value(&self, record: &StressorRecord) -> eyre::Result<Option<PrivateLogValue>> {
        let bucket = self.settings.bucket.as_deref();
        let generator = self.settings.key_generator;
        let key = generator.generate_key(record.key_id());
        let complement = generator.generate_key(!record.key_id());
        let mut value = self.cache.get(bucket, &key)?;
        if value.is_none() {
            value = self.cache.get(bucket, &complement)?;
        }
        if value.is_none() {
            // the log may have moved back from the complement key in the meantime
            value = self.cache.get(bucket, &key)?;
        }
        value.map(|v| v.into_log()).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{CacheValue, InMemoryCache},
        range::KeyRange,
    };

    fn checker(cache: &InMemoryCache, pool: Arc<Pool>) -> LogChecker {
        let settings = CheckerSettings {
            worker_index: 0,
            bucket: None,
            key_generator: KeyGenerator::String,
            counter_update_period: 2,
            write_apply_max_delay: Duration::ZERO,
        };
        LogChecker::new(
            0,
            Arc::new(settings),
            Arc::new(cache.clone()),
            pool,
            Arc::new(ThreadControl::new()),
        )
    }

    fn pool() -> Arc<Pool> {
        Arc::new(Pool::new(1, 1, 10, 0, Arc::new(FailureManager::new())))
    }

    #[test]
    fn log_value_operations() {
        let thread = StressorThread::new(3);
        let log = PrivateLogValue::new(thread, 1).with(2).with(5);
        assert_eq!(log.operation_ids(), &[1, 2, 5]);
        assert!(log.contains(thread, 2));
        assert!(!log.contains(StressorThread::new(4), 2));
        assert_eq!(log.shift(2, 6).operation_ids(), &[5, 6]);
    }

    #[test]
    fn confirms_and_reports_missing() {
        let cache = InMemoryCache::new();
        let pool = pool();
        let checker = checker(&cache, Arc::clone(&pool));
        let thread = StressorThread::new(0);
        let mut record = pool.take().unwrap();
        let generator = KeyGenerator::String;
        let mut selector = KeySelector::new(thread, KeyRange::new(0, 10));

        // operation 0 was written
        let key0 = selector.next_key_id();
        cache.poke(
            None,
            generator.generate_key(key0),
            CacheValue::Log(PrivateLogValue::new(thread, 0)),
        );
        checker.check(&mut record).unwrap();
        assert_eq!(record.operation_id(), 1);
        assert_eq!(record.last_checkpoint(), 0);

        // operation 1 not written yet and no heartbeat: wait
        checker.check(&mut record).unwrap();
        assert_eq!(record.operation_id(), 1);
        assert!(record.last_unsuccessful_check().is_some());
        assert_eq!(pool.missing_operations(), 0);

        // the heartbeat proves operation 1 was written, but it is gone
        cache.poke(
            None,
            thread.last_operation_key(),
            CacheValue::LastOperation(LastOperation {
                operation_id: 1,
                seed: 0,
            }),
        );
        checker.check(&mut record).unwrap();
        assert_eq!(pool.missing_operations(), 1);
        assert_eq!(record.operation_id(), 2);
    }

    #[test]
    fn resumes_from_checkpoint() {
        let cache = InMemoryCache::new();
        let pool = pool();
        let checker = checker(&cache, Arc::clone(&pool));
        let thread = StressorThread::new(0);
        let mut selector = KeySelector::new(thread, KeyRange::new(0, 10));
        for _ in 0..=4 {
            selector.next_key_id();
        }
        cache.poke(
            None,
            thread.checker_key(0),
            CacheValue::LastOperation(LastOperation {
                operation_id: 4,
                seed: selector.position(),
            }),
        );
        let key5 = selector.next_key_id();
        // operation 5 lives under the complement key after a removal
        cache.poke(
            None,
            KeyGenerator::String.generate_key(!key5),
            CacheValue::Log(PrivateLogValue::new(thread, 5)),
        );

        let mut record = pool.take().unwrap();
        checker.check(&mut record).unwrap();
        assert_eq!(record.operation_id(), 6);
        assert!(pool.failures().last_stored_operation().is_some());
    }

    #[test]
    fn ignored_operations_are_skipped() {
        let cache = InMemoryCache::new();
        let pool = pool();
        let checker = checker(&cache, Arc::clone(&pool));
        let thread = StressorThread::new(0);
        let heartbeat = CacheValue::LastOperation(LastOperation {
            operation_id: 3,
            seed: 0,
        });
        cache.poke(None, thread.last_operation_key(), heartbeat.clone());
        cache.poke(None, thread.ignored_key(0), heartbeat);

        let mut record = pool.take().unwrap();
        record.set_last_unsuccessful_check(Some(0));
        for _ in 0..4 {
            checker.check(&mut record).unwrap();
            record.set_last_unsuccessful_check(Some(0));
        }
        assert_eq!(record.operation_id(), 4);
        assert_eq!(pool.missing_operations(), 0);
    }
}
