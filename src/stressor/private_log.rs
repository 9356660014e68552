use super::{Logic, Worker};
use crate::{
    cache::{is_interruption, CacheValue},
    checker::{KeySelector, LastOperation, PrivateLogValue},
    keys::StressorThread,
    manager::is_worker_alive,
    range::KeyRange,
    stats::Operation,
};
use eyre::Context;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Wait for the checkers before trying to trim a full log again.
const TRIM_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Back-off after a failed operation.
const ERROR_DELAY: Duration = Duration::from_millis(10);

/// Where the current transaction started, to repeat it after a rollback.
#[derive(Debug, Clone, Copy)]
struct TransactionStart {
    operation_id: i64,
    position: u64,
}

/// Writes a verifiable operation log into the keys of the thread.
///
/// Operation `i` draws its key from the thread's [`KeySelector`]. A PUT appends `i` to the
/// [`PrivateLogValue`] of the key. A REMOVE moves the log, with `i` appended, to the complement
/// key `!key` and removes the key; the next PUT on the key moves it back. Once a log holds
/// `value-max-size` ids, the ids that all checkers confirmed are trimmed; until then the stressor
/// waits.
///
/// Every `counter-update-period` operations (after every commit with transactions) the stressor
/// publishes its progress as heartbeat, from which it also resumes after a restart.
pub struct PrivateLogLogic {
    thread: StressorThread,
    selector: KeySelector,
    rng: StdRng,
    resumed: bool,
    operation_id: i64,
    key_id: i64,
    // selector position before the current key was drawn
    position: u64,
    tx_start: TransactionStart,
    tx_rolled_back: bool,
    tx_failed_attempts: i32,
}

impl PrivateLogLogic {
    /// Creates the logic of the given stressor thread operating on `range`.
    ///
    /// Errors if the range is empty.
    pub fn new(thread: StressorThread, range: KeyRange) -> eyre::Result<Self> {
        if range.is_empty() {
            eyre::bail!("cannot write logs into empty key range {}", range);
        }
        Ok(Self {
            thread,
            selector: KeySelector::new(thread, range),
            rng: StdRng::from_entropy(),
            resumed: false,
            operation_id: 0,
            key_id: range.start(),
            position: 0,
            tx_start: TransactionStart {
                operation_id: 0,
                position: 0,
            },
            tx_rolled_back: false,
            tx_failed_attempts: 0,
        })
    }

    /// Continues after the last heartbeat of a previous run of the thread, if there is one.
    fn resume(&mut self, worker: &Worker) -> eyre::Result<()> {
        let last = worker
            .cache
            .get(worker.bucket(), &self.thread.last_operation_key())
            .context("failed to read last operation")?;
        match last {
            Some(last) => {
                let last = last.as_last_operation()?;
                self.operation_id = last.operation_id + 1;
                self.selector.set_position(last.seed);
                log::debug!("Restarting operations from operation {}", self.operation_id);
            }
            None => log::trace!("Starting operations of thread {}", self.thread.thread_id),
        }
        self.resumed = true;
        Ok(())
    }

    fn draw_key(&mut self) {
        self.position = self.selector.position();
        self.key_id = self.selector.next_key_id();
    }

    fn restart_transaction(&mut self, worker: &Worker) {
        self.operation_id = self.tx_start.operation_id;
        self.selector.set_position(self.tx_start.position);
        self.draw_key();
        self.tx_rolled_back = false;
        self.tx_failed_attempts += 1;
        log::trace!(
            "Transaction rolled back, number of attempts so far={}",
            self.tx_failed_attempts
        );
        let max_attempts = worker.config.log_logic.max_transaction_attempts;
        if max_attempts >= 0 && self.tx_failed_attempts > max_attempts {
            log::error!("Maximum number of transaction attempts attained, reporting.");
            worker.failures.report_failed_transaction_attempt();
        }
    }

    /// Executes the current operation once.
    ///
    /// Returns `false` if the operation has to be retried, or the transaction restarted if it
    /// was rolled back.
    fn try_invoke(&mut self, worker: &mut Worker) -> eyre::Result<bool> {
        if worker.at_transaction_start() && !worker.in_transaction() {
            self.tx_start = TransactionStart {
                operation_id: self.operation_id,
                position: self.position,
            };
            worker.start_transaction().context("failed to start transaction")?;
        }

        if !self.invoke_logic(worker)? {
            return Ok(false);
        }

        if !worker.config.general.transactions_enabled() {
            if self.operation_id % worker.config.log_logic.counter_update_period == 0 {
                self.write_heartbeat(worker);
            }
            return Ok(true);
        }

        if worker.count_transaction_operation() {
            if let Err(err) = worker.end_transaction(true) {
                log::debug!(
                    "Transaction was rolled back ({}), restarting from operation {}",
                    err,
                    self.tx_start.operation_id
                );
                self.tx_rolled_back = true;
                return Ok(false);
            }
            self.tx_failed_attempts = 0;
            // the heartbeat may only cover committed operations, and has to cover them even
            // when the thread stops right after the commit
            let written = match worker.start_transaction() {
                Ok(_) => {
                    self.write_heartbeat(worker);
                    worker.end_transaction(true)
                }
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                log::error!("Cannot write stressor last operation: {}", err);
                worker.abort_transaction();
            }
        }
        Ok(true)
    }

    fn pick_operation(&mut self, worker: &Worker) -> Operation {
        let general = &worker.config.general;
        let total = general.puts + general.removes;
        if self.rng.gen_range(0..total.max(1)) < general.puts {
            Operation::Put
        } else {
            Operation::Remove
        }
    }

    /// Applies the operation to the log of the current key. Returns `false` if the log is full
    /// and the thread was asked to stop while waiting for the checkers.
    fn invoke_logic(&mut self, worker: &mut Worker) -> eyre::Result<bool> {
        let operation = self.pick_operation(worker);
        let key_id = self.key_id;
        let previous = self.checked_get(worker, key_id)?;

        match (operation, previous) {
            (Operation::Remove, Some(previous)) => {
                let next = match self.next_value(worker, &previous)? {
                    Some(next) => next,
                    None => return Ok(false),
                };
                self.checked_put(worker, !key_id, next)?;
                self.checked_remove(worker, key_id, &previous)?;
            }
            (_, previous) => {
                // a removed log lives under the complement key
                let backup = match previous {
                    Some(_) => None,
                    None => self.checked_get(worker, !key_id)?,
                };
                let next = match previous.as_ref().or_else(|| backup.as_ref()) {
                    Some(base) => match self.next_value(worker, base)? {
                        Some(next) => next,
                        None => return Ok(false),
                    },
                    None => PrivateLogValue::new(self.thread, self.operation_id),
                };
                self.checked_put(worker, key_id, next)?;
                if let Some(backup) = backup {
                    self.checked_remove(worker, !key_id, &backup)?;
                }
            }
        }
        Ok(true)
    }

    /// Appends the current operation to the log, trimming the confirmed ids if it is full.
    fn next_value(
        &mut self,
        worker: &mut Worker,
        previous: &PrivateLogValue,
    ) -> eyre::Result<Option<PrivateLogValue>> {
        if previous.len() < worker.config.log_logic.value_max_size {
            return Ok(Some(previous.with(self.operation_id)));
        }
        let oldest = previous.operation_ids()[0];
        loop {
            if worker.should_stop() {
                return Ok(None);
            }
            let min_checked = self.last_checked_operation(worker, oldest)?;
            if oldest <= min_checked {
                let trimmed = previous
                    .operation_ids()
                    .iter()
                    .take_while(|&&id| id <= min_checked)
                    .count();
                log::trace!(
                    "Discarding {} operations (minimum of checked operations is {})",
                    trimmed,
                    min_checked
                );
                return Ok(Some(previous.shift(trimmed, self.operation_id)));
            }
            worker.control().sleep(TRIM_RETRY_DELAY)?;
        }
    }

    /// The minimum of the operations of this thread that the checkers on all workers confirmed.
    ///
    /// Checkers on dead workers are skipped if configured; the stressor then announces up to
    /// which operation they may skip.
    fn last_checked_operation(&self, worker: &Worker, operation_id: i64) -> eyre::Result<i64> {
        let bucket = worker.bucket();
        let cache = &*worker.cache;
        let mut min_checked = i64::MAX;
        for checker_worker in 0..worker.config.cluster.size {
            let checked = cache
                .get(bucket, &self.thread.checker_key(checker_worker))
                .with_context(|| {
                    format!("cannot read last checked operation of worker {}", checker_worker)
                })?
                .map(|value| value.as_last_operation().map(|last| last.operation_id))
                .transpose()?
                .unwrap_or(i64::MIN);
            let skip = checked < operation_id
                && worker.config.log_logic.ignore_dead_checkers
                && !is_worker_alive(
                    cache,
                    bucket,
                    checker_worker,
                    worker.config.log_logic.dead_worker_timeout,
                );
            if !skip {
                min_checked = min_checked.min(checked);
                continue;
            }
            let ignored_key = self.thread.ignored_key(checker_worker);
            let ignored = cache
                .get(bucket, &ignored_key)?
                .map(|value| value.as_last_operation().map(|last| last.operation_id))
                .transpose()?;
            if ignored.map_or(true, |ignored| ignored < operation_id) {
                log::trace!(
                    "Setting ignored operation for checker worker {} and stressor {}: {:?} -> {} (last checked operation {})",
                    checker_worker,
                    self.thread.thread_id,
                    ignored,
                    operation_id,
                    checked
                );
                cache
                    .put(
                        bucket,
                        ignored_key,
                        CacheValue::LastOperation(LastOperation {
                            operation_id,
                            seed: 0,
                        }),
                    )
                    .with_context(|| {
                        format!("cannot write ignored operation for worker {}", checker_worker)
                    })?;
            }
            min_checked = min_checked.min(operation_id);
        }
        Ok(min_checked)
    }

    fn write_heartbeat(&mut self, worker: &mut Worker) {
        let bucket = worker.config.general.bucket_id.clone();
        let last = LastOperation {
            operation_id: self.operation_id,
            seed: self.selector.position(),
        };
        let key = self.thread.last_operation_key();
        if let Err(err) = worker
            .access()
            .put(bucket.as_deref(), key, CacheValue::LastOperation(last))
        {
            log::error!(
                "Error while writing last operation {} for stressor {}: {}",
                self.operation_id,
                self.thread.thread_id,
                err
            );
        }
    }

    fn checked_get(
        &mut self,
        worker: &mut Worker,
        key_id: i64,
    ) -> eyre::Result<Option<PrivateLogValue>> {
        let config = Arc::clone(&worker.config);
        let key = config.general.key_generator.generate_key(key_id);
        let start = Instant::now();
        let result = worker.access().get(config.general.bucket_id.as_deref(), &key);
        let elapsed = start.elapsed();
        match result {
            Ok(Some(value)) => {
                worker.register(elapsed, Duration::ZERO, Operation::Get, false);
                let log = value
                    .into_log()
                    .with_context(|| format!("unexpected value under key {}", key))?;
                if log.thread_id() != self.thread.thread_id {
                    eyre::bail!(
                        "key {} holds the log of thread {}, expected thread {}",
                        key,
                        log.thread_id(),
                        self.thread.thread_id
                    );
                }
                Ok(Some(log))
            }
            Ok(None) => {
                worker.register(elapsed, Duration::ZERO, Operation::GetNull, false);
                Ok(None)
            }
            Err(err) => {
                worker.register(elapsed, Duration::ZERO, Operation::Get, true);
                Err(err).with_context(|| format!("cannot read key {}", key))
            }
        }
    }

    fn checked_put(
        &mut self,
        worker: &mut Worker,
        key_id: i64,
        value: PrivateLogValue,
    ) -> eyre::Result<()> {
        let config = Arc::clone(&worker.config);
        let key = config.general.key_generator.generate_key(key_id);
        let start = Instant::now();
        let result = worker.access().put(
            config.general.bucket_id.as_deref(),
            key.clone(),
            CacheValue::Log(value),
        );
        worker.register(start.elapsed(), Duration::ZERO, Operation::Put, result.is_err());
        result.with_context(|| format!("cannot write key {}", key))
    }

    /// Removes the key, verifying that it still holds the expected log.
    fn checked_remove(
        &mut self,
        worker: &mut Worker,
        key_id: i64,
        expected: &PrivateLogValue,
    ) -> eyre::Result<()> {
        let config = Arc::clone(&worker.config);
        let key = config.general.key_generator.generate_key(key_id);
        let start = Instant::now();
        let result = worker.access().remove(config.general.bucket_id.as_deref(), &key);
        let elapsed = start.elapsed();
        let removed = match result {
            Ok(removed) => removed,
            Err(err) => {
                worker.register(elapsed, Duration::ZERO, Operation::Remove, true);
                return Err(err).with_context(|| format!("cannot remove key {}", key));
            }
        };
        let matches = matches!(&removed, Some(CacheValue::Log(log)) if log == expected);
        if !matches {
            log::error!(
                "Value is not the expected one: expected {:?}, found {:?}",
                expected,
                removed
            );
        }
        worker.register(elapsed, Duration::ZERO, Operation::Remove, !matches);
        Ok(())
    }
}

impl Logic for PrivateLogLogic {
    fn invoke(&mut self, worker: &mut Worker) -> eyre::Result<()> {
        if !self.resumed {
            if let Err(err) = self.resume(worker) {
                if is_interruption(&err) {
                    return Err(err);
                }
                // a failed read does not mean there is no heartbeat
                log::error!("Failure getting last operation: {:?}", err);
                worker.control().sleep(ERROR_DELAY)?;
                return Ok(());
            }
        }

        self.draw_key();
        loop {
            if self.tx_rolled_back {
                self.restart_transaction(worker);
            }
            log::trace!(
                "Operation {} on key {}",
                self.operation_id,
                worker.config.general.key_generator.generate_key(self.key_id)
            );
            match self.try_invoke(worker) {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) if is_interruption(&err) || worker.control().is_interrupted() => {
                    return Err(err)
                }
                Err(err) => {
                    log::error!("Cache operation error: {:?}", err);
                    if worker.in_transaction() {
                        worker.abort_transaction();
                        log::debug!(
                            "Restarting from operation {}, current operation {}",
                            self.tx_start.operation_id,
                            self.operation_id
                        );
                        self.tx_rolled_back = true;
                    }
                    worker.control().sleep(ERROR_DELAY)?;
                }
            }
            if worker.should_stop() {
                return Ok(());
            }
        }
        self.operation_id += 1;
        Ok(())
    }

    fn operation_id(&self) -> i64 {
        self.operation_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{CacheBackend, InMemoryCache},
        checker::FailureManager,
        config::Config,
        key_generator::KeyGenerator,
        stats::Statistics,
        stressor::StressorShared,
    };
    use pretty_assertions::assert_eq;

    fn worker(cache: &InMemoryCache, configure: impl FnOnce(&mut Config)) -> Worker {
        let mut config = Config::default();
        config.general.num_threads = 1;
        config.general.gets = 0;
        config.general.puts = 1;
        config.general.removes = 1;
        config.log_logic.enabled = true;
        config.log_logic.counter_update_period = 5;
        configure(&mut config);
        Worker::new(
            0,
            Arc::new(config),
            Arc::new(cache.clone()),
            Arc::new(StressorShared::new(Statistics::simple(), true)),
            Arc::new(FailureManager::new()),
        )
    }

    fn find_log(cache: &InMemoryCache, key_id: i64) -> Option<PrivateLogValue> {
        let generator = KeyGenerator::String;
        cache
            .peek(None, &generator.generate_key(key_id))
            .or_else(|| cache.peek(None, &generator.generate_key(!key_id)))
            .map(|value| value.into_log().unwrap())
    }

    fn heartbeat(cache: &InMemoryCache, thread: StressorThread) -> Option<i64> {
        cache
            .peek(None, &thread.last_operation_key())
            .map(|value| value.as_last_operation().unwrap().operation_id)
    }

    #[test]
    fn every_operation_is_logged() {
        let cache = InMemoryCache::new();
        let mut worker = worker(&cache, |_| {});
        let thread = StressorThread::new(0);
        let range = KeyRange::new(0, 20);
        let mut logic = PrivateLogLogic::new(thread, range).unwrap();
        for _ in 0..30 {
            logic.invoke(&mut worker).unwrap();
        }
        assert_eq!(logic.operation_id(), 30);

        let mut selector = KeySelector::new(thread, range);
        for operation_id in 0..30 {
            let key_id = selector.next_key_id();
            let log = find_log(&cache, key_id).unwrap();
            assert!(log.contains(thread, operation_id), "{} not in {:?}", operation_id, log);
        }
        assert_eq!(heartbeat(&cache, thread), Some(25));
        // a key and its complement never hold a log at the same time
        for key_id in range.iter() {
            let generator = KeyGenerator::String;
            let both = cache.peek(None, &generator.generate_key(key_id)).is_some()
                && cache.peek(None, &generator.generate_key(!key_id)).is_some();
            assert!(!both);
        }
    }

    #[test]
    fn resumes_after_heartbeat() {
        let cache = InMemoryCache::new();
        let mut worker = worker(&cache, |_| {});
        let thread = StressorThread::new(0);
        let range = KeyRange::new(0, 20);
        let mut first = PrivateLogLogic::new(thread, range).unwrap();
        for _ in 0..11 {
            first.invoke(&mut worker).unwrap();
        }
        assert_eq!(heartbeat(&cache, thread), Some(10));

        let mut restarted = PrivateLogLogic::new(thread, range).unwrap();
        restarted.invoke(&mut worker).unwrap();
        assert_eq!(restarted.operation_id(), 12);
        let mut selector = KeySelector::new(thread, range);
        let key_id = (0..=11).map(|_| selector.next_key_id()).last().unwrap();
        assert!(find_log(&cache, key_id).unwrap().contains(thread, 11));
    }

    #[test]
    fn full_log_is_trimmed_after_confirmation() {
        let cache = InMemoryCache::new();
        let mut worker = worker(&cache, |config| {
            config.general.removes = 0;
            config.log_logic.value_max_size = 2;
        });
        let thread = StressorThread::new(0);
        let mut logic = PrivateLogLogic::new(thread, KeyRange::new(0, 1)).unwrap();
        cache.poke(
            None,
            thread.checker_key(0),
            CacheValue::LastOperation(LastOperation {
                operation_id: 1,
                seed: 0,
            }),
        );
        for _ in 0..3 {
            logic.invoke(&mut worker).unwrap();
        }
        assert_eq!(find_log(&cache, 0).unwrap().operation_ids(), &[2]);
    }

    #[test]
    fn dead_checkers_are_ignored() {
        let cache = InMemoryCache::new();
        let mut worker = worker(&cache, |config| {
            config.cluster.size = 2;
            config.general.removes = 0;
            config.log_logic.value_max_size = 1;
            config.log_logic.ignore_dead_checkers = true;
        });
        let thread = StressorThread::new(0);
        let mut logic = PrivateLogLogic::new(thread, KeyRange::new(0, 1)).unwrap();
        cache.poke(
            None,
            thread.checker_key(0),
            CacheValue::LastOperation(LastOperation {
                operation_id: 0,
                seed: 0,
            }),
        );
        logic.invoke(&mut worker).unwrap();
        logic.invoke(&mut worker).unwrap();
        assert_eq!(find_log(&cache, 0).unwrap().operation_ids(), &[1]);
        let ignored = cache.peek(None, &thread.ignored_key(1)).unwrap();
        assert_eq!(ignored.as_last_operation().unwrap().operation_id, 0);
    }

    #[test]
    fn rolled_back_transaction_is_repeated() {
        let cache = InMemoryCache::new();
        let mut worker = worker(&cache, |config| {
            config.general.transaction_size = 2;
            config.log_logic.max_transaction_attempts = 0;
        });
        let thread = StressorThread::new(0);
        let range = KeyRange::new(0, 20);
        let mut logic = PrivateLogLogic::new(thread, range).unwrap();

        logic.invoke(&mut worker).unwrap();
        cache.inject_failed_commits(1);
        logic.invoke(&mut worker).unwrap();
        // the commit failed and operation 0 was repeated in a new transaction
        assert_eq!(logic.operation_id(), 1);
        assert_eq!(cache.local_size().unwrap(), 0);
        assert_eq!(worker.failures.failed_transaction_attempts(), 1);

        logic.invoke(&mut worker).unwrap();
        assert_eq!(logic.operation_id(), 2);
        assert_eq!(heartbeat(&cache, thread), Some(1));
        let mut selector = KeySelector::new(thread, range);
        for operation_id in 0..2 {
            let log = find_log(&cache, selector.next_key_id()).unwrap();
            assert!(log.contains(thread, operation_id));
        }
    }

    #[test]
    fn committed_operation_is_reported_when_stopping() {
        let cache = InMemoryCache::new();
        let mut worker = worker(&cache, |config| {
            config.general.transaction_size = 1;
        });
        let thread = StressorThread::new(0);
        let mut logic = PrivateLogLogic::new(thread, KeyRange::new(0, 20)).unwrap();

        logic.invoke(&mut worker).unwrap();
        assert_eq!(heartbeat(&cache, thread), Some(0));

        worker.control().request_terminate();
        logic.invoke(&mut worker).unwrap();
        assert_eq!(logic.operation_id(), 2);
        assert_eq!(heartbeat(&cache, thread), Some(1));
        assert!(!worker.in_transaction());
    }
}
