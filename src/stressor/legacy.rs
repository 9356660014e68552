use super::{Logic, Worker};
use crate::{
    cache::{is_interruption, CacheError, CacheValue},
    range::KeyRange,
    stats::Operation,
};
use eyre::Context;
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// Loads the keys of the thread with random payloads and then issues a weighted random mix of
/// GET, PUT and REMOVE requests, walking over the keys in a cycle.
pub struct LegacyLogic {
    range: KeyRange,
    dead_worker_fragments: Vec<KeyRange>,
    cursor: i64,
    requests: i64,
    rng: StdRng,
}

impl LegacyLogic {
    /// Creates the logic for the given key range and the fragments of dead workers' ranges the
    /// thread has to load in addition.
    ///
    /// Errors if the range is empty.
    pub fn new(range: KeyRange, dead_worker_fragments: Vec<KeyRange>) -> eyre::Result<Self> {
        if range.is_empty() {
            eyre::bail!("cannot stress empty key range {}", range);
        }
        Ok(Self {
            range,
            dead_worker_fragments,
            cursor: range.start(),
            requests: 0,
            rng: StdRng::from_entropy(),
        })
    }

    fn random_payload(&mut self, size: usize) -> Vec<u8> {
        let mut payload = vec![0; size];
        self.rng.fill_bytes(&mut payload);
        payload
    }

    fn next_key_id(&mut self) -> i64 {
        let key_id = self.cursor;
        self.cursor += 1;
        if self.cursor == self.range.end() {
            self.cursor = self.range.start();
        }
        key_id
    }

    fn pick_operation(&mut self, worker: &Worker) -> Operation {
        let general = &worker.config.general;
        let total = general.gets + general.puts + general.removes;
        let r = self.rng.gen_range(0..total.max(1));
        if r < general.gets {
            Operation::Get
        } else if r < general.gets + general.puts {
            Operation::Put
        } else {
            Operation::Remove
        }
    }

    fn load_range(&mut self, worker: &mut Worker, range: KeyRange) -> eyre::Result<()> {
        let config = Arc::clone(&worker.config);
        let bucket = config.general.bucket_id.as_deref();
        let generator = config.general.key_generator;
        let attempts = config.legacy_logic.load_attempts;
        for (loaded, key_id) in range.iter().enumerate() {
            let mut attempt = 0;
            while !worker.should_stop() {
                let value = CacheValue::Bytes(self.random_payload(config.general.entry_size));
                match worker.cache.put(bucket, generator.generate_key(key_id), value) {
                    Ok(()) => break,
                    Err(CacheError::Interrupted) => return Err(CacheError::Interrupted.into()),
                    Err(err) => log::error!("Error while loading key {}: {}", key_id, err),
                }
                attempt += 1;
                if attempts >= 0 && attempt >= attempts {
                    log::warn!("Giving up loading key {} after {} attempts", key_id, attempt);
                    break;
                }
            }
            if worker.should_stop() {
                return Ok(());
            }
            if loaded % 1000 == 0 {
                log::debug!("Loaded {} out of {}", loaded, range.size());
            }
        }
        log::debug!("Loaded all {} keys of {}", range.size(), range);
        Ok(())
    }

    fn execute(
        &mut self,
        worker: &mut Worker,
        operation: Operation,
        key_id: i64,
    ) -> eyre::Result<()> {
        let config = Arc::clone(&worker.config);
        let bucket = config.general.bucket_id.as_deref();
        let key = config.general.key_generator.generate_key(key_id);

        let mut tx_overhead = Duration::ZERO;
        if worker.at_transaction_start() {
            let start = Instant::now();
            match worker.start_transaction() {
                Ok(elapsed) => tx_overhead += elapsed,
                Err(err) => {
                    if err != CacheError::Interrupted {
                        worker.register(Duration::ZERO, start.elapsed(), operation, true);
                    }
                    return Err(err).context("failed to start transaction");
                }
            }
        }

        let value = match operation {
            Operation::Put => Some(CacheValue::Bytes(
                self.random_payload(config.general.entry_size),
            )),
            _ => None,
        };
        let start = Instant::now();
        let outcome = {
            let mut access = worker.access();
            match (operation, value) {
                (Operation::Put, Some(value)) => access.put(bucket, key, value).map(|_| operation),
                (Operation::Remove, _) => access.remove(bucket, &key).map(|_| operation),
                _ => access.get(bucket, &key).map(|value| match value {
                    Some(_) => Operation::Get,
                    None => Operation::GetNull,
                }),
            }
        };
        let response_time = start.elapsed();
        let operation = match outcome {
            Ok(operation) => operation,
            Err(err) => {
                // a cancelled request is not a failure of the cache
                if err != CacheError::Interrupted {
                    worker.register(response_time, tx_overhead, operation, true);
                }
                return Err(err).with_context(|| format!("{} of key {} failed", operation, key_id));
            }
        };

        if worker.count_transaction_operation() {
            match worker.end_transaction(config.general.commit_transactions) {
                Ok(end) => tx_overhead += end,
                Err(err) => {
                    worker.register(response_time, tx_overhead, operation, false);
                    return Err(err).context("failed to end transaction");
                }
            }
        }
        worker.register(response_time, tx_overhead, operation, false);
        Ok(())
    }
}

impl Logic for LegacyLogic {
    fn load(&mut self, worker: &mut Worker) -> eyre::Result<()> {
        log::trace!("Loading key range {}", self.range);
        self.load_range(worker, self.range)?;
        for fragment in self.dead_worker_fragments.clone() {
            log::trace!("Loading key range {} of dead worker", fragment);
            self.load_range(worker, fragment)?;
        }
        Ok(())
    }

    fn invoke(&mut self, worker: &mut Worker) -> eyre::Result<()> {
        let operation = self.pick_operation(worker);
        let key_id = self.next_key_id();
        self.requests += 1;
        match self.execute(worker, operation, key_id) {
            Ok(()) => Ok(()),
            Err(err) if is_interruption(&err) || worker.control().is_interrupted() => Err(err),
            Err(err) => {
                log::error!("Cache operation error: {:?}", err);
                worker.abort_transaction();
                Ok(())
            }
        }
    }

    fn operation_id(&self) -> i64 {
        self.requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{CacheBackend, InMemoryCache},
        checker::FailureManager,
        config::Config,
        stats::Statistics,
        stressor::StressorShared,
    };
    use pretty_assertions::assert_eq;

    fn worker(cache: &InMemoryCache, configure: impl FnOnce(&mut Config)) -> Worker {
        let mut config = Config::default();
        config.general.num_threads = 1;
        configure(&mut config);
        Worker::new(
            0,
            Arc::new(config),
            Arc::new(cache.clone()),
            Arc::new(StressorShared::new(Statistics::simple(), false)),
            Arc::new(FailureManager::new()),
        )
    }

    fn count(worker: &Worker, operation: Operation) -> u64 {
        worker.shared.stats().operation_stats(operation).requests
    }

    #[test]
    fn loads_own_range_and_dead_fragments() {
        let cache = InMemoryCache::new();
        let mut worker = worker(&cache, |_| {});
        let mut logic =
            LegacyLogic::new(KeyRange::new(0, 10), vec![KeyRange::new(50, 53)]).unwrap();
        logic.load(&mut worker).unwrap();
        assert_eq!(cache.local_size().unwrap(), 13);
        let value = cache.peek(None, &"key_51".into()).unwrap();
        assert_eq!(value.as_bytes().unwrap().len(), 1024);
    }

    #[test]
    fn cursor_wraps_around() {
        let mut logic = LegacyLogic::new(KeyRange::new(5, 8), Vec::new()).unwrap();
        let keys: Vec<_> = (0..7).map(|_| logic.next_key_id()).collect();
        assert_eq!(keys, vec![5, 6, 7, 5, 6, 7, 5]);
    }

    #[test]
    fn empty_reads_are_get_null() {
        let cache = InMemoryCache::new();
        let mut worker = worker(&cache, |config| {
            config.general.puts = 0;
            config.general.gets = 1;
        });
        let mut logic = LegacyLogic::new(KeyRange::new(0, 4), Vec::new()).unwrap();
        cache.poke(None, "key_0".into(), CacheValue::Bytes(vec![1]));
        for _ in 0..4 {
            logic.invoke(&mut worker).unwrap();
        }
        assert_eq!(count(&worker, Operation::Get), 1);
        assert_eq!(count(&worker, Operation::GetNull), 3);
    }

    #[test]
    fn failures_are_recorded_and_roll_back() {
        let cache = InMemoryCache::new();
        let mut worker = worker(&cache, |config| {
            config.general.puts = 1;
            config.general.gets = 0;
            config.general.transaction_size = 2;
        });
        let mut logic = LegacyLogic::new(KeyRange::new(0, 10), Vec::new()).unwrap();

        // first put succeeds inside the transaction, the second one fails
        logic.invoke(&mut worker).unwrap();
        cache.inject_failures(1);
        logic.invoke(&mut worker).unwrap();
        assert_eq!(cache.local_size().unwrap(), 0);
        assert!(worker.at_transaction_start());
        assert_eq!(worker.shared.stats().operation_stats(Operation::Put).errors, 1);

        logic.invoke(&mut worker).unwrap();
        logic.invoke(&mut worker).unwrap();
        assert_eq!(cache.local_size().unwrap(), 2);
        // the aborted and the committed transaction
        assert_eq!(count(&worker, Operation::Transaction), 2);
        assert_eq!(worker.shared.stats().operation_stats(Operation::Transaction).errors, 1);
    }

    #[test]
    fn failed_transaction_start_is_recorded() {
        let cache = InMemoryCache::new();
        let mut worker = worker(&cache, |config| {
            config.general.puts = 1;
            config.general.gets = 0;
            config.general.transaction_size = 2;
        });
        let mut logic = LegacyLogic::new(KeyRange::new(0, 10), Vec::new()).unwrap();

        cache.inject_failures(1);
        logic.invoke(&mut worker).unwrap();
        assert!(!worker.in_transaction());
        assert!(worker.at_transaction_start());
        assert_eq!(worker.shared.stats().operation_stats(Operation::Put).errors, 1);
        assert_eq!(worker.shared.stats().num_errors(), 1);
        assert_eq!(count(&worker, Operation::Transaction), 0);

        logic.invoke(&mut worker).unwrap();
        logic.invoke(&mut worker).unwrap();
        assert_eq!(cache.local_size().unwrap(), 2);
        assert_eq!(worker.shared.stats().operation_stats(Operation::Transaction).errors, 0);
    }

    #[test]
    fn interrupted_requests_are_not_failures() {
        let cache = InMemoryCache::new();
        let mut plain = worker(&cache, |config| {
            config.general.puts = 1;
            config.general.gets = 0;
        });
        let mut transactional = worker(&cache, |config| {
            config.general.puts = 1;
            config.general.gets = 0;
            config.general.transaction_size = 2;
        });
        let mut logic = LegacyLogic::new(KeyRange::new(0, 10), Vec::new()).unwrap();

        cache.inject_interruptions(1);
        let err = logic.load(&mut plain).unwrap_err();
        assert!(is_interruption(&err));
        assert_eq!(cache.local_size().unwrap(), 0);

        cache.inject_interruptions(1);
        let err = logic.invoke(&mut plain).unwrap_err();
        assert!(is_interruption(&err));
        assert_eq!(plain.shared.stats().num_requests(), 0);
        assert_eq!(plain.shared.stats().num_errors(), 0);

        // a cancelled transaction start is not recorded either
        cache.inject_interruptions(1);
        let err = logic.invoke(&mut transactional).unwrap_err();
        assert!(is_interruption(&err));
        assert!(!transactional.in_transaction());
        assert_eq!(transactional.shared.stats().num_errors(), 0);
    }
}
