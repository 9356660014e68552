//! Orchestrates the background threads of one worker process.
//!
//! The [`OperationsManager`] owns the stressor threads, the statistics and size sampling threads
//! and, with the log logic, the checker and keep-alive threads. All methods take `&self`, so the
//! manager can be shared between the threads of the stage layer.

pub use self::threads::is_worker_alive;
use self::{
    stats::{SizeSampler, StatsCollector},
    threads::BackgroundThread,
};
use crate::{
    cache::CacheBackend,
    checker::{CheckerSettings, FailureManager, LogChecker, Pool},
    config::Config,
    range::{self, KeyRange},
    stats::{now_millis, Statistics, StatsError},
    stressor::{
        LegacyLogic, LoadStressor, Logic, PrivateLogLogic, StressorShared, StressorState, Worker,
    },
};
use eyre::bail;
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

mod stats;
mod threads;

/// Poll period of [`OperationsManager::wait_until_loaded`].
const LOADED_POLL_PERIOD: Duration = Duration::from_millis(100);

/// Poll period while waiting for stressors to finish within the grace period.
const STOP_POLL_PERIOD: Duration = Duration::from_millis(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Checkers {
    pool: Arc<Pool>,
    threads: Vec<BackgroundThread>,
    keep_alive: Option<BackgroundThread>,
}

struct StatsThread {
    collector: Arc<StatsCollector>,
    thread: BackgroundThread,
}

/// Owns the background threads of one worker process.
pub struct OperationsManager {
    config: Arc<Config>,
    cache: Arc<dyn CacheBackend>,
    failures: Arc<FailureManager>,
    prototype: Statistics,
    stressors: Mutex<Vec<LoadStressor>>,
    // read by the statistics thread
    running: Arc<Mutex<Vec<Arc<StressorShared>>>>,
    sampler: Arc<SizeSampler>,
    size_thread: Mutex<Option<BackgroundThread>>,
    checkers: Mutex<Option<Checkers>>,
    stats: Mutex<Option<StatsThread>>,
    loaded: Mutex<bool>,
}

impl OperationsManager {
    /// Creates a manager for the given validated config, operating on `cache`.
    pub fn new(config: Arc<Config>, cache: Arc<dyn CacheBackend>) -> Self {
        let prototype = Statistics::from_kind(&config.statistics.kind);
        let loaded = config.legacy_logic.no_loading || config.log_logic.enabled;
        Self {
            config,
            cache,
            failures: Arc::new(FailureManager::new()),
            prototype,
            stressors: Mutex::new(Vec::new()),
            running: Arc::new(Mutex::new(Vec::new())),
            sampler: Arc::new(SizeSampler::new()),
            size_thread: Mutex::new(None),
            checkers: Mutex::new(None),
            stats: Mutex::new(None),
            loaded: Mutex::new(loaded),
        }
    }

    /// The run configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The failure counters shared by stressors and checkers.
    pub fn failures(&self) -> &Arc<FailureManager> {
        &self.failures
    }

    /// Returns `true` while stressor threads exist.
    pub fn is_running(&self) -> bool {
        !lock(&self.stressors).is_empty()
    }

    /// Spawns one stressor thread per configured thread, plus the checker and keep-alive threads
    /// if the log logic is enabled.
    ///
    /// Logs a warning and does nothing if the stressors are already running or the cache is not
    /// running. If a thread cannot be started, the threads started so far are stopped again
    /// before the error is returned.
    pub fn start_stressors(&self) -> eyre::Result<()> {
        let config = Arc::clone(&self.config);
        self.start_stressors_with(move |thread_index, range, worker| {
            let general = &config.general;
            let logic: Box<dyn Logic> = if config.log_logic.enabled {
                Box::new(PrivateLogLogic::new(worker.thread, range)?)
            } else {
                let fragments = range::dead_worker_fragments(
                    general.num_entries,
                    config.cluster.size,
                    general.num_threads,
                    &config.legacy_logic.load_data_for_dead_workers,
                    config.cluster.worker_index,
                    thread_index,
                )?
                .into_iter()
                .map(|fragment| fragment.shift(general.key_id_offset))
                .collect();
                Box::new(LegacyLogic::new(range, fragments)?)
            };
            Ok(logic)
        })
    }

    fn start_stressors_with(
        &self,
        logic_for: impl FnMut(u32, KeyRange, &Worker) -> eyre::Result<Box<dyn Logic>>,
    ) -> eyre::Result<()> {
        let started_checkers;
        {
            let mut stressors = lock(&self.stressors);
            if !stressors.is_empty() {
                log::warn!("Stressors already running, cannot start them again");
                return Ok(());
            }
            if !self.cache.is_running() {
                log::warn!("Cache is not running, cannot start stressors");
                return Ok(());
            }
            started_checkers = self.config.log_logic.enabled && lock(&self.checkers).is_none();
            if self.config.log_logic.enabled {
                self.start_checkers()?;
            }

            let started = match self.spawn_stressors(logic_for) {
                Ok(started) => started,
                Err(err) => {
                    if started_checkers {
                        self.stop_checkers();
                    }
                    return Err(err);
                }
            };
            *lock(&self.running) = started.iter().map(|s| Arc::clone(s.shared())).collect();
            *stressors = started;
            log::info!("Started {} stressor threads", stressors.len());
        }

        if self.config.statistics.sample_cache_size {
            let sampler = Arc::clone(&self.sampler);
            let cache = Arc::clone(&self.cache);
            let spawned = BackgroundThread::spawn("SizeThread".to_owned(), move |control| {
                sampler.run(&*cache, &control)
            });
            match spawned {
                Ok(thread) => *lock(&self.size_thread) = Some(thread),
                Err(err) => {
                    if let Err(stop_err) = self.stop_stressors() {
                        log::error!("{:?}", stop_err);
                    }
                    if started_checkers {
                        self.stop_checkers();
                    }
                    return Err(err);
                }
            }
        }

        if self.config.legacy_logic.wait_until_loaded && !self.config.log_logic.enabled {
            self.wait_until_loaded()?;
        }
        Ok(())
    }

    /// Spawns the stressor threads. On error, the threads spawned so far are interrupted and
    /// joined.
    fn spawn_stressors(
        &self,
        mut logic_for: impl FnMut(u32, KeyRange, &Worker) -> eyre::Result<Box<dyn Logic>>,
    ) -> eyre::Result<Vec<LoadStressor>> {
        let config = &self.config;
        let general = &config.general;
        // data loaded once survive restarts of the stressors
        let loaded = *lock(&self.loaded);
        let mut started: Vec<LoadStressor> = Vec::new();
        for thread_index in 0..general.num_threads {
            let range = range::thread_range(
                general.num_entries,
                config.cluster.size,
                general.num_threads,
                config.cluster.worker_index,
                thread_index,
            )
            .shift(general.key_id_offset);
            if range.is_empty() {
                log::warn!("Stressor {} owns no keys and is not started", thread_index);
                continue;
            }
            let shared = Arc::new(StressorShared::new(self.prototype.empty_copy(), loaded));
            let worker = Worker::new(
                thread_index,
                Arc::clone(&self.config),
                Arc::clone(&self.cache),
                shared,
                Arc::clone(&self.failures),
            );
            let stressor = logic_for(thread_index, range, &worker)
                .and_then(|logic| LoadStressor::start(worker, logic));
            match stressor {
                Ok(stressor) => started.push(stressor),
                Err(err) => {
                    log::error!(
                        "Cannot start stressor {}, stopping {} started stressors",
                        thread_index,
                        started.len()
                    );
                    for stressor in &started {
                        stressor.request_terminate();
                        stressor.interrupt();
                    }
                    for stressor in &mut started {
                        if let Err(join_err) = stressor.join() {
                            log::error!("{:?}", join_err);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(started)
    }

    fn start_checkers(&self) -> eyre::Result<()> {
        let mut checkers = lock(&self.checkers);
        if checkers.is_some() {
            return Ok(());
        }
        let config = &self.config;
        let pool = Arc::new(Pool::new(
            config.cluster.size,
            config.general.num_threads,
            config.general.num_entries,
            config.general.key_id_offset,
            Arc::clone(&self.failures),
        ));
        let settings = Arc::new(CheckerSettings::from_config(config));
        let mut threads = Vec::new();
        for id in 0..config.log_logic.checking_threads {
            let settings = Arc::clone(&settings);
            let cache = Arc::clone(&self.cache);
            let pool = Arc::clone(&pool);
            let spawned = BackgroundThread::spawn(format!("LogChecker-{}", id), move |control| {
                LogChecker::new(id, settings, cache, pool, control).run()
            });
            match spawned {
                Ok(thread) => threads.push(thread),
                Err(err) => {
                    threads.into_iter().for_each(BackgroundThread::stop);
                    return Err(err);
                }
            }
        }
        let keep_alive = if config.log_logic.ignore_dead_checkers {
            let cache = Arc::clone(&self.cache);
            let bucket = config.general.bucket_id.clone();
            let worker_index = config.cluster.worker_index;
            let spawned = BackgroundThread::spawn(
                format!("KeepAlive-{}", worker_index),
                move |control| threads::keep_alive(cache, bucket, worker_index, control),
            );
            match spawned {
                Ok(thread) => Some(thread),
                Err(err) => {
                    threads.into_iter().for_each(BackgroundThread::stop);
                    return Err(err);
                }
            }
        } else {
            None
        };
        log::info!(
            "Started {} checker threads for {} stressor threads",
            threads.len(),
            pool.total_threads()
        );
        *checkers = Some(Checkers {
            pool,
            threads,
            keep_alive,
        });
        Ok(())
    }

    /// Blocks until every stressor has loaded its keys.
    ///
    /// Errors if a stressor exits before it finished loading.
    pub fn wait_until_loaded(&self) -> eyre::Result<()> {
        loop {
            let (all_loaded, failed) = {
                let running = lock(&self.running);
                let all_loaded = running.iter().all(|s| s.is_loaded());
                let failed = running
                    .iter()
                    .any(|s| !s.is_loaded() && s.state() == StressorState::Stopped);
                (all_loaded, failed)
            };
            if all_loaded {
                *lock(&self.loaded) = true;
                log::info!("All stressors have loaded their data");
                return Ok(());
            }
            if failed {
                bail!("a stressor stopped before it loaded its data");
            }
            std::thread::sleep(LOADED_POLL_PERIOD);
        }
    }

    /// Asks all stressors to terminate, interrupts those still running after the grace period
    /// and waits for them to exit.
    ///
    /// Logs a warning if no stressors are running. Returns the first error a stressor failed
    /// with.
    pub fn stop_stressors(&self) -> eyre::Result<()> {
        let mut stressors = std::mem::take(&mut *lock(&self.stressors));
        if stressors.is_empty() {
            log::warn!("No stressors are running");
            return Ok(());
        }
        for stressor in &stressors {
            stressor.request_terminate();
        }
        let grace_start = Instant::now();
        let grace_period = self.config.general.termination_grace_period;
        while grace_start.elapsed() < grace_period
            && stressors
                .iter()
                .any(|s| s.shared().state() != StressorState::Stopped)
        {
            std::thread::sleep(STOP_POLL_PERIOD);
        }
        let mut result = Ok(());
        for stressor in &mut stressors {
            stressor.interrupt();
            if let Err(err) = stressor.join() {
                log::error!("{:?}", err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        if stressors.iter().all(|s| s.is_loaded()) {
            *lock(&self.loaded) = true;
        }
        lock(&self.running).clear();
        if let Some(thread) = lock(&self.size_thread).take() {
            thread.stop();
        }
        log::info!("Stopped {} stressor threads", stressors.len());
        result
    }

    /// Waits until the checkers have verified every operation the stopped stressors reported,
    /// then stops the checkers.
    ///
    /// Errors if the stressors are still running, if the log logic is disabled or if the
    /// checkers made no progress for `no-progress-timeout`.
    pub fn wait_until_checked(&self) -> eyre::Result<()> {
        if self.is_running() {
            bail!("stressors must be stopped before waiting for the checkers");
        }
        let pool = match &*lock(&self.checkers) {
            Some(checkers) => Arc::clone(&checkers.pool),
            None => bail!("no checkers are running"),
        };
        let result = pool.wait_until_checked(self.config.log_logic.no_progress_timeout);
        self.stop_checkers();
        result
    }

    /// Stops the checker and keep-alive threads.
    pub fn stop_checkers(&self) {
        if let Some(checkers) = lock(&self.checkers).take() {
            for thread in &checkers.threads {
                thread.request_terminate();
            }
            for thread in checkers.threads {
                thread.stop();
            }
            if let Some(keep_alive) = checkers.keep_alive {
                keep_alive.stop();
            }
            log::info!("Checkers stopped");
        }
    }

    /// Starts collecting one merged statistics record per `statistics.period`.
    ///
    /// Logs a warning if the statistics are already collected.
    pub fn start_stats(&self) -> eyre::Result<()> {
        let mut stats = lock(&self.stats);
        if stats.is_some() {
            log::warn!("Statistics are already collected");
            return Ok(());
        }
        let collector = Arc::new(StatsCollector::new(
            self.prototype.empty_copy(),
            Arc::clone(&self.running),
            Arc::clone(&self.sampler),
        ));
        let period = self.config.statistics.period;
        let thread = {
            let collector = Arc::clone(&collector);
            BackgroundThread::spawn("StatisticsThread".to_owned(), move |control| {
                collector.run(period, &control)
            })?
        };
        *stats = Some(StatsThread { collector, thread });
        Ok(())
    }

    /// Stops the statistics thread and returns the collected interval records.
    ///
    /// Fails if the statistics were not started.
    pub fn stop_stats(&self) -> Result<Vec<Statistics>, StatsError> {
        match lock(&self.stats).take() {
            Some(StatsThread { collector, thread }) => {
                thread.stop();
                Ok(collector.take_results())
            }
            None => Err(StatsError::IllegalState(
                "statistics were not started".to_owned(),
            )),
        }
    }

    /// The number of operations the checkers found missing.
    pub fn missing_operations(&self) -> u64 {
        self.failures.missing_operations()
    }

    /// Describes a detected problem, `None` if everything is fine.
    ///
    /// Reports missing operations and exhausted transaction attempts, and checkers that made no
    /// progress for `no-progress-timeout`.
    pub fn get_error(&self) -> Option<String> {
        if !self.config.log_logic.enabled {
            return None;
        }
        let failures = &self.failures;
        if failures.missing_operations() > 0 || failures.failed_transaction_attempts() > 0 {
            return Some(format!(
                "Background stressors report {} missing operations, {} stale reads and {} failed transaction attempts",
                failures.missing_operations(),
                failures.stale_reads(),
                failures.failed_transaction_attempts()
            ));
        }
        if !self.cache.is_running() {
            log::debug!("Cache is not running, skipping verification of checker progress");
            return None;
        }
        for status in self.status() {
            log::debug!("{}", status);
        }
        let pool = lock(&self.checkers).as_ref().map(|c| Arc::clone(&c.pool))?;
        let log_logic = &self.config.log_logic;
        let threads = self.config.general.num_threads.max(1);
        let bucket = self.config.general.bucket_id.as_deref();
        let stalled = pool.stalled_records(log_logic.no_progress_timeout, now_millis(), |thread| {
            // stressors on dead workers cannot make progress
            log_logic.ignore_dead_checkers
                && !is_worker_alive(
                    &*self.cache,
                    bucket,
                    thread.thread_id / threads,
                    log_logic.dead_worker_timeout,
                )
        });
        if stalled.is_empty() {
            None
        } else {
            for record in &stalled {
                log::error!("No progress in record {}", record);
            }
            Some(format!("Checkers made no progress: {}", stalled.join(", ")))
        }
    }

    /// Describes the state of every stressor thread.
    pub fn status(&self) -> Vec<String> {
        lock(&self.stressors).iter().map(LoadStressor::status).collect()
    }

    /// Stops all threads of the manager.
    pub fn shutdown(&self) {
        if lock(&self.stats).is_some() {
            let _ = self.stop_stats();
        }
        if self.is_running() {
            if let Err(err) = self.stop_stressors() {
                log::error!("Error while stopping stressors: {:?}", err);
            }
        }
        self.stop_checkers();
    }
}

impl Drop for OperationsManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
