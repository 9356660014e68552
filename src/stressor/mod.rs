//! Stressor threads generating the background load.
//!
//! Every stressor thread owns a disjoint part of the key space and its own [`Statistics`]
//! instance. The thread first loads its keys, then invokes its [`Logic`] in a loop, pausing
//! `delay-between-requests` between invocations, until termination is requested.
//!
//! Two logics are available:
//!
//! - [`LegacyLogic`] issues random GET/PUT/REMOVE requests on a cyclic key cursor.
//! - [`PrivateLogLogic`] writes verifiable operation logs that the
//!   [log checkers](crate::checker) replay.

pub use self::{legacy::LegacyLogic, private_log::PrivateLogLogic};
use crate::{
    cache::{is_interruption, Access, CacheBackend, CacheError, Transaction},
    checker::FailureManager,
    config::Config,
    control::ThreadControl,
    keys::StressorThread,
    stats::{now_millis, Operation, Statistics, StatsError},
};
use eyre::Context;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

mod legacy;
mod private_log;

/// The life cycle of a stressor thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StressorState {
    /// Writing the initial values of the key range.
    Loading,
    /// Issuing requests.
    Running,
    /// Termination was requested, the thread finishes its current operation.
    Stopping,
    /// The thread has exited.
    Stopped,
}

impl StressorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Loading,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for StressorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Loading => "loading",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// The state a stressor thread shares with its owner.
#[derive(Debug)]
pub struct StressorShared {
    stats: Mutex<Statistics>,
    loaded: AtomicBool,
    state: AtomicU8,
    operation_id: AtomicI64,
    last_progress: AtomicI64,
    control: ThreadControl,
}

impl StressorShared {
    /// Creates the state of a thread recording into `stats`.
    ///
    /// If `loaded` is set, the thread skips loading.
    pub fn new(stats: Statistics, loaded: bool) -> Self {
        Self {
            stats: Mutex::new(stats),
            loaded: AtomicBool::new(loaded),
            state: AtomicU8::new(StressorState::Loading as u8),
            operation_id: AtomicI64::new(0),
            last_progress: AtomicI64::new(now_millis()),
            control: ThreadControl::new(),
        }
    }

    pub(crate) fn stats(&self) -> MutexGuard<'_, Statistics> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: StressorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The current state of the thread.
    pub fn state(&self) -> StressorState {
        StressorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` once the thread has loaded its keys.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// The termination and interruption control of the thread.
    pub fn control(&self) -> &ThreadControl {
        &self.control
    }

    /// Returns a snapshot of the statistics recorded so far.
    ///
    /// With `reset`, the thread continues recording into a fresh interval starting at `time`.
    pub fn snapshot(&self, reset: bool, time: i64) -> Result<Statistics, StatsError> {
        self.stats().snapshot(reset, time)
    }

    fn report_progress(&self, operation_id: i64) {
        self.operation_id.store(operation_id, Ordering::Release);
        self.last_progress.store(now_millis(), Ordering::Release);
    }

    /// The last operation id the thread reported.
    pub fn operation_id(&self) -> i64 {
        self.operation_id.load(Ordering::Acquire)
    }

    /// When the thread last finished an operation, in epoch milliseconds.
    pub fn last_progress(&self) -> i64 {
        self.last_progress.load(Ordering::Acquire)
    }
}

/// The environment of a stressor thread, passed to its [`Logic`].
pub struct Worker {
    /// The index of the thread within its worker process.
    pub thread_index: u32,
    /// The cluster-wide id of the thread.
    pub thread: StressorThread,
    /// The run configuration.
    pub config: Arc<Config>,
    /// The cache under test.
    pub cache: Arc<dyn CacheBackend>,
    /// The state shared with the owner.
    pub shared: Arc<StressorShared>,
    /// Failure counters shared with the checkers.
    pub failures: Arc<FailureManager>,
    tx: Option<Box<dyn Transaction>>,
    tx_started: Option<Instant>,
    remaining_tx_ops: i32,
}

impl Worker {
    /// Creates the environment of a stressor thread.
    pub fn new(
        thread_index: u32,
        config: Arc<Config>,
        cache: Arc<dyn CacheBackend>,
        shared: Arc<StressorShared>,
        failures: Arc<FailureManager>,
    ) -> Self {
        let thread = StressorThread::global(
            config.general.num_threads,
            config.cluster.worker_index,
            thread_index,
        );
        let remaining_tx_ops = config.general.transaction_size;
        Self {
            thread_index,
            thread,
            config,
            cache,
            shared,
            failures,
            tx: None,
            tx_started: None,
            remaining_tx_ops,
        }
    }

    /// The bucket the stressors operate on.
    pub fn bucket(&self) -> Option<&str> {
        self.config.general.bucket_id.as_deref()
    }

    /// The termination and interruption control of the thread.
    pub fn control(&self) -> &ThreadControl {
        &self.shared.control
    }

    /// Returns `true` if the thread should stop.
    pub fn should_stop(&self) -> bool {
        self.shared.control.should_stop()
    }

    /// Routes requests through the open transaction, if there is one.
    pub fn access(&mut self) -> Access<'_> {
        Access::new(&*self.cache, &mut self.tx)
    }

    /// Records a request in the thread's statistics.
    pub fn register(
        &self,
        response_time: Duration,
        tx_overhead: Duration,
        operation: Operation,
        error: bool,
    ) {
        let response_time = response_time.as_nanos() as i64;
        let tx_overhead = tx_overhead.as_nanos() as i64;
        let mut stats = self.shared.stats();
        let result = if error {
            stats.register_error(response_time, tx_overhead, operation)
        } else {
            stats.register_request(response_time, tx_overhead, operation)
        };
        if let Err(err) = result {
            log::error!("Cannot record {} request: {}", operation, err);
        }
    }

    /// Returns `true` if the next operation has to start a transaction.
    pub fn at_transaction_start(&self) -> bool {
        let size = self.config.general.transaction_size;
        size > 0 && self.remaining_tx_ops == size
    }

    /// Counts one operation of the current transaction. Returns `true` if the transaction is
    /// complete and has to be ended.
    pub fn count_transaction_operation(&mut self) -> bool {
        if self.config.general.transaction_size <= 0 {
            return false;
        }
        self.remaining_tx_ops -= 1;
        if self.remaining_tx_ops <= 0 {
            self.remaining_tx_ops = self.config.general.transaction_size;
            true
        } else {
            false
        }
    }

    /// Starts a transaction and returns the time it took.
    pub fn start_transaction(&mut self) -> Result<Duration, CacheError> {
        let start = Instant::now();
        self.tx = Some(self.cache.start_transaction()?);
        self.tx_started = Some(start);
        Ok(start.elapsed())
    }

    /// Ends the open transaction, records it and returns the time the end took.
    pub fn end_transaction(&mut self, commit: bool) -> Result<Duration, CacheError> {
        let start = Instant::now();
        let result = match self.tx.take() {
            Some(tx) => tx.end_transaction(commit),
            None => Ok(()),
        };
        let elapsed = start.elapsed();
        if let Some(tx_started) = self.tx_started.take() {
            let failed = result.is_err();
            self.register(tx_started.elapsed(), Duration::ZERO, Operation::Transaction, failed);
        }
        result.map(|_| elapsed)
    }

    /// Rolls back the open transaction after a failure and resets the transaction position.
    ///
    /// The aborted transaction is recorded as failed.
    pub fn abort_transaction(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(err) = tx.end_transaction(false) {
                log::error!("Error while ending transaction: {}", err);
            }
            if let Some(tx_started) = self.tx_started.take() {
                self.register(tx_started.elapsed(), Duration::ZERO, Operation::Transaction, true);
            }
        }
        self.remaining_tx_ops = self.config.general.transaction_size;
    }

    /// Rolls back the open transaction of a cancelled thread without recording it.
    fn rollback_transaction(&mut self) {
        if let Some(tx) = self.tx.take() {
            if let Err(err) = tx.end_transaction(false) {
                log::error!("Error while rolling back transaction: {}", err);
            }
        }
        self.tx_started = None;
        self.remaining_tx_ops = self.config.general.transaction_size;
    }

    /// Returns `true` if a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }
}

/// The behavior of a stressor thread.
pub trait Logic: Send {
    /// Writes the initial values. Called once before the first invocation unless the data is
    /// already loaded.
    fn load(&mut self, worker: &mut Worker) -> eyre::Result<()> {
        let _ = worker;
        Ok(())
    }

    /// Executes one operation.
    ///
    /// Operation failures are handled inside; errors returned from here end the thread.
    fn invoke(&mut self, worker: &mut Worker) -> eyre::Result<()>;

    /// The id of the last executed operation, for progress reporting.
    fn operation_id(&self) -> i64;
}

/// A stressor thread and the state it shares with its owner.
pub struct LoadStressor {
    thread_index: u32,
    shared: Arc<StressorShared>,
    handle: Option<JoinHandle<eyre::Result<()>>>,
}

impl LoadStressor {
    /// Spawns a stressor thread executing the given logic in the environment of `worker`.
    pub fn start(mut worker: Worker, mut logic: Box<dyn Logic>) -> eyre::Result<Self> {
        let thread_index = worker.thread_index;
        let shared = Arc::clone(&worker.shared);
        let handle = std::thread::Builder::new()
            .name(format!("StressorThread-{}", thread_index))
            .spawn(move || run(&mut worker, logic.as_mut()))
            .context("failed to spawn stressor thread")?;
        Ok(Self {
            thread_index,
            shared,
            handle: Some(handle),
        })
    }

    /// The index of the thread within its worker process.
    pub fn thread_index(&self) -> u32 {
        self.thread_index
    }

    /// The state shared with the thread.
    pub fn shared(&self) -> &Arc<StressorShared> {
        &self.shared
    }

    /// Returns `true` once the thread has loaded its keys.
    pub fn is_loaded(&self) -> bool {
        self.shared.is_loaded()
    }

    /// Asks the thread to stop after its current operation.
    pub fn request_terminate(&self) {
        if self.shared.state() != StressorState::Stopped {
            self.shared.set_state(StressorState::Stopping);
        }
        self.shared.control.request_terminate();
    }

    /// Wakes the thread from any sleep and lets it roll back its transaction.
    pub fn interrupt(&self) {
        self.shared.control.interrupt();
    }

    /// Waits for the thread to exit.
    pub fn join(&mut self) -> eyre::Result<()> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => {
                    result.with_context(|| format!("stressor {} failed", self.thread_index))
                }
                Err(panic_payload) => std::panic::resume_unwind(panic_payload),
            },
            None => Ok(()),
        }
    }

    /// Returns a snapshot of the statistics recorded so far.
    ///
    /// With `reset`, the thread continues recording into a fresh interval starting at `time`.
    pub fn snapshot(&self, reset: bool, time: i64) -> Result<Statistics, StatsError> {
        self.shared.snapshot(reset, time)
    }

    /// Describes the state of the thread.
    pub fn status(&self) -> String {
        format!(
            "Stressor {}: {}, operation {}, last progress {} ms ago",
            self.thread_index,
            self.shared.state(),
            self.shared.operation_id(),
            now_millis() - self.shared.last_progress()
        )
    }
}

fn run(worker: &mut Worker, logic: &mut dyn Logic) -> eyre::Result<()> {
    let result = run_logic(worker, logic);
    if worker.tx.is_some() {
        // an abandoned transaction would stay open on the server
        log::trace!("Rolling back open transaction of stressor {}", worker.thread_index);
        if worker.cache.is_running() {
            worker.rollback_transaction();
        }
    }
    worker.shared.set_state(StressorState::Stopped);
    match result {
        Err(err) if is_interruption(&err) || worker.control().is_interrupted() => {
            log::trace!("Stressor {} interrupted", worker.thread_index);
            Ok(())
        }
        other => other,
    }
}

fn run_logic(worker: &mut Worker, logic: &mut dyn Logic) -> eyre::Result<()> {
    if !worker.shared.is_loaded() {
        worker.shared.set_state(StressorState::Loading);
        logic.load(worker)?;
        if worker.should_stop() {
            return Ok(());
        }
        worker.shared.loaded.store(true, Ordering::Release);
    }
    if worker.config.legacy_logic.load_only && !worker.config.log_logic.enabled {
        log::info!("The stressor has finished loading data and will terminate.");
        return Ok(());
    }
    worker.shared.set_state(StressorState::Running);
    let delay = worker.config.general.delay_between_requests;
    while !worker.should_stop() {
        logic.invoke(worker)?;
        worker.shared.report_progress(logic.operation_id());
        worker.control().sleep(delay)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::InMemoryCache, range::KeyRange};
    use pretty_assertions::assert_eq;

    fn transactional_stressor(cache: &InMemoryCache) -> LoadStressor {
        let mut config = Config::default();
        config.general.num_threads = 1;
        config.general.gets = 0;
        config.general.puts = 1;
        config.general.removes = 0;
        // never reaches the commit
        config.general.transaction_size = 1_000_000;
        config.general.delay_between_requests = Duration::from_millis(2);
        let worker = Worker::new(
            0,
            Arc::new(config),
            Arc::new(cache.clone()),
            Arc::new(StressorShared::new(Statistics::simple(), true)),
            Arc::new(FailureManager::new()),
        );
        let logic = LegacyLogic::new(KeyRange::new(0, 50), Vec::new()).unwrap();
        LoadStressor::start(worker, Box::new(logic)).unwrap()
    }

    fn wait_for_operations(stressor: &LoadStressor, count: i64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while stressor.shared().operation_id() < count {
            assert!(Instant::now() < deadline, "{}", stressor.status());
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn interrupt_rolls_back_open_transaction() {
        let cache = InMemoryCache::new();
        let mut stressor = transactional_stressor(&cache);
        wait_for_operations(&stressor, 5);

        stressor.interrupt();
        stressor.join().unwrap();

        assert_eq!(stressor.shared().state(), StressorState::Stopped);
        assert_eq!(cache.local_size().unwrap(), 0);
        let stats = stressor.snapshot(false, now_millis()).unwrap();
        assert!(stats.operation_stats(Operation::Put).requests >= 5);
        assert_eq!(stats.num_errors(), 0);
        assert_eq!(stats.operation_stats(Operation::Transaction).requests, 0);
    }

    #[test]
    fn terminate_rolls_back_open_transaction() {
        let cache = InMemoryCache::new();
        let mut stressor = transactional_stressor(&cache);
        wait_for_operations(&stressor, 3);

        stressor.request_terminate();
        stressor.join().unwrap();

        assert_eq!(cache.local_size().unwrap(), 0);
        let stats = stressor.snapshot(false, now_millis()).unwrap();
        assert_eq!(stats.num_errors(), 0);
        assert_eq!(stats.operation_stats(Operation::Transaction).errors, 0);
    }
}
