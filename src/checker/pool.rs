use super::{FailureManager, StressorRecord};
use crate::{keys::StressorThread, range, stats::now_millis};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

/// The records of all stressor threads in the cluster, shared by the checker threads of a worker.
///
/// Checker threads [take](Self::take) a record, check it and [add](Self::add) it back, so every
/// record is processed by at most one checker at a time.
#[derive(Debug)]
pub struct Pool {
    total_threads: u32,
    capacity: usize,
    queue: Mutex<VecDeque<StressorRecord>>,
    failures: Arc<FailureManager>,
}

impl Pool {
    /// Creates a record for every stressor thread of every worker.
    ///
    /// Records start at operation 0; checkers seed them from their checkpoints on first use.
    pub fn new(
        num_workers: u32,
        threads_per_worker: u32,
        num_entries: i64,
        key_id_offset: i64,
        failures: Arc<FailureManager>,
    ) -> Self {
        let mut queue = VecDeque::new();
        for worker in 0..num_workers {
            for thread in 0..threads_per_worker {
                let range = range::thread_range(
                    num_entries,
                    num_workers,
                    threads_per_worker,
                    worker,
                    thread,
                )
                .shift(key_id_offset);
                if range.is_empty() {
                    log::warn!(
                        "Stressor {} on worker {} owns no keys, not checking it",
                        thread,
                        worker
                    );
                    continue;
                }
                let id = StressorThread::global(threads_per_worker, worker, thread);
                queue.push_back(StressorRecord::new(id, range));
            }
        }
        Self {
            total_threads: num_workers * threads_per_worker,
            capacity: queue.len(),
            queue: Mutex::new(queue),
            failures,
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<StressorRecord>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The number of stressor threads in the cluster.
    pub fn total_threads(&self) -> u32 {
        self.total_threads
    }

    /// Takes the next record, `None` if all records are being checked.
    pub fn take(&self) -> Option<StressorRecord> {
        self.queue().pop_front()
    }

    /// Returns a record to the pool.
    pub fn add(&self, record: StressorRecord) {
        self.queue().push_back(record);
    }

    /// The shared failure counters.
    pub fn failures(&self) -> &Arc<FailureManager> {
        &self.failures
    }

    /// The number of operations lost by the cache.
    pub fn missing_operations(&self) -> u64 {
        self.failures.missing_operations()
    }

    /// Describes the progress of every record that is currently in the pool.
    pub fn records(&self) -> Vec<String> {
        let mut records: Vec<_> = self
            .queue()
            .iter()
            .map(|r| {
                (
                    r.thread().thread_id,
                    format!(
                        "thread {}: operation {} on key {} (stressor at {})",
                        r.thread().thread_id,
                        r.operation_id(),
                        r.key_id(),
                        r.last_stressor_operation()
                    ),
                )
            })
            .collect();
        records.sort();
        records.into_iter().map(|(_, status)| status).collect()
    }

    /// Describes the records whose checks made no progress for longer than `timeout`.
    ///
    /// Records for which `skip` returns `true` are not considered.
    pub fn stalled_records(
        &self,
        timeout: Duration,
        now: i64,
        skip: impl Fn(StressorThread) -> bool,
    ) -> Vec<String> {
        let timeout = timeout.as_millis() as i64;
        self.queue()
            .iter()
            .filter(|r| !skip(r.thread()))
            .filter(|r| now - r.last_successful_check() > timeout)
            .map(|r| {
                format!(
                    "thread {}: no progress for {} ms at operation {}",
                    r.thread().thread_id,
                    now - r.last_successful_check(),
                    r.operation_id()
                )
            })
            .collect()
    }

    /// Blocks until every record has caught up with the last heartbeat of its stressor.
    ///
    /// The stressors must have been stopped before, otherwise their heartbeats keep moving. Only
    /// heartbeats read after the call count.
    ///
    /// Errors if the checkers made no progress for `no_progress_timeout`.
    pub fn wait_until_checked(&self, no_progress_timeout: Duration) -> eyre::Result<()> {
        // only heartbeats read after the stressors stopped are final
        let since = now_millis();
        let mut last_progress = Instant::now();
        let mut last_positions: Vec<i64> = Vec::new();
        loop {
            let (done, positions) = {
                let queue = self.queue();
                let done = queue.len() == self.capacity
                    && queue.iter().all(|r| {
                        r.last_unsuccessful_check().is_some()
                            && r.heartbeat_read_at().map_or(false, |read_at| read_at >= since)
                            && r.operation_id() > r.last_stressor_operation()
                    });
                let mut positions: Vec<_> = queue
                    .iter()
                    .map(|r| (r.thread().thread_id, r.operation_id()))
                    .collect();
                positions.sort_unstable();
                (done, positions.into_iter().map(|(_, op)| op).collect::<Vec<_>>())
            };
            if done {
                return Ok(());
            }
            if positions != last_positions {
                last_positions = positions;
                last_progress = Instant::now();
            } else if last_progress.elapsed() > no_progress_timeout {
                eyre::bail!(
                    "Checkers made no progress for {} ms: {}",
                    no_progress_timeout.as_millis(),
                    self.records().join(", ")
                );
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}
