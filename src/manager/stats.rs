use crate::{
    cache::CacheBackend,
    control::ThreadControl,
    stats::{merge_all, now_millis, Statistics},
    stressor::StressorShared,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

/// How often the size thread checks for termination while no sample is requested.
const SIZE_POLL_PERIOD: Duration = Duration::from_millis(100);

/// Samples the local cache size on demand, off the statistics thread.
///
/// Every [`take`](Self::take) returns the sample requested by the previous call and requests the
/// next one; `-1` if the sample is not available yet.
pub(super) struct SizeSampler {
    size: AtomicI64,
    request_tx: Sender<()>,
    request_rx: Receiver<()>,
}

impl SizeSampler {
    pub fn new() -> Self {
        let (request_tx, request_rx) = crossbeam_channel::bounded(1);
        let sampler = Self {
            size: AtomicI64::new(-1),
            request_tx,
            request_rx,
        };
        // the first sample is taken as soon as the thread starts
        let _ = sampler.request_tx.try_send(());
        sampler
    }

    pub fn take(&self) -> i64 {
        let size = self.size.swap(-1, Ordering::AcqRel);
        // a pending request already covers this one
        let _ = self.request_tx.try_send(());
        size
    }

    /// Serves size requests until the thread is stopped.
    pub fn run(&self, cache: &dyn CacheBackend, control: &ThreadControl) {
        while !control.should_stop() {
            match self.request_rx.recv_timeout(SIZE_POLL_PERIOD) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
            let size = if cache.is_running() {
                cache.local_size().unwrap_or_else(|err| {
                    log::error!("Cannot retrieve cache size: {}", err);
                    0
                })
            } else {
                0
            };
            self.size.store(size, Ordering::Release);
        }
        log::trace!("Size thread stopped");
    }
}

/// The state shared between the manager and the statistics thread.
pub(super) struct StatsCollector {
    prototype: Statistics,
    stressors: Arc<Mutex<Vec<Arc<StressorShared>>>>,
    sampler: Arc<SizeSampler>,
    results: Mutex<Vec<Statistics>>,
}

impl StatsCollector {
    pub fn new(
        prototype: Statistics,
        stressors: Arc<Mutex<Vec<Arc<StressorShared>>>>,
        sampler: Arc<SizeSampler>,
    ) -> Self {
        Self {
            prototype,
            stressors,
            sampler,
            results: Mutex::new(Vec::new()),
        }
    }

    fn results(&self) -> MutexGuard<'_, Vec<Statistics>> {
        self.results.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn take_results(&self) -> Vec<Statistics> {
        std::mem::take(&mut *self.results())
    }

    /// Collects one interval record every `period` until the thread is stopped.
    ///
    /// The first gathering only resets the stressors, its interval started before the
    /// statistics were requested.
    pub fn run(&self, period: Duration, control: &ThreadControl) {
        let mut last = now_millis();
        self.gather(last, last);
        while control.sleep(period).is_ok() {
            let now = now_millis();
            let stats = self.gather(last, now);
            log::trace!(
                "Adding iteration {}: {} requests, node up: {}",
                self.results().len(),
                stats.num_requests(),
                stats.is_node_up()
            );
            self.results().push(stats);
            last = now;
        }
        log::trace!("Statistics thread stopped");
    }

    /// Merges the snapshots of all stressors for the interval ending at `now`.
    ///
    /// If no stressor runs, the interval is recorded as node-down.
    fn gather(&self, begin: i64, now: i64) -> Statistics {
        let stressors = self
            .stressors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let snapshots: Vec<_> = stressors
            .iter()
            .filter_map(|stressor| match stressor.snapshot(true, now) {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    log::error!("Cannot take statistics snapshot: {}", err);
                    None
                }
            })
            .collect();
        let cache_size = self.sampler.take();
        let mut merged = match merge_all(&snapshots) {
            Ok(Some(merged)) => merged,
            Ok(None) => self.prototype.node_down(begin, now),
            Err(err) => {
                log::error!("Cannot merge statistics snapshots: {}", err);
                self.prototype.node_down(begin, now)
            }
        };
        merged.set_cache_size(cache_size);
        merged
    }
}
