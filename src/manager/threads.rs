use crate::{
    cache::{CacheBackend, CacheValue},
    control::ThreadControl,
    keys::keep_alive_key,
    stats::now_millis,
};
use eyre::Context;
use std::{sync::Arc, thread::JoinHandle, time::Duration};

/// Period of the keep-alive writes.
const KEEP_ALIVE_PERIOD: Duration = Duration::from_secs(1);

/// A helper thread that runs until it is stopped by its owner.
pub(super) struct BackgroundThread {
    name: String,
    control: Arc<ThreadControl>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundThread {
    pub fn spawn(
        name: String,
        run: impl FnOnce(Arc<ThreadControl>) + Send + 'static,
    ) -> eyre::Result<Self> {
        let control = Arc::new(ThreadControl::new());
        let handle = {
            let control = Arc::clone(&control);
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || run(control))
                .with_context(|| format!("failed to spawn thread {}", name))?
        };
        Ok(Self {
            name,
            control,
            handle: Some(handle),
        })
    }

    pub fn request_terminate(&self) {
        self.control.request_terminate();
    }

    /// Interrupts the thread and waits for it to exit.
    pub fn stop(mut self) {
        self.control.interrupt();
        if let Some(handle) = self.handle.take() {
            log::debug!("Waiting for {} to finish", self.name);
            if let Err(panic_payload) = handle.join() {
                std::panic::resume_unwind(panic_payload);
            }
        }
    }
}

/// Periodically writes the current time under the keep-alive key of the worker, so that the
/// other workers can tell whether its checkers are alive.
pub(super) fn keep_alive(
    cache: Arc<dyn CacheBackend>,
    bucket: Option<String>,
    worker_index: u32,
    control: Arc<ThreadControl>,
) {
    let key = keep_alive_key(worker_index);
    while !control.should_stop() {
        let now = CacheValue::Timestamp(now_millis());
        if let Err(err) = cache.put(bucket.as_deref(), key.clone(), now) {
            log::error!("Failed to write keep alive timestamp: {}", err);
        }
        if control.sleep(KEEP_ALIVE_PERIOD).is_err() {
            break;
        }
    }
    log::trace!("Keep alive thread of worker {} stopped", worker_index);
}

/// Returns `true` if the worker wrote its keep-alive entry within the last `timeout`.
///
/// A worker is considered alive if the entry cannot be read.
pub fn is_worker_alive(
    cache: &dyn CacheBackend,
    bucket: Option<&str>,
    worker_index: u32,
    timeout: Duration,
) -> bool {
    match cache.get(bucket, &keep_alive_key(worker_index)) {
        Ok(Some(value)) => match value.as_timestamp() {
            Ok(timestamp) => timestamp > now_millis() - timeout.as_millis() as i64,
            Err(err) => {
                log::error!("Invalid keep alive entry of worker {}: {}", worker_index, err);
                true
            }
        },
        Ok(None) => false,
        Err(err) => {
            log::error!("Failed to retrieve the keep alive timestamp: {}", err);
            true
        }
    }
}
