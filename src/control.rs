//! Cooperative termination and interruption of worker threads.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::{
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    time::Duration,
};

/// Signals that the thread was interrupted while it was sleeping or waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "The thread was interrupted.")
    }
}

impl Error for Interrupted {}

/// Shared between a background thread and its owner.
///
/// The owner first [requests termination](Self::request_terminate), which the thread observes at
/// the start of its next iteration. Threads that did not stop within the grace period are
/// [interrupted](Self::interrupt), which wakes them from [`sleep`](Self::sleep) immediately.
#[derive(Debug)]
pub struct ThreadControl {
    terminate: AtomicBool,
    interrupted: AtomicBool,
    // dropping the sender disconnects the channel, which wakes all sleepers
    interrupt_tx: Mutex<Option<Sender<()>>>,
    interrupt_rx: Receiver<()>,
}

impl Default for ThreadControl {
    fn default() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            terminate: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            interrupt_tx: Mutex::new(Some(tx)),
            interrupt_rx: rx,
        }
    }
}

impl ThreadControl {
    /// Creates a control for a running thread.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the thread to stop after its current iteration.
    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    /// Wakes the thread from any sleep and makes all further sleeps fail.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.terminate.store(true, Ordering::Release);
        if let Ok(mut tx) = self.interrupt_tx.lock() {
            tx.take();
        }
    }

    /// Returns `true` once termination was requested or the thread was interrupted.
    pub fn should_stop(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Returns `true` once the thread was interrupted.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Sleeps for the given duration unless the thread is interrupted.
    pub fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        if self.is_interrupted() {
            return Err(Interrupted);
        }
        if duration.is_zero() {
            return Ok(());
        }
        match self.interrupt_rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => Ok(()),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Err(Interrupted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Instant};

    #[test]
    fn interrupt_wakes_sleeper() {
        let control = Arc::new(ThreadControl::new());
        let sleeper = {
            let control = Arc::clone(&control);
            std::thread::spawn(move || control.sleep(Duration::from_secs(60)))
        };
        let start = Instant::now();
        std::thread::sleep(Duration::from_millis(20));
        control.interrupt();
        assert_eq!(sleeper.join().unwrap(), Err(Interrupted));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(control.should_stop());
    }

    #[test]
    fn terminate_is_soft() {
        let control = ThreadControl::new();
        control.request_terminate();
        assert!(control.should_stop());
        assert!(!control.is_interrupted());
        assert_eq!(control.sleep(Duration::from_millis(1)), Ok(()));
    }
}
