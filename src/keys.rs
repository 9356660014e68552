//! Defines the names of the coordination keys shared between stressors and checkers.
//!
//! Allows to address the heartbeat of a specific stressor thread or the checkpoint of a specific
//! checker worker.

use crate::Key;

// The prefix of the keys on which stressors publish their last written operation.
const LAST_OPERATION_PREFIX: &str = "stressor_";

// The prefix of the keys on which checkers store the last confirmed operation.
const CHECKER_PREFIX: &str = "checker_";

// The prefix of the keys on which stressors announce operations that dead checkers may skip.
const IGNORED_PREFIX: &str = "ignored_";

// The prefix of the keys that are written periodically to keep a worker's session alive.
const KEEP_ALIVE_PREFIX: &str = "__keepAlive_";

/// Provides the coordination keys for addressing a specific stressor thread.
///
/// Stressor threads are identified globally by `threads_per_worker * worker_index + thread_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct StressorThread {
    /// The global ID of the stressor thread.
    pub thread_id: u32,
}

impl StressorThread {
    /// Address the stressor thread with the given global ID.
    pub fn new(thread_id: u32) -> Self {
        Self { thread_id }
    }

    /// Computes the global ID of thread `thread_index` on worker `worker_index`.
    pub fn global(threads_per_worker: u32, worker_index: u32, thread_index: u32) -> Self {
        Self::new(threads_per_worker * worker_index + thread_index)
    }

    /// The stressor writes its [`LastOperation`][crate::checker::LastOperation] heartbeat under
    /// this key.
    pub fn last_operation_key(&self) -> Key {
        Key::Text(format!("{}{}", LAST_OPERATION_PREFIX, self.thread_id))
    }

    /// The checker on worker `checker_worker` stores its checkpoint for this stressor under this
    /// key.
    pub fn checker_key(&self, checker_worker: u32) -> Key {
        Key::Text(format!(
            "{}{}_{}",
            CHECKER_PREFIX, checker_worker, self.thread_id
        ))
    }

    /// The stressor writes the highest operation id the dead checker on `checker_worker` may
    /// skip under this key.
    pub fn ignored_key(&self, checker_worker: u32) -> Key {
        Key::Text(format!(
            "{}{}_{}",
            IGNORED_PREFIX, checker_worker, self.thread_id
        ))
    }
}

/// The key that is periodically written by the keep-alive thread of the given worker.
pub fn keep_alive_key(worker_index: u32) -> Key {
    Key::Text(format!("{}{}", KEEP_ALIVE_PREFIX, worker_index))
}

/// Parses the stressor thread ID out of a heartbeat key.
///
/// Returns `None` for all other keys.
pub fn parse_last_operation_key(key: &Key) -> Option<StressorThread> {
    match key {
        Key::Text(text) => text
            .strip_prefix(LAST_OPERATION_PREFIX)
            .and_then(|id| id.parse().ok())
            .map(StressorThread::new),
        Key::Binary(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_names() {
        let thread = StressorThread::global(5, 2, 3);
        assert_eq!(thread.thread_id, 13);
        assert_eq!(thread.last_operation_key(), Key::from("stressor_13"));
        assert_eq!(thread.checker_key(1), Key::from("checker_1_13"));
        assert_eq!(thread.ignored_key(0), Key::from("ignored_0_13"));
        assert_eq!(keep_alive_key(4), Key::from("__keepAlive_4"));
    }

    #[test]
    fn parse_heartbeat_key() {
        let thread = StressorThread::new(42);
        assert_eq!(
            parse_last_operation_key(&thread.last_operation_key()),
            Some(thread)
        );
        assert_eq!(parse_last_operation_key(&Key::from("checker_0_42")), None);
        assert_eq!(parse_last_operation_key(&Key::from("stressor_x")), None);
    }
}
