use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counts the consistency violations and anomalies observed by stressors and checkers.
///
/// Counters only ever increase; the orchestrator decides whether a run passed.
#[derive(Debug)]
pub struct FailureManager {
    missing_operations: AtomicU64,
    failed_transaction_attempts: AtomicU64,
    stale_reads: AtomicU64,
    last_stored_operation: AtomicI64,
}

impl Default for FailureManager {
    fn default() -> Self {
        Self {
            missing_operations: AtomicU64::new(0),
            failed_transaction_attempts: AtomicU64::new(0),
            stale_reads: AtomicU64::new(0),
            last_stored_operation: AtomicI64::new(i64::MIN),
        }
    }
}

impl FailureManager {
    /// Creates a manager with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// A checker found an operation that the cache lost.
    pub fn report_missing_operation(&self) {
        self.missing_operations.fetch_add(1, Ordering::AcqRel);
    }

    /// A stressor had to retry a transaction.
    pub fn report_failed_transaction_attempt(&self) {
        self.failed_transaction_attempts.fetch_add(1, Ordering::AcqRel);
    }

    /// A checker did not see an operation that the heartbeat proved to be written.
    pub fn report_stale_read(&self) {
        self.stale_reads.fetch_add(1, Ordering::AcqRel);
    }

    /// A checker confirmed an operation at the given time.
    pub fn report_stored_operation(&self, timestamp: i64) {
        self.last_stored_operation.fetch_max(timestamp, Ordering::AcqRel);
    }

    /// The number of operations lost by the cache.
    pub fn missing_operations(&self) -> u64 {
        self.missing_operations.load(Ordering::Acquire)
    }

    /// The number of retried transactions.
    pub fn failed_transaction_attempts(&self) -> u64 {
        self.failed_transaction_attempts.load(Ordering::Acquire)
    }

    /// The number of reads that did not see a write yet.
    pub fn stale_reads(&self) -> u64 {
        self.stale_reads.load(Ordering::Acquire)
    }

    /// When a checker last confirmed an operation, `None` if none was confirmed yet.
    pub fn last_stored_operation(&self) -> Option<i64> {
        match self.last_stored_operation.load(Ordering::Acquire) {
            i64::MIN => None,
            timestamp => Some(timestamp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters() {
        let failures = FailureManager::new();
        assert_eq!(failures.last_stored_operation(), None);
        failures.report_missing_operation();
        failures.report_missing_operation();
        failures.report_stale_read();
        failures.report_stored_operation(20);
        failures.report_stored_operation(10);
        assert_eq!(failures.missing_operations(), 2);
        assert_eq!(failures.stale_reads(), 1);
        assert_eq!(failures.failed_transaction_attempts(), 0);
        assert_eq!(failures.last_stored_operation(), Some(20));
    }
}
