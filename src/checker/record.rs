use super::LastOperation;
use crate::{keys::StressorThread, range::KeyRange, stats::now_millis};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// The deterministic key sequence of one log stressor.
///
/// The stressor and every checker construct the same selector for a given stressor thread, so
/// the checkers can replay which key the stressor touched with which operation. The number of
/// keys drawn so far is persisted in [`LastOperation::seed`] to resume the sequence after a
/// restart.
#[derive(Debug, Clone)]
pub struct KeySelector {
    seed: u64,
    position: u64,
    range: KeyRange,
}

impl KeySelector {
    /// Starts the sequence of the given stressor thread over the given range.
    pub fn new(thread: StressorThread, range: KeyRange) -> Self {
        assert!(!range.is_empty(), "cannot select keys from empty range {}", range);
        Self {
            seed: u64::from(thread.thread_id) << 32,
            position: 0,
            range,
        }
    }

    /// Draws the next key index.
    pub fn next_key_id(&mut self) -> i64 {
        let mut rng =
            StdRng::seed_from_u64(self.seed ^ self.position.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        self.position += 1;
        rng.gen_range(self.range.start()..self.range.end())
    }

    /// The current position in the sequence.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Continues the sequence at a position returned by [`position`](Self::position).
    pub fn set_position(&mut self, position: u64) {
        self.position = position;
    }
}

/// The progress of the checkers in the operation sequence of one stressor thread.
#[derive(Debug, Clone)]
pub struct StressorRecord {
    thread: StressorThread,
    selector: KeySelector,
    operation_id: i64,
    key_id: i64,
    // stream position before the current key was drawn
    previous_position: u64,
    fresh: bool,
    last_checkpoint: i64,
    last_stressor_operation: i64,
    last_unsuccessful_check: Option<i64>,
    last_successful_check: i64,
    heartbeat_read_at: Option<i64>,
    loss_confirmed_at: Option<i64>,
}

impl StressorRecord {
    /// Creates a record that expects operation 0 of the given stressor thread.
    pub fn new(thread: StressorThread, range: KeyRange) -> Self {
        let mut record = Self {
            thread,
            selector: KeySelector::new(thread, range),
            operation_id: -1,
            key_id: 0,
            previous_position: 0,
            fresh: true,
            last_checkpoint: -1,
            last_stressor_operation: -1,
            last_unsuccessful_check: None,
            last_successful_check: now_millis(),
            heartbeat_read_at: None,
            loss_confirmed_at: None,
        };
        record.next();
        record
    }

    /// Moves on to the next operation of the stressor.
    pub fn next(&mut self) {
        self.operation_id += 1;
        self.previous_position = self.selector.position();
        self.key_id = self.selector.next_key_id();
        self.loss_confirmed_at = None;
    }

    /// Continues after the operation recorded in a checkpoint.
    pub fn resume(&mut self, checkpoint: &LastOperation) {
        self.operation_id = checkpoint.operation_id;
        self.selector.set_position(checkpoint.seed);
        self.last_checkpoint = checkpoint.operation_id;
        self.next();
    }

    /// Marks the operation as confirmed in a checkpoint.
    pub(super) fn set_last_checkpoint(&mut self, operation_id: i64) {
        self.last_checkpoint = operation_id;
    }

    /// Returns the checkpoint for the current operation.
    pub fn checkpoint(&self) -> LastOperation {
        LastOperation {
            operation_id: self.operation_id,
            seed: self.selector.position(),
        }
    }

    /// Returns the checkpoint for the operation before the current one, if there is one.
    pub fn previous_checkpoint(&self) -> Option<LastOperation> {
        (self.operation_id > 0).then(|| LastOperation {
            operation_id: self.operation_id - 1,
            seed: self.previous_position,
        })
    }

    /// Returns `true` until the record was seeded from a checkpoint or checked once.
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub(super) fn set_fresh(&mut self, fresh: bool) {
        self.fresh = fresh;
    }

    /// The stressor thread the record belongs to.
    pub fn thread(&self) -> StressorThread {
        self.thread
    }

    /// The id of the operation that is expected next.
    pub fn operation_id(&self) -> i64 {
        self.operation_id
    }

    /// The key the expected operation was applied to.
    pub fn key_id(&self) -> i64 {
        self.key_id
    }

    /// The id of the last confirmed operation that was persisted as checkpoint.
    pub fn last_checkpoint(&self) -> i64 {
        self.last_checkpoint
    }

    /// The last operation id the stressor reported in its heartbeat.
    pub fn last_stressor_operation(&self) -> i64 {
        self.last_stressor_operation
    }

    /// Updates the last operation reported by the stressor.
    pub fn set_last_stressor_operation(&mut self, operation_id: i64) {
        self.last_stressor_operation = operation_id;
    }

    /// When the heartbeat of the stressor was last read.
    pub fn heartbeat_read_at(&self) -> Option<i64> {
        self.heartbeat_read_at
    }

    pub(super) fn set_heartbeat_read_at(&mut self, timestamp: i64) {
        self.heartbeat_read_at = Some(timestamp);
    }

    /// When the last check failed to find the expected operation, in epoch milliseconds.
    pub fn last_unsuccessful_check(&self) -> Option<i64> {
        self.last_unsuccessful_check
    }

    /// Sets or clears the timestamp of the last unsuccessful check.
    pub fn set_last_unsuccessful_check(&mut self, timestamp: Option<i64>) {
        self.last_unsuccessful_check = timestamp;
    }

    /// When the checkers last moved past an operation of the stressor, in epoch milliseconds.
    pub fn last_successful_check(&self) -> i64 {
        self.last_successful_check
    }

    pub(super) fn set_last_successful_check(&mut self, timestamp: i64) {
        self.last_successful_check = timestamp;
    }

    /// When the heartbeat first proved that the current operation should be visible.
    pub fn loss_confirmed_at(&self) -> Option<i64> {
        self.loss_confirmed_at
    }

    pub(super) fn set_loss_confirmed_at(&mut self, timestamp: i64) {
        self.loss_confirmed_at.get_or_insert(timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_is_deterministic() {
        let range = KeyRange::new(100, 200);
        let mut a = KeySelector::new(StressorThread::new(3), range);
        let mut b = KeySelector::new(StressorThread::new(3), range);
        let mut other = KeySelector::new(StressorThread::new(4), range);
        let a_keys: Vec<_> = (0..50).map(|_| a.next_key_id()).collect();
        let b_keys: Vec<_> = (0..50).map(|_| b.next_key_id()).collect();
        let other_keys: Vec<_> = (0..50).map(|_| other.next_key_id()).collect();
        assert_eq!(a_keys, b_keys);
        assert_ne!(a_keys, other_keys);
        assert!(a_keys.iter().all(|&k| range.contains(k)));
    }

    #[test]
    fn selector_resumes_from_position() {
        let range = KeyRange::new(0, 1000);
        let mut selector = KeySelector::new(StressorThread::new(0), range);
        for _ in 0..10 {
            selector.next_key_id();
        }
        let position = selector.position();
        let expected: Vec<_> = (0..5).map(|_| selector.next_key_id()).collect();

        let mut resumed = KeySelector::new(StressorThread::new(0), range);
        resumed.set_position(position);
        let actual: Vec<_> = (0..5).map(|_| resumed.next_key_id()).collect();
        assert_eq!(expected, actual);
    }

    #[test]
    fn record_follows_stressor_sequence() {
        let thread = StressorThread::new(7);
        let range = KeyRange::new(0, 50);
        let mut selector = KeySelector::new(thread, range);
        let mut record = StressorRecord::new(thread, range);

        assert_eq!(record.operation_id(), 0);
        assert_eq!(record.key_id(), selector.next_key_id());
        record.next();
        record.next();
        selector.next_key_id();
        let checkpoint = record.checkpoint();
        assert_eq!(checkpoint.operation_id, 2);
        assert_eq!(record.key_id(), selector.next_key_id());

        let mut resumed = StressorRecord::new(thread, range);
        resumed.resume(&checkpoint);
        assert_eq!(resumed.operation_id(), 3);
        assert_eq!(resumed.key_id(), selector.next_key_id());
        assert_eq!(resumed.previous_checkpoint(), Some(checkpoint));
    }
}
