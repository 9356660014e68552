//! The contract of the key-value cache under test and a thread-safe in-memory implementation.

use crate::{
    checker::{LastOperation, PrivateLogValue},
    control::Interrupted,
    Key,
};
use eyre::anyhow;
use std::{
    collections::HashMap,
    error::Error,
    fmt::{self, Display},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

/// Errors reported by a [`CacheBackend`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheError {
    /// The calling thread was interrupted while waiting for the cache.
    Interrupted,
    /// The cache is not running.
    NotRunning,
    /// The transaction was rolled back by the cache.
    RolledBack,
    /// The cache failed to execute the request.
    Failure(String),
}

impl Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupted => write!(f, "The request was interrupted."),
            Self::NotRunning => write!(f, "The cache is not running."),
            Self::RolledBack => write!(f, "The transaction was rolled back."),
            Self::Failure(reason) => write!(f, "The cache request failed: {}", reason),
        }
    }
}

impl Error for CacheError {}

/// Returns `true` if the error or any of its causes is a [`CacheError::Interrupted`] or an
/// [`Interrupted`] sleep.
pub fn is_interruption(error: &eyre::Report) -> bool {
    error.chain().any(|cause| {
        cause.is::<Interrupted>()
            || matches!(
                cause.downcast_ref::<CacheError>(),
                Some(CacheError::Interrupted)
            )
    })
}

/// The values stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CacheValue {
    /// Random payload written by the legacy logic.
    Bytes(Vec<u8>),
    /// The operation log of one key, written by the log logic.
    Log(PrivateLogValue),
    /// A stressor heartbeat or a checker checkpoint.
    LastOperation(LastOperation),
    /// A keep-alive timestamp in milliseconds since the epoch.
    Timestamp(i64),
}

impl CacheValue {
    /// Tries to cast the value to a byte payload.
    ///
    /// Errors if the value is of a different type.
    pub fn as_bytes(&self) -> eyre::Result<&[u8]> {
        match self {
            Self::Bytes(val) => Ok(val),
            other => Err(anyhow!("expected byte payload, got `{:?}`", other)),
        }
    }

    /// Tries to cast the value to a [`PrivateLogValue`].
    ///
    /// Errors if the value is of a different type.
    pub fn as_log(&self) -> eyre::Result<&PrivateLogValue> {
        match self {
            Self::Log(val) => Ok(val),
            other => Err(anyhow!("expected log value, got `{:?}`", other)),
        }
    }

    /// Tries to cast the value to a [`PrivateLogValue`], taking ownership.
    ///
    /// Errors if the value is of a different type.
    pub fn into_log(self) -> eyre::Result<PrivateLogValue> {
        match self {
            Self::Log(val) => Ok(val),
            other => Err(anyhow!("expected log value, got `{:?}`", other)),
        }
    }

    /// Tries to cast the value to a [`LastOperation`].
    ///
    /// Errors if the value is of a different type.
    pub fn as_last_operation(&self) -> eyre::Result<&LastOperation> {
        match self {
            Self::LastOperation(val) => Ok(val),
            other => Err(anyhow!("expected last operation, got `{:?}`", other)),
        }
    }

    /// Tries to cast the value to a timestamp.
    ///
    /// Errors if the value is of a different type.
    pub fn as_timestamp(&self) -> eyre::Result<i64> {
        match self {
            Self::Timestamp(val) => Ok(*val),
            other => Err(anyhow!("expected timestamp, got `{:?}`", other)),
        }
    }
}

/// The operations of a key-value cache that the stressors and checkers rely on.
///
/// All entries live in a _bucket_, a namespace inside the cache; `None` selects the default
/// bucket. Implementations must be safe to use from many threads at once.
pub trait CacheBackend: Send + Sync {
    /// Reads the value of `key`.
    fn get(&self, bucket: Option<&str>, key: &Key) -> Result<Option<CacheValue>, CacheError>;

    /// Writes `value` under `key`.
    fn put(&self, bucket: Option<&str>, key: Key, value: CacheValue) -> Result<(), CacheError>;

    /// Removes `key`, returning the previous value.
    fn remove(&self, bucket: Option<&str>, key: &Key) -> Result<Option<CacheValue>, CacheError>;

    /// Starts a transaction that is bound to the returned handle.
    fn start_transaction(&self) -> Result<Box<dyn Transaction>, CacheError>;

    /// Returns `true` if the cache accepts requests.
    fn is_running(&self) -> bool;

    /// The number of entries stored on this node.
    fn local_size(&self) -> Result<i64, CacheError>;
}

/// An open transaction.
///
/// Writes become visible to others only after a successful commit. Dropping the handle without
/// ending it discards the writes.
pub trait Transaction: Send {
    /// Reads the value of `key`, seeing the writes of this transaction.
    fn get(&mut self, bucket: Option<&str>, key: &Key) -> Result<Option<CacheValue>, CacheError>;

    /// Writes `value` under `key` inside the transaction.
    fn put(&mut self, bucket: Option<&str>, key: Key, value: CacheValue)
        -> Result<(), CacheError>;

    /// Removes `key` inside the transaction, returning the previous value.
    fn remove(&mut self, bucket: Option<&str>, key: &Key)
        -> Result<Option<CacheValue>, CacheError>;

    /// Commits (`true`) or rolls back (`false`) the transaction.
    ///
    /// A failed commit leaves the transaction rolled back.
    fn end_transaction(self: Box<Self>, commit: bool) -> Result<(), CacheError>;
}

/// Routes requests either directly to the cache or through an open transaction.
pub enum Access<'a> {
    /// Non-transactional access.
    Direct(&'a dyn CacheBackend),
    /// Access inside a transaction.
    Transactional(&'a mut Box<dyn Transaction>),
}

impl<'a> Access<'a> {
    /// Selects the transaction if one is open.
    pub fn new(cache: &'a dyn CacheBackend, tx: &'a mut Option<Box<dyn Transaction>>) -> Self {
        match tx {
            Some(tx) => Self::Transactional(tx),
            None => Self::Direct(cache),
        }
    }

    /// See [`CacheBackend::get`].
    pub fn get(
        &mut self,
        bucket: Option<&str>,
        key: &Key,
    ) -> Result<Option<CacheValue>, CacheError> {
        match self {
            Self::Direct(cache) => cache.get(bucket, key),
            Self::Transactional(tx) => tx.get(bucket, key),
        }
    }

    /// See [`CacheBackend::put`].
    pub fn put(
        &mut self,
        bucket: Option<&str>,
        key: Key,
        value: CacheValue,
    ) -> Result<(), CacheError> {
        match self {
            Self::Direct(cache) => cache.put(bucket, key, value),
            Self::Transactional(tx) => tx.put(bucket, key, value),
        }
    }

    /// See [`CacheBackend::remove`].
    pub fn remove(
        &mut self,
        bucket: Option<&str>,
        key: &Key,
    ) -> Result<Option<CacheValue>, CacheError> {
        match self {
            Self::Direct(cache) => cache.remove(bucket, key),
            Self::Transactional(tx) => tx.remove(bucket, key),
        }
    }
}

type EntryKey = (Option<String>, Key);

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<EntryKey, CacheValue>>,
    stopped: AtomicBool,
    injected_failures: AtomicU64,
    injected_interruptions: AtomicU64,
    failed_commits: AtomicU64,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<EntryKey, CacheValue>> {
        // a panicking writer cannot leave the map half-updated
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(CacheError::NotRunning);
        }
        let interrupted = self
            .injected_interruptions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if interrupted.is_ok() {
            return Err(CacheError::Interrupted);
        }
        let injected = self
            .injected_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(CacheError::Failure("injected failure".to_owned())),
            Err(_) => Ok(()),
        }
    }
}

fn entry_key(bucket: Option<&str>, key: Key) -> EntryKey {
    (bucket.map(str::to_owned), key)
}

/// A thread-safe cache that keeps all entries in one process.
///
/// Clones share the same entries. The cache can be [stopped](Self::stop) to simulate a crashed
/// node and can be told to [fail](Self::inject_failures) a number of upcoming requests.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    inner: Arc<Inner>,
}

impl InMemoryCache {
    /// Creates an empty, running cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects all requests with [`CacheError::NotRunning`] until [`start`](Self::start) is
    /// called. Entries are kept.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
    }

    /// Accepts requests again.
    pub fn start(&self) {
        self.inner.stopped.store(false, Ordering::Release);
    }

    /// Lets the next `count` requests fail with [`CacheError::Failure`].
    pub fn inject_failures(&self, count: u64) {
        self.inner.injected_failures.store(count, Ordering::Release);
    }

    /// Lets the next `count` requests be cancelled with [`CacheError::Interrupted`], as if the
    /// calling thread was interrupted while waiting for the reply.
    pub fn inject_interruptions(&self, count: u64) {
        self.inner.injected_interruptions.store(count, Ordering::Release);
    }

    /// Lets the next `count` commits fail with [`CacheError::RolledBack`].
    pub fn inject_failed_commits(&self, count: u64) {
        self.inner.failed_commits.store(count, Ordering::Release);
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.inner.entries().clear();
    }

    /// Reads a value bypassing failure injection and the running state.
    pub fn peek(&self, bucket: Option<&str>, key: &Key) -> Option<CacheValue> {
        self.inner
            .entries()
            .get(&entry_key(bucket, key.clone()))
            .cloned()
    }

    /// Writes a value bypassing failure injection and the running state.
    pub fn poke(&self, bucket: Option<&str>, key: Key, value: CacheValue) {
        self.inner.entries().insert(entry_key(bucket, key), value);
    }
}

impl CacheBackend for InMemoryCache {
    fn get(&self, bucket: Option<&str>, key: &Key) -> Result<Option<CacheValue>, CacheError> {
        self.inner.check()?;
        Ok(self.peek(bucket, key))
    }

    fn put(&self, bucket: Option<&str>, key: Key, value: CacheValue) -> Result<(), CacheError> {
        self.inner.check()?;
        self.poke(bucket, key, value);
        Ok(())
    }

    fn remove(&self, bucket: Option<&str>, key: &Key) -> Result<Option<CacheValue>, CacheError> {
        self.inner.check()?;
        Ok(self.inner.entries().remove(&entry_key(bucket, key.clone())))
    }

    fn start_transaction(&self) -> Result<Box<dyn Transaction>, CacheError> {
        self.inner.check()?;
        Ok(Box::new(InMemoryTransaction {
            inner: Arc::clone(&self.inner),
            writes: HashMap::new(),
        }))
    }

    fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::Acquire)
    }

    fn local_size(&self) -> Result<i64, CacheError> {
        if !self.is_running() {
            return Err(CacheError::NotRunning);
        }
        Ok(self.inner.entries().len() as i64)
    }
}

/// Buffers the writes of a transaction until commit; `None` marks a removal.
struct InMemoryTransaction {
    inner: Arc<Inner>,
    writes: HashMap<EntryKey, Option<CacheValue>>,
}

impl Transaction for InMemoryTransaction {
    fn get(&mut self, bucket: Option<&str>, key: &Key) -> Result<Option<CacheValue>, CacheError> {
        self.inner.check()?;
        let entry_key = entry_key(bucket, key.clone());
        match self.writes.get(&entry_key) {
            Some(written) => Ok(written.clone()),
            None => Ok(self.inner.entries().get(&entry_key).cloned()),
        }
    }

    fn put(&mut self, bucket: Option<&str>, key: Key, value: CacheValue) -> Result<(), CacheError> {
        self.inner.check()?;
        self.writes.insert(entry_key(bucket, key), Some(value));
        Ok(())
    }

    fn remove(&mut self, bucket: Option<&str>, key: &Key) -> Result<Option<CacheValue>, CacheError> {
        let previous = self.get(bucket, key)?;
        self.writes.insert(entry_key(bucket, key.clone()), None);
        Ok(previous)
    }

    fn end_transaction(self: Box<Self>, commit: bool) -> Result<(), CacheError> {
        if !commit {
            return Ok(());
        }
        self.inner.check()?;
        let failed = self
            .inner
            .failed_commits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if failed.is_ok() {
            return Err(CacheError::RolledBack);
        }
        let mut entries = self.inner.entries();
        for (key, value) in self.writes {
            match value {
                Some(value) => entries.insert(key, value),
                None => entries.remove(&key),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> Key {
        Key::from(name)
    }

    #[test]
    fn buckets_are_separate() {
        let cache = InMemoryCache::new();
        cache.put(None, key("a"), CacheValue::Timestamp(1)).unwrap();
        cache
            .put(Some("other"), key("a"), CacheValue::Timestamp(2))
            .unwrap();
        assert_eq!(cache.get(None, &key("a")).unwrap(), Some(CacheValue::Timestamp(1)));
        assert_eq!(
            cache.remove(Some("other"), &key("a")).unwrap(),
            Some(CacheValue::Timestamp(2))
        );
        assert_eq!(cache.local_size().unwrap(), 1);
    }

    #[test]
    fn transactions_are_isolated() {
        let cache = InMemoryCache::new();
        cache.put(None, key("a"), CacheValue::Timestamp(1)).unwrap();

        let mut tx = cache.start_transaction().unwrap();
        tx.put(None, key("b"), CacheValue::Timestamp(2)).unwrap();
        assert_eq!(tx.remove(None, &key("a")).unwrap(), Some(CacheValue::Timestamp(1)));
        assert_eq!(tx.get(None, &key("a")).unwrap(), None);
        assert_eq!(cache.get(None, &key("b")).unwrap(), None);
        tx.end_transaction(true).unwrap();

        assert_eq!(cache.get(None, &key("a")).unwrap(), None);
        assert_eq!(cache.get(None, &key("b")).unwrap(), Some(CacheValue::Timestamp(2)));

        let mut tx = cache.start_transaction().unwrap();
        tx.put(None, key("c"), CacheValue::Timestamp(3)).unwrap();
        tx.end_transaction(false).unwrap();
        assert_eq!(cache.get(None, &key("c")).unwrap(), None);
    }

    #[test]
    fn failed_commit_discards_writes() {
        let cache = InMemoryCache::new();
        cache.inject_failed_commits(1);
        let mut tx = cache.start_transaction().unwrap();
        tx.put(None, key("a"), CacheValue::Timestamp(1)).unwrap();
        assert_eq!(tx.end_transaction(true), Err(CacheError::RolledBack));
        assert_eq!(cache.peek(None, &key("a")), None);
    }

    #[test]
    fn stopped_and_failing() {
        let cache = InMemoryCache::new();
        cache.stop();
        assert!(!cache.is_running());
        assert_eq!(cache.get(None, &key("a")), Err(CacheError::NotRunning));
        cache.start();

        cache.inject_failures(2);
        assert!(matches!(cache.get(None, &key("a")), Err(CacheError::Failure(_))));
        assert!(matches!(cache.get(None, &key("a")), Err(CacheError::Failure(_))));
        assert_eq!(cache.get(None, &key("a")), Ok(None));
    }

    #[test]
    fn interruption_in_cause_chain() {
        use eyre::WrapErr;

        let interrupted: eyre::Result<()> = Err(CacheError::Interrupted).wrap_err("put failed");
        assert!(is_interruption(&interrupted.unwrap_err()));
        let failed: eyre::Result<()> = Err(CacheError::NotRunning).wrap_err("put failed");
        assert!(!is_interruption(&failed.unwrap_err()));
        assert!(is_interruption(&eyre::Report::new(Interrupted)));
    }

    #[test]
    fn value_casts() {
        let value = CacheValue::Bytes(vec![1, 2]);
        assert_eq!(value.as_bytes().unwrap(), &[1, 2]);
        assert!(value.as_log().is_err());
        assert!(value.as_timestamp().is_err());
    }
}
