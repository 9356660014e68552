#![warn(missing_docs)]

//! Background load generation, statistics aggregation and consistency checking for key-value
//! caches.
//!
//! The crate drives synthetic GET/PUT/REMOVE traffic against any backend implementing the
//! [`CacheBackend`][cache::CacheBackend] trait. An [`OperationsManager`][manager::OperationsManager]
//! owns the stressor threads of one worker process, periodically collects their
//! [`Statistics`][stats::Statistics] and optionally runs [log checkers](checker) that detect writes
//! lost while cache nodes were killed and restarted.
//!
//! ## Usage Example
//!
//! `cargo run --bin cachestress -- example-config.yml --duration 30` runs the engine against the
//! bundled [`InMemoryCache`][cache::InMemoryCache] and logs one result map per statistics
//! interval.
//!
//! ## Module Overview
//!
//! - [`range`]: deterministic division of the key space among workers and threads.
//! - [`key_generator`]: maps key indices to cache keys.
//! - [`stats`]: running statistics with snapshot and merge support.
//! - [`stressor`]: the load generating threads and their logics.
//! - [`checker`]: log checkers verifying that no write was silently dropped.
//! - [`manager`]: the orchestrator that ties everything together.

use std::fmt;

pub mod cache;
pub mod checker;
pub mod config;
pub mod control;
pub mod key_generator;
pub mod keys;
pub mod manager;
pub mod range;
pub mod stats;
pub mod stressor;

/// The key type used for all cache accesses.
#[derive(Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Key {
    /// A textual key, as produced by the string key generator and used for coordination keys.
    Text(String),
    /// A binary key, as produced by the byte-array key generator.
    Binary(Vec<u8>),
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Text(text) => f.write_str(text),
            Key::Binary(bytes) => {
                f.write_str("0x")?;
                for byte in bytes {
                    write!(f, "{:02X}", byte)?;
                }
                Ok(())
            }
        }
    }
}

impl From<String> for Key {
    fn from(key: String) -> Self {
        Self::Text(key)
    }
}

impl From<&str> for Key {
    fn from(key: &str) -> Self {
        Self::Text(key.to_owned())
    }
}

/// Sets up a [`fern`] logger that writes to stdout and to the given log file.
///
/// Lines are formatted as `[date][time][target][level] message`.
pub fn set_up_logger(
    log_file: &str,
    level: log::LevelFilter,
) -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout())
        .chain(fern::log_file(log_file)?)
        .apply()?;
    Ok(())
}
