pub mod chain;
pub mod checkpoint;
pub mod classify;
pub mod common;
pub mod config;
pub mod db;
pub mod driver;
pub mod engine;
pub mod event;
pub mod gateway;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::EscError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = std::collections::HashMap<K, V>;
pub type Set<T> = std::collections::HashSet<T>;

/// Numeric job id assigned by the scheduler.
pub type JobId = u64;

/// Index of a single task within an array submission.
pub type TaskIndex = u32;

pub const ESCALADE_VERSION: &str = env!("CARGO_PKG_VERSION");
