//! Storage capabilities the canvas needs from its environment.
//!
//! Production wiring implements these over Redis; [`crate::memory::MemoryStore`]
//! implements all of them in-process for tests and local development.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("series {0} does not exist")]
    MissingSeries(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Atomic get/set of unsigned N-bit fields at bit offsets inside a named
/// byte region. Unwritten bits read as zero.
#[async_trait]
pub trait PackedFieldStore: Send + Sync {
    async fn get_field(&self, region: &str, bits: u8, offset: u64) -> StoreResult<u64>;
    async fn set_field(&self, region: &str, bits: u8, offset: u64, value: u64) -> StoreResult<()>;
    async fn exists(&self, region: &str) -> StoreResult<bool>;
    async fn delete(&self, region: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait SetStore: Send + Sync {
    /// Returns `true` when the member was newly added.
    async fn add(&self, key: &str, member: &str) -> StoreResult<bool>;
    /// Lazy enumeration of every member. Finite, and not restartable once
    /// polled; a failure mid-scan surfaces as an `Err` item.
    fn members(&self, key: &str) -> BoxStream<'static, StoreResult<String>>;
    async fn count(&self, key: &str) -> StoreResult<u64>;
    async fn exists(&self, key: &str) -> StoreResult<bool>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Opaque serialized values, with or without expiry.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()>;
    async fn delete(&self, key: &str) -> StoreResult<()>;
}

#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Append a point. Fails with [`StoreError::MissingSeries`] when the series
    /// has not been created.
    async fn append(&self, series: &str, timestamp_ms: i64, value: f64) -> StoreResult<()>;
    /// Create a series; creating one that already exists succeeds.
    async fn create(&self, series: &str, retention: Duration) -> StoreResult<()>;
    /// Sum of all point values with `timestamp >= from_ms`.
    async fn range_sum(&self, series: &str, from_ms: i64) -> StoreResult<f64>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub payload: String,
}

/// Append-only, time-ordered log with store-generated ids.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn append(&self, log: &str, payload: String) -> StoreResult<String>;
    /// Up to `count` most recent entries, newest first.
    async fn recent(&self, log: &str, count: usize) -> StoreResult<Vec<LogEntry>>;
}
