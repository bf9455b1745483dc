//! Redis implementation of the canvas storage capabilities.
//!
//! The packed grid is a string addressed with `BITFIELD`, the placed index a
//! set, documents plain keys, zone series RedisTimeSeries keys and the
//! placement log a stream.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use canvas_core::store::{
    ActivityLog, DocumentStore, LogEntry, PackedFieldStore, SetStore, StoreError, StoreResult,
    TimeSeriesStore,
};
use futures::stream::{self, BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use tracing::debug;

const SCAN_BATCH: usize = 500;
/// Aggregation bucket for windowed sums; every returned bucket is added up.
const RANGE_BUCKET_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Approximate `MAXLEN` applied on every placement log append.
    pub log_max_len: usize,
    /// Retention applied when a series is created implicitly by an append.
    pub series_retention: Duration,
}

#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    config: RedisStoreConfig,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, config: RedisStoreConfig) -> anyhow::Result<Self> {
        let client = Client::open(redis_url).context("failed to create redis client")?;
        let redis = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self { redis, config })
    }
}

fn store_error(err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

fn is_missing_key(err: &RedisError) -> bool {
    err.to_string().contains("does not exist")
}

#[async_trait]
impl PackedFieldStore for RedisStore {
    async fn get_field(&self, region: &str, bits: u8, offset: u64) -> StoreResult<u64> {
        let mut conn = self.redis.clone();
        let values: Vec<u64> = redis::cmd("BITFIELD")
            .arg(region)
            .arg("GET")
            .arg(format!("u{bits}"))
            .arg(offset)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(values.first().copied().unwrap_or(0))
    }

    async fn set_field(&self, region: &str, bits: u8, offset: u64, value: u64) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        redis::cmd("BITFIELD")
            .arg(region)
            .arg("SET")
            .arg(format!("u{bits}"))
            .arg(offset)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn exists(&self, region: &str) -> StoreResult<bool> {
        let mut conn = self.redis.clone();
        conn.exists(region).await.map_err(store_error)
    }

    async fn delete(&self, region: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(region).await.map_err(store_error)
    }
}

#[async_trait]
impl SetStore for RedisStore {
    async fn add(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.redis.clone();
        let added: i64 = conn.sadd(key, member).await.map_err(store_error)?;
        Ok(added > 0)
    }

    /// `SSCAN` in batches. A member may repeat if the set is rehashed
    /// mid-scan; readers treat the stream as a set.
    fn members(&self, key: &str) -> BoxStream<'static, StoreResult<String>> {
        let start = (self.redis.clone(), key.to_string(), Some(0u64));
        stream::unfold(start, |(mut conn, key, cursor)| async move {
            let Some(cursor) = cursor else {
                return None;
            };
            let reply: Result<(u64, Vec<String>), RedisError> = redis::cmd("SSCAN")
                .arg(&key)
                .arg(cursor)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await;
            match reply {
                Ok((next, batch)) => {
                    let next = (next != 0).then_some(next);
                    let items: Vec<StoreResult<String>> = batch.into_iter().map(Ok).collect();
                    Some((items, (conn, key, next)))
                }
                Err(err) => Some((vec![Err(store_error(err))], (conn, key, None))),
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }

    async fn count(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.redis.clone();
        conn.scard(key).await.map_err(store_error)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.redis.clone();
        conn.exists(key).await.map_err(store_error)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await.map_err(store_error)
    }
}

#[async_trait]
impl DocumentStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.redis.clone();
        conn.get(key).await.map_err(store_error)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        match ttl {
            Some(ttl) => conn
                .pset_ex::<_, _, ()>(key, value, ttl.as_millis().max(1) as u64)
                .await
                .map_err(store_error),
            None => conn.set::<_, _, ()>(key, value).await.map_err(store_error),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await.map_err(store_error)
    }
}

#[async_trait]
impl TimeSeriesStore for RedisStore {
    async fn append(&self, series: &str, timestamp_ms: i64, value: f64) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let result = redis::cmd("TS.ADD")
            .arg(series)
            .arg(timestamp_ms)
            .arg(value)
            .arg("RETENTION")
            .arg(self.config.series_retention.as_millis() as u64)
            .arg("ON_DUPLICATE")
            .arg("SUM")
            .query_async::<()>(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if is_missing_key(&err) => Err(StoreError::MissingSeries(series.to_string())),
            Err(err) => Err(store_error(err)),
        }
    }

    async fn create(&self, series: &str, retention: Duration) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let result = redis::cmd("TS.CREATE")
            .arg(series)
            .arg("RETENTION")
            .arg(retention.as_millis() as u64)
            .arg("DUPLICATE_POLICY")
            .arg("SUM")
            .query_async::<()>(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("already exists") => {
                debug!(%series, "series already exists");
                Ok(())
            }
            Err(err) => Err(store_error(err)),
        }
    }

    async fn range_sum(&self, series: &str, from_ms: i64) -> StoreResult<f64> {
        let mut conn = self.redis.clone();
        let buckets: Vec<(i64, String)> = match redis::cmd("TS.RANGE")
            .arg(series)
            .arg(from_ms.max(0))
            .arg("+")
            .arg("AGGREGATION")
            .arg("sum")
            .arg(RANGE_BUCKET_MS)
            .query_async(&mut conn)
            .await
        {
            Ok(buckets) => buckets,
            Err(err) if is_missing_key(&err) => {
                return Err(StoreError::MissingSeries(series.to_string()))
            }
            Err(err) => return Err(store_error(err)),
        };
        buckets.iter().try_fold(0.0, |sum, (_, value)| {
            value
                .parse::<f64>()
                .map(|value| sum + value)
                .map_err(|err| StoreError::Backend(format!("bad sample in {series}: {err}")))
        })
    }
}

#[async_trait]
impl ActivityLog for RedisStore {
    async fn append(&self, log: &str, payload: String) -> StoreResult<String> {
        let mut conn = self.redis.clone();
        redis::cmd("XADD")
            .arg(log)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.log_max_len)
            .arg("*")
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn recent(&self, log: &str, count: usize) -> StoreResult<Vec<LogEntry>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let entries: Vec<(String, Vec<String>)> = redis::cmd("XREVRANGE")
            .arg(log)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(entries
            .into_iter()
            .filter_map(|(id, fields)| {
                let payload = fields
                    .chunks(2)
                    .find(|pair| pair.first().map(String::as_str) == Some("payload"))
                    .and_then(|pair| pair.get(1).cloned())?;
                Some(LogEntry { id, payload })
            })
            .collect())
    }
}
