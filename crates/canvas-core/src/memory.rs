//! In-process implementation of every storage capability, with fault
//! injection for exercising degraded paths.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;

use crate::store::{
    ActivityLog, DocumentStore, LogEntry, PackedFieldStore, SetStore, StoreError, StoreResult,
    TimeSeriesStore,
};

/// Which capability an injected fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Fields,
    Sets,
    Documents,
    Series,
    Log,
    /// Only `delete` on the packed field store fails.
    FieldDelete,
    /// Only `delete` on the set store fails; used to model a partial clear.
    SetDelete,
    /// Only `delete` on the document store fails.
    DocumentDelete,
}

struct Document {
    value: String,
    expires_at: Option<Instant>,
}

struct Series {
    retention_ms: i64,
    points: Vec<(i64, f64)>,
}

#[derive(Default)]
struct State {
    regions: HashMap<String, Vec<u8>>,
    sets: HashMap<String, BTreeSet<String>>,
    documents: HashMap<String, Document>,
    series: HashMap<String, Series>,
    logs: HashMap<String, VecDeque<LogEntry>>,
}

pub struct MemoryStore {
    state: Mutex<State>,
    faults: Mutex<HashSet<Fault>>,
    log_max_len: usize,
    log_seq: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            faults: Mutex::new(HashSet::new()),
            log_max_len: 100_000,
            log_seq: AtomicU64::new(0),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_log_max_len(log_max_len: usize) -> Arc<Self> {
        Arc::new(Self {
            log_max_len: log_max_len.max(1),
            ..Self::default()
        })
    }

    pub fn fail(&self, fault: Fault) {
        self.faults.lock().insert(fault);
    }

    pub fn heal(&self, fault: Fault) {
        self.faults.lock().remove(&fault);
    }

    pub fn heal_all(&self) {
        self.faults.lock().clear();
    }

    fn check(&self, fault: Fault) -> StoreResult<()> {
        if self.faults.lock().contains(&fault) {
            Err(StoreError::Unavailable(format!("injected {fault:?} fault")))
        } else {
            Ok(())
        }
    }

    pub fn series_len(&self, series: &str) -> usize {
        self.state
            .lock()
            .series
            .get(series)
            .map(|s| s.points.len())
            .unwrap_or(0)
    }
}

fn check_width(bits: u8) -> StoreResult<()> {
    if bits == 0 || bits > 63 {
        return Err(StoreError::Backend(format!("unsupported field width u{bits}")));
    }
    Ok(())
}

/// Bit 0 is the most significant bit of byte 0, matching Redis BITFIELD.
fn read_bits(bytes: &[u8], offset: u64, bits: u8) -> u64 {
    (0..bits as u64).fold(0u64, |acc, i| {
        let bit = offset + i;
        let byte = bytes.get((bit / 8) as usize).copied().unwrap_or(0);
        let value = (byte >> (7 - (bit % 8))) & 1;
        (acc << 1) | value as u64
    })
}

fn write_bits(bytes: &mut Vec<u8>, offset: u64, bits: u8, value: u64) {
    let last_byte = ((offset + bits as u64 - 1) / 8) as usize;
    if bytes.len() <= last_byte {
        bytes.resize(last_byte + 1, 0);
    }
    for i in 0..bits as u64 {
        let bit = offset + i;
        let mask = 1u8 << (7 - (bit % 8));
        let set = (value >> (bits as u64 - 1 - i)) & 1 == 1;
        let byte = &mut bytes[(bit / 8) as usize];
        if set {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

#[async_trait]
impl PackedFieldStore for MemoryStore {
    async fn get_field(&self, region: &str, bits: u8, offset: u64) -> StoreResult<u64> {
        self.check(Fault::Fields)?;
        check_width(bits)?;
        let state = self.state.lock();
        Ok(state
            .regions
            .get(region)
            .map(|bytes| read_bits(bytes, offset, bits))
            .unwrap_or(0))
    }

    async fn set_field(&self, region: &str, bits: u8, offset: u64, value: u64) -> StoreResult<()> {
        self.check(Fault::Fields)?;
        check_width(bits)?;
        if value >> bits != 0 {
            return Err(StoreError::Backend(format!("value {value} does not fit u{bits}")));
        }
        let mut state = self.state.lock();
        let bytes = state.regions.entry(region.to_string()).or_default();
        write_bits(bytes, offset, bits, value);
        Ok(())
    }

    async fn exists(&self, region: &str) -> StoreResult<bool> {
        self.check(Fault::Fields)?;
        Ok(self.state.lock().regions.contains_key(region))
    }

    async fn delete(&self, region: &str) -> StoreResult<()> {
        self.check(Fault::Fields)?;
        self.check(Fault::FieldDelete)?;
        self.state.lock().regions.remove(region);
        Ok(())
    }
}

#[async_trait]
impl SetStore for MemoryStore {
    async fn add(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check(Fault::Sets)?;
        let mut state = self.state.lock();
        Ok(state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    fn members(&self, key: &str) -> BoxStream<'static, StoreResult<String>> {
        if let Err(err) = self.check(Fault::Sets) {
            return stream::once(async move { Err(err) }).boxed();
        }
        let members: Vec<String> = self
            .state
            .lock()
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        stream::iter(members.into_iter().map(Ok)).boxed()
    }

    async fn count(&self, key: &str) -> StoreResult<u64> {
        self.check(Fault::Sets)?;
        Ok(self
            .state
            .lock()
            .sets
            .get(key)
            .map(|set| set.len() as u64)
            .unwrap_or(0))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check(Fault::Sets)?;
        Ok(self.state.lock().sets.contains_key(key))
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check(Fault::Sets)?;
        self.check(Fault::SetDelete)?;
        self.state.lock().sets.remove(key);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check(Fault::Documents)?;
        let mut state = self.state.lock();
        let expired = match state.documents.get(key) {
            Some(doc) => doc.expires_at.is_some_and(|at| Instant::now() >= at),
            None => return Ok(None),
        };
        if expired {
            state.documents.remove(key);
            return Ok(None);
        }
        Ok(state.documents.get(key).map(|doc| doc.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        self.check(Fault::Documents)?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.state
            .lock()
            .documents
            .insert(key.to_string(), Document { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check(Fault::Documents)?;
        self.check(Fault::DocumentDelete)?;
        self.state.lock().documents.remove(key);
        Ok(())
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn append(&self, series: &str, timestamp_ms: i64, value: f64) -> StoreResult<()> {
        self.check(Fault::Series)?;
        let mut state = self.state.lock();
        let Some(entry) = state.series.get_mut(series) else {
            return Err(StoreError::MissingSeries(series.to_string()));
        };
        entry.points.push((timestamp_ms, value));
        let newest = entry.points.iter().map(|(ts, _)| *ts).max().unwrap_or(timestamp_ms);
        if entry.retention_ms > 0 {
            let horizon = newest - entry.retention_ms;
            entry.points.retain(|(ts, _)| *ts >= horizon);
        }
        Ok(())
    }

    async fn create(&self, series: &str, retention: Duration) -> StoreResult<()> {
        self.check(Fault::Series)?;
        self.state
            .lock()
            .series
            .entry(series.to_string())
            .or_insert_with(|| Series {
                retention_ms: retention.as_millis() as i64,
                points: Vec::new(),
            });
        Ok(())
    }

    async fn range_sum(&self, series: &str, from_ms: i64) -> StoreResult<f64> {
        self.check(Fault::Series)?;
        let state = self.state.lock();
        let Some(entry) = state.series.get(series) else {
            return Err(StoreError::MissingSeries(series.to_string()));
        };
        Ok(entry
            .points
            .iter()
            .filter(|(ts, _)| *ts >= from_ms)
            .map(|(_, value)| *value)
            .sum())
    }
}

#[async_trait]
impl ActivityLog for MemoryStore {
    async fn append(&self, log: &str, payload: String) -> StoreResult<String> {
        self.check(Fault::Log)?;
        let seq = self.log_seq.fetch_add(1, Ordering::Relaxed);
        let id = format!("{}-{}", chrono::Utc::now().timestamp_millis(), seq);
        let mut state = self.state.lock();
        let entries = state.logs.entry(log.to_string()).or_default();
        entries.push_back(LogEntry {
            id: id.clone(),
            payload,
        });
        while entries.len() > self.log_max_len {
            entries.pop_front();
        }
        Ok(id)
    }

    async fn recent(&self, log: &str, count: usize) -> StoreResult<Vec<LogEntry>> {
        self.check(Fault::Log)?;
        let state = self.state.lock();
        Ok(state
            .logs
            .get(log)
            .map(|entries| entries.iter().rev().take(count).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test(5)]
    async fn nibble_fields_use_msb_first_layout() {
        let store = MemoryStore::new();
        store.set_field("r", 4, 0, 0xA).await.unwrap();
        store.set_field("r", 4, 4, 0x5).await.unwrap();
        store.set_field("r", 4, 12, 0xF).await.unwrap();
        {
            let state = store.state.lock();
            assert_eq!(state.regions["r"], vec![0xA5, 0x0F]);
        }
        assert_eq!(store.get_field("r", 4, 0).await.unwrap(), 0xA);
        assert_eq!(store.get_field("r", 4, 4).await.unwrap(), 0x5);
        assert_eq!(store.get_field("r", 4, 8).await.unwrap(), 0);
        assert_eq!(store.get_field("r", 4, 4096).await.unwrap(), 0);
        assert_eq!(store.get_field("missing", 4, 0).await.unwrap(), 0);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn overwriting_a_field_leaves_neighbours_alone() {
        let store = MemoryStore::new();
        store.set_field("r", 4, 0, 0xF).await.unwrap();
        store.set_field("r", 4, 4, 0xF).await.unwrap();
        store.set_field("r", 4, 0, 0x1).await.unwrap();
        assert_eq!(store.get_field("r", 4, 0).await.unwrap(), 0x1);
        assert_eq!(store.get_field("r", 4, 4).await.unwrap(), 0xF);
        assert!(store.set_field("r", 4, 0, 16).await.is_err());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn series_require_creation_and_respect_retention() {
        let store = MemoryStore::new();
        assert!(matches!(
            TimeSeriesStore::append(store.as_ref(), "zone", 10, 1.0).await,
            Err(StoreError::MissingSeries(_))
        ));
        store.create("zone", Duration::from_millis(100)).await.unwrap();
        TimeSeriesStore::append(store.as_ref(), "zone", 10, 1.0).await.unwrap();
        TimeSeriesStore::append(store.as_ref(), "zone", 50, 1.0).await.unwrap();
        assert_eq!(store.range_sum("zone", 0).await.unwrap(), 2.0);
        assert_eq!(store.range_sum("zone", 20).await.unwrap(), 1.0);
        TimeSeriesStore::append(store.as_ref(), "zone", 200, 1.0).await.unwrap();
        assert_eq!(store.series_len("zone"), 1);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn documents_expire() {
        let store = MemoryStore::new();
        store
            .set("k", "v".into(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn log_is_capped_and_newest_first() {
        let store = MemoryStore::with_log_max_len(2);
        for payload in ["a", "b", "c"] {
            ActivityLog::append(store.as_ref(), "log", payload.into()).await.unwrap();
        }
        let recent = store.recent("log", 10).await.unwrap();
        let payloads: Vec<_> = recent.iter().map(|e| e.payload.as_str()).collect();
        assert_eq!(payloads, vec!["c", "b"]);
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn faults_surface_as_unavailable() {
        let store = MemoryStore::new();
        store.fail(Fault::Fields);
        assert!(matches!(
            store.get_field("r", 4, 0).await,
            Err(StoreError::Unavailable(_))
        ));
        store.heal(Fault::Fields);
        assert!(store.get_field("r", 4, 0).await.is_ok());

        store.fail(Fault::Sets);
        let mut members = store.members("s");
        assert!(matches!(members.next().await, Some(Err(_))));
    }
}
