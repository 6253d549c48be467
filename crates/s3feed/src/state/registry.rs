//! Registry of terminal object states.
//!
//! The registry is the only writer to the state store. Mutations update the
//! store's working copy under one lock; [`StateRegistry::persist`] writes
//! that copy out and is called at page granularity, never per object.
//!
//! Two modes exist. Normal mode keeps every state until a listing no longer
//! reports it. Lexicographic mode keeps only the `lookback_keys` greatest
//! object keys and maintains a persisted tail: the smallest key that is in
//! flight, awaiting another attempt, or completed. Listings resume just
//! before the tail, so the tail key itself is always listed again.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::store::StateStore;
use super::{
    state_store_key, watermark_store_key, ObjectState, STATE_KEY_PREFIX, TAIL_KEY, UNRESOLVED_KEY,
};
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryMode {
    Normal,
    Lexicographic { lookback_keys: usize },
}

/// What one [`StateRegistry::flush`] removed and committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub superseded: usize,
    pub expired: usize,
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct LexicographicIndex {
    capacity: usize,
    /// `(object key, state id)` of completed states, smallest key first.
    ordered: BTreeSet<(String, String)>,
    /// Keys dispatched but not completed, with a dispatch count.
    in_flight: BTreeMap<String, usize>,
    /// Keys whose last attempt ended without a terminal state. They hold
    /// the tail down until they complete or leave the bucket.
    unresolved: BTreeSet<String>,
    tail: Option<String>,
}

impl LexicographicIndex {
    fn compute_tail(&self) -> Option<String> {
        [
            self.in_flight.keys().next(),
            self.unresolved.first(),
            self.ordered.first().map(|(key, _)| key),
        ]
        .into_iter()
        .flatten()
        .min()
        .cloned()
    }

    fn unmark(&mut self, key: &str) {
        if let Some(count) = self.in_flight.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(key);
            }
        }
    }

    fn persist_tail(&mut self, store: &dyn StateStore) -> Result<(), StoreError> {
        let tail = self.compute_tail();
        if tail == self.tail {
            return Ok(());
        }
        self.tail = tail;
        match &self.tail {
            Some(key) => store.set(TAIL_KEY, Value::String(key.clone())),
            None => store.remove(TAIL_KEY),
        }
    }

    fn persist_unresolved(&self, store: &dyn StateStore) -> Result<(), StoreError> {
        if self.unresolved.is_empty() {
            return store.remove(UNRESOLVED_KEY);
        }
        let keys = self.unresolved.iter().cloned().map(Value::String).collect();
        store.set(UNRESOLVED_KEY, Value::Array(keys))
    }
}

/// A listing start key that sorts before `key` but after nothing that
/// could sort between: `key` minus its last character. `None` for keys of
/// one character, which list from the start.
fn key_before(key: &str) -> Option<String> {
    let (last, _) = key.char_indices().next_back()?;
    (last > 0).then(|| key[..last].to_string())
}

#[derive(Debug)]
struct Inner {
    states: HashMap<String, ObjectState>,
    lex: Option<LexicographicIndex>,
}

pub struct StateRegistry {
    store: Arc<dyn StateStore>,
    key_prefix: String,
    inner: Mutex<Inner>,
    flushes: AtomicU64,
}

impl StateRegistry {
    /// Loads the terminal states whose object key starts with `key_prefix`.
    pub fn open(
        store: Arc<dyn StateStore>,
        key_prefix: impl Into<String>,
        mode: RegistryMode,
    ) -> Result<Self, StoreError> {
        let key_prefix = key_prefix.into();
        let lexicographic = matches!(mode, RegistryMode::Lexicographic { .. });

        let mut states = HashMap::new();
        store.each(&mut |key, value| {
            if !key.starts_with(STATE_KEY_PREFIX) {
                return true;
            }
            match serde_json::from_value::<ObjectState>(value.clone()) {
                Err(e) => warn!(store_key = %key, error = %e, "invalid object state in store; skipping"),
                // Non-terminal states are retried on the next scan.
                Ok(st) if !st.is_terminal() => {}
                Ok(st) if !st.key.starts_with(&key_prefix) => {}
                Ok(st) => {
                    let id = if lexicographic { st.lexicographic_id() } else { st.id() };
                    states.insert(id, st);
                }
            }
            true
        })?;

        let lex = match mode {
            RegistryMode::Normal => None,
            RegistryMode::Lexicographic { lookback_keys } => {
                let mut index = LexicographicIndex {
                    capacity: lookback_keys.max(1),
                    ordered: states
                        .iter()
                        .map(|(id, st)| (st.key.clone(), id.clone()))
                        .collect(),
                    in_flight: BTreeMap::new(),
                    unresolved: store
                        .get(UNRESOLVED_KEY)?
                        .and_then(|v| serde_json::from_value::<BTreeSet<String>>(v).ok())
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|key| key.starts_with(&key_prefix))
                        .collect(),
                    tail: store
                        .get(TAIL_KEY)?
                        .and_then(|v| v.as_str().map(str::to_string))
                        .filter(|t| !t.is_empty()),
                };

                while index.ordered.len() > index.capacity {
                    let Some((_, id)) = index.ordered.pop_first() else { break };
                    states.remove(&id);
                    if let Err(e) = store.remove(&state_store_key(&id)) {
                        warn!(state_id = %id, error = %e, "failed to evict least state from store");
                    }
                }

                if index.tail.is_none() {
                    index.persist_tail(store.as_ref())?;
                }
                Some(index)
            }
        };

        store.persist()?;
        info!(states = states.len(), mode = ?mode, "state registry loaded");
        Ok(Self {
            store,
            key_prefix,
            inner: Mutex::new(Inner { states, lex }),
            flushes: AtomicU64::new(0),
        })
    }

    pub fn mode(&self) -> RegistryMode {
        match &self.lock().lex {
            None => RegistryMode::Normal,
            Some(lex) => RegistryMode::Lexicographic {
                lookback_keys: lex.capacity,
            },
        }
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.lock().states.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<ObjectState> {
        self.lock().states.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().states.is_empty()
    }

    /// Number of completed page flushes.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Records a terminal state. In lexicographic mode the key also leaves
    /// the in-flight set, and states with a key below the retained window
    /// are not kept.
    pub fn add_state(&self, st: ObjectState) -> Result<(), StoreError> {
        if !st.key.starts_with(&self.key_prefix) {
            return Err(StoreError::ForeignPrefix {
                key: st.key,
                prefix: self.key_prefix.clone(),
            });
        }

        let mut inner = self.lock();
        let Inner { states, lex } = &mut *inner;

        let Some(lex) = lex else {
            let id = st.id();
            self.store.set(&state_store_key(&id), serde_json::to_value(&st)?)?;
            states.insert(id, st);
            return Ok(());
        };

        lex.unmark(&st.key);
        if lex.unresolved.remove(&st.key) {
            lex.persist_unresolved(self.store.as_ref())?;
        }
        let id = st.lexicographic_id();

        if !states.contains_key(&id) && lex.ordered.len() >= lex.capacity {
            if lex.ordered.first().is_some_and(|(min_key, _)| st.key <= *min_key) {
                debug!(object_key = %st.key, "state below lookback window; not retained");
                return lex.persist_tail(self.store.as_ref());
            }
            if let Some((_, evicted)) = lex.ordered.pop_first() {
                states.remove(&evicted);
                self.store.remove(&state_store_key(&evicted))?;
            }
        }

        self.store.set(&state_store_key(&id), serde_json::to_value(&st)?)?;
        lex.ordered.insert((st.key.clone(), id.clone()));
        states.insert(id, st);
        lex.persist_tail(self.store.as_ref())
    }

    /// Smallest key still of interest in lexicographic mode. Listed keys
    /// below it are outside the retained window.
    pub fn tail(&self) -> Option<String> {
        self.lock().lex.as_ref().and_then(|lex| lex.tail.clone())
    }

    /// Exclusive listing start in lexicographic mode: a key just before the
    /// tail, so the tail itself is listed again.
    pub fn start_after_key(&self) -> Option<String> {
        self.tail().as_deref().and_then(key_before)
    }

    /// Notes that `key` was dispatched. Lowers the tail when needed so a
    /// crash during processing does not skip the object.
    pub fn mark_in_flight(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let Some(lex) = inner.lex.as_mut() else {
            return Ok(());
        };

        *lex.in_flight.entry(key.to_string()).or_insert(0) += 1;
        if lex.tail.as_deref().is_none_or(|tail| key < tail) {
            lex.tail = Some(key.to_string());
            self.store.set(TAIL_KEY, Value::String(key.to_string()))?;
        }
        Ok(())
    }

    /// Notes that the attempt on `key` ended without a terminal state. The
    /// key keeps the tail at or below it until a later attempt completes it.
    pub fn mark_unresolved(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let Some(lex) = inner.lex.as_mut() else {
            return Ok(());
        };
        lex.unmark(key);
        if lex.unresolved.insert(key.to_string()) {
            lex.persist_unresolved(self.store.as_ref())?;
        }
        lex.persist_tail(self.store.as_ref())
    }

    /// Forgets unresolved keys a complete listing did not report: the
    /// objects are gone and cannot be retried.
    pub fn retain_unresolved(&self, listed_keys: &HashSet<String>) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let Some(lex) = inner.lex.as_mut() else {
            return Ok(0);
        };
        let before = lex.unresolved.len();
        lex.unresolved.retain(|key| listed_keys.contains(key));
        let removed = before - lex.unresolved.len();
        if removed > 0 {
            lex.persist_unresolved(self.store.as_ref())?;
            lex.persist_tail(self.store.as_ref())?;
        }
        Ok(removed)
    }

    /// Writes the store's working copy to durable storage. Blocking; async
    /// callers run it on the blocking pool.
    pub fn persist(&self) -> Result<(), StoreError> {
        self.store.persist()
    }

    /// Removes states whose id a complete listing did not report. In
    /// lexicographic mode the greatest id is kept if everything would go.
    pub fn clean_up(&self, known_ids: &HashSet<String>) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let Inner { states, lex } = &mut *inner;

        let mut to_remove: Vec<String> = states
            .keys()
            .filter(|id| !known_ids.contains(*id))
            .cloned()
            .collect();
        if to_remove.is_empty() {
            return Ok(0);
        }

        if lex.is_some() && to_remove.len() == states.len() {
            if let Some(greatest) = to_remove.iter().max().cloned() {
                to_remove.retain(|id| *id != greatest);
            }
        }

        for id in &to_remove {
            if let Some(st) = states.remove(id) {
                if let Some(lex) = lex.as_mut() {
                    lex.ordered.remove(&(st.key, id.clone()));
                }
            }
            self.store.remove(&state_store_key(id))?;
        }

        if let Some(lex) = lex.as_mut() {
            lex.persist_tail(self.store.as_ref())?;
        }
        debug!(removed = to_remove.len(), "cleaned up states not seen in listing");
        Ok(to_remove.len())
    }

    /// Persisted committed watermark of `bucket`.
    pub fn watermark(&self, bucket: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let _guard = self.lock();
        self.read_watermark(bucket)
    }

    /// Flush after a listing page was fully resolved.
    ///
    /// Removes states superseded by a newer version of the same object and
    /// states that expired: older than `ignore_older` and below the bucket
    /// watermark. Then persists the watermark, which only moves forward.
    pub fn flush(
        &self,
        bucket: &str,
        committed: Option<DateTime<Utc>>,
        ignore_older: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<FlushReport, StoreError> {
        let mut inner = self.lock();
        let Inner { states, lex } = &mut *inner;

        let previous = self.read_watermark(bucket)?;
        let watermark = previous.max(committed);

        let mut newest: HashMap<&str, (&str, DateTime<Utc>)> = HashMap::new();
        for (id, st) in states.iter().filter(|(_, st)| st.bucket == bucket) {
            let entry = newest.entry(st.key.as_str()).or_insert((id.as_str(), st.last_modified));
            if st.last_modified > entry.1 {
                *entry = (id.as_str(), st.last_modified);
            }
        }
        let superseded: Vec<String> = states
            .iter()
            .filter(|(id, st)| {
                st.bucket == bucket
                    && newest
                        .get(st.key.as_str())
                        .is_some_and(|(keep, _)| *keep != id.as_str())
            })
            .map(|(id, _)| id.clone())
            .collect();

        let cutoff = match (ignore_older.and_then(|d| chrono::Duration::from_std(d).ok()), watermark) {
            (Some(age), Some(mark)) => Some((now - age).min(mark)),
            _ => None,
        };
        let expired: Vec<String> = match cutoff {
            Some(cutoff) => states
                .iter()
                .filter(|(id, st)| {
                    st.bucket == bucket && st.last_modified < cutoff && !superseded.contains(id)
                })
                .map(|(id, _)| id.clone())
                .collect(),
            None => Vec::new(),
        };

        for id in superseded.iter().chain(expired.iter()) {
            if let Some(st) = states.remove(id) {
                if let Some(lex) = lex.as_mut() {
                    lex.ordered.remove(&(st.key, id.clone()));
                }
            }
            self.store.remove(&state_store_key(id))?;
        }
        if let Some(lex) = lex.as_mut() {
            lex.persist_tail(self.store.as_ref())?;
        }

        if watermark != previous {
            if let Some(mark) = watermark {
                self.store
                    .set(&watermark_store_key(bucket), Value::String(mark.to_rfc3339()))?;
            }
        }

        self.flushes.fetch_add(1, Ordering::SeqCst);
        let report = FlushReport {
            superseded: superseded.len(),
            expired: expired.len(),
            watermark,
        };
        debug!(bucket, ?report, "state registry flushed");
        Ok(report)
    }

    fn read_watermark(&self, bucket: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .store
            .get(&watermark_store_key(bucket))?
            .and_then(|v| v.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()))
            .map(|dt| dt.with_timezone(&Utc)))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
    }

    fn stored(key: &str, etag: &str, minute: u32) -> ObjectState {
        let mut st = ObjectState::new("bucket", key, etag, ts(minute));
        st.mark_stored();
        st
    }

    fn normal(store: &Arc<MemoryStore>) -> StateRegistry {
        StateRegistry::open(store.clone(), "", RegistryMode::Normal).unwrap()
    }

    #[test]
    fn test_add_state_persists_and_dedups() {
        let store = Arc::new(MemoryStore::new());
        let registry = normal(&store);
        let st = stored("a.log", "e1", 0);
        registry.add_state(st.clone()).unwrap();

        assert!(registry.is_processed(&st.id()));
        assert!(!registry.is_processed(&stored("a.log", "e2", 0).id()));
        assert!(store.get(&state_store_key(&st.id())).unwrap().is_some());
    }

    #[test]
    fn test_reload_skips_non_terminal_and_foreign_states() {
        let store = Arc::new(MemoryStore::new());
        let pending = ObjectState::new("bucket", "logs/a", "e", ts(0));
        store
            .set(&state_store_key(&pending.id()), serde_json::to_value(&pending).unwrap())
            .unwrap();
        let other = stored("other/b", "e", 0);
        store
            .set(&state_store_key(&other.id()), serde_json::to_value(&other).unwrap())
            .unwrap();
        let good = stored("logs/c", "e", 0);
        store
            .set(&state_store_key(&good.id()), serde_json::to_value(&good).unwrap())
            .unwrap();
        store.set(&state_store_key("garbage"), Value::from(3)).unwrap();

        let registry = StateRegistry::open(store, "logs/", RegistryMode::Normal).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.is_processed(&good.id()));
    }

    #[test]
    fn test_foreign_prefix_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let registry = StateRegistry::open(store, "logs/", RegistryMode::Normal).unwrap();
        let err = registry.add_state(stored("other/x", "e", 0)).unwrap_err();
        assert!(matches!(err, StoreError::ForeignPrefix { .. }));
    }

    #[test]
    fn test_clean_up_removes_unlisted_states() {
        let store = Arc::new(MemoryStore::new());
        let registry = normal(&store);
        let a = stored("a", "e", 0);
        let b = stored("b", "e", 0);
        registry.add_state(a.clone()).unwrap();
        registry.add_state(b.clone()).unwrap();

        let known = HashSet::from([a.id()]);
        assert_eq!(registry.clean_up(&known).unwrap(), 1);
        assert!(registry.is_processed(&a.id()));
        assert!(!registry.is_processed(&b.id()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_lexicographic_keeps_greatest_keys_and_tail() {
        let store = Arc::new(MemoryStore::new());
        let registry = StateRegistry::open(
            store.clone(),
            "",
            RegistryMode::Lexicographic { lookback_keys: 2 },
        )
        .unwrap();

        for key in ["b", "c", "d"] {
            registry.mark_in_flight(key).unwrap();
        }
        assert_eq!(registry.tail().as_deref(), Some("b"));

        registry.add_state(stored("b", "e", 0)).unwrap();
        registry.add_state(stored("c", "e", 0)).unwrap();
        assert_eq!(registry.tail().as_deref(), Some("b"));

        // Full window: "d" evicts "b".
        registry.add_state(stored("d", "e", 0)).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(!registry.is_processed(&stored("b", "e", 0).lexicographic_id()));
        assert_eq!(registry.tail().as_deref(), Some("c"));
        assert_eq!(store.get(TAIL_KEY).unwrap(), Some(Value::from("c")));

        // Below the window: not retained.
        registry.add_state(stored("a", "e", 0)).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_listing_starts_just_before_the_tail() {
        assert_eq!(key_before("logs/b.log").as_deref(), Some("logs/b.lo"));
        assert_eq!(key_before("logs/é").as_deref(), Some("logs/"));
        assert_eq!(key_before("m"), None);
        assert_eq!(key_before(""), None);
        assert!(key_before("logs/b.log").unwrap().as_str() < "logs/b.log");

        let registry = StateRegistry::open(
            Arc::new(MemoryStore::new()),
            "",
            RegistryMode::Lexicographic { lookback_keys: 10 },
        )
        .unwrap();
        assert_eq!(registry.start_after_key(), None);
        registry.mark_in_flight("logs/b.log").unwrap();
        assert_eq!(registry.start_after_key().as_deref(), Some("logs/b.lo"));
    }

    #[test]
    fn test_unresolved_key_holds_tail_until_completed() {
        let store = Arc::new(MemoryStore::new());
        let mode = RegistryMode::Lexicographic { lookback_keys: 10 };
        let registry = StateRegistry::open(store.clone(), "", mode).unwrap();
        registry.add_state(stored("logs/m", "e", 0)).unwrap();
        registry.mark_in_flight("logs/c").unwrap();
        assert_eq!(registry.tail().as_deref(), Some("logs/c"));

        registry.mark_unresolved("logs/c").unwrap();
        assert_eq!(registry.tail().as_deref(), Some("logs/c"));
        assert_eq!(registry.start_after_key().as_deref(), Some("logs/"));

        // Survives a restart.
        let reopened = StateRegistry::open(store.clone(), "", mode).unwrap();
        assert_eq!(reopened.tail().as_deref(), Some("logs/c"));

        reopened.add_state(stored("logs/c", "e", 0)).unwrap();
        assert_eq!(store.get(UNRESOLVED_KEY).unwrap(), None);
        reopened.clean_up(&HashSet::from([stored("logs/m", "e", 0).lexicographic_id()])).unwrap();
        assert_eq!(reopened.tail().as_deref(), Some("logs/m"));
    }

    #[test]
    fn test_unresolved_keys_missing_from_listing_are_forgotten() {
        let registry = StateRegistry::open(
            Arc::new(MemoryStore::new()),
            "",
            RegistryMode::Lexicographic { lookback_keys: 10 },
        )
        .unwrap();
        registry.add_state(stored("logs/m", "e", 0)).unwrap();
        registry.mark_in_flight("logs/c").unwrap();
        registry.mark_unresolved("logs/c").unwrap();

        assert_eq!(registry.retain_unresolved(&HashSet::from(["logs/m".to_string()])).unwrap(), 1);
        assert_eq!(registry.tail().as_deref(), Some("logs/m"));
    }

    #[test]
    fn test_persist_writes_buffered_states() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        let st = stored("a.log", "e1", 0);
        {
            let registry = StateRegistry::open(
                Arc::new(crate::state::FileStore::open(&path).unwrap()),
                "",
                RegistryMode::Normal,
            )
            .unwrap();
            registry.add_state(st.clone()).unwrap();
            assert!(!path.exists());
            registry.persist().unwrap();
        }

        let reopened = StateRegistry::open(
            Arc::new(crate::state::FileStore::open(&path).unwrap()),
            "",
            RegistryMode::Normal,
        )
        .unwrap();
        assert!(reopened.is_processed(&st.id()));
    }

    #[test]
    fn test_lexicographic_clean_up_keeps_greatest() {
        let store = Arc::new(MemoryStore::new());
        let registry =
            StateRegistry::open(store, "", RegistryMode::Lexicographic { lookback_keys: 10 }).unwrap();
        registry.add_state(stored("a", "e", 0)).unwrap();
        registry.add_state(stored("z", "e", 0)).unwrap();

        assert_eq!(registry.clean_up(&HashSet::new()).unwrap(), 1);
        assert!(registry.is_processed(&stored("z", "e", 0).lexicographic_id()));
    }

    #[test]
    fn test_flush_removes_superseded_and_expired_and_moves_watermark() {
        let store = Arc::new(MemoryStore::new());
        let registry = normal(&store);
        registry.add_state(stored("a", "old", 0)).unwrap();
        registry.add_state(stored("a", "new", 5)).unwrap();
        registry.add_state(stored("b", "e", 1)).unwrap();
        registry.add_state(stored("c", "e", 30)).unwrap();

        let report = registry
            .flush("bucket", Some(ts(20)), Some(Duration::from_secs(600)), ts(40))
            .unwrap();
        // cutoff = min(40 - 10, 20) = minute 20
        assert_eq!(report.superseded, 1);
        assert_eq!(report.expired, 2);
        assert_eq!(report.watermark, Some(ts(20)));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.flush_count(), 1);

        // The watermark never moves backwards.
        let report = registry.flush("bucket", Some(ts(10)), None, ts(41)).unwrap();
        assert_eq!(report.watermark, Some(ts(20)));
        assert_eq!(registry.watermark("bucket").unwrap(), Some(ts(20)));
        assert_eq!(registry.flush_count(), 2);
    }
}
