//! In-memory accounting store.
//!
//! Reference backend for [`AccountingStore`]: single-process, mutex-guarded,
//! with lazy TTL expiry against an injected [`Clock`]. Used directly in tests
//! and suitable for single-node deployments; a Redis-backed implementation
//! slots in behind the same trait for anything distributed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::{Clock, SystemClock};
use crate::store::{AccountingStore, StoreError};

#[derive(Debug, Clone)]
enum Value {
    Counter(i64),
    Str(String),
    List(VecDeque<String>),
    SortedSet(HashMap<String, f64>),
    Hash(HashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// Epoch millis past which the entry reads as absent. `None` = no expiry.
    expires_at: Option<u64>,
}

/// Single-process [`AccountingStore`] over a guarded `HashMap`.
///
/// Expiry is lazy: an expired entry is dropped the next time any operation
/// touches its key, matching the observable semantics of a TTL-based store.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    data: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store on an explicit clock (tests use [`crate::ManualClock`]).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { data: Arc::new(Mutex::new(HashMap::new())), clock }
    }

    fn expires_at(&self, ttl: Duration) -> u64 {
        self.clock
            .now_millis()
            .saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
    }

    /// Drop the entry at `key` if its TTL has elapsed.
    fn evict_if_expired(&self, guard: &mut HashMap<String, Entry>, key: &str) {
        let now = self.clock.now_millis();
        if let Some(entry) = guard.get(key) {
            if entry.expires_at.is_some_and(|at| at <= now) {
                guard.remove(key);
            }
        }
    }

    fn wrong_type(key: &str) -> StoreError {
        StoreError::WrongType { key: key.to_string() }
    }
}

/// Translate a possibly-negative inclusive index pair into `[lo, hi)` bounds
/// over a collection of `len` elements. `None` means the range is empty.
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    let lo = if start < 0 { (len + start).max(0) } else { start.min(len) };
    let hi = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if lo > hi || hi < 0 {
        return None;
    }
    Some((lo as usize, hi as usize + 1))
}

#[async_trait]
impl AccountingStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut guard = self.data.lock().unwrap();
        self.evict_if_expired(&mut guard, key);
        match guard.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(Value::Counter(n)) => Ok(Some(n.to_string())),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Some(self.expires_at(ttl));
        let mut guard = self.data.lock().unwrap();
        guard.insert(key.to_string(), Entry { value: Value::Str(value.to_string()), expires_at });
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let mut guard = self.data.lock().unwrap();
        self.evict_if_expired(&mut guard, key);
        let entry = guard
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: Value::Counter(0), expires_at: None });
        match &mut entry.value {
            Value::Counter(n) => {
                *n += 1;
                Ok(*n)
            }
            // A stored string that parses as an integer counts as a counter.
            Value::Str(s) => {
                let n = s.parse::<i64>().map_err(|_| Self::wrong_type(key))? + 1;
                entry.value = Value::Counter(n);
                Ok(n)
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let expires_at = self.expires_at(ttl);
        let mut guard = self.data.lock().unwrap();
        self.evict_if_expired(&mut guard, key);
        match guard.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(expires_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut guard = self.data.lock().unwrap();
        self.evict_if_expired(&mut guard, key);
        let now = self.clock.now_millis();
        Ok(guard
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| Duration::from_millis(at.saturating_sub(now))))
    }

    async fn list_push_front(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let mut guard = self.data.lock().unwrap();
        self.evict_if_expired(&mut guard, key);
        let entry = guard
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: Value::List(VecDeque::new()), expires_at: None });
        match &mut entry.value {
            Value::List(list) => {
                list.push_front(value.to_string());
                Ok(list.len() as u64)
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError> {
        let mut guard = self.data.lock().unwrap();
        self.evict_if_expired(&mut guard, key);
        let mut emptied = false;
        match guard.get_mut(key) {
            None => return Ok(()),
            Some(entry) => match &mut entry.value {
                Value::List(list) => match resolve_range(list.len(), start, stop) {
                    Some((lo, hi)) => {
                        list.truncate(hi);
                        list.drain(..lo);
                    }
                    None => emptied = true,
                },
                _ => return Err(Self::wrong_type(key)),
            },
        }
        // An empty range deletes the key, as LTRIM does.
        if emptied {
            guard.remove(key);
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let mut guard = self.data.lock().unwrap();
        self.evict_if_expired(&mut guard, key);
        match guard.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => Ok(resolve_range(list.len(), start, stop)
                .map(|(lo, hi)| list.iter().skip(lo).take(hi - lo).cloned().collect())
                .unwrap_or_default()),
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn sorted_set_increment(
        &self,
        key: &str,
        member: &str,
        delta: f64,
    ) -> Result<f64, StoreError> {
        let mut guard = self.data.lock().unwrap();
        self.evict_if_expired(&mut guard, key);
        let entry = guard
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: Value::SortedSet(HashMap::new()), expires_at: None });
        match &mut entry.value {
            Value::SortedSet(set) => {
                let score = set.entry(member.to_string()).or_insert(0.0);
                *score += delta;
                Ok(*score)
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn sorted_set_top(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let mut guard = self.data.lock().unwrap();
        self.evict_if_expired(&mut guard, key);
        match guard.get(key).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::SortedSet(set)) => {
                let mut members: Vec<(String, f64)> =
                    set.iter().map(|(m, s)| (m.clone(), *s)).collect();
                // Score descending, member ascending on ties, so ranks are stable.
                members.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.0.cmp(&b.0))
                });
                Ok(resolve_range(members.len(), start, stop)
                    .map(|(lo, hi)| members[lo..hi].to_vec())
                    .unwrap_or_default())
            }
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let mut guard = self.data.lock().unwrap();
        self.evict_if_expired(&mut guard, key);
        let entry = guard
            .entry(key.to_string())
            .or_insert_with(|| Entry { value: Value::Hash(HashMap::new()), expires_at: None });
        match &mut entry.value {
            Value::Hash(hash) => {
                let n = hash.entry(field.to_string()).or_insert(0);
                *n += delta;
                Ok(*n)
            }
            _ => Err(Self::wrong_type(key)),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut guard = self.data.lock().unwrap();
        self.evict_if_expired(&mut guard, key);
        match guard.get(key).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => {
                Ok(hash.iter().map(|(f, n)| (f.clone(), n.to_string())).collect())
            }
            Some(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut guard = self.data.lock().unwrap();
        self.evict_if_expired(&mut guard, key);
        Ok(guard.remove(key).is_some())
    }
}
