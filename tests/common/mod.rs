//! Shared fakes and builders for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tallygate::{
    AccountingStore, ExtractionMethod, InMemoryStore, ManualClock, PerformanceRecord, QueryIntent,
    StoreError,
};

/// A store whose every operation fails, for fail-open / drop-path tests.
#[derive(Debug, Default, Clone)]
pub struct FailingStore;

impl FailingStore {
    fn down<T>() -> Result<T, StoreError> {
        Err(StoreError::Unavailable("injected outage".into()))
    }
}

#[async_trait]
impl AccountingStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Self::down()
    }
    async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), StoreError> {
        Self::down()
    }
    async fn increment(&self, _key: &str) -> Result<i64, StoreError> {
        Self::down()
    }
    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Self::down()
    }
    async fn ttl(&self, _key: &str) -> Result<Option<Duration>, StoreError> {
        Self::down()
    }
    async fn list_push_front(&self, _key: &str, _value: &str) -> Result<u64, StoreError> {
        Self::down()
    }
    async fn list_trim(&self, _key: &str, _start: i64, _stop: i64) -> Result<(), StoreError> {
        Self::down()
    }
    async fn list_range(&self, _key: &str, _start: i64, _stop: i64) -> Result<Vec<String>, StoreError> {
        Self::down()
    }
    async fn sorted_set_increment(
        &self,
        _key: &str,
        _member: &str,
        _delta: f64,
    ) -> Result<f64, StoreError> {
        Self::down()
    }
    async fn sorted_set_top(
        &self,
        _key: &str,
        _start: i64,
        _stop: i64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        Self::down()
    }
    async fn hash_increment(&self, _key: &str, _field: &str, _delta: i64) -> Result<i64, StoreError> {
        Self::down()
    }
    async fn hash_get_all(&self, _key: &str) -> Result<HashMap<String, String>, StoreError> {
        Self::down()
    }
    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        Self::down()
    }
}

/// In-memory store pinned to a manual clock starting mid-day on 2024-01-01.
pub fn clocked_store() -> (Arc<InMemoryStore>, ManualClock) {
    let clock = ManualClock::new(start_of_test_time());
    let store = Arc::new(InMemoryStore::with_clock(Arc::new(clock.clone())));
    (store, clock)
}

/// 2024-01-01T12:00:00Z in epoch millis.
pub fn start_of_test_time() -> u64 {
    u64::try_from(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap().timestamp_millis()).unwrap()
}

pub fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

/// A record with sensible defaults; tweak fields at the call site.
pub fn query_record(
    query: &str,
    method: ExtractionMethod,
    total_ms: u64,
    timestamp: DateTime<Utc>,
) -> PerformanceRecord {
    PerformanceRecord {
        query: query.to_string(),
        intent: QueryIntent::Search,
        method,
        extraction_ms: total_ms / 4,
        search_ms: total_ms / 2,
        format_ms: total_ms / 4,
        total_ms,
        result_count: 1,
        confidence: 0.9,
        timestamp,
        user_id: Some("u-test".into()),
        session_id: None,
    }
}
