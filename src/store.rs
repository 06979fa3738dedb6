//! Accounting store: the shared external state both the rate limiter and the
//! metrics pipeline depend on.
//!
//! The [`AccountingStore`] trait exposes exactly the primitives the consumers
//! need — atomic counters with TTL expiry, bounded lists, score-ordered sets,
//! and counter hashes — so any key-value store offering those (Redis being the
//! obvious backend) can sit behind it. [`memory::InMemoryStore`] is the
//! reference implementation and the substitute used in tests.
//!
//! Failures surface as [`StoreError`], a distinguishable infrastructure error
//! that callers must never confuse with a business rejection. The store does
//! not retry internally; the callers in this crate deliberately choose not to
//! retry either (the limiter fails open, the recorder logs and drops).

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

pub mod memory;

/// Infrastructure errors from the accounting store.
///
/// Always non-fatal to the request path: the rate limiter fails open and the
/// metrics pipeline logs and drops on any of these.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or refused the operation.
    #[error("accounting store unavailable: {0}")]
    Unavailable(String),
    /// The operation did not complete within the caller's deadline.
    #[error("accounting store operation timed out after {0:?}")]
    Timeout(Duration),
    /// The key exists but holds a value of a different kind.
    #[error("value at key `{key}` has an unexpected type")]
    WrongType {
        /// The offending key.
        key: String,
    },
}

impl StoreError {
    /// Check if this error is a deadline elapse.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Check if this error is a reachability failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Key-value store primitives required by the limiter and the metrics pipeline.
///
/// Semantics follow the Redis commands they map onto: list indices may be
/// negative (counted from the tail, `-1` being the last element), sorted-set
/// reads are score-descending, and `increment` creates missing keys at zero.
/// No operation retries internally; every failure is surfaced as a
/// [`StoreError`].
#[async_trait]
pub trait AccountingStore: Send + Sync {
    /// Fetch the string value at `key`, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set `key` to `value`, replacing any previous value, expiring after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Atomically increment the counter at `key` by one, creating it at zero
    /// first if absent. Returns the post-increment value.
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    /// Set or refresh the TTL of an existing key. Returns `false` if the key
    /// does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining time to live of `key`: `None` if the key is absent or has no
    /// expiry set.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Push `value` onto the front of the list at `key`, creating the list if
    /// absent. Returns the new list length.
    async fn list_push_front(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Trim the list at `key` to the inclusive index range `[start, stop]`.
    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> Result<(), StoreError>;

    /// Read the inclusive index range `[start, stop]` of the list at `key`.
    /// An absent key reads as an empty list.
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;

    /// Atomically add `delta` to `member`'s score in the sorted set at `key`,
    /// creating set and member as needed. Returns the new score.
    async fn sorted_set_increment(
        &self,
        key: &str,
        member: &str,
        delta: f64,
    ) -> Result<f64, StoreError>;

    /// Read members of the sorted set at `key` ordered by descending score,
    /// inclusive rank range `[start, stop]` (`0` is the highest score).
    async fn sorted_set_top(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, StoreError>;

    /// Atomically add `delta` to the integer `field` of the hash at `key`,
    /// creating hash and field as needed. Returns the new field value.
    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    /// Read every field of the hash at `key`. An absent key reads as empty.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Delete `key`. Returns `true` if a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// Bound a store call by `deadline` so a degraded backend cannot stall the
/// request path. Elapse maps to [`StoreError::Timeout`].
pub async fn bounded<T, F>(deadline: Duration, op: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(deadline, op).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_predicates() {
        let timeout = StoreError::Timeout(Duration::from_millis(200));
        assert!(timeout.is_timeout());
        assert!(!timeout.is_unavailable());

        let down = StoreError::Unavailable("connection refused".into());
        assert!(down.is_unavailable());
        assert!(!down.is_timeout());
    }

    #[test]
    fn error_display_names_the_key() {
        let err = StoreError::WrongType { key: "metrics:daily:2024-01-01".into() };
        assert!(err.to_string().contains("metrics:daily:2024-01-01"));
    }

    #[tokio::test]
    async fn bounded_passes_through_fast_ops() {
        let result = bounded(Duration::from_millis(200), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_maps_elapse_to_timeout() {
        let result: Result<(), _> = bounded(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(result.unwrap_err().is_timeout());
    }
}
