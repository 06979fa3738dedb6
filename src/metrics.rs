//! Query telemetry: the performance record type and the best-effort recorder.
//!
//! One [`PerformanceRecord`] arrives per processed query. [`MetricsRecorder`]
//! fans it out into the accounting store — raw record, daily counters,
//! duration samples, slow-query ledger, popularity ranking — with every write
//! independent: a failing store call is logged and skipped, never allowed to
//! abort the remaining writes or to fail the caller. The outcome of the fan-out
//! is reported as a [`RecordOutcome`] even though most callers fire and forget.

use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::store::{bounded, AccountingStore, StoreError};

/// How a query's intent and parameters were extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Direct pattern match against known query shapes.
    Pattern,
    /// Model-assisted extraction.
    Model,
    /// Pattern match refined by the model.
    Hybrid,
    /// Served from the extraction cache.
    Cache,
}

impl ExtractionMethod {
    /// Stable label used in store hash fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Model => "model",
            Self::Hybrid => "hybrid",
            Self::Cache => "cache",
        }
    }

    /// Parse a stored label; unknown labels read as `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "pattern" => Some(Self::Pattern),
            "model" => Some(Self::Model),
            "hybrid" => Some(Self::Hybrid),
            "cache" => Some(Self::Cache),
            _ => None,
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified intent of a query.
///
/// Closed enumeration with an `Other` bucket: labels written by newer
/// producers still aggregate, they just surface under `Other` at report time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    /// Free-text search across records.
    Search,
    /// Direct lookup of a known entity.
    Lookup,
    /// Create a new entity.
    Create,
    /// Update an existing entity.
    Update,
    /// Delete an entity.
    Delete,
    /// Summary or report request.
    Summary,
    /// Help / capability question.
    Help,
    /// Anything unclassified.
    Other,
}

impl QueryIntent {
    /// Stable label used in store hash fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Lookup => "lookup",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Summary => "summary",
            Self::Help => "help",
            Self::Other => "other",
        }
    }

    /// Parse a stored label; anything unknown collapses to `Other`.
    pub fn from_label(label: &str) -> Self {
        match label {
            "search" => Self::Search,
            "lookup" => Self::Lookup,
            "create" => Self::Create,
            "update" => Self::Update,
            "delete" => Self::Delete,
            "summary" => Self::Summary,
            "help" => Self::Help,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for QueryIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable telemetry record per processed query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    /// The query text as received.
    pub query: String,
    /// Classified intent.
    pub intent: QueryIntent,
    /// How extraction was performed.
    pub method: ExtractionMethod,
    /// Time spent extracting intent/parameters, in milliseconds.
    pub extraction_ms: u64,
    /// Time spent searching, in milliseconds.
    pub search_ms: u64,
    /// Time spent formatting the response, in milliseconds.
    pub format_ms: u64,
    /// End-to-end time, in milliseconds.
    pub total_ms: u64,
    /// Number of results returned.
    pub result_count: u32,
    /// Classifier confidence in `[0, 1]`.
    pub confidence: f64,
    /// When the query completed.
    pub timestamp: DateTime<Utc>,
    /// Originating user, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Originating session, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl PerformanceRecord {
    /// UTC calendar day this record belongs to.
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// One entry of the slow-query ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowQueryEntry {
    /// The offending query text.
    pub query: String,
    /// End-to-end time, in milliseconds.
    pub total_ms: u64,
    /// Extraction method used.
    pub method: ExtractionMethod,
    /// When the query completed.
    pub timestamp: DateTime<Utc>,
}

/// Stable fingerprint of a query: truncated SHA-256 of the normalized text.
///
/// Used as the popularity-ranking member so raw text never becomes a sorted-set
/// key; 64 bits of digest is collision-tolerant at daily query volumes.
pub fn fingerprint(query: &str) -> String {
    let digest = Sha256::digest(normalize_query(query).as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        let _ = write!(&mut hex, "{:02x}", byte);
    }
    hex
}

/// Canonical form used for fingerprinting: lowercased, whitespace collapsed.
fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

// Store key scheme. All day-scoped keys carry the retention TTL.
pub(crate) fn daily_key(date: NaiveDate) -> String {
    format!("metrics:daily:{}", date)
}
pub(crate) fn durations_key(date: NaiveDate) -> String {
    format!("metrics:durations:{}", date)
}
pub(crate) fn slow_key(date: NaiveDate) -> String {
    format!("metrics:slow:{}", date)
}
pub(crate) fn popular_key(date: NaiveDate) -> String {
    format!("metrics:popular:{}", date)
}
pub(crate) fn querytext_key(date: NaiveDate, fp: &str) -> String {
    format!("metrics:querytext:{}:{}", date, fp)
}
fn record_key(date: NaiveDate, ts_millis: i64, fp: &str) -> String {
    format!("metrics:record:{}:{}:{}", date, ts_millis, fp)
}

pub(crate) const FIELD_TOTAL: &str = "total_queries";
pub(crate) const FIELD_SLOW: &str = "slow_queries";
pub(crate) const METHOD_PREFIX: &str = "method:";
pub(crate) const INTENT_PREFIX: &str = "intent:";

/// Tunables for the recorder and the reporting engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Queries slower than this are flagged and ledgered.
    pub slow_threshold: Duration,
    /// TTL applied to every day-scoped key.
    pub retention: Duration,
    /// Maximum entries kept in the slow-query ledger.
    pub ledger_cap: usize,
    /// Bound on any single store call.
    pub op_timeout: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            slow_threshold: Duration::from_millis(1000),
            retention: Duration::from_secs(7 * 24 * 3600),
            ledger_cap: 100,
            op_timeout: Duration::from_millis(200),
        }
    }
}

/// What actually happened to a record.
///
/// Callers on the request path typically ignore this — recording is
/// fire-and-forget — but the distinction exists so operators and tests can see
/// degradation instead of silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Every write landed.
    Recorded,
    /// Some writes failed; the rest landed.
    Partial {
        /// Number of failed fan-out steps.
        failed: usize,
    },
    /// Every write failed; the record left no trace in the store.
    Dropped,
}

impl RecordOutcome {
    /// Check if every write landed.
    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded)
    }
}

/// Counts fan-out steps and folds them into a [`RecordOutcome`].
#[derive(Default)]
struct Tally {
    attempted: usize,
    failed: usize,
}

impl Tally {
    fn track(&mut self, step: &'static str, result: Result<(), StoreError>) {
        self.attempted += 1;
        if let Err(err) = result {
            self.failed += 1;
            warn!(step, error = %err, "metrics write failed; continuing");
        }
    }

    fn outcome(self) -> RecordOutcome {
        match self.failed {
            0 => RecordOutcome::Recorded,
            n if n == self.attempted => RecordOutcome::Dropped,
            n => RecordOutcome::Partial { failed: n },
        }
    }
}

/// Best-effort telemetry recorder over an [`AccountingStore`].
#[derive(Debug, Clone)]
pub struct MetricsRecorder<S> {
    store: Arc<S>,
    config: MetricsConfig,
}

impl<S> MetricsRecorder<S>
where
    S: AccountingStore,
{
    /// Create a recorder with default tunables.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, MetricsConfig::default())
    }

    /// Create a recorder with explicit tunables.
    pub fn with_config(store: Arc<S>, config: MetricsConfig) -> Self {
        Self { store, config }
    }

    /// The active tunables.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Persist one performance record, best-effort.
    ///
    /// Emits a summary log line (and a warning when the query exceeded the
    /// slow threshold), then fans out into the store. Individual failures are
    /// logged and skipped; the aggregate result comes back as a
    /// [`RecordOutcome`]. This method never fails.
    pub async fn record(&self, record: &PerformanceRecord) -> RecordOutcome {
        let date = record.day();
        let fp = fingerprint(&record.query);
        let slow = record.total_ms > millis(self.config.slow_threshold);

        info!(
            query = %record.query,
            intent = %record.intent,
            method = %record.method,
            total_ms = record.total_ms,
            results = record.result_count,
            confidence = record.confidence,
            "query processed"
        );
        if slow {
            warn!(
                query = %record.query,
                total_ms = record.total_ms,
                threshold_ms = millis(self.config.slow_threshold),
                "slow query"
            );
        }

        let mut tally = Tally::default();
        tally.track("raw_record", self.store_raw(record, date, &fp).await);
        tally.track("daily_counters", self.bump_counters(record, date).await);
        tally.track("duration_sample", self.append_duration(record, date).await);
        if slow {
            tally.track("slow_ledger", self.track_slow(record, date).await);
        }
        tally.track("popularity", self.track_popularity(record, date, &fp).await);
        tally.track("daily_ttl", self.refresh_daily_ttl(date).await);
        tally.outcome()
    }

    async fn op<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        bounded(self.config.op_timeout, fut).await
    }

    async fn store_raw(
        &self,
        record: &PerformanceRecord,
        date: NaiveDate,
        fp: &str,
    ) -> Result<(), StoreError> {
        let Ok(json) = serde_json::to_string(record) else {
            // Serializing our own struct cannot realistically fail; skip the
            // raw copy rather than inventing a store error for it.
            return Ok(());
        };
        let key = record_key(date, record.timestamp.timestamp_millis(), fp);
        self.op(self.store.set_with_ttl(&key, &json, self.config.retention)).await
    }

    async fn bump_counters(
        &self,
        record: &PerformanceRecord,
        date: NaiveDate,
    ) -> Result<(), StoreError> {
        let daily = daily_key(date);
        self.op(self.store.hash_increment(&daily, FIELD_TOTAL, 1)).await?;
        let method_field = format!("{}{}", METHOD_PREFIX, record.method.as_str());
        self.op(self.store.hash_increment(&daily, &method_field, 1)).await?;
        let intent_field = format!("{}{}", INTENT_PREFIX, record.intent.as_str());
        self.op(self.store.hash_increment(&daily, &intent_field, 1)).await?;
        Ok(())
    }

    async fn append_duration(
        &self,
        record: &PerformanceRecord,
        date: NaiveDate,
    ) -> Result<(), StoreError> {
        let key = durations_key(date);
        self.op(self.store.list_push_front(&key, &record.total_ms.to_string())).await?;
        self.op(self.store.expire(&key, self.config.retention)).await?;
        Ok(())
    }

    async fn track_slow(
        &self,
        record: &PerformanceRecord,
        date: NaiveDate,
    ) -> Result<(), StoreError> {
        self.op(self.store.hash_increment(&daily_key(date), FIELD_SLOW, 1)).await?;

        let entry = SlowQueryEntry {
            query: record.query.clone(),
            total_ms: record.total_ms,
            method: record.method,
            timestamp: record.timestamp,
        };
        let Ok(json) = serde_json::to_string(&entry) else {
            return Ok(());
        };
        let key = slow_key(date);
        self.op(self.store.list_push_front(&key, &json)).await?;
        let cap = i64::try_from(self.config.ledger_cap).unwrap_or(i64::MAX);
        self.op(self.store.list_trim(&key, 0, cap - 1)).await?;
        self.op(self.store.expire(&key, self.config.retention)).await?;
        Ok(())
    }

    async fn track_popularity(
        &self,
        record: &PerformanceRecord,
        date: NaiveDate,
        fp: &str,
    ) -> Result<(), StoreError> {
        let key = popular_key(date);
        self.op(self.store.sorted_set_increment(&key, fp, 1.0)).await?;
        self.op(self.store.expire(&key, self.config.retention)).await?;
        self.op(self.store.set_with_ttl(
            &querytext_key(date, fp),
            &record.query,
            self.config.retention,
        ))
        .await?;
        Ok(())
    }

    /// Refresh the daily hash TTL so the aggregate never expires mid-day.
    async fn refresh_daily_ttl(&self, date: NaiveDate) -> Result<(), StoreError> {
        self.op(self.store.expire(&daily_key(date), self.config.retention)).await?;
        Ok(())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
