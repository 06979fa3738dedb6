//! Daily aggregation and reporting over the recorded telemetry.
//!
//! Reads what [`crate::metrics::MetricsRecorder`] accumulated for a calendar
//! day and derives percentiles, method and intent breakdowns, the popularity
//! ranking, and the recent slow-query list. Everything here is off the request
//! path and read-mostly; store failures degrade to "no data" (`None`), never
//! to an error the caller has to handle, and a single malformed ledger entry
//! is skipped rather than sinking the whole report.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::warn;

use crate::metrics::{
    daily_key, durations_key, popular_key, querytext_key, slow_key, ExtractionMethod,
    MetricsConfig, QueryIntent, SlowQueryEntry, FIELD_SLOW, FIELD_TOTAL, INTENT_PREFIX,
    METHOD_PREFIX,
};
use crate::store::{bounded, AccountingStore, StoreError};

/// Popularity entries included in a daily report.
const TOP_QUERY_COUNT: i64 = 10;
/// Slow-ledger entries included in a daily report.
const SLOW_DISPLAY_COUNT: i64 = 20;

// Per-phase raw samples are not retained, so phase averages are estimated as
// fixed shares of the mean total. An approximation inherited from the system
// being instrumented, kept for report compatibility.
const EXTRACTION_SHARE: f64 = 0.3;
const SEARCH_SHARE: f64 = 0.5;
const FORMAT_SHARE: f64 = 0.2;

/// Per-method usage counters for one day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MethodUsage {
    /// Direct pattern matches.
    pub pattern: u64,
    /// Model-assisted extractions.
    pub model: u64,
    /// Hybrid extractions.
    pub hybrid: u64,
    /// Cache hits.
    pub cache: u64,
}

impl MethodUsage {
    fn slot(&mut self, method: ExtractionMethod) -> &mut u64 {
        match method {
            ExtractionMethod::Pattern => &mut self.pattern,
            ExtractionMethod::Model => &mut self.model,
            ExtractionMethod::Hybrid => &mut self.hybrid,
            ExtractionMethod::Cache => &mut self.cache,
        }
    }

    /// Count for one method.
    pub fn count(&self, method: ExtractionMethod) -> u64 {
        match method {
            ExtractionMethod::Pattern => self.pattern,
            ExtractionMethod::Model => self.model,
            ExtractionMethod::Hybrid => self.hybrid,
            ExtractionMethod::Cache => self.cache,
        }
    }
}

/// Derived metrics for one calendar day.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedMetrics {
    /// The day covered.
    pub date: NaiveDate,
    /// Total queries recorded.
    pub total_queries: u64,
    /// Queries over the slow threshold.
    pub slow_queries: u64,
    /// Mean total time, ms.
    pub avg_total_ms: f64,
    /// Estimated mean extraction time, ms (fixed share of the total mean).
    pub avg_extraction_ms: f64,
    /// Estimated mean search time, ms (fixed share of the total mean).
    pub avg_search_ms: f64,
    /// Estimated mean formatting time, ms (fixed share of the total mean).
    pub avg_format_ms: f64,
    /// Median total time, ms (nearest-rank).
    pub p50_ms: u64,
    /// 95th percentile total time, ms (nearest-rank).
    pub p95_ms: u64,
    /// 99th percentile total time, ms (nearest-rank).
    pub p99_ms: u64,
    /// Per-method usage counts.
    pub method_usage: MethodUsage,
    /// Per-intent counts; unknown stored labels aggregate under
    /// [`QueryIntent::Other`].
    pub intent_breakdown: BTreeMap<QueryIntent, u64>,
}

/// One entry of the popularity ranking, fingerprint resolved back to text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopularQuery {
    /// Display text (the fingerprint itself when the text mapping expired).
    pub text: String,
    /// Occurrences within the day.
    pub count: u64,
}

/// A full day's report: aggregates plus the two ledgers.
#[derive(Debug, Clone, Serialize)]
pub struct DailyReport {
    /// Derived aggregate metrics.
    pub metrics: AggregatedMetrics,
    /// Most popular queries, descending by count.
    pub top_queries: Vec<PopularQuery>,
    /// Most recent slow queries, newest first.
    pub recent_slow: Vec<SlowQueryEntry>,
}

/// Nearest-rank percentile over an ascending-sorted sample array.
///
/// For percentile `p` in `(0, 100]` the result is the value at index
/// `ceil(p/100 * n) - 1`, clamped into the array; `percentile(d, 100)` is the
/// maximum. Exact, not interpolated. Returns `None` on an empty array.
pub fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let rank = (p / 100.0 * n as f64).ceil() as i64 - 1;
    let index = rank.clamp(0, n as i64 - 1) as usize;
    Some(sorted[index])
}

/// Read-side engine deriving reports from the accounting store.
#[derive(Debug, Clone)]
pub struct ReportEngine<S> {
    store: Arc<S>,
    config: MetricsConfig,
}

impl<S> ReportEngine<S>
where
    S: AccountingStore,
{
    /// Create an engine with default tunables.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, MetricsConfig::default())
    }

    /// Create an engine with explicit tunables (must match the recorder's).
    pub fn with_config(store: Arc<S>, config: MetricsConfig) -> Self {
        Self { store, config }
    }

    /// Aggregate metrics for `date`.
    ///
    /// `None` when no queries were recorded that day — and also when the
    /// store is unreachable, which is logged and deliberately
    /// indistinguishable from "no data" for callers.
    pub async fn aggregated_metrics(&self, date: NaiveDate) -> Option<AggregatedMetrics> {
        match self.try_aggregate(date).await {
            Ok(metrics) => metrics,
            Err(err) => {
                warn!(%date, error = %err, "aggregation read failed; reporting no data");
                None
            }
        }
    }

    async fn try_aggregate(&self, date: NaiveDate) -> Result<Option<AggregatedMetrics>, StoreError> {
        let fields = self.op(self.store.hash_get_all(&daily_key(date))).await?;
        let total_queries = parse_count(fields.get(FIELD_TOTAL));
        if total_queries == 0 {
            return Ok(None);
        }

        let raw = self.op(self.store.list_range(&durations_key(date), 0, -1)).await?;
        let mut samples: Vec<u64> = raw.iter().filter_map(|s| s.parse().ok()).collect();
        samples.sort_unstable();

        let avg_total_ms = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<u64>() as f64 / samples.len() as f64
        };

        let mut method_usage = MethodUsage::default();
        let mut intent_breakdown: BTreeMap<QueryIntent, u64> = BTreeMap::new();
        for (field, value) in &fields {
            if let Some(label) = field.strip_prefix(METHOD_PREFIX) {
                if let Some(method) = ExtractionMethod::from_label(label) {
                    *method_usage.slot(method) += parse_count(Some(value));
                }
            } else if let Some(label) = field.strip_prefix(INTENT_PREFIX) {
                *intent_breakdown.entry(QueryIntent::from_label(label)).or_insert(0) +=
                    parse_count(Some(value));
            }
        }

        Ok(Some(AggregatedMetrics {
            date,
            total_queries,
            slow_queries: parse_count(fields.get(FIELD_SLOW)),
            avg_total_ms,
            avg_extraction_ms: avg_total_ms * EXTRACTION_SHARE,
            avg_search_ms: avg_total_ms * SEARCH_SHARE,
            avg_format_ms: avg_total_ms * FORMAT_SHARE,
            p50_ms: percentile(&samples, 50.0).unwrap_or(0),
            p95_ms: percentile(&samples, 95.0).unwrap_or(0),
            p99_ms: percentile(&samples, 99.0).unwrap_or(0),
            method_usage,
            intent_breakdown,
        }))
    }

    /// Full report for `date`: aggregates, top queries, recent slow queries.
    /// `None` when no aggregate exists for the date.
    pub async fn daily_report(&self, date: NaiveDate) -> Option<DailyReport> {
        let metrics = self.aggregated_metrics(date).await?;
        let top_queries = self.top_queries(date).await;
        let recent_slow = self.recent_slow(date).await;
        Some(DailyReport { metrics, top_queries, recent_slow })
    }

    async fn top_queries(&self, date: NaiveDate) -> Vec<PopularQuery> {
        let ranked = match self
            .op(self.store.sorted_set_top(&popular_key(date), 0, TOP_QUERY_COUNT - 1))
            .await
        {
            Ok(ranked) => ranked,
            Err(err) => {
                warn!(%date, error = %err, "popularity read failed; omitting top queries");
                return Vec::new();
            }
        };

        let mut out = Vec::with_capacity(ranked.len());
        for (fp, score) in ranked {
            // Fall back to the fingerprint when the text mapping expired.
            let text = self
                .op(self.store.get(&querytext_key(date, &fp)))
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| fp.clone());
            out.push(PopularQuery { text, count: score.max(0.0) as u64 });
        }
        out
    }

    async fn recent_slow(&self, date: NaiveDate) -> Vec<SlowQueryEntry> {
        let raw = match self
            .op(self.store.list_range(&slow_key(date), 0, SLOW_DISPLAY_COUNT - 1))
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                warn!(%date, error = %err, "slow ledger read failed; omitting slow queries");
                return Vec::new();
            }
        };

        raw.iter()
            .filter_map(|json| match serde_json::from_str(json) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    // Corrupted entries are skipped, never fatal to the report.
                    warn!(%date, error = %err, "skipping malformed slow ledger entry");
                    None
                }
            })
            .collect()
    }

    /// Reports for every day in `[start, end]`, oldest first, skipping days
    /// with no data.
    pub async fn metrics_for_range(&self, start: NaiveDate, end: NaiveDate) -> Vec<DailyReport> {
        let mut reports = Vec::new();
        let mut day = start;
        while day <= end {
            if let Some(report) = self.daily_report(day).await {
                reports.push(report);
            }
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        reports
    }

    /// Delete all stored state for `date`: the daily aggregate, the duration
    /// samples, the slow ledger, and the popularity ranking. Intended for
    /// test isolation; the per-fingerprint text keys are left to TTL expiry.
    pub async fn clear_metrics(&self, date: NaiveDate) -> Result<(), StoreError> {
        self.op(self.store.delete(&daily_key(date))).await?;
        self.op(self.store.delete(&durations_key(date))).await?;
        self.op(self.store.delete(&slow_key(date))).await?;
        self.op(self.store.delete(&popular_key(date))).await?;
        Ok(())
    }

    async fn op<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        bounded(self.config.op_timeout, fut).await
    }
}

/// Render a report as fixed-order human-readable text.
///
/// Section order: overall metrics, percentile table, method distribution,
/// intent breakdown, slow-query list, top-query list. All percentage math is
/// guarded against a zero total so rendering can never panic on its own.
pub fn format_report(report: &DailyReport) -> String {
    use std::fmt::Write as _;

    let m = &report.metrics;
    let total = m.total_queries;
    let mut out = String::new();

    let _ = writeln!(out, "=== Daily Query Report: {} ===", m.date);
    let _ = writeln!(out);
    let _ = writeln!(out, "Overall:");
    let _ = writeln!(out, "  total queries:  {}", total);
    let _ = writeln!(out, "  slow queries:   {} ({:.1}%)", m.slow_queries, pct(m.slow_queries, total));
    let _ = writeln!(out, "  avg total time: {:.1} ms", m.avg_total_ms);
    let _ = writeln!(out);
    let _ = writeln!(out, "Percentiles (total time):");
    let _ = writeln!(out, "  p50: {} ms", m.p50_ms);
    let _ = writeln!(out, "  p95: {} ms", m.p95_ms);
    let _ = writeln!(out, "  p99: {} ms", m.p99_ms);
    let _ = writeln!(out);
    let _ = writeln!(out, "Estimated phase averages:");
    let _ = writeln!(out, "  extraction: {:.1} ms", m.avg_extraction_ms);
    let _ = writeln!(out, "  search:     {:.1} ms", m.avg_search_ms);
    let _ = writeln!(out, "  formatting: {:.1} ms", m.avg_format_ms);
    let _ = writeln!(out);
    let _ = writeln!(out, "Method distribution:");
    for method in [
        ExtractionMethod::Pattern,
        ExtractionMethod::Model,
        ExtractionMethod::Hybrid,
        ExtractionMethod::Cache,
    ] {
        let count = m.method_usage.count(method);
        let _ = writeln!(out, "  {:<8} {} ({:.1}%)", method.as_str(), count, pct(count, total));
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Intent breakdown:");
    for (intent, count) in &m.intent_breakdown {
        let _ = writeln!(out, "  {:<8} {} ({:.1}%)", intent.as_str(), count, pct(*count, total));
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Slow queries (most recent {}):", report.recent_slow.len());
    for entry in &report.recent_slow {
        let _ = writeln!(
            out,
            "  {} ms  [{}]  \"{}\"  at {}",
            entry.total_ms,
            entry.method.as_str(),
            entry.query,
            entry.timestamp.format("%H:%M:%S")
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Top queries:");
    for popular in &report.top_queries {
        let _ = writeln!(out, "  {}x  \"{}\"", popular.count, popular.text);
    }
    out
}

fn pct(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

fn parse_count(raw: Option<&String>) -> u64 {
    raw.and_then(|s| s.parse().ok()).unwrap_or(0)
}
