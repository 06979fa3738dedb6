#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tallygate
//!
//! Request accounting for conversational backends: per-identity fixed-window
//! rate limiting across configurable traffic classes, plus best-effort query
//! telemetry with daily aggregation and reporting. Both sides share one
//! externally-persisted accounting store (atomic counters, TTL expiry,
//! bounded lists, score-ordered sets) reached through a single injected trait.
//!
//! ## Design stance
//!
//! - **Never on the critical path's error path.** The limiter fails open on
//!   store trouble and the recorder logs-and-drops; the only thing allowed to
//!   short-circuit a request is an intentional quota rejection.
//! - **No in-process authoritative state.** All counters and ledgers live in
//!   the store, mutated only through its atomic primitives, so any number of
//!   processes sharing a store enforce one quota and one aggregate.
//! - **Approximate where the source is approximate.** The fixed-window
//!   check-then-increment race and the estimated per-phase timings are
//!   documented properties, not bugs.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tallygate::{FixedWindowLimiter, InMemoryStore, RateLimitConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(InMemoryStore::new());
//!     let limiter = FixedWindowLimiter::new(store, RateLimitConfig::standard());
//!
//!     let decision = limiter.check("message", "+15551234567").await;
//!     assert!(decision.is_admitted());
//!     assert_eq!(decision.remaining, 49);
//! }
//! ```

pub mod clock;
pub mod metrics;
pub mod rate_limit;
pub mod report;
pub mod store;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use metrics::{
    fingerprint, ExtractionMethod, MetricsConfig, MetricsRecorder, PerformanceRecord, QueryIntent,
    RecordOutcome, SlowQueryEntry,
};
pub use rate_limit::{
    identity_key, Decision, FixedWindowLimiter, GateError, GateLayer, GateService,
    RateLimitConfig, TrafficClass,
};
pub use rate_limit::middleware::GateSubject;
pub use report::{
    format_report, percentile, AggregatedMetrics, DailyReport, MethodUsage, PopularQuery,
    ReportEngine,
};
pub use store::memory::InMemoryStore;
pub use store::{AccountingStore, StoreError};
