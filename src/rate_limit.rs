//! Fixed-window rate limiting over the accounting store.
//!
//! This module provides the building blocks for request gating:
//! - [`TrafficClass`] / [`RateLimitConfig`]: per-class window configuration.
//! - [`FixedWindowLimiter`]: the `check` decision function.
//! - [`Decision`]: admit/reject plus everything a caller-facing layer needs
//!   for `X-RateLimit-*` and `Retry-After` headers.
//! - [`middleware::GateLayer`]: tower middleware that enforces the limit.
//!
//! # Algorithm
//!
//! Fixed-window counting, one store counter per `(class, identity)` pair. The
//! counter is created by the first admitted request in a window and destroyed
//! by TTL expiry; rejected requests never touch it.
//!
//! The read-then-increment sequence is not one atomic transaction, so two
//! concurrent requests racing at the boundary can admit up to one request
//! beyond `max_requests` before the next check observes the updated count.
//! That is a documented property of this limiter, not a bug: the counter
//! itself stays exact because all mutation goes through the store's atomic
//! increment.
//!
//! # Failure policy
//!
//! Fail open. If the store is unreachable or slow, the request is admitted,
//! the error is logged, and no counter is touched — availability of the
//! primary pipeline outranks strict quota enforcement.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::{bounded, AccountingStore, StoreError};

pub mod middleware;
pub use middleware::{GateError, GateLayer, GateService};

/// Default bound on any single store call made by the limiter.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(200);

/// One independently limited traffic class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficClass {
    /// Class tag; becomes part of the identity key, so distinct classes never
    /// share counters.
    pub name: String,
    /// Window length. The counter's TTL.
    pub window: Duration,
    /// Admissions allowed per window.
    pub max_requests: u32,
}

impl TrafficClass {
    /// Define a traffic class.
    pub fn new(name: impl Into<String>, window: Duration, max_requests: u32) -> Self {
        Self { name: name.into(), window, max_requests }
    }
}

/// The set of traffic classes the limiter enforces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    classes: HashMap<String, TrafficClass>,
}

impl RateLimitConfig {
    /// Build a config from any collection of classes.
    pub fn new(classes: impl IntoIterator<Item = TrafficClass>) -> Self {
        Self { classes: classes.into_iter().map(|c| (c.name.clone(), c)).collect() }
    }

    /// The four classes shipped out of the box: a high-volume per-caller
    /// messaging class, a moderate per-user search class, a tight per-address
    /// auth class, and a coarse per-address global backstop.
    pub fn standard() -> Self {
        Self::new([
            TrafficClass::new("message", Duration::from_secs(3600), 50),
            TrafficClass::new("search", Duration::from_secs(3600), 30),
            TrafficClass::new("auth", Duration::from_secs(900), 10),
            TrafficClass::new("ip_global", Duration::from_secs(3600), 1000),
        ])
    }

    /// Look up a class by name.
    pub fn class(&self, name: &str) -> Option<&TrafficClass> {
        self.classes.get(name)
    }

    /// Names of all configured classes, in no particular order.
    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }
}

/// Derive the store key for a `(class, identity)` pair.
///
/// Pure and side-effect-free; the class tag is embedded so keys from different
/// classes can never collide.
pub fn identity_key(class: &str, identity: &str) -> String {
    format!("ratelimit:{}:{}", class, identity)
}

/// The outcome of a rate limit check.
///
/// Carries the full quota picture in both outcomes so a caller-facing layer
/// can always populate `X-RateLimit-Limit`, `X-RateLimit-Remaining`,
/// `X-RateLimit-Reset`, and (on rejection) `Retry-After`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub admitted: bool,
    /// The class's quota ceiling.
    pub limit: u32,
    /// Admissions left in the current window after this check.
    pub remaining: u32,
    /// Time until the current window's counter expires.
    pub resets_in: Duration,
    /// How long a rejected caller should wait before retrying. `None` when
    /// admitted.
    pub retry_after: Option<Duration>,
}

impl Decision {
    fn admitted(limit: u32, remaining: u32, resets_in: Duration) -> Self {
        Self { admitted: true, limit, remaining, resets_in, retry_after: None }
    }

    fn rejected(limit: u32, resets_in: Duration) -> Self {
        Self {
            admitted: false,
            limit,
            remaining: 0,
            resets_in,
            retry_after: Some(Duration::from_secs(ceil_secs(resets_in))),
        }
    }

    /// Decision issued when the store is unreachable: admit, report the full
    /// quota, assume a fresh window. The true counter is unreadable.
    fn fail_open(limit: u32, window: Duration) -> Self {
        Self::admitted(limit, limit, window)
    }

    /// Decision issued when no traffic class matches: admit with zeroed quota
    /// metadata. `limit == 0` on an admitted decision marks the check as
    /// unenforced, so header-emitting callers can skip the `X-RateLimit-*`
    /// set instead of advertising a made-up ceiling.
    fn unlimited() -> Self {
        Self { admitted: true, limit: 0, remaining: 0, resets_in: Duration::ZERO, retry_after: None }
    }

    /// Helper to check if admitted.
    pub fn is_admitted(&self) -> bool {
        self.admitted
    }

    /// Seconds a rejected caller should wait, rounded up. `None` when admitted.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(ceil_secs)
    }
}

/// Round a duration up to whole seconds so `Retry-After: 0` is never emitted
/// for a live window.
fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Fixed-window rate limiter over an [`AccountingStore`].
///
/// Stateless per decision: all window state lives in the store, so any number
/// of limiter instances (or processes) sharing a store enforce one quota.
#[derive(Debug, Clone)]
pub struct FixedWindowLimiter<S> {
    store: Arc<S>,
    config: RateLimitConfig,
    op_timeout: Duration,
}

impl<S> FixedWindowLimiter<S>
where
    S: AccountingStore,
{
    /// Create a limiter over `store` enforcing `config`.
    pub fn new(store: Arc<S>, config: RateLimitConfig) -> Self {
        Self { store, config, op_timeout: DEFAULT_OP_TIMEOUT }
    }

    /// Override the per-store-call deadline.
    pub fn with_op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// The enforced configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check the quota for `identity` under `class` and consume one admission
    /// if allowed.
    ///
    /// Never fails: store errors admit the request (fail open), and an
    /// unconfigured class admits with a warning — nothing in this subsystem
    /// is allowed to fail the primary pipeline.
    pub async fn check(&self, class: &str, identity: &str) -> Decision {
        let Some(cfg) = self.config.class(class) else {
            warn!(class, "rate limit check for unconfigured traffic class; admitting");
            return Decision::unlimited();
        };

        match self.try_check(cfg, identity).await {
            Ok(decision) => {
                debug!(
                    class,
                    identity,
                    admitted = decision.admitted,
                    remaining = decision.remaining,
                    "rate limit decision"
                );
                decision
            }
            Err(err) => {
                warn!(class, identity, error = %err, "rate limit store error; failing open");
                Decision::fail_open(cfg.max_requests, cfg.window)
            }
        }
    }

    async fn try_check(&self, cfg: &TrafficClass, identity: &str) -> Result<Decision, StoreError> {
        let key = identity_key(&cfg.name, identity);

        let count = match bounded(self.op_timeout, self.store.get(&key)).await? {
            Some(raw) => raw.parse::<u32>().unwrap_or(0),
            None => 0,
        };

        if count >= cfg.max_requests {
            // Rejected requests are not counted against the window.
            let resets_in =
                bounded(self.op_timeout, self.store.ttl(&key)).await?.unwrap_or(cfg.window);
            return Ok(Decision::rejected(cfg.max_requests, resets_in));
        }

        let new_count = bounded(self.op_timeout, self.store.increment(&key)).await?;
        let resets_in = if new_count == 1 {
            // This increment created the key: start the window.
            bounded(self.op_timeout, self.store.expire(&key, cfg.window)).await?;
            cfg.window
        } else {
            // Mid-window admit; the TTL read is best-effort since the
            // admission is already consumed.
            bounded(self.op_timeout, self.store.ttl(&key)).await.ok().flatten().unwrap_or(cfg.window)
        };

        let used = u32::try_from(new_count).unwrap_or(u32::MAX);
        Ok(Decision::admitted(cfg.max_requests, cfg.max_requests.saturating_sub(used), resets_in))
    }
}
