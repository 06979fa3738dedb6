mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{clocked_store, FailingStore};
use tallygate::{
    identity_key, Decision, FixedWindowLimiter, GateError, GateLayer, GateSubject,
    RateLimitConfig, TrafficClass,
};
use tower::{service_fn, ServiceExt};

fn small_config() -> RateLimitConfig {
    RateLimitConfig::new([TrafficClass::new("test", Duration::from_secs(10), 5)])
}

#[tokio::test]
async fn admits_up_to_limit_then_rejects_with_retry_after() {
    let (store, _clock) = clocked_store();
    let limiter = FixedWindowLimiter::new(store, small_config());

    // First five admitted with remaining descending 4,3,2,1,0.
    for expected_remaining in (0..5).rev() {
        let d = limiter.check("test", "user1").await;
        assert!(d.is_admitted());
        assert_eq!(d.remaining, expected_remaining);
        assert_eq!(d.limit, 5);
    }

    // Sixth rejected, retry-after within the 10s window.
    let d = limiter.check("test", "user1").await;
    assert!(!d.is_admitted());
    assert_eq!(d.remaining, 0);
    let retry = d.retry_after_secs().unwrap();
    assert!(retry > 0 && retry <= 10, "retry_after {} out of (0, 10]", retry);

    // A different identity still has a full quota.
    let d = limiter.check("test", "user2").await;
    assert!(d.is_admitted());
    assert_eq!(d.remaining, 4);
}

#[tokio::test]
async fn rejections_never_consume_quota() {
    let (store, _clock) = clocked_store();
    let limiter = FixedWindowLimiter::new(store.clone(), small_config());

    for _ in 0..5 {
        assert!(limiter.check("test", "user1").await.is_admitted());
    }

    // Hammer the exhausted window; the stored counter must not move.
    use tallygate::AccountingStore;
    let key = identity_key("test", "user1");
    let before = store.get(&key).await.unwrap();
    for _ in 0..6 {
        let d = limiter.check("test", "user1").await;
        assert!(!d.is_admitted());
        assert_eq!(d.remaining, 0);
    }
    let after = store.get(&key).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(after.as_deref(), Some("5"));
}

#[tokio::test]
async fn window_resets_after_ttl_expiry() {
    let (store, clock) = clocked_store();
    let limiter = FixedWindowLimiter::new(store, small_config());

    for _ in 0..5 {
        assert!(limiter.check("test", "user1").await.is_admitted());
    }
    assert!(!limiter.check("test", "user1").await.is_admitted());

    clock.advance(Duration::from_secs(10));

    let d = limiter.check("test", "user1").await;
    assert!(d.is_admitted());
    assert_eq!(d.remaining, 4);
}

#[tokio::test]
async fn quotas_are_independent_per_class() {
    let (store, _clock) = clocked_store();
    let config = RateLimitConfig::new([
        TrafficClass::new("a", Duration::from_secs(60), 1),
        TrafficClass::new("b", Duration::from_secs(60), 1),
    ]);
    let limiter = FixedWindowLimiter::new(store, config);

    assert!(limiter.check("a", "same-user").await.is_admitted());
    assert!(!limiter.check("a", "same-user").await.is_admitted());

    // Same identity, other class: untouched.
    assert!(limiter.check("b", "same-user").await.is_admitted());
}

#[tokio::test]
async fn fails_open_when_store_is_down() {
    let limiter = FixedWindowLimiter::new(Arc::new(FailingStore), small_config());

    // Far more requests than the limit; every one admitted.
    for _ in 0..20 {
        let d = limiter.check("test", "user1").await;
        assert!(d.is_admitted());
        assert_eq!(d.retry_after, None);
    }
}

#[tokio::test]
async fn unconfigured_class_admits_with_zeroed_quota_metadata() {
    let (store, _clock) = clocked_store();
    let limiter = FixedWindowLimiter::new(store, small_config());

    let decision = limiter.check("not-a-class", "user1").await;
    assert!(decision.is_admitted());
    // Zeroed metadata marks the check as unenforced; a header-emitting caller
    // must not advertise a ceiling that was never configured.
    assert_eq!(decision.limit, 0);
    assert_eq!(decision.remaining, 0);
    assert_eq!(decision.resets_in, std::time::Duration::ZERO);
    assert_eq!(decision.retry_after, None);
}

#[tokio::test]
async fn standard_classes_enforce_their_own_ceilings() {
    let (store, _clock) = clocked_store();
    let limiter = FixedWindowLimiter::new(store, RateLimitConfig::standard());

    for _ in 0..10 {
        assert!(limiter.check("auth", "10.0.0.1").await.is_admitted());
    }
    let d = limiter.check("auth", "10.0.0.1").await;
    assert!(!d.is_admitted());
    assert!(d.retry_after_secs().unwrap() <= 900);

    // The messaging class for the same identity is unaffected.
    let d = limiter.check("message", "10.0.0.1").await;
    assert!(d.is_admitted());
    assert_eq!(d.remaining, 49);
}

#[tokio::test]
async fn gate_layer_rejects_over_quota_requests() {
    let (store, _clock) = clocked_store();
    let limiter = FixedWindowLimiter::new(store, small_config());
    let layer =
        GateLayer::new(limiter, |req: &&'static str| Some(GateSubject::new("test", *req)));

    let service = service_fn(|req: &'static str| async move {
        Ok::<_, std::io::Error>(format!("handled {}", req))
    });

    use tower_layer::Layer;
    let gated = layer.layer(service);

    for _ in 0..5 {
        let response = gated.clone().oneshot("user1").await.unwrap();
        assert_eq!(response, "handled user1");
    }

    let err = gated.clone().oneshot("user1").await.unwrap_err();
    match err {
        GateError::Rejected(Decision { admitted, limit, retry_after, .. }) => {
            assert!(!admitted);
            assert_eq!(limit, 5);
            assert!(retry_after.is_some());
        }
        GateError::Inner(e) => panic!("expected rejection, got inner error: {}", e),
    }

    // Another subject passes straight through.
    let response = gated.clone().oneshot("user2").await.unwrap();
    assert_eq!(response, "handled user2");
}

#[tokio::test]
async fn gate_layer_exempts_requests_without_a_subject() {
    let (store, _clock) = clocked_store();
    let limiter = FixedWindowLimiter::new(
        store,
        RateLimitConfig::new([TrafficClass::new("test", Duration::from_secs(10), 1)]),
    );
    let layer = GateLayer::new(limiter, |_req: &&'static str| None::<GateSubject>);

    let service = service_fn(|_req: &'static str| async move { Ok::<_, std::io::Error>("ok") });

    use tower_layer::Layer;
    let gated = layer.layer(service);

    // Limit is 1, but exempt requests never consume it.
    for _ in 0..4 {
        assert_eq!(gated.clone().oneshot("anything").await.unwrap(), "ok");
    }
}
