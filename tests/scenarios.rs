//! End-to-end behavior of the assembled subsystem over an in-process store.

use std::sync::Arc;
use std::time::Duration;

use gatekeeper::clock::{ManualClock, SharedClock};
use gatekeeper::config::GatekeeperConfig;
use gatekeeper::fingerprint::{self, RequestIdentity};
use gatekeeper::ratelimit::{LimitPolicy, PolicyTable, RateLimitKey, SCOPE_BY_IP};
use gatekeeper::resilience::CircuitState;
use gatekeeper::store::testing::FlakyStore;
use gatekeeper::store::MemoryStore;
use gatekeeper::Gatekeeper;

struct Node {
    gatekeeper: Gatekeeper,
    store: FlakyStore,
    clock: ManualClock,
}

fn node(config: GatekeeperConfig) -> Node {
    let clock = ManualClock::new(1_000_000);
    let shared: SharedClock = Arc::new(clock.clone());
    let store = FlakyStore::new(Arc::new(MemoryStore::with_clock(Arc::clone(&shared))));
    let gatekeeper = Gatekeeper::with_store(config, Arc::new(store.clone()), shared);
    Node {
        gatekeeper,
        store,
        clock,
    }
}

fn five_per_hour() -> GatekeeperConfig {
    let mut config = GatekeeperConfig::default();
    config.limits.policies = PolicyTable::with_default(LimitPolicy::fixed(5, Duration::from_secs(3600)))
        .with_scope(SCOPE_BY_IP, LimitPolicy::fixed(5, Duration::from_secs(3600)));
    config
}

fn browser(ip: &str, user_agent: &str) -> RequestIdentity {
    RequestIdentity::new(Some("10.0.0.1"))
        .with_header("X-Forwarded-For", format!("{ip}, 10.0.0.1"))
        .with_header("User-Agent", user_agent)
}

#[tokio::test]
async fn sixth_call_in_an_hour_is_denied_with_bounded_retry() {
    let node = node(five_per_hour());
    let caller = browser("198.51.100.4", "Mozilla/5.0");

    for _ in 0..5 {
        assert!(node.gatekeeper.check_request(&caller, "submission").await.allowed);
    }
    let denied = node.gatekeeper.check_request(&caller, "submission").await;
    assert!(!denied.allowed);
    assert!(denied.retry_after > Duration::ZERO);
    assert!(denied.retry_after_secs() <= 3600);

    // The new bucket starts fresh.
    node.clock.advance(denied.retry_after);
    assert!(node.gatekeeper.check_request(&caller, "submission").await.allowed);
}

#[tokio::test]
async fn store_timeout_falls_back_and_records_failure() {
    let mut config = five_per_hour();
    config.store.request_timeout_ms = 20;
    let node = node(config);
    let caller = browser("198.51.100.4", "Mozilla/5.0");

    assert!(node.gatekeeper.check_request(&caller, "submission").await.allowed);
    assert!(node.gatekeeper.check_request(&caller, "submission").await.allowed);

    node.store.set_delay(Some(Duration::from_millis(200)));
    let third = node.gatekeeper.check_request(&caller, "submission").await;
    assert!(third.allowed);
    // The fallback counts from zero.
    assert_eq!(third.remaining, 4);

    let metrics = node.gatekeeper.limiter().breaker().metrics();
    assert_eq!(metrics.failed_calls, 1);
    assert_eq!(metrics.state, CircuitState::Closed);
}

#[tokio::test]
async fn distinct_fingerprints_do_not_interfere() {
    let node = node(five_per_hour());
    let callers = [
        browser("198.51.100.4", "Mozilla/5.0"),
        browser("198.51.100.5", "Mozilla/5.0"),
        browser("198.51.100.4", "curl/8.0"),
    ];

    let mut tasks = Vec::new();
    for caller in callers.iter().cloned() {
        for _ in 0..8 {
            let gatekeeper = node.gatekeeper.clone();
            let caller = caller.clone();
            tasks.push(tokio::spawn(async move {
                let allowed = gatekeeper.check_request(&caller, "submission").await.allowed;
                (fingerprint::derive(&caller), allowed)
            }));
        }
    }

    let mut admitted = std::collections::HashMap::new();
    for result in futures::future::join_all(tasks).await {
        let (fp, allowed) = result.unwrap();
        *admitted.entry(fp.to_string()).or_insert(0u32) += u32::from(allowed);
    }
    assert_eq!(admitted.len(), 3);
    assert!(admitted.values().all(|&n| n == 5));
}

#[test]
fn fingerprint_is_stable_across_header_paths() {
    let via_proxy = RequestIdentity::new(Some("10.0.0.1"))
        .with_header("X-Forwarded-For", "203.0.113.9")
        .with_header("User-Agent", "Mozilla/5.0");
    let via_real_ip = RequestIdentity::new(Some("10.0.0.2"))
        .with_header("X-Real-IP", "203.0.113.9")
        .with_header("User-Agent", "Mozilla/5.0");
    let direct = RequestIdentity::new(Some("203.0.113.9")).with_header("User-Agent", "Mozilla/5.0");

    let fp = fingerprint::derive(&via_proxy);
    assert_eq!(fp, fingerprint::derive(&via_real_ip));
    assert_eq!(fp, fingerprint::derive(&direct));
    assert_ne!(fp, fingerprint::derive(&browser("203.0.113.9", "curl/8.0")));
}

#[test]
fn sliding_policy_holds_across_bucket_boundary() {
    let node = node(GatekeeperConfig::default());
    let key = RateLimitKey::new(SCOPE_BY_IP, "fp", "upload");
    let policy = LimitPolicy::sliding(3, Duration::from_secs(60));
    let limiter = node.gatekeeper.limiter();

    tokio_test::block_on(async {
        // Move to 2s before a minute boundary.
        node.clock.set(3_598_000);
        for _ in 0..3 {
            assert!(limiter.is_allowed_with(&key, &policy).await);
        }
        node.clock.advance(Duration::from_secs(4));
        assert!(!limiter.is_allowed_with(&key, &policy).await);
        assert_eq!(limiter.usage_with(&key, &policy).await, 3);
    });
}

#[tokio::test]
async fn lock_is_exclusive_across_nodes_sharing_a_store() {
    let clock = ManualClock::new(1_000_000);
    let shared: SharedClock = Arc::new(clock.clone());
    let store = Arc::new(MemoryStore::with_clock(Arc::clone(&shared)));
    let node_a = Gatekeeper::with_store(GatekeeperConfig::default(), store.clone(), Arc::clone(&shared));
    let node_b = Gatekeeper::with_store(GatekeeperConfig::default(), store, shared);

    assert!(node_a.lock().acquire("nightly-cleanup", "a", Duration::from_secs(30)).await);
    assert!(!node_b.lock().acquire("nightly-cleanup", "b", Duration::from_secs(30)).await);
    assert!(!node_b.lock().release("nightly-cleanup", "b").await);

    clock.advance(Duration::from_secs(30));
    assert!(node_b.lock().acquire("nightly-cleanup", "b", Duration::from_secs(30)).await);
    assert!(!node_a.lock().release("nightly-cleanup", "a").await);
    assert!(node_b.lock().release("nightly-cleanup", "b").await);
}

#[tokio::test]
async fn breaker_opens_and_recovers_end_to_end() {
    let mut config = five_per_hour();
    config.breaker.minimum_calls = 2;
    config.breaker.sliding_window_size = 2;
    config.breaker.half_open_trials = 1;
    config.breaker.wait_duration_ms = 5_000;
    let node = node(config);
    let caller = browser("198.51.100.4", "Mozilla/5.0");

    node.store.set_failing(true);
    node.gatekeeper.check_request(&caller, "submission").await;
    node.gatekeeper.check_request(&caller, "submission").await;
    assert_eq!(node.gatekeeper.limiter().breaker().state(), CircuitState::Open);

    let calls = node.store.calls();
    assert!(node.gatekeeper.check_request(&caller, "submission").await.allowed);
    assert_eq!(node.store.calls(), calls);

    node.store.set_failing(false);
    node.clock.advance(Duration::from_secs(5));
    assert!(node.gatekeeper.check_request(&caller, "submission").await.allowed);
    assert_eq!(node.gatekeeper.limiter().breaker().state(), CircuitState::Closed);
}
