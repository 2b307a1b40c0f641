mod common;

use azure_redis_auth::common::{AuthError, IdentityError, ReauthenticationError};
use azure_redis_auth::config::{RefreshDue, RefreshPolicy};
use azure_redis_auth::events::{
    ConnectionReauthenticationFailed, TokenEvents, TokenRefreshFailed, TokenRefreshed,
};
use azure_redis_auth::token::AcquireOutcome;
use azure_redis_auth::{TokenAuthEngine, TokenAuthEngineBuilder};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use claims::{assert_err, assert_ok, assert_some};
use common::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Lets tests move the refresh predicate's notion of "now" forward without
/// waiting on the wall clock.
#[derive(Clone, Default)]
struct SimulatedClock {
    offset_secs: Arc<AtomicI64>,
}

impl SimulatedClock {
    fn advance(&self, seconds: i64) {
        self.offset_secs.fetch_add(seconds, Ordering::SeqCst);
    }

    /// Refresh after 75% of the lifetime, evaluated against simulated time.
    fn refresh_due(&self) -> RefreshDue {
        let offset = self.offset_secs.clone();
        RefreshDue::Custom(Arc::new(move |acquired, expires| {
            let now = Utc::now() + ChronoDuration::seconds(offset.load(Ordering::SeqCst));
            RefreshDue::LifetimeElapsed { fraction: 0.75 }.should_refresh_at(acquired, expires, now)
        }))
    }
}

fn fast_policy() -> RefreshPolicy {
    RefreshPolicy::default()
        .with_max_attempts(3)
        .with_backoff(|_, _| Duration::ZERO)
}

struct Harness {
    engine: TokenAuthEngine,
    refreshed: Recorder<TokenRefreshed>,
    refresh_failed: Recorder<TokenRefreshFailed>,
    reauthenticated: Recorder<String>,
    reauth_failed: Recorder<ConnectionReauthenticationFailed>,
}

async fn start_engine(backend: Arc<FakeBackend>, policy: RefreshPolicy) -> Harness {
    let events = Arc::new(TokenEvents::new());
    let refreshed = Recorder::default();
    let refresh_failed = Recorder::default();
    let reauthenticated = Recorder::default();
    let reauth_failed = Recorder::default();

    let recorder = refreshed.clone();
    events.on_token_refreshed(move |event| recorder.record(event.clone()));
    let recorder = refresh_failed.clone();
    events.on_token_refresh_failed(move |event| recorder.record(event.clone()));
    let recorder = reauthenticated.clone();
    events.on_connection_reauthenticated(move |event| recorder.record(event.endpoint.clone()));
    let recorder = reauth_failed.clone();
    events.on_connection_reauthentication_failed(move |event| recorder.record(event.clone()));

    let engine = TokenAuthEngineBuilder::new(backend)
        .principal_id("principal-oid")
        .policy(policy)
        .events(events)
        .start()
        .await
        .unwrap();

    Harness {
        engine,
        refreshed,
        refresh_failed,
        reauthenticated,
        reauth_failed,
    }
}

mod token_lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_initial_acquisition_failure_is_returned() {
        let backend = FakeBackend::new(vec![unavailable(), unavailable(), unavailable()]);

        let result = TokenAuthEngineBuilder::new(backend.clone())
            .principal_id("principal-oid")
            .policy(fast_policy())
            .start()
            .await;

        assert!(matches!(
            result,
            Err(AuthError::Identity(IdentityError::Service { status: 503, .. }))
        ));
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_invalid_policy_is_rejected_before_any_request() {
        let backend = FakeBackend::new(vec![]);

        let result = TokenAuthEngineBuilder::new(backend.clone())
            .policy(RefreshPolicy::default().with_max_attempts(0))
            .start()
            .await;

        assert!(matches!(result, Err(AuthError::Configuration(_))));
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let result = TokenAuthEngineBuilder::new(FakeBackend::new(vec![])).build();
        assert!(matches!(result, Err(AuthError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_transient_failures_then_success_emit_one_refresh() {
        let backend = FakeBackend::new(vec![
            unavailable(),
            unavailable(),
            token("t1", expiring_in(60)),
        ]);

        let harness = start_engine(backend, fast_policy()).await;

        assert_eq!(harness.refreshed.len(), 1);
        assert_eq!(harness.refresh_failed.len(), 0);
        let credential = assert_some!(harness.engine.credential());
        assert_eq!(credential.username.as_deref(), Some("principal-oid"));
        assert_eq!(credential.password.as_str(), "t1");
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_current_token() {
        let t1 = expiring_in(60);
        let backend = FakeBackend::new(vec![
            token("t1", t1),
            unavailable(),
            unavailable(),
            unavailable(),
        ]);
        let harness = start_engine(backend, fast_policy()).await;

        let outcome = assert_ok!(harness.engine.acquire_token(false).await);

        assert_eq!(outcome, AcquireOutcome::Failed);
        assert_eq!(harness.engine.token_expiry(), t1);
        let failures = harness.refresh_failed.items();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].current_expiry, Some(t1));
    }

    #[tokio::test]
    async fn test_stale_cache_hit_is_discarded() {
        let t1 = expiring_in(120);
        let backend = FakeBackend::new(vec![token("t1", t1), token("cached", expiring_in(60))]);
        let harness = start_engine(backend, fast_policy()).await;

        let outcome = assert_ok!(harness.engine.acquire_token(false).await);

        assert_eq!(outcome, AcquireOutcome::Unchanged);
        assert_eq!(harness.engine.token_expiry(), t1);
        assert_eq!(harness.refreshed.len(), 1);
    }

    #[tokio::test]
    async fn test_credential_returns_expired_token_and_refreshes_in_background() {
        let backend = FakeBackend::new(vec![token("expired", expiring_in(-5))]);
        let harness = start_engine(backend.clone(), fast_policy()).await;
        let gate = backend.hold();

        let started = std::time::Instant::now();
        let credential = assert_some!(harness.engine.credential());

        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(credential.password.as_str(), "expired");

        gate.notify_one();
        let refreshed = tokio::time::timeout(Duration::from_secs(5), async {
            while harness.engine.token_expiry() <= Utc::now() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        assert_ok!(refreshed);
        assert_eq!(backend.calls(), 2);
        assert_ne!(
            assert_some!(harness.engine.credential()).password.as_str(),
            "expired"
        );
    }
}

mod reauthentication {
    use super::*;

    #[tokio::test]
    async fn test_refresh_reauthenticates_every_connection() {
        let clock = SimulatedClock::default();
        let t1 = expiring_in(60);
        let t2 = expiring_in(120);
        let backend = FakeBackend::new(vec![token("t1", t1), token("t2", t2)]);
        let harness = start_engine(
            backend,
            fast_policy().with_refresh_due(clock.refresh_due()),
        )
        .await;

        let primary = FakeEndpoint::new("primary:6380");
        let replica = FakeEndpoint::new("replica:6380");
        let first = FakeConnection::new("first", vec![primary.clone()]);
        let second = FakeConnection::new("second", vec![replica.clone()]);
        let first_id = harness
            .engine
            .on_connection_established(&as_connection(&first))
            .await;
        let second_id = harness
            .engine
            .on_connection_established(&as_connection(&second))
            .await;

        // Not due yet: nothing to do.
        assert!(harness.engine.ensure_authentication().await);
        assert_eq!(primary.auth_count(), 0);

        clock.advance(45);
        assert!(harness.engine.ensure_authentication().await);

        assert_eq!(harness.engine.token_expiry(), t2);
        assert_eq!(harness.refreshed.len(), 2);
        for endpoint in [&primary, &replica] {
            assert_eq!(
                endpoint.last_auth(),
                Some(("principal-oid".to_string(), "t2".to_string()))
            );
        }
        assert_eq!(harness.engine.authenticated_expiry(first_id).await, Some(t2));
        assert_eq!(harness.engine.authenticated_expiry(second_id).await, Some(t2));
        assert_eq!(harness.reauthenticated.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_endpoint_is_retried_on_next_heartbeat() {
        let clock = SimulatedClock::default();
        let t1 = expiring_in(60);
        let t2 = expiring_in(120);
        let backend = FakeBackend::new(vec![token("t1", t1), token("t2", t2)]);
        let harness = start_engine(
            backend.clone(),
            fast_policy().with_refresh_due(clock.refresh_due()),
        )
        .await;

        let flaky = FakeEndpoint::new("flaky:6380");
        let healthy = FakeEndpoint::new("healthy:6380");
        flaky.reply_with([AuthReply::Fail]);
        let connection = FakeConnection::new("cluster", vec![flaky.clone(), healthy.clone()]);
        let id = harness
            .engine
            .on_connection_established(&as_connection(&connection))
            .await;

        clock.advance(45);
        harness.engine.ensure_authentication().await;

        assert_eq!(harness.engine.token_expiry(), t2);
        assert_eq!(harness.engine.authenticated_expiry(id).await, Some(t1));
        let failures = harness.reauth_failed.items();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].endpoint, "flaky:6380");
        assert_eq!(harness.reauthenticated.items(), vec!["healthy:6380".to_string()]);

        harness.engine.ensure_authentication().await;

        assert_eq!(backend.calls(), 2);
        assert_eq!(harness.engine.authenticated_expiry(id).await, Some(t2));
        assert_eq!(harness.reauth_failed.len(), 1);
        assert_eq!(flaky.auth_count(), 2);
        assert!(harness.reauthenticated.items().contains(&"flaky:6380".to_string()));
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Outcome {
        Failed(String),
        Reauthenticated(String),
    }

    #[tokio::test]
    async fn test_single_endpoint_fails_then_recovers_in_order() {
        let clock = SimulatedClock::default();
        let t1 = expiring_in(60);
        let t2 = expiring_in(120);
        let backend = FakeBackend::new(vec![token("t1", t1), token("t2", t2)]);
        let harness = start_engine(
            backend,
            fast_policy().with_refresh_due(clock.refresh_due()),
        )
        .await;

        let outcomes = Recorder::default();
        let recorder = outcomes.clone();
        harness.engine.events().on_connection_reauthentication_failed(move |event| {
            recorder.record(Outcome::Failed(event.endpoint.clone()))
        });
        let recorder = outcomes.clone();
        harness.engine.events().on_connection_reauthenticated(move |event| {
            recorder.record(Outcome::Reauthenticated(event.endpoint.clone()))
        });

        let endpoint = FakeEndpoint::new("c:6380");
        endpoint.reply_with([AuthReply::Fail]);
        let connection = FakeConnection::new("c", vec![endpoint.clone()]);
        let id = harness
            .engine
            .on_connection_established(&as_connection(&connection))
            .await;

        clock.advance(45);
        harness.engine.ensure_authentication().await;

        assert_eq!(outcomes.items(), vec![Outcome::Failed("c:6380".to_string())]);
        assert_eq!(harness.engine.authenticated_expiry(id).await, Some(t1));

        harness.engine.ensure_authentication().await;

        assert_eq!(
            outcomes.items(),
            vec![
                Outcome::Failed("c:6380".to_string()),
                Outcome::Reauthenticated("c:6380".to_string()),
            ]
        );
        assert_eq!(harness.engine.authenticated_expiry(id).await, Some(t2));
    }

    #[tokio::test]
    async fn test_immediate_retries_recover_within_one_pass() {
        let clock = SimulatedClock::default();
        let t2 = expiring_in(120);
        let backend = FakeBackend::new(vec![token("t1", expiring_in(60)), token("t2", t2)]);
        let mut policy = fast_policy().with_refresh_due(clock.refresh_due());
        policy.immediate_reauthentication_retries = 1;
        let harness = start_engine(backend, policy).await;

        let flaky = FakeEndpoint::new("flaky:6380");
        flaky.reply_with([AuthReply::Fail]);
        let connection = FakeConnection::new("cluster", vec![flaky.clone()]);
        let id = harness
            .engine
            .on_connection_established(&as_connection(&connection))
            .await;

        clock.advance(45);
        harness.engine.ensure_authentication().await;

        assert_eq!(flaky.auth_count(), 2);
        assert_eq!(harness.reauth_failed.len(), 0);
        assert_eq!(harness.engine.authenticated_expiry(id).await, Some(t2));
    }

    #[tokio::test]
    async fn test_dropped_connection_is_pruned() {
        let clock = SimulatedClock::default();
        let backend = FakeBackend::new(vec![token("t1", expiring_in(60))]);
        let harness = start_engine(backend, fast_policy().with_refresh_due(clock.refresh_due())).await;

        let endpoint = FakeEndpoint::new("gone:6380");
        let connection = FakeConnection::new("gone", vec![endpoint.clone()]);
        harness
            .engine
            .on_connection_established(&as_connection(&connection))
            .await;
        drop(connection);

        clock.advance(45);
        harness.engine.ensure_authentication().await;

        assert_eq!(endpoint.auth_count(), 0);
        assert_eq!(harness.engine.connection_count().await, 0);
        assert_eq!(harness.reauth_failed.len(), 0);
    }

    #[tokio::test]
    async fn test_disposed_connection_is_pruned() {
        let clock = SimulatedClock::default();
        let backend = FakeBackend::new(vec![token("t1", expiring_in(60))]);
        let harness = start_engine(backend, fast_policy().with_refresh_due(clock.refresh_due())).await;

        let disposed = FakeConnection::new("disposed", vec![FakeEndpoint::new("a:6380")]);
        let mid_auth_endpoint = FakeEndpoint::new("b:6380");
        mid_auth_endpoint.reply_with([AuthReply::Disposed]);
        let disposed_during_auth = FakeConnection::new("closing", vec![mid_auth_endpoint.clone()]);
        harness
            .engine
            .on_connection_established(&as_connection(&disposed))
            .await;
        harness
            .engine
            .on_connection_established(&as_connection(&disposed_during_auth))
            .await;
        disposed.dispose();

        clock.advance(45);
        harness.engine.ensure_authentication().await;
        assert_eq!(harness.engine.connection_count().await, 0);

        harness.engine.acquire_token(false).await.unwrap();
        harness.engine.ensure_authentication().await;

        assert_eq!(disposed.server_lookups(), 1);
        assert_eq!(mid_auth_endpoint.auth_count(), 1);
        assert_eq!(harness.reauth_failed.len(), 0);
    }

    #[tokio::test]
    async fn test_disconnected_endpoint_is_skipped() {
        let clock = SimulatedClock::default();
        let t2 = expiring_in(120);
        let backend = FakeBackend::new(vec![token("t1", expiring_in(60)), token("t2", t2)]);
        let harness = start_engine(backend, fast_policy().with_refresh_due(clock.refresh_due())).await;

        let online = FakeEndpoint::new("online:6380");
        let offline = FakeEndpoint::new("offline:6380");
        offline.set_connected(false);
        let connection = FakeConnection::new("cluster", vec![online.clone(), offline.clone()]);
        let id = harness
            .engine
            .on_connection_established(&as_connection(&connection))
            .await;

        clock.advance(45);
        harness.engine.ensure_authentication().await;

        assert_eq!(online.auth_count(), 1);
        assert_eq!(offline.auth_count(), 0);
        assert_eq!(harness.engine.authenticated_expiry(id).await, Some(t2));
    }

    #[tokio::test]
    async fn test_panicking_endpoint_is_contained() {
        let clock = SimulatedClock::default();
        let t1 = expiring_in(60);
        let backend = FakeBackend::new(vec![token("t1", t1)]);
        let harness = start_engine(backend, fast_policy().with_refresh_due(clock.refresh_due())).await;

        let endpoint = FakeEndpoint::new("broken:6380");
        endpoint.reply_with([AuthReply::Panic]);
        let connection = FakeConnection::new("broken", vec![endpoint.clone()]);
        let id = harness
            .engine
            .on_connection_established(&as_connection(&connection))
            .await;

        clock.advance(45);
        assert!(harness.engine.ensure_authentication().await);

        let failures = harness.reauth_failed.items();
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].error,
            ReauthenticationError::Panicked("broken".to_string())
        );
        assert_eq!(harness.engine.authenticated_expiry(id).await, Some(t1));

        // The engine keeps working after the panic.
        assert!(harness.engine.ensure_authentication().await);
        assert_eq!(endpoint.auth_count(), 2);
    }

    #[tokio::test]
    async fn test_hanging_subscriber_does_not_stall_reauthentication() {
        let clock = SimulatedClock::default();
        let events = Arc::new(TokenEvents::with_handler_timeout(Duration::from_millis(100)));
        events.on_connection_reauthenticated(|_| std::thread::sleep(Duration::from_secs(2)));
        let backend = FakeBackend::new(vec![token("t1", expiring_in(60))]);
        let engine = TokenAuthEngineBuilder::new(backend)
            .principal_id("principal-oid")
            .policy(fast_policy().with_refresh_due(clock.refresh_due()))
            .events(events)
            .start()
            .await
            .unwrap();

        let connection = FakeConnection::new("slow-subscriber", vec![FakeEndpoint::new("a:6380")]);
        engine
            .on_connection_established(&as_connection(&connection))
            .await;

        clock.advance(45);
        let started = std::time::Instant::now();
        engine.ensure_authentication().await;

        assert!(started.elapsed() < Duration::from_secs(1));
    }
}

mod concurrency {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlapping_checks_are_dropped() {
        let backend = FakeBackend::new(vec![token("t1", expiring_in(-1))]);
        let harness = start_engine(backend.clone(), fast_policy()).await;
        let gate = backend.hold();

        let engine = harness.engine.clone();
        let first = tokio::spawn(async move { engine.ensure_authentication().await });
        while backend.calls() < 2 {
            tokio::task::yield_now().await;
        }

        assert!(!harness.engine.ensure_authentication().await);

        gate.notify_one();
        assert!(assert_ok!(first.await));
        assert_eq!(backend.calls(), 2);
        assert!(harness.engine.ensure_authentication().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_passes_keep_tags_consistent() {
        let backend = FakeBackend::new(vec![token("t1", expiring_in(60))]);
        let harness = start_engine(backend, fast_policy()).await;

        let connections: Vec<_> = (0..8)
            .map(|i| {
                FakeConnection::new(
                    &format!("client-{i}"),
                    vec![FakeEndpoint::new(&format!("node-{i}:6380"))],
                )
            })
            .collect();
        let mut ids = Vec::new();
        for connection in &connections {
            // Tracked as authenticated with an older token.
            ids.push(
                harness
                    .engine
                    .on_connection_established(&as_connection(connection))
                    .await,
            );
        }
        let outcome = harness.engine.acquire_token(false).await.unwrap();
        assert!(matches!(outcome, AcquireOutcome::Refreshed { .. }));
        let expiry = harness.engine.token_expiry();

        let passes: Vec<_> = (0..4)
            .map(|_| {
                let engine = harness.engine.clone();
                tokio::spawn(async move { engine.reauthenticate_all().await })
            })
            .collect();
        for pass in passes {
            assert_ok!(pass.await);
        }

        for id in ids {
            assert_eq!(harness.engine.authenticated_expiry(id).await, Some(expiry));
        }
        assert!(harness.reauthenticated.len() >= connections.len());
    }
}

mod heartbeat {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_runs_while_connections_are_managed() {
        let backend = FakeBackend::new(vec![]);
        let policy = RefreshPolicy::default()
            .with_heartbeat_interval(Duration::from_secs(10))
            .with_refresh_due(RefreshDue::Custom(Arc::new(|_, _| true)));
        let engine = TokenAuthEngineBuilder::new(backend.clone())
            .principal_id("principal-oid")
            .policy(policy)
            .start()
            .await
            .unwrap();
        assert!(!engine.is_heartbeat_running().await);

        let endpoint = FakeEndpoint::new("primary:6380");
        let connection = FakeConnection::new("client", vec![endpoint.clone()]);
        let id = engine
            .on_connection_established(&as_connection(&connection))
            .await;
        assert!(engine.is_heartbeat_running().await);

        tokio::time::sleep(Duration::from_secs(25)).await;

        assert_eq!(backend.calls(), 3);
        assert_eq!(endpoint.auth_count(), 2);

        assert!(engine.stop_managing(id).await);
        assert!(!engine.is_heartbeat_running().await);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_after_last_connection_is_dropped() {
        let backend = FakeBackend::new(vec![]);
        let policy = RefreshPolicy::default().with_heartbeat_interval(Duration::from_secs(10));
        let engine = TokenAuthEngineBuilder::new(backend.clone())
            .principal_id("principal-oid")
            .policy(policy)
            .start()
            .await
            .unwrap();

        let connection = FakeConnection::new("client", vec![FakeEndpoint::new("a:6380")]);
        engine
            .on_connection_established(&as_connection(&connection))
            .await;
        drop(connection);

        tokio::time::sleep(Duration::from_secs(15)).await;

        assert_eq!(engine.connection_count().await, 0);
        assert!(!engine.is_heartbeat_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_heartbeat_for_good() {
        let backend = FakeBackend::new(vec![]);
        let policy = RefreshPolicy::default()
            .with_heartbeat_interval(Duration::from_secs(10))
            .with_refresh_due(RefreshDue::Custom(Arc::new(|_, _| true)));
        let engine = TokenAuthEngineBuilder::new(backend.clone())
            .principal_id("principal-oid")
            .policy(policy)
            .start()
            .await
            .unwrap();
        let connection = FakeConnection::new("client", vec![FakeEndpoint::new("a:6380")]);
        engine
            .on_connection_established(&as_connection(&connection))
            .await;

        engine.shutdown().await;
        let other = FakeConnection::new("other", vec![FakeEndpoint::new("b:6380")]);
        engine.on_connection_established(&as_connection(&other)).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(!engine.is_heartbeat_running().await);
        assert_eq!(backend.calls(), 1);
    }
}

#[tokio::test]
async fn test_expiry_before_first_acquisition_is_minimum() {
    let engine = assert_ok!(TokenAuthEngineBuilder::new(FakeBackend::new(vec![])).build());

    assert_eq!(engine.token_expiry(), DateTime::<Utc>::MIN_UTC);
    assert!(engine.credential().is_none());
    assert_err!(engine.acquire_token(true).await);
}
