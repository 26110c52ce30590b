//! Integration tests for start coalescing, initialization, and login.

use std::sync::Arc;
use std::time::Duration;

use agent_bridge::{AppError, Bridge, BridgeConfig, BridgeStatus};

use super::test_helpers::{test_config, FakeLauncher, FakeOptions, LoginOutcome};

fn bridge(config: BridgeConfig, launcher: &Arc<FakeLauncher>) -> Bridge {
    Bridge::with_launcher(config, Arc::clone(launcher) as _)
}

// ── Start coalescing ─────────────────────────────────────────────────────────

/// Concurrent callers share a single spawn and a single `initialize`.
#[tokio::test]
async fn concurrent_ensure_started_spawns_once() {
    let launcher = FakeLauncher::new(FakeOptions::default());
    let bridge = bridge(test_config(), &launcher);

    let (a, b, c) = tokio::join!(
        bridge.ensure_started(),
        bridge.ensure_started(),
        bridge.ensure_started()
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());

    assert_eq!(launcher.launches(), 1, "exactly one process must be spawned");
    assert_eq!(launcher.requests("initialize").len(), 1);
    assert_eq!(launcher.requests("initialized").len(), 1);
}

/// Every caller coalesced onto a failing attempt sees the same failure.
#[tokio::test]
async fn concurrent_callers_share_a_failed_start() {
    let launcher = FakeLauncher::new(FakeOptions {
        silent_launches: 1,
        ..FakeOptions::default()
    });
    let config = BridgeConfig {
        init_timeout_ms: 200,
        ..test_config()
    };
    let bridge = bridge(config, &launcher);

    let (a, b, c) = tokio::join!(
        bridge.ensure_started(),
        bridge.ensure_started(),
        bridge.ensure_started()
    );
    let a = a.expect_err("silent agent");
    assert!(matches!(a, AppError::InitializationTimeout { .. }), "got {a:?}");
    assert_eq!(b.expect_err("same attempt"), a);
    assert_eq!(c.expect_err("same attempt"), a);

    assert_eq!(launcher.launches(), 1, "one attempt for all callers");
    assert_eq!(bridge.status().await, BridgeStatus::Stopped);
}

/// A caller that gives up on a start does not leave the bridge stuck in
/// `Starting`: the attempt still runs to its own timeout.
#[tokio::test]
async fn abandoned_start_caller_does_not_wedge_the_bridge() {
    let launcher = FakeLauncher::new(FakeOptions {
        silent_launches: 1,
        ..FakeOptions::default()
    });
    let config = BridgeConfig {
        init_timeout_ms: 300,
        ..test_config()
    };
    let bridge = bridge(config, &launcher);

    let gave_up = tokio::time::timeout(Duration::from_millis(50), bridge.ensure_started()).await;
    assert!(gave_up.is_err(), "caller must time out first");
    assert_eq!(bridge.status().await, BridgeStatus::Starting);

    let joined = tokio::time::timeout(Duration::from_secs(3), bridge.ensure_started())
        .await
        .expect("attempt must settle");
    assert!(
        matches!(joined, Err(AppError::InitializationTimeout { .. })),
        "got {joined:?}"
    );
    assert_eq!(bridge.status().await, BridgeStatus::Stopped);

    let outcome = tokio::time::timeout(Duration::from_secs(3), bridge.run_turn("hi", "/work/a"))
        .await
        .expect("turn must not hang")
        .expect("turn completes");
    assert_eq!(outcome.output, "reply: hi");
    assert_eq!(launcher.launches(), 2);
}

/// A started bridge returns immediately without respawning.
#[tokio::test]
async fn ensure_started_is_idempotent() {
    let launcher = FakeLauncher::new(FakeOptions::default());
    let bridge = bridge(test_config(), &launcher);

    assert_eq!(bridge.status().await, BridgeStatus::Stopped);
    bridge.ensure_started().await.expect("first start");
    bridge.ensure_started().await.expect("second start");

    assert_eq!(launcher.launches(), 1);
    assert_eq!(bridge.status().await, BridgeStatus::Ready);
}

/// `initialize` carries the client identity.
#[tokio::test]
async fn initialize_announces_client_info() {
    let launcher = FakeLauncher::new(FakeOptions::default());
    let bridge = bridge(test_config(), &launcher);
    bridge.ensure_started().await.expect("start");

    let (_, params) = launcher.requests("initialize").remove(0);
    assert_eq!(params["clientInfo"]["name"], "agent-bridge");
    assert!(params["clientInfo"]["version"].is_string());
}

// ── Initialization timeout ───────────────────────────────────────────────────

/// A silent agent fails the start with its stderr attached, and the next
/// call spawns a fresh process.
#[tokio::test]
async fn initialization_timeout_reports_stderr_and_allows_retry() {
    let launcher = FakeLauncher::new(FakeOptions {
        silent_launches: 1,
        ..FakeOptions::default()
    });
    let config = BridgeConfig {
        init_timeout_ms: 200,
        ..test_config()
    };
    let bridge = bridge(config, &launcher);

    let err = bridge.ensure_started().await.expect_err("silent agent");
    match err {
        AppError::InitializationTimeout { diagnostics } => {
            assert!(
                diagnostics.contains("model not ready"),
                "diagnostics must carry agent stderr, got {diagnostics:?}"
            );
        }
        other => panic!("expected InitializationTimeout, got {other:?}"),
    }
    assert_eq!(bridge.status().await, BridgeStatus::Stopped);

    bridge.ensure_started().await.expect("retry succeeds");
    assert_eq!(launcher.launches(), 2);
    assert_eq!(bridge.status().await, BridgeStatus::Ready);
}

// ── Spawn failure ────────────────────────────────────────────────────────────

/// A launcher error surfaces as `Spawn` and the next call launches again.
#[tokio::test]
async fn spawn_failure_is_reported_and_retried() {
    let launcher = FakeLauncher::new(FakeOptions {
        spawn_failures: 1,
        ..FakeOptions::default()
    });
    let bridge = bridge(test_config(), &launcher);

    let err = bridge.ensure_started().await.expect_err("launch fails");
    assert!(
        matches!(&err, AppError::Spawn(msg) if msg.contains("no such file")),
        "got {err:?}"
    );
    assert_eq!(bridge.status().await, BridgeStatus::Stopped);
    assert_eq!(launcher.launches(), 0);

    bridge.ensure_started().await.expect("retry succeeds");
    assert_eq!(launcher.attempts(), 2);
    assert_eq!(launcher.launches(), 1);
    assert_eq!(bridge.status().await, BridgeStatus::Ready);
}

// ── Login ────────────────────────────────────────────────────────────────────

/// An agent that does not require auth is never sent a login request.
#[tokio::test]
async fn login_skipped_when_not_required() {
    let launcher = FakeLauncher::new(FakeOptions::default());
    let bridge = bridge(test_config(), &launcher);
    bridge.ensure_started().await.expect("start");

    assert_eq!(launcher.requests("account/read").len(), 1);
    assert!(launcher.requests("account/login/start").is_empty());
}

/// Required login uses the configured API key.
#[tokio::test]
async fn login_sends_api_key_when_required() {
    let launcher = FakeLauncher::new(FakeOptions {
        requires_auth: true,
        ..FakeOptions::default()
    });
    let bridge = bridge(test_config(), &launcher);
    bridge.ensure_started().await.expect("login succeeds");

    let logins = launcher.requests("account/login/start");
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].1["type"], "apiKey");
    assert_eq!(logins[0].1["apiKey"], "sk-test");
}

/// Required login without a credential fails before anything is sent.
#[tokio::test]
async fn login_without_credential_fails() {
    let launcher = FakeLauncher::new(FakeOptions {
        requires_auth: true,
        ..FakeOptions::default()
    });
    let config = BridgeConfig {
        credential: None,
        ..test_config()
    };
    let bridge = bridge(config, &launcher);

    let err = bridge.ensure_started().await.expect_err("no credential");
    assert_eq!(err, AppError::MissingCredential);
    assert!(launcher.requests("account/login/start").is_empty());
    assert_eq!(bridge.status().await, BridgeStatus::Stopped);
}

/// A failed login completion rejects the start with the agent's reason.
#[tokio::test]
async fn login_rejection_is_reported() {
    let launcher = FakeLauncher::new(FakeOptions {
        requires_auth: true,
        login: LoginOutcome::Reject("invalid api key".into()),
        ..FakeOptions::default()
    });
    let bridge = bridge(test_config(), &launcher);

    let err = bridge.ensure_started().await.expect_err("rejected");
    assert_eq!(err, AppError::LoginRejected("invalid api key".into()));
}

/// No login completion within the login timeout.
#[tokio::test]
async fn login_completion_times_out() {
    let launcher = FakeLauncher::new(FakeOptions {
        requires_auth: true,
        login: LoginOutcome::Silent,
        ..FakeOptions::default()
    });
    let config = BridgeConfig {
        login_timeout_ms: 150,
        ..test_config()
    };
    let bridge = bridge(config, &launcher);

    let err = bridge.ensure_started().await.expect_err("silent login");
    assert_eq!(err, AppError::LoginTimeout);
}

// ── Shutdown ─────────────────────────────────────────────────────────────────

/// After shutdown no new turn can be queued.
#[tokio::test]
async fn shutdown_stops_the_bridge() {
    let launcher = FakeLauncher::new(FakeOptions::default());
    let bridge = bridge(test_config(), &launcher);
    bridge.ensure_started().await.expect("start");

    bridge.shutdown().await;

    assert_eq!(bridge.status().await, BridgeStatus::Stopped);
    let err = bridge
        .run_turn("hello", "/work/a")
        .await
        .expect_err("bridge is shut down");
    assert!(matches!(err, AppError::ProcessExited(_)), "got {err:?}");
}
