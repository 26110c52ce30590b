//! Integration tests for agent exit handling and full state reset.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use agent_bridge::{AppError, Bridge, BridgeStatus};

use super::test_helpers::{test_config, wait_until, FakeLauncher, FakeOptions, GUIDANCE};

/// An exit while a turn is in flight fails that turn with `ProcessExited`.
#[tokio::test]
async fn crash_during_turn_rejects_it() {
    let options = FakeOptions::default();
    options.auto_complete.store(false, Ordering::SeqCst);
    let launcher = FakeLauncher::new(options);
    let bridge = Bridge::with_launcher(test_config(), Arc::clone(&launcher) as _);

    let ticket = bridge.submit("long task", "/work/a").expect("submit");
    wait_until("turn/start", || launcher.requests("turn/start").len() == 1).await;

    launcher.agent(1).crash(137);

    let err = ticket.wait().await.expect_err("turn must fail");
    assert!(
        matches!(&err, AppError::ProcessExited(reason) if reason.contains("137")),
        "got {err:?}"
    );
    assert_eq!(bridge.status().await, BridgeStatus::Stopped);
}

/// After an exit the next turn respawns, re-initialises, creates a new thread
/// for the same directory, and seeds it again.
#[tokio::test]
async fn next_turn_after_crash_starts_from_scratch() {
    let launcher = FakeLauncher::new(FakeOptions::default());
    let bridge = Bridge::with_launcher(test_config(), Arc::clone(&launcher) as _);

    let before = bridge.run_turn("hello", "/work/a").await.expect("turn 1");
    assert_eq!(before.thread_id, "thread-1-1");

    launcher.agent(1).crash(1);
    let mut stopped = false;
    for _ in 0..400 {
        if bridge.status().await == BridgeStatus::Stopped {
            stopped = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert!(stopped, "bridge must notice the exit");

    let after = bridge.run_turn("hello again", "/work/a").await.expect("turn 2");

    assert_eq!(launcher.launches(), 2);
    assert_eq!(launcher.requests("initialize").len(), 2);
    assert_eq!(after.thread_id, "thread-2-1", "bindings must not survive the exit");

    let threads = launcher.requests("thread/start");
    assert_eq!(threads.len(), 2);
    assert_eq!(threads[1].0, 2, "second thread/start goes to the new process");

    let input = launcher.turn_input(1);
    assert_eq!(input.len(), 2, "seed markers must not survive the exit");
    assert!(input[0].starts_with(GUIDANCE));
}

/// Events from a process that already exited never reach the new one's turn.
#[tokio::test]
async fn output_from_a_dead_process_is_ignored() {
    let options = FakeOptions::default();
    options.auto_complete.store(false, Ordering::SeqCst);
    let launcher = FakeLauncher::new(options);
    let bridge = Bridge::with_launcher(test_config(), Arc::clone(&launcher) as _);

    let first = bridge.submit("one", "/work/a").expect("submit 1");
    wait_until("turn/start", || launcher.requests("turn/start").len() == 1).await;
    let old = launcher.agent(1);
    old.crash(1);
    assert!(first.wait().await.is_err());

    let second = bridge.submit("two", "/work/a").expect("submit 2");
    wait_until("turn/start on launch 2", || {
        launcher.requests("turn/start").iter().any(|(launch, _)| *launch == 2)
    })
    .await;

    old.finish_turn("ghost", "completed").await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(bridge.status().await, BridgeStatus::Busy);

    launcher.agent(2).finish_turn("fresh", "completed").await;
    let outcome = second.wait().await.expect("second completes");
    assert_eq!(outcome.output, "fresh");
}
