//! Unit tests for `AppError` display and conversions.

use agent_bridge::AppError;

#[test]
fn display_uses_category_prefix() {
    assert_eq!(AppError::Config("bad".into()).to_string(), "config: bad");
    assert_eq!(
        AppError::RpcTimeout {
            method: "thread/start".into()
        }
        .to_string(),
        "rpc timeout: no response to thread/start"
    );
    assert_eq!(
        AppError::Rpc {
            method: "turn/start".into(),
            message: "unknown thread".into()
        }
        .to_string(),
        "rpc: turn/start failed: unknown thread"
    );
    assert_eq!(
        AppError::ProcessExited("process exited with code 1".into()).to_string(),
        "process exited: process exited with code 1"
    );
}

#[test]
fn initialization_timeout_mentions_stderr_when_present() {
    let with = AppError::InitializationTimeout {
        diagnostics: "panic: no model".into(),
    };
    let without = AppError::InitializationTimeout {
        diagnostics: String::new(),
    };

    assert_eq!(
        with.to_string(),
        "initialization timeout: agent stderr: panic: no model"
    );
    assert_eq!(
        without.to_string(),
        "initialization timeout: no agent stderr captured"
    );
}

#[test]
fn turn_timeout_counts_events() {
    let err = AppError::TurnTimeout {
        events: vec!["turn/started turn=t".into(), "item/agentMessage/delta (3 chars)".into()],
    };
    assert_eq!(err.to_string(), "turn timeout: 2 event(s) received");
}

#[test]
fn io_errors_convert() {
    let err: AppError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed").into();
    assert_eq!(err, AppError::Io("pipe closed".into()));
}

#[test]
fn errors_are_std_errors() {
    fn assert_error<E: std::error::Error + Send + Sync + 'static>(_: &E) {}
    assert_error(&AppError::MissingCredential);
    assert!(AppError::MissingCredential
        .to_string()
        .starts_with("missing credential"));
}
