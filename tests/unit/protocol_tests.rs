//! Unit tests for JSON-RPC message shapes and inbound parsing.

use std::path::Path;

use serde_json::json;

use agent_bridge::protocol::{
    parse_inbound_line, thread_id_from, thread_start_params, turn_id_from, turn_start_params,
    AccountStatus, Incoming, InputItem, Outgoing, ServerNotification, METHOD_NOT_FOUND,
};
use agent_bridge::AppError;

// ── Outbound ─────────────────────────────────────────────────────────────────

#[test]
fn request_serializes_with_integer_id() {
    let request = Outgoing::Request {
        id: 7,
        method: "thread/start".into(),
        params: thread_start_params(Path::new("/work/a"), "never", "workspace-write"),
    };

    assert_eq!(
        request.to_value(),
        json!({
            "id": 7,
            "method": "thread/start",
            "params": {
                "cwd": "/work/a",
                "approvalPolicy": "never",
                "sandbox": "workspace-write",
            }
        })
    );
}

#[test]
fn notification_without_params_omits_the_field() {
    let value = Outgoing::Notification {
        method: "initialized".into(),
        params: None,
    }
    .to_value();

    assert_eq!(value["method"], "initialized");
    assert!(value.get("params").is_none());
    assert!(value.get("id").is_none());
}

#[test]
fn turn_input_items_are_typed_text() {
    let params = turn_start_params("th-1", &[InputItem::text("hello")]);
    assert_eq!(
        params,
        json!({ "threadId": "th-1", "input": [{ "type": "text", "text": "hello" }] })
    );
}

// ── Response payloads ────────────────────────────────────────────────────────

#[test]
fn account_status_decides_login() {
    let needs: AccountStatus =
        serde_json::from_value(json!({ "account": null, "requiresOpenaiAuth": true }))
            .expect("decode");
    assert!(needs.needs_login());

    let signed_in: AccountStatus = serde_json::from_value(json!({
        "account": { "type": "apiKey" },
        "requiresOpenaiAuth": true
    }))
    .expect("decode");
    assert!(!signed_in.needs_login());

    assert!(!AccountStatus::default().needs_login());
}

#[test]
fn ids_are_read_from_nested_or_flat_results() {
    assert_eq!(
        thread_id_from(&json!({ "thread": { "id": "th-9" } })).as_deref(),
        Some("th-9")
    );
    assert_eq!(thread_id_from(&json!({ "threadId": "th-3" })).as_deref(), Some("th-3"));
    assert_eq!(thread_id_from(&json!({ "thread": { "id": "" } })), None);
    assert_eq!(turn_id_from(&json!({ "turn": { "id": "tu-1" } })).as_deref(), Some("tu-1"));
    assert_eq!(turn_id_from(&json!({})), None);
}

// ── Inbound ──────────────────────────────────────────────────────────────────

#[test]
fn empty_line_is_skipped() {
    assert_eq!(parse_inbound_line("   ").expect("ok"), None);
}

#[test]
fn malformed_json_is_a_protocol_error() {
    let err = parse_inbound_line("{oops").expect_err("must fail");
    assert!(matches!(&err, AppError::Protocol(msg) if msg.starts_with("malformed json")));
}

#[test]
fn response_and_error_are_correlated_by_id() {
    assert_eq!(
        parse_inbound_line(r#"{"id":4,"result":{"ok":true}}"#).expect("ok"),
        Some(Incoming::Response {
            id: 4,
            result: json!({ "ok": true })
        })
    );
    assert_eq!(
        parse_inbound_line(r#"{"id":"5","error":{"code":-32600,"message":"bad request"}}"#)
            .expect("ok"),
        Some(Incoming::Error {
            id: 5,
            message: "bad request".into()
        })
    );
}

#[test]
fn message_without_method_or_id_is_rejected() {
    assert!(parse_inbound_line(r#"{"result":{}}"#).is_err());
}

#[test]
fn known_notification_with_wrong_shape_is_rejected() {
    let err = parse_inbound_line(r#"{"method":"item/agentMessage/delta","params":{}}"#)
        .expect_err("delta is required");
    assert!(matches!(&err, AppError::Protocol(msg) if msg.starts_with("missing required field")));
}

#[test]
fn turn_completed_reads_nested_turn() {
    let line = r#"{"method":"turn/completed","params":{"threadId":"th","turn":{"id":"tu","status":"failed","error":{"message":"boom"}}}}"#;
    let Some(Incoming::Notification(notification)) = parse_inbound_line(line).expect("ok") else {
        panic!("expected a notification");
    };

    assert_eq!(notification.turn_id(), Some("tu"));
    assert_eq!(notification.summary(), "turn/completed status=failed");
    assert_eq!(
        notification,
        ServerNotification::TurnCompleted {
            turn_id: Some("tu".into()),
            status: Some("failed".into()),
            error: Some("boom".into()),
        }
    );
}

#[test]
fn login_completed_is_parsed() {
    let line = r#"{"method":"account/login/completed","params":{"loginId":null,"success":false,"error":"bad key"}}"#;
    assert_eq!(
        parse_inbound_line(line).expect("ok"),
        Some(Incoming::Notification(ServerNotification::LoginCompleted {
            login_id: None,
            success: false,
            error: Some("bad key".into()),
        }))
    );
}

#[test]
fn unknown_notification_keeps_method_and_turn() {
    let line = r#"{"method":"item/started","params":{"turnId":"tu","item":{"type":"reasoning"}}}"#;
    let Some(Incoming::Notification(notification)) = parse_inbound_line(line).expect("ok") else {
        panic!("expected a notification");
    };
    assert_eq!(notification.turn_id(), Some("tu"));
    assert_eq!(notification.summary(), "item/started");
}

#[test]
fn message_with_id_and_method_is_an_agent_request() {
    let line = r#"{"id":"99","method":"item/commandExecution/requestApproval","params":{"turnId":"tu"}}"#;
    assert_eq!(
        parse_inbound_line(line).expect("ok"),
        Some(Incoming::Request {
            id: json!("99"),
            method: "item/commandExecution/requestApproval".into(),
            turn_id: Some("tu".into()),
        })
    );
}

#[test]
fn error_response_echoes_the_agent_id() {
    let reply = Outgoing::ErrorResponse {
        id: json!("99"),
        code: METHOD_NOT_FOUND,
        message: "not supported".into(),
    };
    assert_eq!(
        reply.to_value(),
        json!({ "id": "99", "error": { "code": -32601, "message": "not supported" } })
    );
}
