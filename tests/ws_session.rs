//! End-to-end tests for the `/ws` endpoint against a real server and shell.

mod common;

use std::time::Duration;

use common::*;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

// ── Origin ───────────────────────────────────────────────────────

#[tokio::test]
async fn foreign_origin_is_rejected_before_upgrade() {
    let server = start_server(session_config(None), 3).await;

    let err = try_connect(server.addr, "127.0.0.1", Some("http://evil.example"))
        .await
        .expect_err("handshake should fail");
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 403),
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
    assert!(server.admission.is_empty());
}

#[tokio::test]
async fn missing_origin_is_rejected() {
    let server = start_server(session_config(None), 3).await;
    let err = try_connect(server.addr, "127.0.0.1", None).await.unwrap_err();
    assert!(matches!(err, WsError::Http(ref r) if r.status() == 403));
}

#[tokio::test]
async fn tailnet_origin_is_accepted() {
    let server = start_server(session_config(None), 3).await;
    let mut ws = try_connect(server.addr, "127.0.0.1", Some("http://100.100.7.7:3000"))
        .await
        .unwrap();
    assert_eq!(recv_json(&mut ws).await["type"], "connected");
}

// ── Authentication ───────────────────────────────────────────────

#[tokio::test]
async fn open_server_greets_on_connect() {
    let server = start_server(session_config(None), 3).await;
    let mut ws = connect(server.addr).await;

    let msg = recv_json(&mut ws).await;
    assert_eq!(msg, json!({"type": "connected", "message": "Connected to terminal"}));
}

#[tokio::test]
async fn correct_token_connects() {
    let server = start_server(session_config(Some("s3cret")), 3).await;
    let mut ws = connect(server.addr).await;

    send_json(&mut ws, json!({"type": "auth", "token": "s3cret"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "connected");
}

#[tokio::test]
async fn wrong_token_closes_with_4001() {
    let server = start_server(session_config(Some("s3cret")), 3).await;
    let mut ws = connect(server.addr).await;

    send_json(&mut ws, json!({"type": "auth", "token": "guess"})).await;
    let (code, reason) = recv_close(&mut ws).await;
    assert_eq!(code, 4001);
    assert_eq!(reason, "Unauthorized");
}

#[tokio::test]
async fn silent_client_closes_with_4008() {
    let mut config = session_config(Some("s3cret"));
    config.auth_timeout = Duration::from_millis(200);
    let server = start_server(config, 3).await;
    let mut ws = connect(server.addr).await;

    let (code, reason) = recv_close(&mut ws).await;
    assert_eq!(code, 4008);
    assert_eq!(reason, "Authentication timeout");
}

#[tokio::test]
async fn messages_before_auth_get_no_response() {
    let server = start_server(session_config(Some("s3cret")), 3).await;
    let mut ws = connect(server.addr).await;

    send_json(&mut ws, json!({"type": "resize", "cols": 80, "rows": 24})).await;
    send_json(&mut ws, json!({"type": "input", "data": "echo leaked\r"})).await;
    send_json(&mut ws, json!({"type": "nonsense"})).await;
    send_json(&mut ws, json!({"type": "auth", "token": "s3cret"})).await;

    // The first thing the client ever hears is the acknowledgment.
    assert_eq!(recv_json(&mut ws).await["type"], "connected");
}

// ── Routing ──────────────────────────────────────────────────────

#[tokio::test]
async fn malformed_messages_get_generic_error() {
    let server = start_server(session_config(None), 3).await;
    let mut ws = connect(server.addr).await;
    recv_json(&mut ws).await;

    for raw in [
        "not json".to_string(),
        json!({"type": "exec"}).to_string(),
        json!({"type": "resize", "cols": 0, "rows": 24}).to_string(),
        json!({"type": "input", "data": ""}).to_string(),
    ] {
        ws.send(Message::Text(raw.clone().into())).await.unwrap();
        let msg = recv_json(&mut ws).await;
        assert_eq!(
            msg,
            json!({"type": "error", "message": "Failed to process request"}),
            "for {raw}"
        );
    }
}

#[tokio::test]
async fn resize_spawns_shell_and_input_reaches_it() {
    let server = start_server(session_config(None), 3).await;
    let mut ws = connect(server.addr).await;
    recv_json(&mut ws).await;

    send_json(&mut ws, json!({"type": "resize", "cols": 80, "rows": 24})).await;
    send_json(&mut ws, json!({"type": "input", "data": "echo $((6 * 7))x\r"})).await;

    read_output_until(&mut ws, "42x").await;
}

#[tokio::test]
async fn shell_sees_requested_size() {
    let server = start_server(session_config(None), 3).await;
    let mut ws = connect(server.addr).await;
    recv_json(&mut ws).await;

    send_json(&mut ws, json!({"type": "resize", "cols": 80, "rows": 24})).await;
    send_json(&mut ws, json!({"type": "resize", "cols": 132, "rows": 43})).await;
    send_json(&mut ws, json!({"type": "input", "data": "stty size | tr ' ' x\r"})).await;

    read_output_until(&mut ws, "43x132").await;
}

#[tokio::test]
async fn binary_frames_are_routed() {
    let server = start_server(session_config(None), 3).await;
    let mut ws = connect(server.addr).await;
    recv_json(&mut ws).await;

    let frame = json!({"type": "resize", "cols": 80, "rows": 24}).to_string();
    ws.send(Message::Binary(frame.into_bytes().into())).await.unwrap();
    let frame = json!({"type": "input", "data": "echo bin$((1 + 1))\r"}).to_string();
    ws.send(Message::Binary(frame.into_bytes().into())).await.unwrap();

    read_output_until(&mut ws, "bin2").await;
}

#[tokio::test]
async fn shell_exit_is_reported_and_connection_stays_open() {
    let server = start_server(session_config(None), 3).await;
    let mut ws = connect(server.addr).await;
    recv_json(&mut ws).await;

    send_json(&mut ws, json!({"type": "resize", "cols": 80, "rows": 24})).await;
    send_json(&mut ws, json!({"type": "input", "data": "exit 7\r"})).await;

    loop {
        let msg = recv_json(&mut ws).await;
        match msg["type"].as_str() {
            Some("output") => continue,
            Some("exit") => {
                assert_eq!(msg["code"], 7);
                break;
            }
            _ => panic!("unexpected message {msg}"),
        }
    }

    // No respawn: input and resize are dropped without a reply.
    send_json(&mut ws, json!({"type": "resize", "cols": 80, "rows": 24})).await;
    send_json(&mut ws, json!({"type": "input", "data": "echo again\r"})).await;
    // The session is still alive and routing.
    send_json(&mut ws, json!({"type": "bogus"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "error");
    assert_eq!(server.admission.len(), 1);
}

// ── Admission ────────────────────────────────────────────────────

#[tokio::test]
async fn capacity_rejects_new_identity_with_1013() {
    let server = start_server(session_config(None), 2).await;

    let mut a = connect_from(server.addr, "127.0.0.1").await;
    assert_eq!(recv_json(&mut a).await["type"], "connected");
    let mut b = connect_from(server.addr, "127.0.0.2").await;
    assert_eq!(recv_json(&mut b).await["type"], "connected");

    let mut c = connect_from(server.addr, "127.0.0.3").await;
    let (code, _) = recv_close(&mut c).await;
    assert_eq!(code, 1013);
    assert_eq!(server.admission.len(), 2);

    // Closing one frees a slot.
    a.close(None).await.unwrap();
    drop(a);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut d = connect_from(server.addr, "127.0.0.3").await;
    assert_eq!(recv_json(&mut d).await["type"], "connected");
}

#[tokio::test]
async fn same_source_replaces_previous_session() {
    let server = start_server(session_config(None), 1).await;

    let mut old = connect(server.addr).await;
    assert_eq!(recv_json(&mut old).await["type"], "connected");

    // At capacity, but a reconnect from the same source still gets in.
    let mut new = connect(server.addr).await;
    assert_eq!(recv_json(&mut new).await["type"], "connected");

    let (code, reason) = recv_close(&mut old).await;
    assert_eq!(code, 1000);
    assert_eq!(reason, "Session replaced");
    assert_eq!(server.admission.len(), 1);
}

// ── Heartbeat and shutdown ───────────────────────────────────────

#[tokio::test]
async fn unresponsive_client_is_dropped_without_close_frame() {
    let mut config = session_config(None);
    config.heartbeat_interval = Duration::from_millis(100);
    let server = start_server(config, 3).await;
    let mut ws = connect(server.addr).await;

    // Not reading means no pongs go back.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let mut saw_close = false;
    loop {
        match tokio::time::timeout(RECV_TIMEOUT, ws.next()).await.unwrap() {
            Some(Ok(Message::Close(_))) => saw_close = true,
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => break,
        }
    }
    assert!(!saw_close, "heartbeat expiry must not send a close frame");
    assert!(server.admission.is_empty());
}

#[tokio::test]
async fn responsive_client_survives_heartbeats() {
    let mut config = session_config(None);
    config.heartbeat_interval = Duration::from_millis(100);
    let server = start_server(config, 3).await;
    let mut ws = connect(server.addr).await;
    recv_json(&mut ws).await;

    // Reading lets the client answer every probe.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(600);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Ok(Some(Ok(Message::Ping(_)))) => continue,
            Ok(other) => panic!("unexpected frame {other:?}"),
            Err(_) => break,
        }
    }

    send_json(&mut ws, json!({"type": "bogus"})).await;
    assert_eq!(recv_json(&mut ws).await["type"], "error");
}

#[tokio::test]
async fn shutdown_closes_live_sessions() {
    let server = start_server(session_config(None), 3).await;
    let mut ws = connect(server.addr).await;
    recv_json(&mut ws).await;

    server.shutdown.shutdown();
    let (code, reason) = recv_close(&mut ws).await;
    assert_eq!(code, 1000);
    assert_eq!(reason, "Server shutting down");
    assert!(server.shutdown.wait_for_all_closed(RECV_TIMEOUT).await);
}
