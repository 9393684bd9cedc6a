#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use ptyrelay::admission::Admission;
use ptyrelay::api;
use ptyrelay::pty::ShellConfig;
use ptyrelay::session::SessionConfig;
use ptyrelay::shutdown::ShutdownCoordinator;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest, http::HeaderValue, Error as WsError, Message,
};
use tokio_tungstenite::WebSocketStream;

pub type Ws = WebSocketStream<TcpStream>;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub admission: Admission,
    pub shutdown: ShutdownCoordinator,
}

/// Session settings for tests: `/bin/sh`, optional secret.
pub fn session_config(secret: Option<&str>) -> SessionConfig {
    SessionConfig {
        secret: secret.map(Arc::from),
        shell: ShellConfig {
            shell: Some("/bin/sh".to_string()),
            env_passthrough: Vec::new(),
        },
        ..SessionConfig::default()
    }
}

pub async fn start_server(config: SessionConfig, max_sessions: usize) -> TestServer {
    let admission = Admission::new(max_sessions);
    let shutdown = ShutdownCoordinator::new();
    let state = api::AppState {
        admission: admission.clone(),
        session_config: Arc::new(config),
        shutdown: shutdown.clone(),
    };
    let app = api::router(state, api::RouterConfig::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        admission,
        shutdown,
    }
}

/// Open a WebSocket from a specific loopback source address with the given
/// `Origin` header.
pub async fn try_connect(
    addr: SocketAddr,
    source_ip: &str,
    origin: Option<&str>,
) -> Result<Ws, WsError> {
    let socket = TcpSocket::new_v4().unwrap();
    socket
        .bind(format!("{source_ip}:0").parse().unwrap())
        .unwrap();
    let stream = socket.connect(addr).await.unwrap();

    let mut request = format!("ws://{addr}/ws").into_client_request().unwrap();
    if let Some(origin) = origin {
        request
            .headers_mut()
            .insert("origin", HeaderValue::from_str(origin).unwrap());
    }
    let (ws, _) = tokio_tungstenite::client_async(request, stream).await?;
    Ok(ws)
}

/// Connect from `source_ip` with an allowed origin.
pub async fn connect_from(addr: SocketAddr, source_ip: &str) -> Ws {
    try_connect(addr, source_ip, Some("http://127.0.0.1:3000"))
        .await
        .expect("WebSocket handshake should succeed")
}

pub async fn connect(addr: SocketAddr) -> Ws {
    connect_from(addr, "127.0.0.1").await
}

/// Next data or close frame, skipping transport pings and pongs. `None` when
/// the stream ends or errors.
pub async fn recv(ws: &mut Ws) -> Option<Message> {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message");
        match msg {
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(msg)) => return Some(msg),
            Some(Err(_)) | None => return None,
        }
    }
}

/// Helper: receive next text message, parse as JSON.
pub async fn recv_json(ws: &mut Ws) -> serde_json::Value {
    match recv(ws).await {
        Some(Message::Text(text)) => serde_json::from_str(text.as_str()).expect("invalid JSON"),
        other => panic!("expected text message, got {:?}", other),
    }
}

/// Helper: expect a close frame, returning its code and reason.
pub async fn recv_close(ws: &mut Ws) -> (u16, String) {
    match recv(ws).await {
        Some(Message::Close(Some(frame))) => (u16::from(frame.code), frame.reason.to_string()),
        other => panic!("expected close frame, got {:?}", other),
    }
}

pub async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Accumulate `output` data until it contains `needle`. Any other message
/// fails the test.
pub async fn read_output_until(ws: &mut Ws, needle: &str) -> String {
    let mut output = String::new();
    while !output.contains(needle) {
        let msg = recv_json(ws).await;
        match msg["type"].as_str() {
            Some("output") => output.push_str(msg["data"].as_str().unwrap()),
            _ => panic!("unexpected message while waiting for output: {msg}"),
        }
    }
    output
}
