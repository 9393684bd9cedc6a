use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::admission::{AdmissionError, AdmissionTicket};
use crate::heartbeat::Beat;
use crate::pty::PtyEvent;
use crate::sanitize;
use crate::session::{CloseReason, Reply, ServerMessage, Session};

use super::AppState;

pub(super) async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: AppState) {
    // Register this connection for graceful shutdown tracking
    let (_guard, shutdown_rx) = state.shutdown.register();
    let identity = addr.ip().to_string();
    let (mut sink, stream) = socket.split();

    let admitted = match state.admission.admit(&identity) {
        Ok(admitted) => admitted,
        Err(AdmissionError::CapacityReached { .. }) => {
            let frame = CloseFrame {
                code: close_code::AGAIN,
                reason: "".into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    let (session, events) = Session::new(
        admitted.ticket.id(),
        identity,
        Arc::clone(&state.session_config),
    );
    drive(session, events, admitted.ticket, shutdown_rx, stream, sink).await;
}

/// How a connection's loop ended.
enum End {
    /// Peer closed or the transport failed.
    Gone,
    /// Missed too many heartbeat probes: drop without a close frame.
    Expired,
    Close(CloseReason),
}

/// Run one connection until it ends.
///
/// Client frames, PTY events, the auth deadline, heartbeat ticks, eviction
/// and shutdown are all handled here, one at a time, so the session never
/// sees concurrent input.
pub(crate) async fn drive<S, K, E>(
    mut session: Session,
    mut events: mpsc::Receiver<PtyEvent>,
    ticket: AdmissionTicket,
    mut shutdown_rx: watch::Receiver<bool>,
    mut stream: S,
    mut sink: K,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    K: Sink<Message> + Unpin,
    E: Display,
{
    let end = run(
        &mut session,
        &mut events,
        &ticket,
        &mut shutdown_rx,
        &mut stream,
        &mut sink,
    )
    .await;

    match end {
        End::Close(reason) => {
            let frame = CloseFrame {
                code: reason.code(),
                reason: reason.reason().into(),
            };
            let limit = session.heartbeat_interval();
            let _ = time::timeout(limit, async {
                let _ = sink.send(Message::Close(Some(frame))).await;
                let _ = sink.close().await;
            })
            .await;
            tracing::info!(session = %session.id(), reason = reason.reason(), "session closed");
        }
        End::Expired => {
            tracing::info!(session = %session.id(), "session dropped after missed heartbeats");
        }
        End::Gone => {
            tracing::info!(session = %session.id(), "client disconnected");
        }
    }

    session.close();
    // `ticket` drops last, releasing the admission slot.
    drop(ticket);
}

async fn run<S, K, E>(
    session: &mut Session,
    events: &mut mpsc::Receiver<PtyEvent>,
    ticket: &AdmissionTicket,
    shutdown_rx: &mut watch::Receiver<bool>,
    stream: &mut S,
    sink: &mut K,
) -> End
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    K: Sink<Message> + Unpin,
    E: Display,
{
    // A connection registered after shutdown started never sees `changed()`.
    if *shutdown_rx.borrow() {
        return End::Close(CloseReason::Shutdown);
    }

    let period = session.heartbeat_interval();

    if let Some(greeting) = session.greeting() {
        if let Err(end) = send_json(session, sink, &greeting, period).await {
            return end;
        }
    }

    let mut heartbeat = time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = session.auth_deadline();

        let reply = tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => session.route(text.as_str()),
                Some(Ok(Message::Binary(data))) => session.route(&String::from_utf8_lossy(&data)),
                Some(Ok(Message::Pong(_))) => {
                    session.acknowledge_probe();
                    Reply::Nothing
                }
                // Pings are answered by the transport.
                Some(Ok(Message::Ping(_))) => Reply::Nothing,
                Some(Ok(Message::Close(_))) | None => return End::Gone,
                Some(Err(e)) => {
                    tracing::debug!(
                        session = %session.id(),
                        error = %sanitize::for_log(&e.to_string()),
                        "WebSocket receive failed"
                    );
                    return End::Gone;
                }
            },

            Some(event) = events.recv() => match session.on_pty_event(event) {
                Some(message) => Reply::Send(message),
                None => Reply::Nothing,
            },

            _ = until(deadline) => session.auth_expired(),

            _ = heartbeat.tick() => match session.heartbeat_tick() {
                Beat::Probe => {
                    if let Err(end) = send(session, sink, Message::Ping(Bytes::new()), period).await {
                        return end;
                    }
                    Reply::Nothing
                }
                Beat::Expired => return End::Expired,
            },

            _ = ticket.evicted() => Reply::Close(CloseReason::Replaced),

            changed = shutdown_rx.changed() => match changed {
                Ok(()) if !*shutdown_rx.borrow() => Reply::Nothing,
                // Coordinator gone or shutdown signalled.
                _ => Reply::Close(CloseReason::Shutdown),
            },
        };

        match reply {
            Reply::Nothing => {}
            Reply::Send(message) => {
                if let Err(end) = send_json(session, sink, &message, period).await {
                    return end;
                }
            }
            Reply::Close(reason) => return End::Close(reason),
        }
    }
}

/// Send one frame, giving up after `limit`.
///
/// A peer that stops reading is treated like one that stopped answering
/// probes, so a full socket can never stall the loop past one heartbeat
/// interval.
async fn send<K>(session: &Session, sink: &mut K, message: Message, limit: Duration) -> Result<(), End>
where
    K: Sink<Message> + Unpin,
{
    match time::timeout(limit, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(End::Gone),
        Err(_) => {
            tracing::debug!(session = %session.id(), "WebSocket send stalled");
            Err(End::Expired)
        }
    }
}

async fn send_json<K>(
    session: &Session,
    sink: &mut K,
    message: &ServerMessage,
    limit: Duration,
) -> Result<(), End>
where
    K: Sink<Message> + Unpin,
{
    send(session, sink, Message::Text(message.to_json().into()), limit).await
}

/// Resolve at `deadline`, or never.
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
