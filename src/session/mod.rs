//! Per-connection session state.
//!
//! A [`Session`] owns everything one client connection touches: the auth
//! gate and its deadline, the (lazily spawned) shell, and heartbeat
//! bookkeeping. It performs no I/O of its own; the connection's drive loop
//! feeds it client messages, PTY events and timer ticks one at a time and
//! carries out the [`Reply`] it returns.

pub mod auth;
pub mod messages;
mod router;
pub mod validate;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::heartbeat::{self, Beat, Heartbeat};
use crate::pty::{Pty, PtyError, PtyEvent, ShellConfig};
use crate::sanitize;

pub use auth::{AuthGate, AuthOutcome, AUTH_TIMEOUT};
pub use messages::{ClientMessage, ServerMessage, GENERIC_ERROR};
pub use router::RouteError;

/// Capacity of the channel carrying PTY output into the session loop.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Close code sent when the submitted token is wrong.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
/// Close code sent when no valid token arrives in time.
pub const CLOSE_AUTH_TIMEOUT: u16 = 4008;

/// Settings shared by every session on a server.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Shared secret; `None` means sessions start authenticated.
    pub secret: Option<Arc<str>>,
    pub auth_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_missed_pongs: u32,
    pub shell: ShellConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: None,
            auth_timeout: AUTH_TIMEOUT,
            heartbeat_interval: heartbeat::DEFAULT_INTERVAL,
            max_missed_pongs: heartbeat::DEFAULT_MAX_MISSED,
            shell: ShellConfig::default(),
        }
    }
}

/// Why the server is closing a connection gracefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Unauthorized,
    AuthTimeout,
    /// A newer connection from the same source took over.
    Replaced,
    Shutdown,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Unauthorized => CLOSE_UNAUTHORIZED,
            CloseReason::AuthTimeout => CLOSE_AUTH_TIMEOUT,
            CloseReason::Replaced | CloseReason::Shutdown => 1000,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseReason::Unauthorized => "Unauthorized",
            CloseReason::AuthTimeout => "Authentication timeout",
            CloseReason::Replaced => "Session replaced",
            CloseReason::Shutdown => "Server shutting down",
        }
    }
}

/// What the drive loop must do after the session handled an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nothing,
    Send(ServerMessage),
    Close(CloseReason),
}

/// Shell lifecycle for one session. A session spawns at most one shell.
#[derive(Debug)]
pub enum PtyState {
    NoPty,
    Active(Pty),
    Exited { code: i32 },
}

pub struct Session {
    id: Uuid,
    identity: String,
    gate: AuthGate,
    auth_deadline: Option<Instant>,
    pty: PtyState,
    heartbeat: Heartbeat,
    config: Arc<SessionConfig>,
    events_tx: mpsc::Sender<PtyEvent>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("authenticated", &self.gate.is_authenticated())
            .field("pty", &self.pty)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session and the receiver its PTY events will arrive on.
    ///
    /// When a secret is configured the auth deadline starts now.
    pub fn new(
        id: Uuid,
        identity: impl Into<String>,
        config: Arc<SessionConfig>,
    ) -> (Self, mpsc::Receiver<PtyEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let gate = AuthGate::new(config.secret.clone());
        let auth_deadline =
            (!gate.is_authenticated()).then(|| Instant::now() + config.auth_timeout);
        let session = Self {
            id,
            identity: identity.into(),
            gate,
            auth_deadline,
            pty: PtyState::NoPty,
            heartbeat: Heartbeat::new(config.max_missed_pongs),
            config,
            events_tx,
        };
        (session, events_rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_authenticated(&self) -> bool {
        self.gate.is_authenticated()
    }

    /// Message to send as soon as the connection opens, if any.
    pub fn greeting(&self) -> Option<ServerMessage> {
        self.gate.is_authenticated().then(ServerMessage::connected)
    }

    /// Pending auth deadline; `None` once authenticated or closed.
    pub fn auth_deadline(&self) -> Option<Instant> {
        self.auth_deadline
    }

    /// Called by the drive loop when the auth deadline fires.
    pub fn auth_expired(&mut self) -> Reply {
        if self.auth_deadline.take().is_none() || self.gate.is_authenticated() {
            return Reply::Nothing;
        }
        tracing::warn!(
            session = %self.id,
            source = %sanitize::for_log(&self.identity),
            "authentication timed out"
        );
        Reply::Close(CloseReason::AuthTimeout)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }

    pub fn heartbeat_tick(&mut self) -> Beat {
        let beat = self.heartbeat.tick();
        if beat == Beat::Expired {
            tracing::warn!(
                session = %self.id,
                source = %sanitize::for_log(&self.identity),
                missed = self.heartbeat.missed(),
                "heartbeat expired, dropping connection"
            );
        }
        beat
    }

    pub fn acknowledge_probe(&mut self) {
        self.heartbeat.acknowledge();
    }

    pub fn missed_probes(&self) -> u32 {
        self.heartbeat.missed()
    }

    pub fn pty_state(&self) -> &PtyState {
        &self.pty
    }

    pub fn pty(&self) -> Option<&Pty> {
        match &self.pty {
            PtyState::Active(pty) => Some(pty),
            _ => None,
        }
    }

    /// Spawn the shell at `cols` x `rows`, or resize the one already running.
    /// After the shell has exited this is a no-op.
    pub fn ensure_pty(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        match &self.pty {
            PtyState::Active(pty) => pty.resize(cols, rows),
            PtyState::NoPty => {
                let pty = Pty::spawn(&self.config.shell, cols, rows, self.events_tx.clone())?;
                tracing::info!(session = %self.id, pid = ?pty.pid(), "session shell started");
                self.pty = PtyState::Active(pty);
                Ok(())
            }
            PtyState::Exited { .. } => {
                tracing::debug!(session = %self.id, "resize after shell exit ignored");
                Ok(())
            }
        }
    }

    /// Forward validated input to the shell, if one is running.
    pub fn write_pty(&self, data: &str) -> Result<(), PtyError> {
        match &self.pty {
            PtyState::Active(pty) => pty.write(Bytes::copy_from_slice(data.as_bytes())),
            _ => {
                tracing::trace!(session = %self.id, "input without a running shell dropped");
                Ok(())
            }
        }
    }

    /// Kill the shell, if any. Safe to call repeatedly.
    pub fn terminate_pty(&mut self) {
        if let PtyState::Active(pty) = &mut self.pty {
            pty.terminate();
        }
    }

    /// Translate a PTY event into the envelope for the client.
    ///
    /// Nothing is relayed to an unauthenticated client.
    pub fn on_pty_event(&mut self, event: PtyEvent) -> Option<ServerMessage> {
        let message = match event {
            PtyEvent::Output(data) => ServerMessage::Output { data },
            PtyEvent::Exit { code } => {
                tracing::info!(session = %self.id, code, "session shell exited");
                self.pty = PtyState::Exited { code };
                ServerMessage::Exit { code }
            }
        };
        self.gate.is_authenticated().then_some(message)
    }

    /// Release everything the session holds. Idempotent.
    pub fn close(&mut self) {
        self.auth_deadline = None;
        self.terminate_pty();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
