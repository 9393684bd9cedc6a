use serde_json::Value;
use thiserror::Error;

use super::messages::{ClientMessage, ServerMessage, KNOWN_TYPES};
use super::validate::{validate_input, validate_size, InputError, SizeError};
use super::{AuthOutcome, CloseReason, Reply, Session};
use crate::pty::PtyError;
use crate::sanitize;

/// Anything that can go wrong handling one client message. Logged in full,
/// never shown to the client.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("malformed message: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("invalid input: {0}")]
    Input(#[from] InputError),

    #[error("invalid size: {0}")]
    Size(#[from] SizeError),

    #[error(transparent)]
    Pty(#[from] PtyError),
}

impl Session {
    /// Handle one raw client message.
    ///
    /// Every failure is logged here and collapses to the generic error
    /// envelope.
    pub fn route(&mut self, raw: &str) -> Reply {
        match self.try_route(raw) {
            Ok(reply) => reply,
            Err(RouteError::Pty(e)) => {
                tracing::error!(session = %self.id, error = %e, "shell operation failed");
                Reply::Send(ServerMessage::generic_error())
            }
            Err(e) => {
                tracing::warn!(session = %self.id, error = %e, "rejected client message");
                Reply::Send(ServerMessage::generic_error())
            }
        }
    }

    fn try_route(&mut self, raw: &str) -> Result<Reply, RouteError> {
        let value: Value = serde_json::from_str(raw)?;
        let kind = value.get("type").and_then(Value::as_str);

        if kind == Some("auth") {
            return Ok(self.authenticate(&value));
        }
        // Unauthenticated clients get no signal at all, so they cannot probe.
        if !self.gate.is_authenticated() {
            tracing::trace!(session = %self.id, "message before authentication dropped");
            return Ok(Reply::Nothing);
        }

        let kind = kind.unwrap_or_default();
        if !KNOWN_TYPES.contains(&kind) {
            return Err(RouteError::UnknownType(sanitize::for_log(kind)));
        }

        match serde_json::from_value::<ClientMessage>(value)? {
            ClientMessage::Auth { .. } => Ok(Reply::Nothing),
            ClientMessage::Input { data } => {
                validate_input(&data)?;
                self.write_pty(&data)?;
                Ok(Reply::Nothing)
            }
            ClientMessage::Resize { cols, rows } => {
                let (cols, rows) = validate_size(cols, rows)?;
                self.ensure_pty(cols, rows)?;
                Ok(Reply::Nothing)
            }
        }
    }

    fn authenticate(&mut self, value: &Value) -> Reply {
        let candidate = value.get("token").and_then(Value::as_str).unwrap_or_default();
        match self.gate.submit(candidate) {
            AuthOutcome::Ignored => Reply::Nothing,
            AuthOutcome::Accepted => {
                self.auth_deadline = None;
                tracing::info!(
                    session = %self.id,
                    source = %sanitize::for_log(&self.identity),
                    "session authenticated"
                );
                Reply::Send(ServerMessage::connected())
            }
            AuthOutcome::Rejected => {
                tracing::warn!(
                    session = %self.id,
                    source = %sanitize::for_log(&self.identity),
                    "authentication failed"
                );
                Reply::Close(CloseReason::Unauthorized)
            }
        }
    }
}
