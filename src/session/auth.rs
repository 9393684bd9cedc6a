use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// How long an unauthenticated session may stay open.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Compare a candidate token with the secret without leaking where (or
/// whether, by length) they differ.
///
/// Both sides are hashed first so the constant-time comparison always runs
/// over 32 bytes, whatever the input lengths.
pub fn tokens_match(candidate: &str, secret: &str) -> bool {
    let candidate = Sha256::digest(candidate.as_bytes());
    let secret = Sha256::digest(secret.as_bytes());
    candidate.as_slice().ct_eq(secret.as_slice()).into()
}

/// Result of submitting an `auth` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Already authenticated, or no secret configured: nothing happens.
    Ignored,
    Accepted,
    Rejected,
}

/// Shared-secret gate for one session.
#[derive(Debug, Clone)]
pub struct AuthGate {
    secret: Option<Arc<str>>,
    authenticated: bool,
}

impl AuthGate {
    /// With no secret the gate starts open.
    pub fn new(secret: Option<Arc<str>>) -> Self {
        let authenticated = secret.is_none();
        Self {
            secret,
            authenticated,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn submit(&mut self, candidate: &str) -> AuthOutcome {
        if self.authenticated {
            return AuthOutcome::Ignored;
        }
        let Some(secret) = self.secret.as_deref() else {
            return AuthOutcome::Ignored;
        };
        if tokens_match(candidate, secret) {
            self.authenticated = true;
            AuthOutcome::Accepted
        } else {
            AuthOutcome::Rejected
        }
    }
}
