//! Admission control: a global cap on live sessions and at most one session
//! per source identity.
//!
//! The registry is the only state shared across connections. Every
//! register/evict/release happens under a single `parking_lot::Mutex`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::sanitize;

/// Default maximum number of concurrent sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 3;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("maximum number of sessions reached ({limit})")]
    CapacityReached { limit: usize },
}

struct Entry {
    id: Uuid,
    evict: CancellationToken,
}

struct AdmissionInner {
    sessions: HashMap<String, Entry>,
    max_sessions: usize,
}

/// Registry of active sessions keyed by source identity.
#[derive(Clone)]
pub struct Admission {
    inner: Arc<Mutex<AdmissionInner>>,
}

/// Result of a successful admission.
#[derive(Debug)]
pub struct Admitted {
    pub ticket: AdmissionTicket,
    /// Id of the session that previously held this identity, if any. It has
    /// already been signalled to close.
    pub evicted: Option<Uuid>,
}

/// Proof of admission held by a live session. Dropping it releases the slot.
pub struct AdmissionTicket {
    id: Uuid,
    identity: String,
    evict: CancellationToken,
    registry: Admission,
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl AdmissionTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Resolves once a newer session from the same identity has replaced
    /// this one.
    pub fn evicted(&self) -> WaitForCancellationFuture<'_> {
        self.evict.cancelled()
    }

    pub fn is_evicted(&self) -> bool {
        self.evict.is_cancelled()
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.registry.release(&self.identity, self.id);
    }
}

impl Admission {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AdmissionInner {
                sessions: HashMap::new(),
                max_sessions,
            })),
        }
    }

    /// Admit a new session for `identity`.
    ///
    /// A session already registered under the same identity is evicted and
    /// replaced; this never changes the live count, so it is evaluated before
    /// the capacity check.
    pub fn admit(&self, identity: &str) -> Result<Admitted, AdmissionError> {
        let mut inner = self.inner.lock();

        let replacing = inner.sessions.contains_key(identity);
        if !replacing && inner.sessions.len() >= inner.max_sessions {
            tracing::warn!(
                source = %sanitize::for_log(identity),
                limit = inner.max_sessions,
                "connection rejected: session limit reached"
            );
            return Err(AdmissionError::CapacityReached {
                limit: inner.max_sessions,
            });
        }

        let id = Uuid::new_v4();
        let evict = CancellationToken::new();
        let previous = inner.sessions.insert(
            identity.to_string(),
            Entry {
                id,
                evict: evict.clone(),
            },
        );

        let evicted = previous.map(|old| {
            old.evict.cancel();
            tracing::info!(
                source = %sanitize::for_log(identity),
                evicted = %old.id,
                session = %id,
                "existing session from same source evicted"
            );
            old.id
        });

        tracing::info!(
            source = %sanitize::for_log(identity),
            session = %id,
            active = inner.sessions.len(),
            "session admitted"
        );

        Ok(Admitted {
            ticket: AdmissionTicket {
                id,
                identity: identity.to_string(),
                evict,
                registry: self.clone(),
            },
            evicted,
        })
    }

    /// Release the slot held by session `id`. A no-op if the identity has
    /// since been taken over by a newer session.
    fn release(&self, identity: &str, id: Uuid) {
        let mut inner = self.inner.lock();
        let owned = inner
            .sessions
            .get(identity)
            .is_some_and(|entry| entry.id == id);
        if owned {
            inner.sessions.remove(identity);
            tracing::debug!(
                source = %sanitize::for_log(identity),
                session = %id,
                active = inner.sessions.len(),
                "session slot released"
            );
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> usize {
        self.inner.lock().max_sessions
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.inner.lock().sessions.contains_key(identity)
    }
}
