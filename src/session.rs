//! Session Registry
//!
//! A session is one logical subscription (chart or quote) multiplexed over
//! the single connection, identified by a generated id. The registry is the
//! arena-style `id -> session` map owned by the client; inbound routable
//! messages carry their session id at position 0 of the argument list and are
//! forwarded to the owning session, or dropped when no session matches (the
//! session already ended, or the message preceded registration).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng as _;
use rand::distr::Alphanumeric;
use serde_json::Value;

/// Length of the random suffix in generated session ids.
pub const SESSION_ID_RANDOM_LEN: usize = 12;

/// Kind of a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// OHLCV chart-bar feed.
    Chart,
    /// Quote (last-price) feed.
    Quote,
}

/// One logical subscription multiplexed over the connection.
pub trait Session: Send + Sync {
    /// The generated session identifier.
    fn id(&self) -> &str;

    /// Chart or quote.
    fn kind(&self) -> SessionKind;

    /// Handle a routed inbound message addressed to this session.
    fn handle_event(&self, method: &str, params: &[Value]);
}

/// Arena-style map from session id to session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<dyn Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a session under its id.
    pub fn register(&self, session: Arc<dyn Session>) {
        let id = session.id().to_string();
        tracing::debug!(session_id = %id, kind = ?session.kind(), "registering session");
        self.sessions.write().insert(id, session);
    }

    /// Remove a session by id.
    pub fn remove(&self, id: &str) -> Option<Arc<dyn Session>> {
        self.sessions.write().remove(id)
    }

    /// Forward a message to the session whose id sits at `params[0]`.
    ///
    /// Returns `true` if a session handled it; messages without a resolvable
    /// session are dropped.
    pub fn route(&self, method: &str, params: &[Value]) -> bool {
        let Some(session_id) = params.first().and_then(Value::as_str) else {
            tracing::trace!(method, "message without session id, dropping");
            return false;
        };

        let session = self.sessions.read().get(session_id).cloned();
        match session {
            Some(session) => {
                session.handle_event(method, params);
                true
            }
            None => {
                tracing::debug!(method, session_id, "no session registered, dropping");
                false
            }
        }
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}

/// Generate a session id: `<prefix>_` followed by twelve random
/// alphanumerics. Collision probability is negligible for practical use;
/// the ids are not cryptographically unique.
#[must_use]
pub fn generate_session_id(prefix: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(SESSION_ID_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{prefix}_{suffix}")
}
