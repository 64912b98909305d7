use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::RwLock;

use hearth_types::models::Session;

/// The only connection state written from outside the connection's own
/// reader and writer: session expiry, the session itself and its token.
#[derive(Default)]
pub struct AtomicSession {
    expires_at: AtomicI64,
    session: RwLock<Option<Arc<Session>>>,
    token: RwLock<Option<String>>,
}

impl AtomicSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Milliseconds since the epoch; 0 when there is no live session.
    pub fn expires_at(&self) -> i64 {
        self.expires_at.load(Ordering::Acquire)
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
    }

    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write() = Some(token.into());
    }

    /// Store a freshly validated session. Sessions without an expiry are
    /// treated as valid for the next minute so they get re-checked.
    pub fn store(&self, session: Session) {
        let expires_at = if session.expires_at > 0 {
            session.expires_at
        } else {
            hearth_types::now_millis() + 60_000
        };
        *self.session.write() = Some(Arc::new(session));
        self.expires_at.store(expires_at, Ordering::Release);
    }

    pub fn clear(&self) {
        self.expires_at.store(0, Ordering::Release);
        *self.session.write() = None;
        *self.token.write() = None;
    }
}
