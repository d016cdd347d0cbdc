use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// Raw key/value state carried by a transport session.
pub type SessionState = Map<String, Value>;

/// Reasons a transport cannot carry out a mutation right now.
///
/// Everything except `Backend` means "sessions are unavailable in this
/// context" and callers are expected to degrade instead of failing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Sessions are switched off for the current execution context.
    #[error("session transport is disabled")]
    Disabled,
    /// Response headers were already flushed, cookies can no longer be set.
    #[error("response headers already sent")]
    HeadersSent,
    /// Operation needs an active session.
    #[error("no active session")]
    Inactive,
    /// Underlying persistence failure.
    #[error("session backend failure: {reason}")]
    Backend { reason: String },
}

impl TransportError {
    /// True when the error means the transport is unavailable rather than broken.
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, TransportError::Backend { .. })
    }
}

/// Cookie `SameSite` attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    #[default]
    Strict,
    Lax,
    None,
}

/// Attributes applied to the session cookie and used again when expiring it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieParams {
    pub name: String,
    pub path: String,
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
    /// Cookie lifetime in seconds; `None` keeps it for the browser session.
    pub lifetime: Option<u64>,
    /// Never adopt a session id the server did not issue.
    pub strict_mode: bool,
    /// Emit `Strict-Transport-Security` with this max-age when set.
    pub hsts_max_age: Option<u64>,
}

impl Default for CookieParams {
    fn default() -> Self {
        Self {
            name: "folio_session".to_string(),
            path: "/".to_string(),
            domain: None,
            secure: false,
            http_only: true,
            same_site: SameSite::Strict,
            lifetime: None,
            strict_mode: true,
            hsts_max_age: None,
        }
    }
}

/// Capability interface over the per-request session mechanism.
///
/// Implementations own the raw session state; higher layers keep their own
/// data under a private key of [`SessionTransport::state_mut`].
pub trait SessionTransport: Send {
    /// Start or resume the session. Calling it on an active session is a no-op.
    fn start(&mut self, params: &CookieParams) -> Result<(), TransportError>;

    /// Current session identifier, if active.
    fn id(&self) -> Option<&str>;

    /// Issue a fresh identifier while keeping the current state.
    fn regenerate_id(&mut self, delete_old: bool) -> Result<(), TransportError>;

    /// Drop server-side state and expire the client cookie (idempotent).
    fn destroy(&mut self) -> Result<(), TransportError>;

    fn is_active(&self) -> bool;

    fn state(&self) -> &SessionState;

    fn state_mut(&mut self) -> &mut SessionState;

    /// Persist state at the end of the request.
    fn commit(&mut self) -> Result<(), TransportError>;

    /// Whether the current request arrived over HTTPS.
    fn is_secure_request(&self) -> bool {
        false
    }

    /// Delete stored sessions not committed for longer than `max_idle`.
    /// Returns how many were removed.
    fn purge_idle(&self, _max_idle: Duration) -> Result<usize, TransportError> {
        Ok(0)
    }
}

/// Shared "server side" of [`MemoryTransport`], standing in for the session
/// records a real deployment keeps between requests.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    inner: Arc<Mutex<HashMap<String, SessionState>>>,
    counter: Arc<AtomicU64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .lock()
            .map(|map| map.contains_key(id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_id(&self) -> String {
        format!("mem-{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn load(&self, id: &str) -> Result<Option<SessionState>, TransportError> {
        let map = self.inner.lock().map_err(poisoned)?;
        Ok(map.get(id).cloned())
    }

    fn save(&self, id: &str, state: &SessionState) -> Result<(), TransportError> {
        let mut map = self.inner.lock().map_err(poisoned)?;
        map.insert(id.to_string(), state.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), TransportError> {
        let mut map = self.inner.lock().map_err(poisoned)?;
        map.remove(id);
        Ok(())
    }
}

/// In-memory transport for tests and smoke runs.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    backend: MemoryBackend,
    incoming: Option<String>,
    id: Option<String>,
    state: SessionState,
    params: Option<CookieParams>,
    disabled: bool,
    headers_sent: bool,
    secure: bool,
    expired_cookies: usize,
}

impl MemoryTransport {
    pub fn new(backend: MemoryBackend) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    /// Simulate a follow-up request presenting `id` in its cookie.
    pub fn resume(backend: MemoryBackend, id: impl Into<String>) -> Self {
        Self {
            backend,
            incoming: Some(id.into()),
            ..Self::default()
        }
    }

    /// A transport for a context where sessions are switched off.
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::default()
        }
    }

    pub fn with_secure_request(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn mark_headers_sent(&mut self) {
        self.headers_sent = true;
    }

    /// Parameters passed to the most recent successful `start`.
    pub fn params(&self) -> Option<&CookieParams> {
        self.params.as_ref()
    }

    /// Number of removal cookies emitted so far.
    pub fn expired_cookies(&self) -> usize {
        self.expired_cookies
    }

    pub fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    fn ensure_writable(&self) -> Result<(), TransportError> {
        if self.disabled {
            return Err(TransportError::Disabled);
        }
        if self.headers_sent {
            return Err(TransportError::HeadersSent);
        }
        Ok(())
    }
}

impl SessionTransport for MemoryTransport {
    fn start(&mut self, params: &CookieParams) -> Result<(), TransportError> {
        self.ensure_writable()?;
        if self.id.is_some() {
            return Ok(());
        }

        let resumed = match self.incoming.take() {
            Some(candidate) => match self.backend.load(&candidate)? {
                Some(state) => Some((candidate, state)),
                None if !params.strict_mode => Some((candidate, SessionState::new())),
                None => {
                    debug!("ignoring unknown session id");
                    None
                }
            },
            None => None,
        };

        let (id, state) = resumed.unwrap_or_else(|| (self.backend.next_id(), SessionState::new()));
        self.id = Some(id);
        self.state = state;
        self.params = Some(params.clone());
        Ok(())
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn regenerate_id(&mut self, delete_old: bool) -> Result<(), TransportError> {
        self.ensure_writable()?;
        let old = self.id.take().ok_or(TransportError::Inactive)?;
        if delete_old {
            self.backend.remove(&old)?;
        }
        self.id = Some(self.backend.next_id());
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), TransportError> {
        self.state.clear();
        if let Some(id) = self.id.take() {
            self.backend.remove(&id)?;
            self.expired_cookies += 1;
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.id.is_some()
    }

    fn state(&self) -> &SessionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut SessionState {
        &mut self.state
    }

    fn commit(&mut self) -> Result<(), TransportError> {
        match &self.id {
            Some(id) => self.backend.save(id, &self.state),
            None => Ok(()),
        }
    }

    fn is_secure_request(&self) -> bool {
        self.secure
    }
}

fn poisoned<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Backend {
        reason: format!("lock poisoned: {err}"),
    }
}
