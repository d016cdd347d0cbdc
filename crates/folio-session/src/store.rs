use std::sync::Arc;

use folio_core::transport::{SessionState, SessionTransport, TransportError};
use folio_keys::{IdentifierCodec, KeyRing, KeyRingError};
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::{csrf, options::SessionOptions};

/// Key of the private namespace inside the transport state.
const NAMESPACE_KEY: &str = "_folio";
const CSRF_KEY: &str = "csrf_token";
const USER_ID_KEY: &str = "user_id";

#[derive(Debug, Error)]
pub enum SessionError {
    /// Key ring provisioning failed; masking is impossible until fixed.
    #[error("session configuration error: {0}")]
    Configuration(#[from] KeyRingError),
    #[error("session value could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Active,
    Destroyed,
}

/// Per-request session facade: hardened transport, private key/value
/// namespace, CSRF token, and id masking over the shared key ring.
pub struct SessionStore<T: SessionTransport> {
    transport: T,
    options: SessionOptions,
    codec: IdentifierCodec,
    lifecycle: Lifecycle,
}

impl<T: SessionTransport> SessionStore<T> {
    pub fn new(transport: T, key_ring: Arc<KeyRing>, options: SessionOptions) -> Self {
        Self {
            transport,
            options,
            codec: IdentifierCodec::new(key_ring),
            lifecycle: Lifecycle::Uninitialized,
        }
    }

    /// Start the transport with hardened cookie settings. Idempotent; after an
    /// external teardown it restarts only the transport. An unavailable
    /// transport is logged and the store keeps working on local state.
    #[instrument(skip_all)]
    pub fn start(&mut self) -> &mut Self {
        if self.transport.is_active() {
            self.lifecycle = Lifecycle::Active;
            return self;
        }

        let params = self.options.cookie_params(self.transport.is_secure_request());
        match self.transport.start(&params) {
            Ok(()) => {
                debug!(secure = params.secure, "session started");
                self.lifecycle = Lifecycle::Active;
            }
            Err(err) if err.is_unavailable() => {
                warn!(error = %err, "session transport unavailable, continuing without it");
            }
            Err(err) => warn!(error = %err, "session transport failed to start"),
        }
        self
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn id(&self) -> Option<&str> {
        self.transport.id()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        let value = self.namespace()?.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn get_or<V: DeserializeOwned>(&self, key: &str, default: V) -> V {
        self.get(key).unwrap_or(default)
    }

    pub fn set<V: Serialize>(&mut self, key: &str, value: V) -> Result<(), SessionError> {
        let value = serde_json::to_value(value)?;
        self.with_namespace_mut(|ns| {
            ns.insert(key.to_string(), value);
        });
        Ok(())
    }

    pub fn has(&self, key: &str) -> bool {
        self.namespace().is_some_and(|ns| ns.contains_key(key))
    }

    pub fn delete(&mut self, key: &str) {
        if self.has(key) {
            self.with_namespace_mut(|ns| {
                ns.remove(key);
            });
        }
    }

    /// Wipe the namespace, expire the cookie and tear down the transport.
    /// Safe to call repeatedly.
    #[instrument(skip_all)]
    pub fn destroy(&mut self) {
        self.transport.state_mut().remove(NAMESPACE_KEY);
        if self.transport.is_active() {
            if let Err(err) = self.transport.destroy() {
                warn!(error = %err, "session teardown failed");
            }
        }
        self.lifecycle = Lifecycle::Destroyed;
    }

    /// Issue a new session id, keeping the contents. Quietly does nothing
    /// without an active session or when the transport cannot change cookies.
    #[instrument(skip_all)]
    pub fn regenerate(&mut self, delete_old: bool) {
        if !self.transport.is_active() {
            debug!("no active session to regenerate");
            return;
        }
        match self.transport.regenerate_id(delete_old) {
            Ok(()) => debug!("session id regenerated"),
            Err(err) if err.is_unavailable() => {
                debug!(error = %err, "session id not regenerated");
            }
            Err(err) => warn!(error = %err, "session id regeneration failed"),
        }
    }

    /// Persist the session at the end of the request. Now and then this also
    /// purges sessions idle for longer than `record_max_idle`.
    pub fn commit(&mut self) -> Result<(), SessionError> {
        if !self.transport.is_active() {
            return Ok(());
        }
        self.transport.commit()?;
        self.maybe_purge_idle();
        Ok(())
    }

    fn maybe_purge_idle(&self) {
        let one_in = self.options.gc_probability;
        if one_in == 0 || rand::thread_rng().gen_range(0..one_in) != 0 {
            return;
        }
        match self.transport.purge_idle(self.options.record_max_idle()) {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "purged idle sessions"),
            Err(err) => warn!(error = %err, "idle session purge failed"),
        }
    }

    /// The session's anti-forgery token, created on first use.
    pub fn csrf_token(&mut self) -> String {
        if let Some(token) = self.get::<String>(CSRF_KEY) {
            return token;
        }
        let token = csrf::generate_token();
        self.with_namespace_mut(|ns| {
            ns.insert(CSRF_KEY.to_string(), Value::String(token.clone()));
        });
        token
    }

    /// Constant-time check of `candidate`; false when no token was issued.
    pub fn validate_csrf(&self, candidate: &str) -> bool {
        match self.get::<String>(CSRF_KEY) {
            Some(expected) => csrf::tokens_match(&expected, candidate),
            None => false,
        }
    }

    pub fn set_user_id(&mut self, id: u64) {
        self.with_namespace_mut(|ns| {
            ns.insert(USER_ID_KEY.to_string(), Value::from(id));
        });
    }

    pub fn user_id(&self) -> Option<u64> {
        self.get(USER_ID_KEY)
    }

    pub fn mask_id(&self, id: u64) -> Result<String, SessionError> {
        Ok(self.codec.mask(id)?)
    }

    /// `None` for anything that does not decode; callers treat it as "not found".
    pub fn unmask_id(&self, token: &str) -> Option<u64> {
        self.codec.unmask(token)
    }

    pub fn key_ring(&self) -> &Arc<KeyRing> {
        self.codec.key_ring()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn namespace(&self) -> Option<&SessionState> {
        self.transport.state().get(NAMESPACE_KEY)?.as_object()
    }

    fn with_namespace_mut<R>(&mut self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let state = self.transport.state_mut();
        let mut ns = match state.remove(NAMESPACE_KEY) {
            Some(Value::Object(map)) => map,
            _ => SessionState::new(),
        };
        let out = f(&mut ns);
        state.insert(NAMESPACE_KEY.to_string(), Value::Object(ns));
        out
    }
}
