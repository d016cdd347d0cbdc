//! Production transport: session id in a cookie, state in [`SessionRecords`].

use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use cookie::{time::Duration as CookieDuration, Cookie, CookieBuilder};
use folio_core::transport::{
    CookieParams, SameSite, SessionState, SessionTransport, TransportError,
};
use rand::{rngs::OsRng, RngCore};
use tracing::debug;

use crate::records::{is_valid_id, SessionRecords};

/// Cookie-backed transport for one request.
///
/// Construct it from the request's `Cookie` header, let the session layer
/// drive it, then copy [`CookieTransport::response_headers`] into the response.
#[derive(Debug)]
pub struct CookieTransport {
    records: SessionRecords,
    cookie_header: Option<String>,
    https: bool,
    id: Option<String>,
    state: SessionState,
    params: Option<CookieParams>,
    outgoing: Vec<Cookie<'static>>,
    disabled: bool,
    headers_sent: bool,
}

impl CookieTransport {
    pub fn new(records: SessionRecords, cookie_header: Option<&str>, https: bool) -> Self {
        Self {
            records,
            cookie_header: cookie_header.map(str::to_string),
            https,
            id: None,
            state: SessionState::new(),
            params: None,
            outgoing: Vec::new(),
            disabled: false,
            headers_sent: false,
        }
    }

    /// Sessions are switched off for this request (e.g. a CLI or health probe).
    pub fn disable(&mut self) {
        self.disabled = true;
    }

    /// Response output has started; cookies can no longer be changed.
    pub fn mark_headers_sent(&mut self) {
        self.headers_sent = true;
    }

    /// `Set-Cookie` values queued during this request, oldest first.
    pub fn set_cookie_headers(&self) -> Vec<String> {
        self.outgoing.iter().map(|c| c.to_string()).collect()
    }

    /// Every header the session layer wants on the response.
    pub fn response_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers: Vec<(&'static str, String)> = self
            .set_cookie_headers()
            .into_iter()
            .map(|value| ("Set-Cookie", value))
            .collect();
        if let Some(max_age) = self.params.as_ref().and_then(|p| p.hsts_max_age) {
            headers.push((
                "Strict-Transport-Security",
                format!("max-age={max_age}; includeSubDomains"),
            ));
        }
        headers
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

    fn incoming_id(&self, name: &str) -> Option<String> {
        let header = self.cookie_header.as_deref()?;
        Cookie::split_parse(header)
            .filter_map(Result::ok)
            .find(|cookie| cookie.name() == name)
            .map(|cookie| cookie.value().to_string())
    }

    fn queue_id_cookie(&mut self, params: &CookieParams, id: &str) {
        let mut builder = base_cookie(params, id.to_string());
        if let Some(lifetime) = params.lifetime {
            let secs = i64::try_from(lifetime).unwrap_or(i64::MAX);
            builder = builder.max_age(CookieDuration::seconds(secs));
        }
        self.outgoing.push(builder.build());
    }
}

impl SessionTransport for CookieTransport {
    fn start(&mut self, params: &CookieParams) -> Result<(), TransportError> {
        self.ensure_writable()?;
        if self.id.is_some() {
            return Ok(());
        }

        let resumed = match self.incoming_id(&params.name).filter(|id| is_valid_id(id)) {
            Some(candidate) => match self.records.load(&candidate)? {
                Some(state) => Some((candidate, state)),
                None if !params.strict_mode => Some((candidate, SessionState::new())),
                None => {
                    debug!("ignoring unknown session id");
                    None
                }
            },
            None => None,
        };

        match resumed {
            Some((id, state)) => {
                self.id = Some(id);
                self.state = state;
            }
            None => {
                let id = new_session_id();
                self.queue_id_cookie(params, &id);
                self.id = Some(id);
                self.state = SessionState::new();
            }
        }
        self.params = Some(params.clone());
        Ok(())
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn regenerate_id(&mut self, delete_old: bool) -> Result<(), TransportError> {
        self.ensure_writable()?;
        let params = self.params.clone().ok_or(TransportError::Inactive)?;
        let old = self.id.take().ok_or(TransportError::Inactive)?;
        if delete_old {
            self.records.remove(&old)?;
        }

        let id = new_session_id();
        self.queue_id_cookie(&params, &id);
        self.id = Some(id);
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), TransportError> {
        self.state.clear();
        let Some(id) = self.id.take() else {
            return Ok(());
        };
        self.records.remove(&id)?;

        if let Some(params) = &self.params {
            if self.headers_sent {
                debug!("headers already sent, session cookie left to expire");
            } else {
                let mut removal = base_cookie(params, String::new()).build();
                removal.make_removal();
                self.outgoing.push(removal);
            }
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
            Some(id) => self.records.save(id, &self.state),
            None => Ok(()),
        }
    }

    fn is_secure_request(&self) -> bool {
        self.https
    }

    fn purge_idle(&self, max_idle: Duration) -> Result<usize, TransportError> {
        self.records.purge_idle(max_idle)
    }
}

/// Cookie carrying every identifying attribute from `params`; the removal
/// cookie must match these for browsers to drop the original.
fn base_cookie(params: &CookieParams, value: String) -> CookieBuilder<'static> {
    let mut builder = Cookie::build((params.name.clone(), value))
        .path(params.path.clone())
        .secure(params.secure)
        .http_only(params.http_only)
        .same_site(match params.same_site {
            SameSite::Strict => cookie::SameSite::Strict,
            SameSite::Lax => cookie::SameSite::Lax,
            SameSite::None => cookie::SameSite::None,
        });
    if let Some(domain) = &params.domain {
        builder = builder.domain(domain.clone());
    }
    builder
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
