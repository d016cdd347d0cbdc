use std::time::Duration;

use folio_core::transport::{CookieParams, SameSite};
use folio_keys::KeyRingConfig;
use serde::{Deserialize, Serialize};

/// One year, the usual HSTS max-age.
const HSTS_MAX_AGE: u64 = 365 * 24 * 60 * 60;

/// Session and key ring settings, usually read from the `[session]` table of
/// the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub cookie_name: String,
    pub cookie_path: String,
    pub cookie_domain: Option<String>,
    /// Cookie lifetime in seconds; absent or zero means a browser-session cookie.
    pub cookie_lifetime: Option<u64>,
    pub force_https: bool,
    pub hsts_enabled: bool,
    pub force_secure_cookie: bool,
    /// Seconds without a commit after which a stored session may be purged.
    pub record_max_idle: u64,
    /// One commit in this many also purges idle sessions; 0 never does.
    pub gc_probability: u32,
    pub key_ring: KeyRingConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            cookie_name: "folio_session".to_string(),
            cookie_path: "/".to_string(),
            cookie_domain: None,
            cookie_lifetime: None,
            force_https: false,
            hsts_enabled: false,
            force_secure_cookie: false,
            record_max_idle: 24 * 60 * 60,
            gc_probability: 100,
            key_ring: KeyRingConfig::default(),
        }
    }
}

impl SessionOptions {
    pub fn record_max_idle(&self) -> Duration {
        Duration::from_secs(self.record_max_idle)
    }

    /// Hardened cookie attributes for a request. `httponly`, `SameSite=Strict`
    /// and strict id adoption are not configurable.
    pub fn cookie_params(&self, secure_request: bool) -> CookieParams {
        let secure = secure_request || self.force_https || self.force_secure_cookie;
        CookieParams {
            name: self.cookie_name.clone(),
            path: self.cookie_path.clone(),
            domain: self.cookie_domain.clone().filter(|d| !d.is_empty()),
            secure,
            http_only: true,
            same_site: SameSite::Strict,
            lifetime: self.cookie_lifetime.filter(|secs| *secs > 0),
            strict_mode: true,
            hsts_max_age: (self.hsts_enabled && secure).then_some(HSTS_MAX_AGE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_http_defaults_are_hardened_but_not_secure() {
        let params = SessionOptions::default().cookie_params(false);
        assert!(params.http_only);
        assert!(params.strict_mode);
        assert_eq!(params.same_site, SameSite::Strict);
        assert!(!params.secure);
        assert_eq!(params.hsts_max_age, None);
    }

    #[test]
    fn https_or_forcing_sets_secure() {
        let options = SessionOptions::default();
        assert!(options.cookie_params(true).secure);

        let forced = SessionOptions {
            force_secure_cookie: true,
            ..SessionOptions::default()
        };
        assert!(forced.cookie_params(false).secure);

        let https = SessionOptions {
            force_https: true,
            hsts_enabled: true,
            ..SessionOptions::default()
        };
        let params = https.cookie_params(false);
        assert!(params.secure);
        assert_eq!(params.hsts_max_age, Some(HSTS_MAX_AGE));
    }

    #[test]
    fn hsts_needs_a_secure_cookie() {
        let options = SessionOptions {
            hsts_enabled: true,
            ..SessionOptions::default()
        };
        assert_eq!(options.cookie_params(false).hsts_max_age, None);
    }

    #[test]
    fn zero_lifetime_and_empty_domain_are_ignored() {
        let options = SessionOptions {
            cookie_lifetime: Some(0),
            cookie_domain: Some(String::new()),
            ..SessionOptions::default()
        };
        let params = options.cookie_params(false);
        assert_eq!(params.lifetime, None);
        assert_eq!(params.domain, None);
    }
}
