use std::sync::Arc;

use folio_core::transport::SessionTransport;
use folio_keys::{IdentifierCodec, KeyRing};
use tracing::{debug, info, instrument, warn};

use crate::{
    options::SessionOptions,
    store::{SessionError, SessionStore},
};

/// Process-level entry point. Bootstraps the key ring once and hands every
/// request its own started [`SessionStore`] sharing that ring. The ring is
/// re-checked against the key directory every `refresh_interval`, so a
/// long-running process rotates on schedule and sees keys other processes
/// wrote.
#[derive(Debug, Clone)]
pub struct SessionManager {
    options: SessionOptions,
    key_ring: Arc<KeyRing>,
}

impl SessionManager {
    /// Harden and load the key directory, rotating if the newest key is stale.
    /// Failure here means the deployment is misconfigured.
    #[instrument(skip_all)]
    pub fn bootstrap(options: SessionOptions) -> Result<Self, SessionError> {
        let key_ring = KeyRing::open(options.key_ring.clone())?;
        if key_ring.rotate_if_needed()? {
            info!("rotated session key");
        }
        Ok(Self {
            options,
            key_ring: Arc::new(key_ring),
        })
    }

    /// Started session for one request.
    pub fn session<T: SessionTransport>(&self, transport: T) -> SessionStore<T> {
        self.refresh_keys();
        let mut store = SessionStore::new(transport, self.key_ring.clone(), self.options.clone());
        store.start();
        store
    }

    /// Mask an id outside any request, e.g. from a maintenance task.
    pub fn mask_id(&self, id: u64) -> Result<String, SessionError> {
        self.refresh_keys();
        Ok(self.codec().mask(id)?)
    }

    pub fn unmask_id(&self, token: &str) -> Option<u64> {
        self.codec().unmask(token)
    }

    pub fn key_ring(&self) -> &Arc<KeyRing> {
        &self.key_ring
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    fn codec(&self) -> IdentifierCodec {
        IdentifierCodec::new(self.key_ring.clone())
    }

    /// A failed refresh keeps the keys already loaded.
    fn refresh_keys(&self) {
        match self.key_ring.refresh_if_due() {
            Ok(true) => debug!("session keys refreshed"),
            Ok(false) => {}
            Err(err) => warn!(error = %err, "session key refresh failed, using loaded keys"),
        }
    }
}

#[cfg(test)]
mod tests {
    use folio_core::transport::{MemoryBackend, MemoryTransport};
    use folio_keys::KeyRingConfig;

    use super::*;
    use crate::{cookie_transport::CookieTransport, records::SessionRecords, store::Lifecycle};

    fn options(dir: &std::path::Path) -> SessionOptions {
        SessionOptions {
            key_ring: KeyRingConfig::new(dir.join("keys")),
            ..SessionOptions::default()
        }
    }

    #[test]
    fn bootstrap_creates_a_key_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = SessionManager::bootstrap(options(dir.path())).expect("bootstrap");
        let second = SessionManager::bootstrap(options(dir.path())).expect("bootstrap again");
        assert_eq!(first.key_ring().len(), 1);
        assert_eq!(
            first.key_ring().summaries().expect("summaries"),
            second.key_ring().summaries().expect("summaries")
        );
    }

    #[test]
    fn sessions_share_the_key_ring() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::bootstrap(options(dir.path())).expect("bootstrap");
        let one = manager.session(MemoryTransport::new(MemoryBackend::new()));
        let two = manager.session(MemoryTransport::new(MemoryBackend::new()));

        assert_eq!(one.lifecycle(), Lifecycle::Active);
        let token = one.mask_id(5).expect("mask");
        assert_eq!(two.unmask_id(&token), Some(5));
    }

    #[test]
    fn cookie_round_trip_across_requests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::bootstrap(SessionOptions {
            force_https: true,
            hsts_enabled: true,
            ..options(dir.path())
        })
        .expect("bootstrap");
        let records = SessionRecords::open(dir.path().join("sessions")).expect("records");

        let mut first = manager.session(CookieTransport::new(records.clone(), None, false));
        first.set_user_id(11);
        let csrf = first.csrf_token();
        first.commit().expect("commit");
        let headers = first.transport().response_headers();
        assert!(headers
            .iter()
            .any(|(name, _)| *name == "Strict-Transport-Security"));
        let set_cookie = first.transport().set_cookie_headers();
        let cookie = set_cookie[0]
            .split(';')
            .next()
            .expect("name=value")
            .to_string();

        let mut second = manager.session(CookieTransport::new(records, Some(&cookie), true));
        assert_eq!(second.user_id(), Some(11));
        assert!(second.validate_csrf(&csrf));

        second.regenerate(true);
        second.destroy();
        assert_eq!(second.user_id(), None);
        assert!(!second.validate_csrf(&csrf));
    }

    #[test]
    fn sees_keys_rotated_by_another_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut opts = options(dir.path());
        opts.key_ring.retain_keys = 2;
        let manager = SessionManager::bootstrap(opts.clone()).expect("bootstrap");

        let other = KeyRing::open(opts.key_ring.clone()).expect("open");
        other.rotate().expect("rotate");
        other.rotate().expect("rotate");
        let theirs = IdentifierCodec::new(Arc::new(other));
        let token = theirs.mask(77).expect("mask");

        let session = manager.session(MemoryTransport::new(MemoryBackend::new()));
        assert_eq!(session.unmask_id(&token), Some(77));
        let ours = session.mask_id(78).expect("mask");
        assert_eq!(theirs.unmask(&ours), Some(78));
        assert_eq!(manager.key_ring().len(), 2);
    }

    #[test]
    fn long_running_manager_rotates_on_schedule() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut opts = options(dir.path());
        opts.key_ring.rotation_interval = 0;
        opts.key_ring.refresh_interval = 0;
        let manager = SessionManager::bootstrap(opts).expect("bootstrap");
        let before = manager.key_ring().summaries().expect("summaries")[0].id;

        std::thread::sleep(std::time::Duration::from_millis(5));
        let _session = manager.session(MemoryTransport::new(MemoryBackend::new()));
        let after = manager.key_ring().summaries().expect("summaries")[0].id;
        assert_ne!(before, after);
    }

    #[test]
    fn commit_purges_idle_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::bootstrap(SessionOptions {
            record_max_idle: 60,
            gc_probability: 1,
            ..options(dir.path())
        })
        .expect("bootstrap");
        let records = SessionRecords::open(dir.path().join("sessions")).expect("records");

        let abandoned = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        records
            .save(abandoned, &folio_core::transport::SessionState::new())
            .expect("save");
        std::fs::File::options()
            .write(true)
            .open(records.root().join(format!("{abandoned}.json")))
            .expect("open record")
            .set_modified(std::time::SystemTime::now() - std::time::Duration::from_secs(600))
            .expect("set mtime");

        let mut session = manager.session(CookieTransport::new(records.clone(), None, false));
        session.set_user_id(1);
        session.commit().expect("commit");

        assert!(!records.contains(abandoned));
        assert!(records.contains(session.id().expect("active")));
    }

    #[test]
    fn masks_outside_a_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = SessionManager::bootstrap(options(dir.path())).expect("bootstrap");
        let token = manager.mask_id(3).expect("mask");
        assert_eq!(manager.unmask_id(&token), Some(3));
        assert_eq!(manager.unmask_id("garbage"), None);
    }
}
