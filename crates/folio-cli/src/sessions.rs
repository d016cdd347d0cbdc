use std::path::PathBuf;

use crate::config::Config;
use color_eyre::Result;
use dirs::data_dir;
use folio_keys::KeyRing;
use folio_session::{SessionManager, SessionRecords};
use tracing::debug;

/// Resolve the default data directory for Folio.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("folio"))
}

/// Bootstrap the key ring described by the config.
pub fn manager_from_config(config: &Config) -> Result<SessionManager> {
    debug!(key_dir = ?config.session.key_ring.key_dir, "bootstrapping session keys");
    Ok(SessionManager::bootstrap(config.session.clone())?)
}

/// Open the key ring without rotating it, for operator commands that report
/// on rotation themselves.
pub fn ring_from_config(config: &Config) -> Result<KeyRing> {
    debug!(key_dir = ?config.session.key_ring.key_dir, "opening session keys");
    Ok(KeyRing::open(config.session.key_ring.clone())?)
}

/// Remove session records idle for longer than `record_max_idle`.
pub fn purge_idle(config: &Config) -> Result<usize> {
    let records = records_from_config(config)?;
    Ok(records.purge_idle(config.session.record_max_idle())?)
}

/// Open the session record directory, honouring the config override.
pub fn records_from_config(config: &Config) -> Result<SessionRecords> {
    let root = match &config.record_dir {
        Some(root) => root.clone(),
        None => default_data_dir()?.join("sessions"),
    };
    debug!(?root, "opening session records");
    Ok(SessionRecords::open(root)?)
}

/// Config rooted entirely inside a temp dir, for tests.
#[cfg(test)]
pub fn test_config(root: &std::path::Path) -> Config {
    let mut config = Config {
        record_dir: Some(root.join("sessions")),
        ..Config::default()
    };
    config.session.key_ring.key_dir = root.join("keys");
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_idle_uses_configured_age() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = test_config(dir.path());
        let records = records_from_config(&config).expect("records");
        let id = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        records.save(id, &Default::default()).expect("save");

        assert_eq!(purge_idle(&config).expect("purge"), 0);

        config.session.record_max_idle = 0;
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(purge_idle(&config).expect("purge"), 1);
        assert!(!records.contains(id));
    }
}
