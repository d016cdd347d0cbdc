//! Directory-backed ring of AES-256 keys.
//!
//! Each key is a small JSON record in its own file. The newest key encrypts,
//! older keys are kept only so recently issued tokens keep decoding. Mutation
//! relies on atomic file replacement alone: two processes racing to create a
//! key simply leave one extra key behind, which the next prune removes.

use std::{
    collections::BTreeSet,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, RwLock, RwLockReadGuard},
    time::{Duration, Instant},
};

use aes_gcm::{Aes256Gcm, Key as AesKey, KeyInit};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, TimeDelta, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::fs::{ensure_directory, write_atomic, PRIVATE_DIR_MODE, PRIVATE_FILE_MODE};

const RECORD_VERSION: u8 = 1;
const FILE_PREFIX: &str = "key-";
const FILE_EXTENSION: &str = "json";

/// Fatal provisioning failures. A deployment hitting one of these cannot mask ids.
#[derive(Debug, Error)]
pub enum KeyRingError {
    #[error("key directory {path}: {source}")]
    Directory { path: PathBuf, source: io::Error },
    #[error("failed to persist key {path}: {source}")]
    Persist { path: PathBuf, source: io::Error },
    #[error("no usable key in {0}")]
    Empty(PathBuf),
    #[error("key ring lock poisoned")]
    Poisoned,
    #[error("cipher failure: {0}")]
    Cipher(String),
}

/// Where keys live and how long they stay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyRingConfig {
    pub key_dir: PathBuf,
    /// Seconds before the newest key is considered stale.
    pub rotation_interval: u64,
    /// Number of newest keys kept on disk.
    pub retain_keys: usize,
    /// Seconds between checks of the key directory for keys written by
    /// other processes, and for rotation.
    pub refresh_interval: u64,
}

impl Default for KeyRingConfig {
    fn default() -> Self {
        Self {
            key_dir: PathBuf::from("config").join("session_keys"),
            rotation_interval: 30 * 24 * 60 * 60,
            retain_keys: 3,
            refresh_interval: 60,
        }
    }
}

impl KeyRingConfig {
    pub fn new(key_dir: impl Into<PathBuf>) -> Self {
        Self {
            key_dir: key_dir.into(),
            ..Self::default()
        }
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }

    fn retain(&self) -> usize {
        self.retain_keys.max(1)
    }
}

/// One immutable 256-bit key. Key bytes are wiped on drop and never printed.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Key {
    #[zeroize(skip)]
    id: Uuid,
    #[zeroize(skip)]
    created_at: DateTime<Utc>,
    #[zeroize(skip)]
    path: PathBuf,
    bytes: [u8; 32],
}

impl Key {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(&self.bytes))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Operator-facing view of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySummary {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyRecord {
    version: u8,
    id: Uuid,
    created_at: DateTime<Utc>,
    key: String,
}

/// Rotating set of keys, newest first.
///
/// Several processes may share one key directory; [`KeyRing::refresh`] picks
/// up what the others wrote.
#[derive(Debug)]
pub struct KeyRing {
    config: KeyRingConfig,
    keys: RwLock<Vec<Key>>,
    /// Key files seen by the last scan, unreadable ones included.
    listing: Mutex<BTreeSet<PathBuf>>,
    refreshed_at: Mutex<Instant>,
}

struct Scan {
    keys: Vec<Key>,
    listing: BTreeSet<PathBuf>,
}

impl KeyRing {
    /// Harden the key directory and load it, creating the first key if none exist.
    #[instrument(skip_all, fields(dir = %config.key_dir.display()))]
    pub fn open(config: KeyRingConfig) -> Result<Self, KeyRingError> {
        let ring = Self {
            config,
            keys: RwLock::new(Vec::new()),
            listing: Mutex::new(BTreeSet::new()),
            refreshed_at: Mutex::new(Instant::now()),
        };
        ring.ensure_directory()?;
        ring.load_keys()?;
        Ok(ring)
    }

    pub fn config(&self) -> &KeyRingConfig {
        &self.config
    }

    pub fn dir(&self) -> &Path {
        &self.config.key_dir
    }

    /// Create the key directory and re-apply `0700` to it.
    pub fn ensure_directory(&self) -> Result<(), KeyRingError> {
        ensure_directory(self.dir(), PRIVATE_DIR_MODE).map_err(|source| KeyRingError::Directory {
            path: self.dir().to_path_buf(),
            source,
        })
    }

    /// Reload keys from disk. An empty directory gets one fresh key; if the
    /// ring is still empty afterwards the directory is unusable.
    #[instrument(skip_all)]
    pub fn load_keys(&self) -> Result<usize, KeyRingError> {
        let mut scan = scan_dir(self.dir())?;
        if scan.keys.is_empty() {
            info!("key ring empty, generating initial key");
            write_key(self.dir(), None)?;
            scan = scan_dir(self.dir())?;
        }
        if scan.keys.is_empty() {
            return Err(KeyRingError::Empty(self.dir().to_path_buf()));
        }

        let count = self.install(scan)?;
        debug!(count, "loaded keys");
        Ok(count)
    }

    /// Reload when key files appeared or disappeared since the last scan.
    /// Returns whether the ring was reloaded.
    pub fn reload_if_changed(&self) -> Result<bool, KeyRingError> {
        let on_disk = key_paths(self.dir())?;
        let changed = *self.listing.lock().map_err(|_| KeyRingError::Poisoned)? != on_disk;
        if changed {
            debug!("key directory changed, reloading");
            self.load_keys()?;
        }
        Ok(changed)
    }

    /// Pick up keys written or pruned by other processes, then rotate if the
    /// newest key is stale. Returns whether the ring changed.
    #[instrument(skip_all)]
    pub fn refresh(&self) -> Result<bool, KeyRingError> {
        let reloaded = self.reload_if_changed()?;
        let rotated = self.rotate_if_needed()?;
        *self.refreshed_at.lock().map_err(|_| KeyRingError::Poisoned)? = Instant::now();
        Ok(reloaded || rotated)
    }

    /// [`KeyRing::refresh`], at most once per `refresh_interval`.
    pub fn refresh_if_due(&self) -> Result<bool, KeyRingError> {
        let last = *self.refreshed_at.lock().map_err(|_| KeyRingError::Poisoned)?;
        if last.elapsed() < self.config.refresh_interval() {
            return Ok(false);
        }
        self.refresh()
    }

    /// Persist a new key, reload the ring, then prune past the retention count.
    #[instrument(skip_all)]
    pub fn generate_key(&self) -> Result<Uuid, KeyRingError> {
        let newest = self.read()?.first().map(Key::created_at);
        let id = write_key(self.dir(), newest)?;
        info!(%id, "generated key");

        self.install(scan_dir(self.dir())?)?;
        self.prune_old_keys(self.config.retain())?;
        Ok(id)
    }

    /// Generate a new key when the newest one is older than the rotation
    /// interval. Returns whether a key was generated.
    pub fn rotate_if_needed(&self) -> Result<bool, KeyRingError> {
        let newest = self.read()?.first().map(Key::created_at);
        let interval = i64::try_from(self.config.rotation_interval)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);

        let due = match newest {
            Some(created_at) => Utc::now().signed_duration_since(created_at) > interval,
            None => true,
        };
        if due {
            self.generate_key()?;
        }
        Ok(due)
    }

    /// Generate a new key regardless of the newest key's age.
    pub fn rotate(&self) -> Result<Uuid, KeyRingError> {
        self.generate_key()
    }

    /// Keep the newest `retain` keys and delete the rest. Files that cannot be
    /// removed are logged and stay in the ring. Returns how many were removed.
    #[instrument(skip(self))]
    pub fn prune_old_keys(&self, retain: usize) -> Result<usize, KeyRingError> {
        let mut keys = self.keys.write().map_err(|_| KeyRingError::Poisoned)?;
        if keys.len() <= retain {
            return Ok(0);
        }

        let expired = keys.split_off(retain);
        let mut gone = Vec::new();
        for key in expired {
            match fs::remove_file(&key.path) {
                Ok(()) => {
                    info!(id = %key.id, "pruned key");
                    gone.push(key.path.clone());
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => gone.push(key.path.clone()),
                Err(err) => {
                    warn!(path = %key.path.display(), error = %err, "cannot remove old key, skipping");
                    keys.push(key);
                }
            }
        }

        let mut listing = self.listing.lock().map_err(|_| KeyRingError::Poisoned)?;
        for path in &gone {
            listing.remove(path);
        }
        Ok(gone.len())
    }

    pub fn len(&self) -> usize {
        self.read().map(|keys| keys.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summaries(&self) -> Result<Vec<KeySummary>, KeyRingError> {
        Ok(self
            .read()?
            .iter()
            .map(|key| KeySummary {
                id: key.id,
                created_at: key.created_at,
            })
            .collect())
    }

    fn install(&self, scan: Scan) -> Result<usize, KeyRingError> {
        let count = scan.keys.len();
        *self.keys.write().map_err(|_| KeyRingError::Poisoned)? = scan.keys;
        *self.listing.lock().map_err(|_| KeyRingError::Poisoned)? = scan.listing;
        Ok(count)
    }

    /// Keys newest first, for the codec.
    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Vec<Key>>, KeyRingError> {
        self.keys.read().map_err(|_| KeyRingError::Poisoned)
    }
}

fn key_paths(dir: &Path) -> Result<BTreeSet<PathBuf>, KeyRingError> {
    let entries = fs::read_dir(dir).map_err(|source| KeyRingError::Directory {
        path: dir.to_path_buf(),
        source,
    })?;
    Ok(entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| is_key_file(path))
        .collect())
}

fn scan_dir(dir: &Path) -> Result<Scan, KeyRingError> {
    let listing = key_paths(dir)?;
    let mut keys: Vec<Key> = listing
        .iter()
        .filter_map(|path| match read_key(path) {
            Ok(key) => Some(key),
            Err(reason) => {
                debug!(path = %path.display(), %reason, "skipping unreadable key file");
                None
            }
        })
        .collect();

    keys.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    Ok(Scan { keys, listing })
}

fn is_key_file(path: &Path) -> bool {
    let named = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(FILE_PREFIX));
    let json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == FILE_EXTENSION);
    named && json && path.is_file()
}

fn read_key(path: &Path) -> Result<Key, String> {
    let raw = fs::read(path).map_err(|e| e.to_string())?;
    let record: KeyRecord = serde_json::from_slice(&raw).map_err(|e| e.to_string())?;
    if record.version != RECORD_VERSION {
        return Err(format!("unsupported record version {}", record.version));
    }
    Ok(Key {
        id: record.id,
        created_at: record.created_at,
        path: path.to_path_buf(),
        bytes: decode_key(&record.key)?,
    })
}

/// Write a fresh key strictly newer than `newest` and return its id.
fn write_key(dir: &Path, newest: Option<DateTime<Utc>>) -> Result<Uuid, KeyRingError> {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);

    let mut created_at = Utc::now();
    if let Some(newest) = newest {
        if created_at <= newest {
            created_at = newest + TimeDelta::nanoseconds(1);
        }
    }

    let id = Uuid::new_v4();
    let record = KeyRecord {
        version: RECORD_VERSION,
        id,
        created_at,
        key: encode_key(&bytes),
    };
    bytes.zeroize();

    let path = dir.join(format!(
        "{FILE_PREFIX}{}-{}.{FILE_EXTENSION}",
        created_at.format("%Y%m%d%H%M%S%9f"),
        id.simple()
    ));
    let mut json = serde_json::to_vec(&record).map_err(|e| KeyRingError::Persist {
        path: path.clone(),
        source: io::Error::other(e),
    })?;
    let written = write_atomic(&path, &json, PRIVATE_FILE_MODE);
    json.zeroize();
    written.map_err(|source| KeyRingError::Persist { path, source })?;
    Ok(id)
}

fn encode_key(bytes: &[u8; 32]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

fn decode_key(secret: &str) -> Result<[u8; 32], String> {
    let mut bytes = general_purpose::STANDARD
        .decode(secret)
        .map_err(|e| e.to_string())?;

    if bytes.len() != 32 {
        let len = bytes.len();
        bytes.zeroize();
        return Err(format!("expected 32 bytes, got {len}"));
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(out)
}
