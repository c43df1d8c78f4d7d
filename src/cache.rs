//! Fingerprint cache for expensive source fetches.
//!
//! Each fetch is content-addressed by the SHA-256 of its logical identity
//! (locator plus selector). A slot directory `<root>/<hex key>` holds the
//! fetched tree; its mtime records when it was built. Slots older than the
//! freshness window are treated as absent and rebuilt through a staging
//! directory that is renamed into place only once fully populated.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::util::{blocking, blocking_with_timeout, copy_tree, remove_path};
use crate::{blog, blog_debug, blog_warn, Error, Result};

const STAGING_PREFIX: &str = ".staging-";

/// Something that can populate a directory from a source locator.
///
/// Implementations are blocking; the cache calls them on the blocking pool.
pub trait Fetcher: Send + Sync {
    /// Populate `dest` (which does not exist yet) from `locator`.
    fn fetch(&self, locator: &str, selector: Option<&str>, dest: &Path) -> Result<()>;

    /// Finish a freshly fetched tree in place, e.g. initialize submodules.
    fn post_fetch(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Outcome of a [`FingerprintCache::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A fresh slot already existed.
    Hit(PathBuf),
    /// The slot was missing or stale and has been rebuilt.
    Rebuilt(PathBuf),
}

impl Resolution {
    pub fn path(&self) -> &Path {
        match self {
            Resolution::Hit(p) | Resolution::Rebuilt(p) => p,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Resolution::Hit(_))
    }
}

/// SHA-256 of the fetch identity, lower-case hex.
///
/// The locator is terminated by a NUL byte and the selector is tagged, so an
/// absent selector and an empty one produce different keys.
pub fn fingerprint(locator: &str, selector: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(locator.as_bytes());
    hasher.update([0u8]);
    match selector {
        None => hasher.update([0u8]),
        Some(s) => {
            hasher.update([1u8]);
            hasher.update(s.as_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Whether `path` exists and was modified within `max_age`.
///
/// An mtime in the future counts as fresh.
fn is_fresh(path: &Path, max_age: Duration) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_dir() {
        return false;
    }
    match meta.modified() {
        Ok(mtime) => match SystemTime::now().duration_since(mtime) {
            Ok(age) => age <= max_age,
            Err(_) => true,
        },
        Err(_) => false,
    }
}

/// Set a directory's mtime.
pub fn set_mtime(path: &Path, when: SystemTime) -> std::io::Result<()> {
    fs::File::open(path)?.set_modified(when)
}

fn is_expired(path: &Path, max_age: Duration) -> bool {
    fs::symlink_metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
        .is_some_and(|age| age > max_age)
}

fn is_slot_name(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

pub struct FingerprintCache {
    root: PathBuf,
    max_age: Duration,
    fetcher: Arc<dyn Fetcher>,
    fetch_timeout: Option<Duration>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl FingerprintCache {
    pub fn new(root: PathBuf, max_age: Duration, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            root,
            max_age,
            fetcher,
            fetch_timeout: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Abandon a rebuild that takes longer than `timeout`.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn slot_path(&self, locator: &str, selector: Option<&str>) -> PathBuf {
        self.root.join(fingerprint(locator, selector))
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Return a fresh slot for `(locator, selector)`, rebuilding it if it is
    /// missing or older than the freshness window.
    pub async fn resolve(&self, locator: &str, selector: Option<&str>) -> Result<Resolution> {
        let key = fingerprint(locator, selector);
        let slot = self.root.join(&key);

        if is_fresh(&slot, self.max_age) {
            blog_debug!("cache hit {} ({})", locator, key);
            return Ok(Resolution::Hit(slot));
        }

        let guard = self.key_lock(&key).lock_owned().await;

        // Another task may have rebuilt the slot while we waited.
        if is_fresh(&slot, self.max_age) {
            blog_debug!("cache hit after wait {} ({})", locator, key);
            return Ok(Resolution::Hit(slot));
        }

        blog!("cache miss {} selector={:?}, fetching", locator, selector);
        self.rebuild(guard, &key, locator, selector).await?;
        Ok(Resolution::Rebuilt(slot))
    }

    /// Fetch into a staging directory and rename it into the slot.
    ///
    /// The key guard moves into the blocking task, so a fetch abandoned by
    /// the timeout keeps the key locked until its thread actually exits.
    async fn rebuild(
        &self,
        guard: OwnedMutexGuard<()>,
        key: &str,
        locator: &str,
        selector: Option<&str>,
    ) -> Result<()> {
        let root = self.root.clone();
        let slot = root.join(key);
        let staging = root.join(format!("{}{}-{}", STAGING_PREFIX, key, Uuid::new_v4()));
        let fetcher = Arc::clone(&self.fetcher);
        let owned_locator = locator.to_string();
        let owned_selector = selector.map(str::to_string);

        let work = move || -> Result<()> {
            let _guard = guard;
            fs::create_dir_all(&root)?;
            remove_path(&slot)?;
            let outcome = (|| -> Result<()> {
                fetcher.fetch(&owned_locator, owned_selector.as_deref(), &staging)?;
                fetcher.post_fetch(&staging)?;
                fs::rename(&staging, &slot)?;
                set_mtime(&slot, SystemTime::now())?;
                Ok(())
            })();
            if outcome.is_err() {
                let _ = remove_path(&staging);
            }
            outcome
        };

        let result = match self.fetch_timeout {
            Some(timeout) => blocking_with_timeout(timeout, work).await,
            None => blocking(work).await,
        };

        result.map_err(|e| {
            blog_warn!("fetch of {} failed: {}", locator, e);
            match e {
                Error::Fetch { .. } => e,
                other => Error::Fetch {
                    locator: locator.to_string(),
                    reason: other.to_string(),
                },
            }
        })
    }

    /// Resolve, then copy the slot's contents into `dest`, replacing whatever
    /// was there. The slot itself is never handed out as a working copy.
    pub async fn materialize(
        &self,
        locator: &str,
        selector: Option<&str>,
        dest: &Path,
    ) -> Result<Resolution> {
        let resolution = self.resolve(locator, selector).await?;
        let slot = resolution.path().to_path_buf();
        let dest = dest.to_path_buf();
        blocking(move || {
            remove_path(&dest)?;
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            copy_tree(&slot, &dest)?;
            Ok(())
        })
        .await?;
        Ok(resolution)
    }

    /// Remove expired slots and staging directories left behind by crashed
    /// runs. Returns the number of entries removed.
    pub async fn prune(&self) -> Result<usize> {
        let root = self.root.clone();
        let max_age = self.max_age;
        blocking(move || {
            let entries = match fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
                Err(e) => return Err(e.into()),
            };
            let mut removed = 0;
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if !(is_slot_name(&name) || name.starts_with(STAGING_PREFIX)) {
                    continue;
                }
                let path = entry.path();
                if is_expired(&path, max_age) {
                    blog_debug!("pruning {}", path.display());
                    remove_path(&path)?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
    }
}
