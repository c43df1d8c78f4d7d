use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{blog_debug, Error, Result};

/// Default freshness window for fetch cache slots.
pub const DEFAULT_MAX_AGE_HOURS: u64 = 24;

/// User configuration, read from `~/.benchdag/benchdag.toml`.
///
/// Every field is optional; command-line flags override whatever is set here.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    pub cache_root: Option<String>,
    pub max_age_hours: Option<u64>,
    pub work_root: Option<String>,
    pub jobs: Option<usize>,
    /// Clone depth for the git fetcher. `0` means a full clone.
    pub fetch_depth: Option<u32>,
    /// Give up on a single fetch after this many minutes.
    pub fetch_timeout_minutes: Option<u64>,
}

impl Config {
    pub fn benchdag_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".benchdag"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::benchdag_dir()?.join("benchdag.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        blog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            blog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        blog_debug!("Config loaded: {:?}", config);
        Ok(config)
    }

    /// Root of the fetch cache. Defaults to `<user cache dir>/benchdag/fetch`.
    pub fn cache_root(&self) -> Result<PathBuf> {
        match &self.cache_root {
            Some(dir) => Ok(expand_tilde(dir)),
            None => {
                let base = dirs::cache_dir()
                    .or_else(|| dirs::home_dir().map(|h| h.join(".cache")))
                    .ok_or(Error::NoHomeDir)?;
                Ok(base.join("benchdag").join("fetch"))
            }
        }
    }

    pub fn max_age(&self) -> Duration {
        hours(self.max_age_hours.unwrap_or(DEFAULT_MAX_AGE_HOURS))
    }

    /// Root under which per-instance working directories are created.
    pub fn work_root(&self) -> PathBuf {
        self.work_root
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| PathBuf::from("benchdag-work"))
    }

    pub fn jobs(&self) -> usize {
        self.jobs.filter(|j| *j > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_minutes
            .filter(|m| *m > 0)
            .map(|m| Duration::from_secs(m.saturating_mul(60)))
    }

    pub fn fetch_depth(&self) -> Option<u32> {
        match self.fetch_depth {
            Some(0) => None,
            Some(depth) => Some(depth),
            None => Some(1),
        }
    }
}

/// `h` hours, saturating instead of overflowing.
pub fn hours(h: u64) -> Duration {
    Duration::from_secs(h.saturating_mul(3600))
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
