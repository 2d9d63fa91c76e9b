//! Liveness file for external health probes.
//!
//! The process is healthy while the file's modification time is recent. The
//! poll loop touches it only after a cycle got as far as a parsed listing, so
//! a relay that is up but can no longer read the portal goes stale.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

/// Handle to the health file; a no-op when no path is configured.
#[derive(Debug, Clone, Default)]
pub struct HealthSignal {
    path: Option<PathBuf>,
}

impl HealthSignal {
    /// Creates a signal writing to `path`, or a disabled one for `None`.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// A signal that does nothing.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// The configured file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Creates the file (and its directory) at startup.
    pub fn init(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create health directory {}", parent.display()))?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to create health file {}", path.display()))?;
        log::info!("Health file: {}", path.display());
        Ok(())
    }

    /// Sets the file's modification time to now, creating it if needed.
    pub fn touch(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open health file {}", path.display()))?;
        file.set_modified(SystemTime::now())
            .with_context(|| format!("Failed to touch health file {}", path.display()))?;
        Ok(())
    }

    /// Time since the last touch, or `None` when disabled or missing.
    pub fn age(&self) -> Option<Duration> {
        let path = self.path.as_ref()?;
        let modified = File::open(path).and_then(|f| f.metadata()).and_then(|m| m.modified()).ok()?;
        Some(SystemTime::now().duration_since(modified).unwrap_or(Duration::ZERO))
    }

    /// Returns true when the file was touched less than `max_age` ago.
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.age().is_some_and(|age| age < max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_disabled_is_noop() {
        let health = HealthSignal::disabled();
        assert!(health.init().is_ok());
        assert!(health.touch().is_ok());
        assert!(health.age().is_none());
        assert!(!health.is_fresh(Duration::from_secs(60)));
    }

    #[test]
    fn test_init_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("health");
        let health = HealthSignal::new(Some(path.clone()));
        health.init().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_touch_refreshes_mtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("health");
        let health = HealthSignal::new(Some(path.clone()));
        health.init().unwrap();

        let old = SystemTime::now() - Duration::from_secs(3600);
        File::options().write(true).open(&path).unwrap().set_modified(old).unwrap();
        assert!(!health.is_fresh(Duration::from_secs(900)));

        health.touch().unwrap();
        assert!(health.is_fresh(Duration::from_secs(900)));
    }

    #[test]
    fn test_missing_file_is_not_fresh() {
        let dir = TempDir::new().unwrap();
        let health = HealthSignal::new(Some(dir.path().join("absent")));
        assert!(health.age().is_none());
        assert!(!health.is_fresh(Duration::from_secs(900)));
    }
}
