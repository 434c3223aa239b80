//! Path layout for rewind state directories

use std::path::{Path, PathBuf};

/// Every on-disk location used by the server, watcher and traced child.
///
/// All three processes derive their paths from the same data directory, so
/// they agree on where the database, mailbox files and checkpoint images live
/// without sharing any in-memory state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    data_dir: PathBuf,
}

impl Paths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Resolve the data directory from an optional override, defaulting to ~/.rewind
    pub fn resolve(custom: Option<PathBuf>) -> Self {
        Self::new(custom.unwrap_or_else(default_data_dir))
    }

    /// Get the base data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Get the database file path (<data>/trace.db)
    pub fn database(&self) -> PathBuf {
        self.data_dir.join("trace.db")
    }

    /// Get the mailbox directory (<data>/mailbox)
    pub fn mailbox_dir(&self) -> PathBuf {
        self.data_dir.join("mailbox")
    }

    /// Get the checkpoint image root (<data>/checkpoints)
    pub fn checkpoints_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    /// Get the directory uploaded targets are written into (<data>/shared)
    pub fn shared_dir(&self) -> PathBuf {
        self.data_dir.join("shared")
    }

    /// Get the canonical location of the uploaded target script
    pub fn target_script(&self, name: &str) -> PathBuf {
        self.shared_dir().join(name)
    }

    /// Get the logs directory (<data>/logs)
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Get the log file for one process role (<data>/logs/<role>.log)
    pub fn log_file(&self, role: &str) -> PathBuf {
        self.logs_dir().join(format!("{role}.log"))
    }

    /// Get the config file path (<data>/config.toml)
    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

/// Get the default data directory path (~/.rewind)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".rewind"))
        .unwrap_or_else(|| PathBuf::from(".rewind"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_share_one_root() {
        let paths = Paths::new("/tmp/rw");
        assert_eq!(paths.database(), PathBuf::from("/tmp/rw/trace.db"));
        assert_eq!(paths.mailbox_dir(), PathBuf::from("/tmp/rw/mailbox"));
        assert_eq!(paths.log_file("watch"), PathBuf::from("/tmp/rw/logs/watch.log"));
        assert_eq!(
            paths.target_script("main.py"),
            PathBuf::from("/tmp/rw/shared/main.py")
        );
    }

    #[test]
    fn test_resolve_prefers_override() {
        let paths = Paths::resolve(Some(PathBuf::from("/srv/rewind")));
        assert_eq!(paths.data_dir(), Path::new("/srv/rewind"));
    }
}
