use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::util::Paths;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// State directory layout shared by every process role
    pub paths: Paths,
    /// Web server settings
    pub server: ServerSettings,
    /// Polling and session settings
    pub session: SessionSettings,
    /// Command prefix used when spawning the watcher (e.g. ["sudo", "-E"])
    pub watcher_command_prefix: Vec<String>,
    /// Explicit path to the criu binary (None = look it up on PATH)
    pub criu_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Enable CORS for any origin.
    pub cors_permissive: bool,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Interval between mailbox polls
    pub poll_interval: Duration,
    /// How many polls the tracer waits for a checkpoint ack before failing
    pub ack_poll_budget: u32,
    /// Time a watcher gets to exit after SIGTERM before it is killed
    pub shutdown_grace: Duration,
    /// File name the uploaded target is stored under
    pub target_name: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            cors_permissive: true,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            ack_poll_budget: 600,
            shutdown_grace: Duration::from_secs(2),
            target_name: "main.py".to_string(),
        }
    }
}

/// TOML representation of the config file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlConfig {
    pub server: Option<TomlServerConfig>,
    pub session: Option<TomlSessionConfig>,
    pub watcher: Option<TomlWatcherConfig>,
    pub checkpoint: Option<TomlCheckpointConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub cors_permissive: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlSessionConfig {
    pub poll_interval_ms: Option<u64>,
    pub ack_poll_budget: Option<u32>,
    pub shutdown_grace_ms: Option<u64>,
    pub target_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlWatcherConfig {
    pub command_prefix: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TomlCheckpointConfig {
    pub criu_path: Option<PathBuf>,
}

impl Config {
    /// Defaults rooted at the given state directory
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            server: ServerSettings::default(),
            session: SessionSettings::default(),
            watcher_command_prefix: Vec::new(),
            criu_path: None,
        }
    }

    /// Load configuration from `<data-dir>/config.toml`, merging with defaults
    pub fn load(paths: Paths) -> Self {
        let config_file = paths.config_file();
        let mut config = Config::new(paths);

        if !config_file.exists() {
            return config;
        }

        match fs::read_to_string(&config_file) {
            Ok(contents) => match toml::from_str::<TomlConfig>(&contents) {
                Ok(toml_config) => config.merge(toml_config),
                Err(e) => {
                    tracing::warn!(
                        path = %config_file.display(),
                        error = %e,
                        "Ignoring malformed config file"
                    );
                }
            },
            Err(e) => {
                tracing::warn!(
                    path = %config_file.display(),
                    error = %e,
                    "Failed to read config file"
                );
            }
        }

        config
    }

    /// Apply every key present in the TOML file on top of the current values
    pub fn merge(&mut self, toml_config: TomlConfig) {
        if let Some(server) = toml_config.server {
            if let Some(host) = server.host {
                self.server.host = host;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(cors) = server.cors_permissive {
                self.server.cors_permissive = cors;
            }
        }

        if let Some(session) = toml_config.session {
            if let Some(ms) = session.poll_interval_ms {
                self.session.poll_interval = Duration::from_millis(ms.max(1));
            }
            if let Some(budget) = session.ack_poll_budget {
                self.session.ack_poll_budget = budget.max(1);
            }
            if let Some(ms) = session.shutdown_grace_ms {
                self.session.shutdown_grace = Duration::from_millis(ms);
            }
            if let Some(name) = session.target_name {
                self.session.target_name = name;
            }
        }

        if let Some(watcher) = toml_config.watcher {
            if let Some(prefix) = watcher.command_prefix {
                self.watcher_command_prefix = prefix;
            }
        }

        if let Some(checkpoint) = toml_config.checkpoint {
            self.criu_path = checkpoint.criu_path;
        }
    }

    /// Canonical location of the uploaded target script
    pub fn target_script(&self) -> PathBuf {
        self.paths.target_script(&self.session.target_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(Paths::new(dir.path()));
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.session.poll_interval, Duration::from_millis(100));
        assert!(config.watcher_command_prefix.is_empty());
        assert_eq!(config.target_script(), dir.path().join("shared/main.py"));
    }

    #[test]
    fn test_partial_file_merges_over_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("config.toml"),
            r#"
                [server]
                port = 9100

                [session]
                poll_interval_ms = 25

                [watcher]
                command_prefix = ["sudo", "-E"]
            "#,
        )
        .unwrap();

        let config = Config::load(Paths::new(dir.path()));
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.session.poll_interval, Duration::from_millis(25));
        assert_eq!(config.session.target_name, "main.py");
        assert_eq!(config.watcher_command_prefix, vec!["sudo", "-E"]);
    }

    #[test]
    fn test_malformed_file_is_ignored() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("config.toml"), "[server\nport = ").unwrap();
        let config = Config::load(Paths::new(dir.path()));
        assert_eq!(config.server.port, 8000);
    }
}
