mod settings;

pub use settings::{
    Config, ServerSettings, SessionSettings, TomlCheckpointConfig, TomlConfig, TomlServerConfig,
    TomlSessionConfig, TomlWatcherConfig,
};
