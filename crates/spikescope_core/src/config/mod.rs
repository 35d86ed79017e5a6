//! Service configuration.
//!
//! TOML-backed settings split into sections, managed by [`ConfigManager`]
//! with atomic writes.

mod manager;
mod settings;

pub use manager::{ConfigError, ConfigManager, ConfigResult};
pub use settings::{
    LoggingSettings, PathSettings, RecordingSettings, RemoteSettings, Settings, SignalSettings,
    SortingSettings,
};
