//! Configuration for switchyard: one TOML file with `[server]`, `[client]`,
//! `[auth]` and `[logging]` sections, every field optional.

pub mod error;
pub mod loader;
pub mod schema;

pub use {
    error::{ConfigError, Result},
    loader::{CONFIG_FILE_NAME, config_dir, discover_and_load, discover_in, load, parse},
    schema::{
        AuthConfig, ClientConfig, LogFormat, LoggingConfig, ServerConfig, SwitchyardConfig,
        UserConfig,
    },
};
