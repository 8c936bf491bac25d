//! Locating and reading `switchyard.toml`.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{ConfigError, Result, SwitchyardConfig};

pub const CONFIG_FILE_NAME: &str = "switchyard.toml";

/// Platform config directory, e.g. `~/.config/switchyard` on Linux.
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "switchyard").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Parse TOML text. `path` is only used in error messages.
pub fn parse(text: &str, path: &Path) -> Result<SwitchyardConfig> {
    toml::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load an explicit file. A missing file is an error here.
pub fn load(path: &Path) -> Result<SwitchyardConfig> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse(&text, path)?;
    debug!(path = %path.display(), "loaded config");
    Ok(config)
}

/// Search `./switchyard.toml`, then the platform config directory. Returns
/// defaults when neither exists.
pub fn discover_and_load() -> Result<SwitchyardConfig> {
    discover_in(Path::new("."), config_dir().as_deref())
}

/// [`discover_and_load`] with explicit search roots.
pub fn discover_in(cwd: &Path, config_dir: Option<&Path>) -> Result<SwitchyardConfig> {
    let candidates = std::iter::once(cwd.join(CONFIG_FILE_NAME))
        .chain(config_dir.map(|dir| dir.join(CONFIG_FILE_NAME)));
    for candidate in candidates {
        if candidate.is_file() {
            return load(&candidate);
        }
    }
    debug!("no config file found, using defaults");
    Ok(SwitchyardConfig::default())
}
