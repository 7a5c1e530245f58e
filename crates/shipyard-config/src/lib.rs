//! Shipyard user configuration
//!
//! Locates the per-user config directory, loads `config.yml` with
//! environment overrides, and exposes the narrow [`Settings`] interface
//! the build core uses for persisted values such as the BuildKit node id.

pub mod error;
pub mod settings;
pub mod user;

pub use error::*;
pub use settings::{FileSettings, MemorySettings, Settings};
pub use user::{
    DEFAULT_REGISTRY_HOST, KEY_ACCESS_TOKEN, KEY_BUILDKIT_NODE_ID, KEY_REGISTRY_HOST,
    KEY_REMOTE_BUILDER_URL, UserConfig,
};

use std::path::PathBuf;

/// Name of the settings file inside the config directory
pub const CONFIG_FILE_NAME: &str = "config.yml";

/// Shipyardの設定ディレクトリを取得
///
/// `SHIPYARD_CONFIG_DIR` が設定されていればそれを優先し、
/// なければ `<config dir>/shipyard` を使う。存在しなければ作成する。
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = match std::env::var("SHIPYARD_CONFIG_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::config_dir()
            .ok_or(ConfigError::ConfigDirNotFound)?
            .join("shipyard"),
    };

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// Path of `config.yml` in the config directory
pub fn config_file_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}
