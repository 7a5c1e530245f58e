//! User-level configuration with environment overrides
//!
//! 優先順位:
//! 1. 環境変数 (`SHIPYARD_*`)
//! 2. `config.yml`
//! 3. デフォルト値

use crate::error::Result;
use crate::settings::{FileSettings, Settings};

pub const KEY_ACCESS_TOKEN: &str = "access_token";
pub const KEY_REGISTRY_HOST: &str = "registry_host";
pub const KEY_REMOTE_BUILDER_URL: &str = "remote_builder_url";
pub const KEY_BUILDKIT_NODE_ID: &str = "buildkit_node_id";

pub const DEFAULT_REGISTRY_HOST: &str = "registry.shipyard.dev";

const ENV_ACCESS_TOKEN: &str = "SHIPYARD_ACCESS_TOKEN";
const ENV_REGISTRY_HOST: &str = "SHIPYARD_REGISTRY_HOST";
const ENV_REMOTE_BUILDER_URL: &str = "SHIPYARD_REMOTE_BUILDER_URL";
const ENV_IMAGE_REF: &str = "SHIPYARD_IMAGE_REF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserConfig {
    pub access_token: Option<String>,
    pub registry_host: String,
    pub remote_builder_url: Option<String>,
    /// Replaces the computed deployment tag when set
    pub image_ref: Option<String>,
}

impl UserConfig {
    /// Load from the default `config.yml` and apply env overrides
    pub fn load() -> Result<Self> {
        let settings = FileSettings::open_default()?;
        Ok(Self::from_settings(&settings))
    }

    pub fn from_settings(settings: &dyn Settings) -> Self {
        Self {
            access_token: env_value(ENV_ACCESS_TOKEN).or_else(|| settings.get(KEY_ACCESS_TOKEN)),
            registry_host: env_value(ENV_REGISTRY_HOST)
                .or_else(|| settings.get(KEY_REGISTRY_HOST))
                .unwrap_or_else(|| DEFAULT_REGISTRY_HOST.to_string()),
            remote_builder_url: env_value(ENV_REMOTE_BUILDER_URL)
                .or_else(|| settings.get(KEY_REMOTE_BUILDER_URL)),
            image_ref: env_value(ENV_IMAGE_REF),
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::MemorySettings;
    use serial_test::serial;

    const ALL_ENV: [&str; 4] = [
        ENV_ACCESS_TOKEN,
        ENV_REGISTRY_HOST,
        ENV_REMOTE_BUILDER_URL,
        ENV_IMAGE_REF,
    ];

    #[test]
    #[serial]
    fn test_defaults() {
        temp_env::with_vars_unset(ALL_ENV, || {
            let config = UserConfig::from_settings(&MemorySettings::new());
            assert_eq!(config.registry_host, DEFAULT_REGISTRY_HOST);
            assert_eq!(config.access_token, None);
            assert_eq!(config.remote_builder_url, None);
            assert_eq!(config.image_ref, None);
        });
    }

    #[test]
    #[serial]
    fn test_file_values() {
        temp_env::with_vars_unset(ALL_ENV, || {
            let mut settings = MemorySettings::new();
            settings.set(KEY_ACCESS_TOKEN, "file-token");
            settings.set(KEY_REGISTRY_HOST, "registry.example.com");

            let config = UserConfig::from_settings(&settings);
            assert_eq!(config.access_token.as_deref(), Some("file-token"));
            assert_eq!(config.registry_host, "registry.example.com");
        });
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        temp_env::with_vars(
            [
                (ENV_ACCESS_TOKEN, Some("env-token")),
                (ENV_REMOTE_BUILDER_URL, Some("https://builder.internal:8443")),
                (ENV_IMAGE_REF, Some("registry.example.com/app:pinned")),
                (ENV_REGISTRY_HOST, None),
            ],
            || {
                let mut settings = MemorySettings::new();
                settings.set(KEY_ACCESS_TOKEN, "file-token");

                let config = UserConfig::from_settings(&settings);
                assert_eq!(config.access_token.as_deref(), Some("env-token"));
                assert_eq!(
                    config.remote_builder_url.as_deref(),
                    Some("https://builder.internal:8443")
                );
                assert_eq!(
                    config.image_ref.as_deref(),
                    Some("registry.example.com/app:pinned")
                );
            },
        );
    }
}
