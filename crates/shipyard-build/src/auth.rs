//! レジストリ認証処理
//!
//! デプロイ先レジストリにはアクセストークンで認証し、それ以外のレジストリは
//! Docker config.json から認証情報を取得して Bollard の DockerCredentials に変換します。

use crate::error::{BuildError, BuildResult};
use crate::reference::extract_registry;
use base64::Engine;
use bollard::auth::DockerCredentials;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Registry key the daemon uses for Docker Hub pull credentials
pub const DOCKER_HUB_INDEX: &str = "https://index.docker.io/v1/";

/// Docker config.json の構造
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    /// credential helper 名 (例: "osxkeychain", "desktop")
    #[serde(default)]
    creds_store: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthEntry {
    /// Base64エンコードされた "username:password"
    auth: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialResponse {
    username: String,
    secret: String,
}

/// レジストリ認証を管理
#[derive(Clone)]
pub struct RegistryAuth {
    config_path: PathBuf,
    deploy: Option<DockerCredentials>,
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("config_path", &self.config_path)
            .field(
                "deploy_registry",
                &self.deploy.as_ref().and_then(|c| c.serveraddress.as_deref()),
            )
            .finish()
    }
}

impl Default for RegistryAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryAuth {
    /// デフォルトで ~/.docker/config.json を使用
    pub fn new() -> Self {
        let config_path = std::env::var("DOCKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".docker"))
                    .unwrap_or_else(|| PathBuf::from(".docker"))
            })
            .join("config.json");

        Self {
            config_path,
            deploy: None,
        }
    }

    /// 指定したパスの config.json を使用
    pub fn with_config_path(config_path: PathBuf) -> Self {
        Self {
            config_path,
            deploy: None,
        }
    }

    /// Authenticate to the deployment registry with an access token
    pub fn with_deploy_token(mut self, registry_host: &str, token: &str) -> Self {
        self.deploy = Some(deploy_credentials(registry_host, token));
        self
    }

    /// Credentials for pushing `image`
    pub fn get_credentials(&self, image: &str) -> BuildResult<Option<DockerCredentials>> {
        let registry = extract_registry(image);

        if let Some(deploy) = &self.deploy
            && deploy.serveraddress.as_deref() == Some(registry.as_str())
        {
            return Ok(Some(deploy.clone()));
        }

        self.lookup_docker_config(&registry)
    }

    /// `X-Registry-Auth` header value for pushing `image`
    pub fn push_header(&self, image: &str) -> BuildResult<String> {
        let credentials = self.get_credentials(image)?.unwrap_or_default();
        encode_registry_auth(&credentials)
    }

    /// Credentials the daemon may use to pull base images during a build
    pub fn build_credentials(&self) -> HashMap<String, DockerCredentials> {
        let mut configs = HashMap::new();

        let username = std::env::var("DOCKER_HUB_USERNAME").unwrap_or_default();
        let password = std::env::var("DOCKER_HUB_PASSWORD").unwrap_or_default();
        if !username.is_empty() && !password.is_empty() {
            configs.insert(
                DOCKER_HUB_INDEX.to_string(),
                DockerCredentials {
                    username: Some(username),
                    password: Some(password),
                    serveraddress: Some("index.docker.io".to_string()),
                    ..Default::default()
                },
            );
        }

        if let Some(deploy) = &self.deploy
            && let Some(host) = &deploy.serveraddress
        {
            configs.insert(host.clone(), deploy.clone());
        }

        configs
    }

    fn lookup_docker_config(&self, registry: &str) -> BuildResult<Option<DockerCredentials>> {
        // config.json が存在しない場合は認証なしで続行
        if !self.config_path.exists() {
            tracing::debug!("Docker config.json not found at {:?}", self.config_path);
            return Ok(None);
        }

        let config = self.load_docker_config()?;

        // 1. auths セクションを確認
        if let Some(auth_entry) = config.auths.get(registry)
            && let Some(auth_b64) = &auth_entry.auth
            && let Some(creds) = self.decode_auth(auth_b64, registry)?
        {
            tracing::debug!("Found credentials in auths for {}", registry);
            return Ok(Some(creds));
        }

        // 2. credential helper を確認
        if let Some(helper) = &config.creds_store {
            tracing::debug!("Trying credential helper: {}", helper);
            if let Ok(Some(creds)) = self.get_from_helper(helper, registry) {
                return Ok(Some(creds));
            }
        }

        tracing::debug!("No credentials found for {}", registry);
        Ok(None)
    }

    fn load_docker_config(&self) -> BuildResult<DockerConfig> {
        let content =
            std::fs::read_to_string(&self.config_path).map_err(|e| BuildError::AuthFailed {
                registry: self.config_path.display().to_string(),
                message: format!("Failed to read config.json: {}", e),
            })?;

        serde_json::from_str(&content).map_err(|e| BuildError::AuthFailed {
            registry: self.config_path.display().to_string(),
            message: format!("Failed to parse config.json: {}", e),
        })
    }

    fn decode_auth(
        &self,
        auth_b64: &str,
        registry: &str,
    ) -> BuildResult<Option<DockerCredentials>> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(auth_b64)
            .map_err(|e| BuildError::AuthFailed {
                registry: registry.to_string(),
                message: format!("Failed to decode auth: {}", e),
            })?;

        let auth_str = String::from_utf8(decoded).map_err(|e| BuildError::AuthFailed {
            registry: registry.to_string(),
            message: format!("Invalid UTF-8 in auth: {}", e),
        })?;

        if let Some((username, password)) = auth_str.split_once(':') {
            Ok(Some(DockerCredentials {
                username: Some(username.to_string()),
                password: Some(password.to_string()),
                serveraddress: Some(registry.to_string()),
                ..Default::default()
            }))
        } else {
            Ok(None)
        }
    }

    fn get_from_helper(
        &self,
        helper: &str,
        registry: &str,
    ) -> BuildResult<Option<DockerCredentials>> {
        let helper_cmd = format!("docker-credential-{}", helper);

        let mut child = Command::new(&helper_cmd)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BuildError::AuthFailed {
                registry: registry.to_string(),
                message: format!("Failed to run {}: {}", helper_cmd, e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(registry.as_bytes()).ok();
        }

        let output = child
            .wait_with_output()
            .map_err(|e| BuildError::AuthFailed {
                registry: registry.to_string(),
                message: format!("Credential helper failed: {}", e),
            })?;

        if !output.status.success() {
            tracing::debug!(
                "Credential helper returned error for {}: {}",
                registry,
                String::from_utf8_lossy(&output.stderr)
            );
            return Ok(None);
        }

        let response: CredentialResponse =
            serde_json::from_slice(&output.stdout).map_err(|e| BuildError::AuthFailed {
                registry: registry.to_string(),
                message: format!("Failed to parse credential helper response: {}", e),
            })?;

        Ok(Some(DockerCredentials {
            username: Some(response.username),
            password: Some(response.secret),
            serveraddress: Some(registry.to_string()),
            ..Default::default()
        }))
    }
}

/// Deployment-registry credentials: fixed user `x`, the access token as password
pub fn deploy_credentials(registry_host: &str, token: &str) -> DockerCredentials {
    DockerCredentials {
        username: Some("x".to_string()),
        password: Some(token.to_string()),
        serveraddress: Some(registry_host.to_string()),
        ..Default::default()
    }
}

/// Encode credentials the way the daemon expects in `X-Registry-Auth`
pub fn encode_registry_auth(credentials: &DockerCredentials) -> BuildResult<String> {
    let json = serde_json::to_vec(credentials).map_err(|e| BuildError::AuthFailed {
        registry: credentials.serveraddress.clone().unwrap_or_default(),
        message: format!("Failed to encode credentials: {}", e),
    })?;
    Ok(base64::engine::general_purpose::URL_SAFE.encode(json))
}
