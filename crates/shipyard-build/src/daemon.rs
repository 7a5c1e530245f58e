//! Image daemon abstraction
//!
//! Everything the build orchestration needs from a container daemon sits
//! behind [`Daemon`], so the same flow drives a local socket, a tunneled
//! remote builder, or a test double.

// Bollard 0.19 の非推奨APIを一時的に使用
#![allow(deprecated)]

use crate::builder::{ImageBuilder, advertised_builder_version, buildkit_requested};
use crate::error::{BuildError, BuildResult};
use crate::pusher::{PushOperation, open_push_stream};
use crate::reference::split_image_tag;
use crate::resolver::BuildArgs;
use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use colored::Colorize;
use futures_util::StreamExt;
use shipyard_tunnel::TunnelRelay;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Client timeout for daemon requests, in seconds. Builds can run long.
const DAEMON_TIMEOUT_SECS: u64 = 60 * 60;

/// Where a daemon's API can be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEndpoint {
    Unix(PathBuf),
    /// `host:port`
    Tcp(String),
}

impl DaemonEndpoint {
    /// Endpoint from `DOCKER_HOST`, or the default socket
    pub fn from_env() -> BuildResult<Self> {
        match std::env::var("DOCKER_HOST") {
            Ok(host) if !host.trim().is_empty() => Self::parse(host.trim()),
            _ => Ok(Self::Unix(PathBuf::from(DEFAULT_DOCKER_SOCKET))),
        }
    }

    pub fn parse(host: &str) -> BuildResult<Self> {
        if let Some(path) = host.strip_prefix("unix://") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let address = host
            .strip_prefix("tcp://")
            .or_else(|| host.strip_prefix("http://"))
            .ok_or_else(|| {
                BuildError::InvalidConfig(format!("Unsupported DOCKER_HOST: {}", host))
            })?;
        let address = address.trim_end_matches('/');
        if address.is_empty() {
            return Err(BuildError::InvalidConfig(format!(
                "Unsupported DOCKER_HOST: {}",
                host
            )));
        }

        Ok(Self::Tcp(address.to_string()))
    }

    /// Value suitable for `DOCKER_HOST`
    pub fn docker_host(&self) -> String {
        match self {
            Self::Unix(path) => format!("unix://{}", path.display()),
            Self::Tcp(address) => format!("tcp://{}", address),
        }
    }
}

impl std::fmt::Display for DaemonEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.docker_host())
    }
}

/// Image summary as listed by the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImage {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub size: i64,
}

#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub tag: String,
    /// Recipe path inside the context
    pub dockerfile: String,
    pub build_args: BuildArgs,
    pub target: Option<String>,
    pub no_cache: bool,
    pub platform: Option<String>,
    pub session_key: Option<String>,
    /// Pull credentials keyed by registry
    pub credentials: HashMap<String, DockerCredentials>,
}

#[async_trait]
pub trait Daemon: Send + Sync {
    fn endpoint(&self) -> DaemonEndpoint;

    fn is_remote(&self) -> bool;

    async fn ping(&self) -> BuildResult<()>;

    /// Build from a gzip tar context
    async fn build_image(&self, context: Vec<u8>, request: &BuildRequest) -> BuildResult<()>;

    /// List images, optionally restricted by a reference filter
    async fn list_images(&self, reference: Option<&str>) -> BuildResult<Vec<LocalImage>>;

    async fn tag_image(&self, source: &str, tag: &str) -> BuildResult<()>;

    async fn remove_image(&self, reference: &str) -> BuildResult<()>;

    /// Pull `reference` from its registry, printing daemon status lines
    async fn pull_image(
        &self,
        reference: &str,
        credentials: Option<DockerCredentials>,
    ) -> BuildResult<()>;

    /// Start pushing `tag`; `registry_auth` is the encoded `X-Registry-Auth` value
    async fn push_image(&self, tag: &str, registry_auth: &str) -> BuildResult<PushOperation>;
}

/// [`Daemon`] backed by the Docker Engine API
pub struct BollardDaemon {
    docker: Docker,
    endpoint: DaemonEndpoint,
    remote: bool,
    // keeps the tunnel listener alive as long as the client
    _relay: Option<Arc<TunnelRelay>>,
}

impl BollardDaemon {
    /// Connect to the daemon named by `DOCKER_HOST` or the default socket
    pub fn connect_local() -> BuildResult<Self> {
        let endpoint = DaemonEndpoint::from_env()?;
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            endpoint,
            remote: false,
            _relay: None,
        })
    }

    /// Connect through a tunnel relay to a remote builder
    pub fn over_relay(relay: Arc<TunnelRelay>) -> BuildResult<Self> {
        let docker = Docker::connect_with_http(
            &relay.docker_host(),
            DAEMON_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )?;
        Ok(Self {
            docker,
            endpoint: DaemonEndpoint::Tcp(relay.local_addr().to_string()),
            remote: true,
            _relay: Some(relay),
        })
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

#[async_trait]
impl Daemon for BollardDaemon {
    fn endpoint(&self) -> DaemonEndpoint {
        self.endpoint.clone()
    }

    fn is_remote(&self) -> bool {
        self.remote
    }

    async fn ping(&self) -> BuildResult<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn build_image(&self, context: Vec<u8>, request: &BuildRequest) -> BuildResult<()> {
        let advertised = advertised_builder_version(&self.endpoint).await;
        let env = std::env::var("DOCKER_BUILDKIT").ok();
        let buildkit = buildkit_requested(advertised.as_deref(), env.as_deref())?;
        tracing::debug!("Builder version {:?}, buildkit: {}", advertised, buildkit);

        ImageBuilder::new(self.docker.clone())
            .with_buildkit(buildkit)
            .build_image(context, request)
            .await
    }

    async fn list_images(&self, reference: Option<&str>) -> BuildResult<Vec<LocalImage>> {
        let mut filters = HashMap::new();
        if let Some(reference) = reference {
            filters.insert("reference".to_string(), vec![reference.to_string()]);
        }

        let options = bollard::image::ListImagesOptions::<String> {
            all: false,
            filters,
            ..Default::default()
        };

        let images = self.docker.list_images(Some(options)).await?;
        Ok(images
            .into_iter()
            .map(|summary| LocalImage {
                id: summary.id,
                repo_tags: summary.repo_tags,
                size: summary.size,
            })
            .collect())
    }

    async fn tag_image(&self, source: &str, tag: &str) -> BuildResult<()> {
        let (repo, tag) = split_image_tag(tag);
        let options = bollard::image::TagImageOptions { repo, tag };
        self.docker.tag_image(source, Some(options)).await?;
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> BuildResult<()> {
        let options = bollard::image::RemoveImageOptions {
            force: false,
            noprune: false,
        };
        self.docker
            .remove_image(reference, Some(options), None)
            .await?;
        Ok(())
    }

    async fn pull_image(
        &self,
        reference: &str,
        credentials: Option<DockerCredentials>,
    ) -> BuildResult<()> {
        let (from_image, tag) = split_image_tag(reference);
        let options = bollard::image::CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, credentials);
        while let Some(info) = stream.next().await {
            let info = info?;
            let failure = info
                .error_detail
                .and_then(|detail| detail.message)
                .or(info.error);
            if let Some(message) = failure {
                return Err(BuildError::PullFailed {
                    image: reference.to_string(),
                    message,
                });
            }

            match (info.id, info.status) {
                (Some(id), Some(status)) => println!("{}: {}", id, status.cyan()),
                (None, Some(status)) => println!("{}", status.cyan()),
                _ => {}
            }
        }

        Ok(())
    }

    async fn push_image(&self, tag: &str, registry_auth: &str) -> BuildResult<PushOperation> {
        let (repo, tag) = split_image_tag(tag);
        let body = open_push_stream(&self.endpoint, &repo, &tag, registry_auth).await?;
        Ok(PushOperation::from_reader(body))
    }
}
