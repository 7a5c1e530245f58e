//! Daemon connection: local socket or tunneled remote builder

use crate::daemon::{BollardDaemon, Daemon};
use crate::error::{BuildError, BuildResult};
use async_trait::async_trait;
use bollard::Docker;
use shipyard_tunnel::{
    DaemonProbe, Readiness, ReadinessPolicy, SshDialer, TunnelError, TunnelRelay, TunnelTarget,
    wait_for_daemon,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Address and credential of a remote builder
#[derive(Clone)]
pub struct RemoteBuilder {
    pub url: String,
    pub token: String,
}

impl std::fmt::Debug for RemoteBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBuilder")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Provisions (or looks up) the remote builder for an app
#[async_trait]
pub trait RemoteBuilderSource: Send + Sync {
    async fn ensure_remote_builder(&self, app_name: &str) -> BuildResult<RemoteBuilder>;
}

/// A builder that is already known, e.g. from user configuration
pub struct StaticRemoteBuilder {
    builder: Option<RemoteBuilder>,
}

impl StaticRemoteBuilder {
    pub fn new(url: Option<String>, token: Option<String>) -> Self {
        let builder = match (url, token) {
            (Some(url), Some(token)) => Some(RemoteBuilder { url, token }),
            _ => None,
        };
        Self { builder }
    }
}

#[async_trait]
impl RemoteBuilderSource for StaticRemoteBuilder {
    async fn ensure_remote_builder(&self, app_name: &str) -> BuildResult<RemoteBuilder> {
        self.builder.clone().ok_or_else(|| {
            BuildError::InvalidConfig(format!(
                "No remote builder available for '{}': set SHIPYARD_REMOTE_BUILDER_URL and SHIPYARD_ACCESS_TOKEN",
                app_name
            ))
        })
    }
}

/// Opens daemon clients
#[async_trait]
pub trait DaemonConnector: Send + Sync {
    async fn connect_local(&self) -> BuildResult<Arc<dyn Daemon>>;

    /// Connect to the app's remote builder and wait until it is ready
    async fn connect_remote(
        &self,
        app_name: &str,
        cancel: &CancellationToken,
    ) -> BuildResult<Arc<dyn Daemon>>;
}

pub struct DockerConnector {
    source: Arc<dyn RemoteBuilderSource>,
    policy: ReadinessPolicy,
}

impl DockerConnector {
    pub fn new(source: Arc<dyn RemoteBuilderSource>) -> Self {
        Self {
            source,
            policy: ReadinessPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ReadinessPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl DaemonConnector for DockerConnector {
    async fn connect_local(&self) -> BuildResult<Arc<dyn Daemon>> {
        Ok(Arc::new(BollardDaemon::connect_local()?))
    }

    async fn connect_remote(
        &self,
        app_name: &str,
        cancel: &CancellationToken,
    ) -> BuildResult<Arc<dyn Daemon>> {
        let builder = self.source.ensure_remote_builder(app_name).await?;
        tracing::debug!("Remote builder URL: {}", builder.url);

        let target = TunnelTarget::from_builder_url(&builder.url, app_name, &builder.token)
            .map_err(BuildError::tunnel("parsing remote builder address"))?;
        let dialer = Arc::new(
            SshDialer::new(target).map_err(BuildError::tunnel("preparing tunnel credentials"))?,
        );
        let relay = Arc::new(
            TunnelRelay::start(dialer, cancel)
                .await
                .map_err(BuildError::tunnel("starting tunnel relay"))?,
        );

        let daemon = BollardDaemon::over_relay(relay.clone())?;
        let probe = Arc::new(RelayPing {
            docker: daemon.docker().clone(),
            relay,
        });

        tracing::info!("Waiting for remote builder to become available...");
        match wait_for_daemon(probe, &self.policy, cancel)
            .await
            .map_err(BuildError::tunnel("waiting for remote builder"))?
        {
            Readiness::Ready => Ok(Arc::new(daemon)),
            Readiness::Cancelled => Err(BuildError::Cancelled),
        }
    }
}

/// Pings through the relay, reporting why the tunnel failed when it did
struct RelayPing {
    docker: Docker,
    relay: Arc<TunnelRelay>,
}

#[async_trait]
impl DaemonProbe for RelayPing {
    async fn probe(&self) -> shipyard_tunnel::Result<()> {
        match self.docker.ping().await {
            Ok(_) => Ok(()),
            Err(e) => Err(self
                .relay
                .take_failure()
                .unwrap_or_else(|| TunnelError::Connection(e.to_string()))),
        }
    }
}
