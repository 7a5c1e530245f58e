//! Build operation for one deployment
//!
//! A [`BuildOperation`] owns the decisions made for a single deploy: the
//! image tag, whether a local daemon is usable, and which daemon builds are
//! sent to. The daemon is chosen on first use and never re-chosen.

use crate::auth::RegistryAuth;
use crate::builtins::BuiltinSpec;
use crate::buildpack::{BuildpackRequest, PackCli};
use crate::context::BuildContext;
use crate::daemon::{BuildRequest, Daemon};
use crate::error::{BuildError, BuildResult};
use crate::ignore::load_excludes;
use crate::progress::BuildProgress;
use crate::pusher::ImagePusher;
use crate::reference::{ImageReference, split_image_tag};
use crate::registry::{delete_deployment_images, find_image, resolve_image};
use crate::remote::DaemonConnector;
use crate::resolver::{
    BuildResolver, RECIPE_ENTRY_NAME, Recipe, build_args_with_values, deployment_tag,
    normalize_build_args,
};
use crate::session::{build_node_id, session_key};
use shipyard_config::{MemorySettings, Settings};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

const DEFAULT_LOCAL_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_PLATFORM: &str = "linux/amd64";

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub app_name: String,
    pub registry_host: String,
    /// Label for the generated tag; defaults to `deployment-<unix time>`
    pub image_label: Option<String>,
    /// Full image reference overriding the generated tag
    pub image_ref: Option<String>,
    pub local_only: bool,
    pub remote_only: bool,
    /// Arguments declared by the project, overridden by call-site ones
    pub declared_build_args: BTreeMap<String, String>,
    pub builtin: Option<BuiltinSpec>,
    pub buildpack_builder: Option<String>,
    pub buildpacks: Vec<String>,
    pub target: Option<String>,
    pub no_cache: bool,
    pub platform: Option<String>,
    pub ignore_file: Option<PathBuf>,
    pub local_probe_timeout: Duration,
}

impl BuildOptions {
    pub fn new(app_name: impl Into<String>, registry_host: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            registry_host: registry_host.into(),
            image_label: None,
            image_ref: None,
            local_only: false,
            remote_only: false,
            declared_build_args: BTreeMap::new(),
            builtin: None,
            buildpack_builder: None,
            buildpacks: Vec::new(),
            target: None,
            no_cache: false,
            platform: Some(DEFAULT_PLATFORM.to_string()),
            ignore_file: None,
            local_probe_timeout: DEFAULT_LOCAL_PROBE_TIMEOUT,
        }
    }
}

/// A built or resolved image, tagged for deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: String,
    pub tag: String,
    pub size: i64,
}

pub struct BuildOperation {
    options: BuildOptions,
    image_tag: String,
    connector: Arc<dyn DaemonConnector>,
    local_daemon: Option<Arc<dyn Daemon>>,
    daemon: OnceCell<Arc<dyn Daemon>>,
    auth: RegistryAuth,
    settings: Mutex<Box<dyn Settings>>,
    cancel: CancellationToken,
}

impl BuildOperation {
    /// Validate the builder flags, compute the image tag, and probe for a
    /// local daemon
    pub async fn new(
        options: BuildOptions,
        connector: Arc<dyn DaemonConnector>,
        auth: RegistryAuth,
        cancel: CancellationToken,
    ) -> BuildResult<Self> {
        if options.local_only && options.remote_only {
            return Err(BuildError::ConflictingBuilderFlags);
        }

        let image_tag = match &options.image_ref {
            Some(image_ref) => image_ref.clone(),
            None => deployment_tag(
                &options.registry_host,
                &options.app_name,
                options.image_label.as_deref(),
            )?,
        };
        tracing::debug!("Deployment image tag: {}", image_tag);

        let local_daemon = if options.remote_only {
            None
        } else {
            probe_local(connector.as_ref(), options.local_probe_timeout).await
        };

        if options.local_only && local_daemon.is_none() {
            return Err(BuildError::LocalDaemonUnavailable);
        }

        Ok(Self {
            options,
            image_tag,
            connector,
            local_daemon,
            daemon: OnceCell::new(),
            auth,
            settings: Mutex::new(Box::new(MemorySettings::new())),
            cancel,
        })
    }

    /// Persist the BuildKit node id in `settings` instead of memory
    pub fn with_settings(mut self, settings: Box<dyn Settings>) -> Self {
        self.settings = Mutex::new(settings);
        self
    }

    pub fn app_name(&self) -> &str {
        &self.options.app_name
    }

    pub fn image_tag(&self) -> &str {
        &self.image_tag
    }

    pub fn local_only(&self) -> bool {
        self.options.local_only
    }

    pub fn remote_only(&self) -> bool {
        self.options.remote_only
    }

    pub fn local_daemon_available(&self) -> bool {
        self.local_daemon.is_some()
    }

    /// The chosen daemon, if one has been configured yet
    pub fn daemon(&self) -> Option<&Arc<dyn Daemon>> {
        self.daemon.get()
    }

    /// Choose and connect the build daemon. Runs at most once; later calls
    /// return the same daemon. A failed attempt is not cached.
    pub async fn configure_daemon(&self) -> BuildResult<Arc<dyn Daemon>> {
        let daemon = self
            .daemon
            .get_or_try_init(|| async {
                match &self.local_daemon {
                    Some(local) if !self.options.remote_only => {
                        tracing::info!("Using local docker daemon");
                        Ok(local.clone())
                    }
                    _ => {
                        tracing::info!(
                            "Docker daemon not available locally, using remote builder for {}",
                            self.options.app_name
                        );
                        self.cancellable(
                            self.connector
                                .connect_remote(&self.options.app_name, &self.cancel),
                        )
                        .await
                    }
                }
            })
            .await?;

        Ok(daemon.clone())
    }

    /// Build from a Dockerfile (explicit, conventional, or builtin)
    pub async fn build_from_dockerfile(
        &self,
        source_dir: &Path,
        dockerfile: Option<&Path>,
        build_args: &[(String, Option<String>)],
    ) -> BuildResult<Image> {
        let resolver = BuildResolver::new(source_dir);
        let context_dir = resolver.resolve_context()?;
        let recipe = resolver.resolve_recipe(dockerfile, self.options.builtin.as_ref())?;

        let archive = assemble_context(
            context_dir.clone(),
            recipe,
            self.options.ignore_file.clone(),
        )
        .await?;

        let request = BuildRequest {
            tag: self.image_tag.clone(),
            dockerfile: RECIPE_ENTRY_NAME.to_string(),
            build_args: normalize_build_args(&self.options.declared_build_args, build_args),
            target: self.options.target.clone(),
            no_cache: self.options.no_cache,
            platform: self.options.platform.clone(),
            session_key: Some(self.session_key(&context_dir)),
            credentials: self.auth.build_credentials(),
        };

        let daemon = self.configure_daemon().await?;

        let progress = BuildProgress::new(&self.options.app_name);
        progress.set_message(&format!("Building {}", self.image_tag));
        match self
            .cancellable(daemon.build_image(archive, &request))
            .await
        {
            Ok(()) => progress.finish_success(),
            Err(e) => {
                progress.finish_error(&e.to_string());
                return Err(e);
            }
        }

        self.built_image(daemon.as_ref()).await
    }

    /// Build with Cloud Native Buildpacks
    pub async fn build_from_buildpack_builder(
        &self,
        source_dir: &Path,
        build_args: &[(String, Option<String>)],
    ) -> BuildResult<Image> {
        let builder = self
            .options
            .buildpack_builder
            .clone()
            .ok_or(BuildError::NoBuildpackBuilder)?;

        let env = build_args_with_values(&normalize_build_args(
            &self.options.declared_build_args,
            build_args,
        ))
        .into_iter()
        .collect();

        let (repository, _) = split_image_tag(&self.image_tag);
        let request = BuildpackRequest {
            builder,
            buildpacks: self.options.buildpacks.clone(),
            env,
            image: format!("{}:cache", repository),
            additional_tags: vec![self.image_tag.clone()],
        };

        let daemon = self.configure_daemon().await?;
        self.cancellable(PackCli::new().build(source_dir, &request, &daemon.endpoint()))
            .await?;

        self.built_image(daemon.as_ref()).await
    }

    /// Use an image that already exists locally: tag it for deployment and
    /// push it. `None` when remote-only, no local daemon, or no match.
    pub async fn resolve_image_locally(&self, image_ref: &str) -> BuildResult<Option<Image>> {
        if self.options.remote_only {
            return Ok(None);
        }
        let Some(local) = &self.local_daemon else {
            return Ok(None);
        };

        let Some(found) = find_image(local.as_ref(), image_ref).await? else {
            tracing::debug!("Image {} not found locally", image_ref);
            return Ok(None);
        };

        local.tag_image(&found.id, &self.image_tag).await?;

        let image = Image {
            id: found.id,
            tag: self.image_tag.clone(),
            size: found.size,
        };
        self.push_image(&image).await?;

        Ok(Some(image))
    }

    /// Use `image_ref` as the deployment image: a local match first, else a
    /// pull on the configured daemon. `None` when the registry does not have
    /// it either.
    pub async fn resolve_image(&self, image_ref: &str) -> BuildResult<Option<Image>> {
        if let Some(image) = self.resolve_image_locally(image_ref).await? {
            return Ok(Some(image));
        }

        let remote = ImageReference::parse(image_ref)?.remote();
        let credentials = self.auth.get_credentials(&remote)?;
        let daemon = self.configure_daemon().await?;

        let found = match self
            .cancellable(resolve_image(daemon.as_ref(), image_ref, credentials))
            .await
        {
            Ok(Some(found)) => found,
            Ok(None) => return Ok(None),
            Err(BuildError::PullFailed { image, message }) => {
                tracing::warn!("Could not pull {}: {}", image, message);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        daemon.tag_image(&found.id, &self.image_tag).await?;

        let image = Image {
            id: found.id,
            tag: self.image_tag.clone(),
            size: found.size,
        };
        self.push_image(&image).await?;

        Ok(Some(image))
    }

    /// Push `image` to the deployment registry from the configured daemon
    pub async fn push_image(&self, image: &Image) -> BuildResult<()> {
        let daemon = self.configure_daemon().await?;
        self.cancellable(ImagePusher::new(daemon, self.auth.clone()).push(&image.tag))
            .await?;
        Ok(())
    }

    /// Best-effort removal of this deployment's local tags
    pub async fn cleanup_deployment_tags(&self) {
        let Some(daemon) = self.daemon.get() else {
            return;
        };

        match delete_deployment_images(daemon.as_ref(), &self.image_tag).await {
            Ok(removed) => tracing::debug!("Removed {} deployment image tags", removed),
            Err(e) => tracing::debug!("Error cleaning up deployment images: {}", e),
        }
    }

    fn session_key(&self, context_dir: &Path) -> String {
        let mut settings = self.settings.lock().unwrap_or_else(PoisonError::into_inner);
        session_key(&build_node_id(settings.as_mut()), context_dir)
    }

    async fn built_image(&self, daemon: &dyn Daemon) -> BuildResult<Image> {
        let found = find_image(daemon, &self.image_tag)
            .await?
            .ok_or_else(|| BuildError::ImageNotFound(self.image_tag.clone()))?;

        Ok(Image {
            id: found.id,
            tag: self.image_tag.clone(),
            size: found.size,
        })
    }

    async fn cancellable<T>(&self, work: impl Future<Output = BuildResult<T>>) -> BuildResult<T> {
        tokio::select! {
            result = work => result,
            _ = self.cancel.cancelled() => Err(BuildError::Cancelled),
        }
    }
}

/// Archive the context directory plus the recipe off the async workers
async fn assemble_context(
    context_dir: PathBuf,
    recipe: Recipe,
    ignore_file: Option<PathBuf>,
) -> BuildResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let excludes = load_excludes(&context_dir, ignore_file.as_deref(), &recipe.file_name());

        let context = BuildContext::new()?;
        context.add_source(&context_dir, &excludes)?;
        context.add_file(RECIPE_ENTRY_NAME, &recipe.contents)?;
        let archive = context.archive();

        if let Err(e) = context.close() {
            tracing::warn!("Failed to remove build context scratch directory: {}", e);
        }
        archive
    })
    .await
    .map_err(|e| BuildError::Io(std::io::Error::other(e)))?
}

async fn probe_local(connector: &dyn DaemonConnector, limit: Duration) -> Option<Arc<dyn Daemon>> {
    let daemon = match connector.connect_local().await {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::debug!("Local docker unavailable: {}", e);
            return None;
        }
    };

    match tokio::time::timeout(limit, daemon.ping()).await {
        Ok(Ok(())) => Some(daemon),
        Ok(Err(e)) => {
            tracing::debug!("Local docker did not answer: {}", e);
            None
        }
        Err(_) => {
            tracing::debug!("Local docker ping timed out after {:?}", limit);
            None
        }
    }
}
