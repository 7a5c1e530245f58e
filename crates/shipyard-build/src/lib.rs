//! Shipyard image build orchestration
//!
//! Decides where an image for a deployment gets built (local daemon,
//! tunneled remote builder, or buildpacks), assembles the build context,
//! drives build/tag/push, and folds the daemon's per-layer push events
//! into a single progress stream.

pub mod auth;
pub mod builder;
pub mod builtins;
pub mod buildpack;
pub mod context;
pub mod daemon;
pub mod error;
pub mod ignore;
pub mod operation;
pub mod progress;
pub mod pusher;
pub mod reference;
pub mod registry;
pub mod remote;
pub mod resolver;
pub mod session;

pub use auth::RegistryAuth;
pub use builder::ImageBuilder;
pub use builtins::BuiltinSpec;
pub use context::BuildContext;
pub use daemon::{BollardDaemon, BuildRequest, Daemon, DaemonEndpoint, LocalImage};
pub use error::{BuildError, BuildResult};
pub use ignore::ExcludeSet;
pub use operation::{BuildOperation, BuildOptions, Image};
pub use progress::{BuildProgress, PushProgressBar};
pub use pusher::{ImagePusher, PushMessage, PushOperation, PushProgress};
pub use reference::{ImageReference, split_image_tag};
pub use remote::{
    DaemonConnector, DockerConnector, RemoteBuilder, RemoteBuilderSource, StaticRemoteBuilder,
};
pub use resolver::{BuildArgs, BuildResolver, Recipe};
