use shipyard_tunnel::TunnelError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Both local-only and remote-only are set - select only one")]
    ConflictingBuilderFlags,

    #[error("Local docker unavailable and local-only was requested, cannot proceed")]
    LocalDaemonUnavailable,

    #[error("Dockerfile not found: {0}")]
    DockerfileNotFound(PathBuf),

    #[error("No Dockerfile found in {0} and no builtin is configured")]
    NoRecipe(PathBuf),

    #[error("Unknown builtin: {0}")]
    UnknownBuiltin(String),

    #[error("Failed to render builtin '{name}': {message}")]
    BuiltinRender { name: String, message: String },

    #[error("No buildpack builder configured")]
    NoBuildpackBuilder,

    #[error("Build context directory not found: {0}")]
    ContextNotFound(PathBuf),

    #[error("Docker connection error: {0}")]
    DockerConnection(#[from] bollard::errors::Error),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Buildpack build failed: {0}")]
    BuildpackFailed(String),

    #[error("Image not found after build: {0}")]
    ImageNotFound(String),

    #[error("Pull of {image} failed: {message}")]
    PullFailed { image: String, message: String },

    #[error("Push failed: {message}")]
    PushFailed { message: String },

    #[error("Invalid image tag: {tag}")]
    InvalidTag { tag: String },

    #[error("Registry authentication failed for {registry}: {message}")]
    AuthFailed { registry: String, message: String },

    #[error("Invalid build configuration: {0}")]
    InvalidConfig(String),

    #[error("Error {operation}: {source}")]
    Tunnel {
        operation: &'static str,
        #[source]
        source: TunnelError,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// Wrap a tunnel failure with the step it happened in
    pub fn tunnel(operation: &'static str) -> impl FnOnce(TunnelError) -> BuildError {
        move |source| BuildError::Tunnel { operation, source }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BuildError::Cancelled)
    }

    /// ユーザー向けの分かりやすいエラーメッセージ
    pub fn user_message(&self) -> String {
        match self {
            BuildError::DockerfileNotFound(path) => {
                format!(
                    "Dockerfile not found: {}\n\
                     \n\
                     Check the path passed with --dockerfile.",
                    path.display()
                )
            }
            BuildError::NoRecipe(dir) => {
                format!(
                    "No Dockerfile found in {}\n\
                     \n\
                     Either:\n\
                     1. add a Dockerfile to the project\n\
                     2. point at one with --dockerfile path/to/Dockerfile\n\
                     3. pick a builtin with --builtin <name>",
                    dir.display()
                )
            }
            BuildError::LocalDaemonUnavailable => "Local docker unavailable and --local-only was passed, cannot proceed.\n\
                 \n\
                 Start Docker locally or drop --local-only to use a remote builder."
                .to_string(),
            BuildError::Tunnel {
                source: TunnelError::Unauthorized,
                ..
            } => "You are unauthorized to use this builder.\n\
                 \n\
                 Check SHIPYARD_ACCESS_TOKEN or log in again."
                .to_string(),
            BuildError::BuildFailed(msg) => {
                format!(
                    "Build failed: {}\n\
                     \n\
                     Check the Dockerfile.",
                    msg
                )
            }
            _ => format!("{}", self),
        }
    }
}

pub type BuildResult<T> = std::result::Result<T, BuildError>;
pub type Result<T> = BuildResult<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_errors_carry_operation() {
        let err = BuildError::tunnel("waiting for remote builder")(TunnelError::Connection(
            "connection refused".into(),
        ));
        assert_eq!(
            err.to_string(),
            "Error waiting for remote builder: Tunnel connection failed: connection refused"
        );
    }

    #[test]
    fn test_unauthorized_user_message() {
        let err = BuildError::tunnel("connecting")(TunnelError::Unauthorized);
        assert!(err.user_message().contains("unauthorized"));
    }
}
