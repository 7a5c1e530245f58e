//! Cloud Native Buildpacks builds via the `pack` CLI

use crate::daemon::DaemonEndpoint;
use crate::error::{BuildError, BuildResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone, Default)]
pub struct BuildpackRequest {
    pub builder: String,
    pub buildpacks: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Image written by the build
    pub image: String,
    pub additional_tags: Vec<String>,
}

/// Runs `pack build` against a given daemon
pub struct PackCli {
    program: PathBuf,
}

impl Default for PackCli {
    fn default() -> Self {
        Self::new()
    }
}

impl PackCli {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("pack"),
        }
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn command(
        &self,
        source_dir: &Path,
        request: &BuildpackRequest,
        endpoint: &DaemonEndpoint,
    ) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("build")
            .arg(&request.image)
            .arg("--builder")
            .arg(&request.builder)
            .arg("--path")
            .arg(source_dir)
            .arg("--docker-host")
            .arg(endpoint.docker_host())
            .arg("--trust-builder");

        for buildpack in &request.buildpacks {
            cmd.arg("--buildpack").arg(buildpack);
        }
        for (key, value) in &request.env {
            cmd.arg("--env").arg(format!("{}={}", key, value));
        }
        for tag in &request.additional_tags {
            cmd.arg("--tag").arg(tag);
        }

        cmd.env("DOCKER_HOST", endpoint.docker_host())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }

    pub async fn build(
        &self,
        source_dir: &Path,
        request: &BuildpackRequest,
        endpoint: &DaemonEndpoint,
    ) -> BuildResult<()> {
        tracing::info!(
            "Building {} with buildpack builder {}",
            request.image,
            request.builder
        );

        let status = self
            .command(source_dir, request, endpoint)
            .status()
            .await
            .map_err(|e| {
                BuildError::BuildpackFailed(format!(
                    "failed to run {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        if !status.success() {
            return Err(BuildError::BuildpackFailed(format!(
                "{} exited with {}",
                self.program.display(),
                status
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> BuildpackRequest {
        BuildpackRequest {
            builder: "paketobuildpacks/builder:base".into(),
            buildpacks: vec!["gcr.io/paketo-buildpacks/nodejs".into()],
            env: BTreeMap::from([("NODE_ENV".into(), "production".into())]),
            image: "registry.shipyard.dev/myapp:cache".into(),
            additional_tags: vec!["registry.shipyard.dev/myapp:deployment-1".into()],
        }
    }

    #[test]
    fn test_command_arguments() {
        let endpoint = DaemonEndpoint::Tcp("127.0.0.1:40000".into());
        let cmd = PackCli::new().command(Path::new("/src/app"), &request(), &endpoint);
        let std_cmd = cmd.as_std();

        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "build",
                "registry.shipyard.dev/myapp:cache",
                "--builder",
                "paketobuildpacks/builder:base",
                "--path",
                "/src/app",
                "--docker-host",
                "tcp://127.0.0.1:40000",
                "--trust-builder",
                "--buildpack",
                "gcr.io/paketo-buildpacks/nodejs",
                "--env",
                "NODE_ENV=production",
                "--tag",
                "registry.shipyard.dev/myapp:deployment-1",
            ]
        );

        let docker_host = std_cmd
            .get_envs()
            .find(|(k, _)| *k == "DOCKER_HOST")
            .and_then(|(_, v)| v)
            .unwrap();
        assert_eq!(docker_host, "tcp://127.0.0.1:40000");
    }

    #[tokio::test]
    async fn test_failed_build_is_reported() {
        let endpoint = DaemonEndpoint::Unix("/var/run/docker.sock".into());
        let result = PackCli::with_program("false")
            .build(Path::new("."), &request(), &endpoint)
            .await;
        assert!(matches!(result, Err(BuildError::BuildpackFailed(_))));
    }

    #[tokio::test]
    async fn test_missing_pack_binary() {
        let endpoint = DaemonEndpoint::Unix("/var/run/docker.sock".into());
        let result = PackCli::with_program("/nonexistent/pack")
            .build(Path::new("."), &request(), &endpoint)
            .await;
        assert!(matches!(result, Err(BuildError::BuildpackFailed(m)) if m.contains("failed to run")));
    }
}
