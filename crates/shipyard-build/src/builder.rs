// Bollard 0.19 の非推奨APIを一時的に使用
#![allow(deprecated)]

use crate::daemon::{BuildRequest, DaemonEndpoint};
use crate::error::{BuildError, Result};
use crate::pusher::dispatch;
use crate::resolver::build_args_with_values;
use crate::session::{TraceRelay, print_trace};
use bollard::Docker;
use bollard::image::{BuildImageOptions, BuilderVersion};
use bytes::Bytes;
use colored::Colorize;
use futures_util::stream::StreamExt;
use http_body_util::Empty;
use hyper::{Method, Request};
use std::collections::HashMap;

/// Label carrying the build session key
pub const SESSION_LABEL: &str = "dev.shipyard.build-session";

/// Ping response header naming the daemon's preferred builder
pub const BUILDER_VERSION_HEADER: &str = "Builder-Version";

const BUILDKIT_BUILDER_VERSION: &str = "2";

/// Whether a build should go through BuildKit.
///
/// `DOCKER_BUILDKIT`, when set, overrides the builder the daemon advertises
/// on ping.
pub fn buildkit_requested(advertised: Option<&str>, env: Option<&str>) -> Result<bool> {
    match env.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => parse_bool(value).ok_or_else(|| {
            BuildError::InvalidConfig(
                "DOCKER_BUILDKIT environment variable expects boolean value".to_string(),
            )
        }),
        None => Ok(advertised == Some(BUILDKIT_BUILDER_VERSION)),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Builder version the daemon advertises on `/_ping`, if it says
pub async fn advertised_builder_version(endpoint: &DaemonEndpoint) -> Option<String> {
    let request = Request::builder()
        .method(Method::GET)
        .uri("/_ping")
        .header(hyper::header::HOST, "docker")
        .body(Empty::<Bytes>::new())
        .ok()?;

    match dispatch(endpoint, request).await {
        Ok(response) => response
            .headers()
            .get(BUILDER_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        Err(e) => {
            tracing::debug!("Builder version lookup failed: {}", e);
            None
        }
    }
}

pub struct ImageBuilder {
    docker: Docker,
    buildkit: bool,
    trace: Option<TraceRelay>,
}

impl ImageBuilder {
    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            buildkit: false,
            trace: None,
        }
    }

    pub fn with_buildkit(mut self, buildkit: bool) -> Self {
        self.buildkit = buildkit;
        self
    }

    /// イメージをビルド
    pub async fn build_image(mut self, context_data: Vec<u8>, request: &BuildRequest) -> Result<()> {
        tracing::info!("Building image: {}", request.tag);

        let build_args = build_args_with_values(&request.build_args);
        let build_args_refs: HashMap<&str, &str> = build_args
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let mut labels = HashMap::new();
        if let Some(key) = &request.session_key {
            labels.insert(SESSION_LABEL, key.as_str());
        }

        // BuildKit needs a session to attach to
        let session = request.session_key.clone().filter(|_| self.buildkit);
        let version = if session.is_some() {
            BuilderVersion::BuilderBuildKit
        } else {
            if self.buildkit {
                tracing::debug!("No session key, using the classic builder");
            }
            BuilderVersion::BuilderV1
        };

        let options = BuildImageOptions {
            dockerfile: request.dockerfile.as_str(),
            t: request.tag.as_str(),
            buildargs: build_args_refs,
            labels,
            target: request.target.as_deref().unwrap_or(""),
            platform: request.platform.as_deref().unwrap_or(""),
            nocache: request.no_cache,
            rm: true,      // 中間コンテナを削除
            forcerm: true, // ビルド失敗時も中間コンテナを削除
            session,
            version,
            ..Default::default()
        };

        tracing::debug!("Build options: {:?}", options);

        let credentials = if request.credentials.is_empty() {
            None
        } else {
            Some(request.credentials.clone())
        };

        let (relay, events) = TraceRelay::channel();
        self.trace = Some(relay);
        let printer = tokio::spawn(print_trace(events));

        // ビルドストリームの開始
        use http_body_util::{Either, Full};
        let body = Full::new(Bytes::from(context_data));
        let mut stream = self
            .docker
            .build_image(options, credentials, Some(Either::Left(body)));

        let mut outcome = Ok(());
        while let Some(msg) = stream.next().await {
            let handled = match msg {
                Ok(output) => self.handle_build_output(output),
                Err(e) => Err(BuildError::DockerConnection(e)),
            };
            if let Err(e) = handled {
                outcome = Err(e);
                break;
            }
        }

        // 送信側を閉じてトレース表示を終了させる
        self.trace = None;
        drop(stream);
        if let Err(e) = printer.await {
            tracing::debug!("Trace printer stopped: {}", e);
        }

        outcome?;
        tracing::info!("Successfully built: {}", request.tag);
        Ok(())
    }

    /// ビルド出力の処理
    fn handle_build_output(&self, output: bollard::models::BuildInfo) -> Result<()> {
        if let Some(relay) = &self.trace
            && relay.relay(&output)
        {
            return Ok(());
        }

        if let Some(stream) = output.stream {
            print!("{}", stream);
        }

        if let Some(error) = output.error {
            return Err(BuildError::BuildFailed(error));
        }

        if let Some(error_detail) = output.error_detail {
            let error_msg = error_detail
                .message
                .unwrap_or_else(|| "Unknown build error".to_string());
            return Err(BuildError::BuildFailed(error_msg));
        }

        if let Some(status) = output.status {
            // ステータスメッセージ（pull等）
            println!("{}", status.cyan());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BuildContext;
    use crate::ignore::ExcludeSet;
    use crate::session::{SolveStatus, TRACE_MESSAGE_ID, Vertex};
    use base64::Engine;
    use prost::Message;

    fn offline_builder() -> ImageBuilder {
        let docker =
            Docker::connect_with_http("tcp://127.0.0.1:2375", 4, bollard::API_DEFAULT_VERSION)
                .unwrap();
        ImageBuilder::new(docker)
    }

    fn output(line: serde_json::Value) -> bollard::models::BuildInfo {
        serde_json::from_str(&line.to_string()).unwrap()
    }

    #[test]
    fn test_buildkit_follows_daemon_when_env_unset() {
        assert!(buildkit_requested(Some("2"), None).unwrap());
        assert!(!buildkit_requested(Some("1"), None).unwrap());
        assert!(!buildkit_requested(None, None).unwrap());
        assert!(buildkit_requested(Some("2"), Some("")).unwrap());
    }

    #[test]
    fn test_buildkit_env_overrides_daemon() {
        assert!(!buildkit_requested(Some("2"), Some("0")).unwrap());
        assert!(!buildkit_requested(Some("2"), Some("false")).unwrap());
        assert!(buildkit_requested(Some("1"), Some("1")).unwrap());
        assert!(buildkit_requested(None, Some("TRUE")).unwrap());
    }

    #[test]
    fn test_buildkit_env_must_be_boolean() {
        let err = buildkit_requested(Some("2"), Some("yes")).unwrap_err();
        assert!(err.to_string().contains("DOCKER_BUILDKIT"));
    }

    #[tokio::test]
    async fn test_trace_output_is_relayed_not_printed() {
        let status = SolveStatus {
            vertexes: vec![Vertex {
                digest: "sha256:step".into(),
                name: "[2/2] RUN make".into(),
                completed: Some(prost_types::Timestamp {
                    seconds: 1,
                    nanos: 0,
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let payload = base64::engine::general_purpose::STANDARD.encode(status.encode_to_vec());

        let mut builder = offline_builder();
        let (relay, mut rx) = TraceRelay::channel();
        builder.trace = Some(relay);

        builder
            .handle_build_output(output(serde_json::json!({
                "id": TRACE_MESSAGE_ID,
                "aux": payload,
            })))
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), status);
    }

    #[tokio::test]
    async fn test_error_output_fails_build() {
        let builder = offline_builder();
        let err = builder
            .handle_build_output(output(serde_json::json!({
                "errorDetail": { "message": "exit code 2" },
            })))
            .unwrap_err();
        assert!(matches!(err, BuildError::BuildFailed(ref m) if m == "exit code 2"));

        builder
            .handle_build_output(output(serde_json::json!({ "stream": "Step 1/2\n" })))
            .unwrap();
    }

    #[tokio::test]
    #[ignore] // Docker接続が必要なため、通常のテストではスキップ
    async fn test_build_simple_image() {
        let docker = Docker::connect_with_local_defaults().unwrap();

        let source = tempfile::tempdir().unwrap();
        let ctx = BuildContext::new().unwrap();
        ctx.add_source(source.path(), &ExcludeSet::new()).unwrap();
        ctx.add_file("Dockerfile", b"FROM alpine:latest\nCMD echo 'test'")
            .unwrap();
        let context_data = ctx.archive().unwrap();

        let request = BuildRequest {
            tag: "shipyard-test:latest".into(),
            dockerfile: "Dockerfile".into(),
            session_key: Some("test-session".into()),
            ..Default::default()
        };

        let result = ImageBuilder::new(docker.clone())
            .build_image(context_data, &request)
            .await;
        assert!(result.is_ok());

        docker
            .remove_image(
                "shipyard-test:latest",
                None::<bollard::query_parameters::RemoveImageOptions>,
                None,
            )
            .await
            .ok();
    }
}
