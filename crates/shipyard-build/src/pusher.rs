//! イメージプッシュ処理
//!
//! The daemon reports a push as newline-delimited JSON, one status line per
//! layer event. [`PushProgress`] folds those into a single overall figure and
//! [`PushOperation`] exposes the result as a channel of [`PushMessage`]s plus
//! a terminal outcome.

use crate::auth::RegistryAuth;
use crate::daemon::{Daemon, DaemonEndpoint};
use crate::error::{BuildError, BuildResult};
use crate::progress::PushProgressBar;
use crate::reference::{split_image_tag, validate_tag};
use bytes::Bytes;
use colored::Colorize;
use futures_util::{Stream, TryStreamExt};
use http_body_util::{BodyExt, BodyStream, Empty};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;

const MESSAGE_BUFFER: usize = 32;

/// Statuses that mark a layer as done
const LAYER_DONE_STATUSES: [&str; 2] = ["Layer already exists", "Pushed"];

/// One line of the daemon's push output
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushStatus {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "progressDetail")]
    pub progress_detail: Option<ProgressDetail>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "errorDetail")]
    pub error_detail: Option<ErrorDetail>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ProgressDetail {
    #[serde(default)]
    pub current: i64,
    #[serde(default)]
    pub total: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: Option<String>,
}

impl PushStatus {
    fn failure(&self) -> Option<String> {
        self.error.clone().or_else(|| {
            self.error_detail
                .as_ref()
                .map(|d| d.message.clone().unwrap_or_else(|| "unknown push error".to_string()))
        })
    }
}

/// Overall push progress
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PushMessage {
    pub layers_total: usize,
    pub layers_complete: usize,
    /// 0..=100
    pub progress: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct LayerBytes {
    current: i64,
    total: i64,
}

/// Per-layer accounting for one push
#[derive(Debug, Default)]
pub struct PushProgress {
    layers: HashMap<String, LayerBytes>,
    finished: HashSet<String>,
}

impl PushProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one status line in and return the updated overall progress
    pub fn record(&mut self, status: &PushStatus) -> PushMessage {
        if let Some(id) = status.id.as_deref().filter(|id| !id.is_empty()) {
            let detail = status.progress_detail.unwrap_or_default();
            self.layers.insert(
                id.to_string(),
                LayerBytes {
                    current: detail.current,
                    total: detail.total,
                },
            );

            if let Some(s) = status.status.as_deref()
                && LAYER_DONE_STATUSES.contains(&s)
            {
                self.finished.insert(id.to_string());
            }
        }

        self.snapshot()
    }

    pub fn snapshot(&self) -> PushMessage {
        let layer_count = self.layers.len() as f64;
        let (current, total) = self
            .layers
            .values()
            .fold((0i64, 0i64), |(c, t), l| (c + l.current, t + l.total));

        // each layer counts as one extra unit so layers without byte
        // counts still move the figure
        let denominator = layer_count + total as f64;
        let progress = if denominator > 0.0 {
            (100.0 * (layer_count + current as f64) / denominator).clamp(0.0, 100.0)
        } else {
            0.0
        };

        PushMessage {
            layers_total: self.layers.len(),
            layers_complete: self.finished.len(),
            progress,
        }
    }
}

/// A push in flight: progress messages, then a terminal outcome
pub struct PushOperation {
    messages: mpsc::Receiver<PushMessage>,
    task: JoinHandle<BuildResult<()>>,
}

impl PushOperation {
    /// Consume a push status stream in the background
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (tx, messages) = mpsc::channel(MESSAGE_BUFFER);
        let task = tokio::spawn(consume_push_stream(reader, tx));
        Self { messages, task }
    }

    /// Next progress message; `None` once the stream has ended
    pub async fn next(&mut self) -> Option<PushMessage> {
        self.messages.recv().await
    }

    /// Drain remaining messages and return the terminal outcome
    pub async fn finish(mut self) -> BuildResult<()> {
        while self.messages.recv().await.is_some() {}
        self.task.await.map_err(|e| BuildError::PushFailed {
            message: format!("push stream task failed: {}", e),
        })?
    }
}

async fn consume_push_stream<R>(reader: R, tx: mpsc::Sender<PushMessage>) -> BuildResult<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut progress = PushProgress::new();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await.map_err(|e| BuildError::PushFailed {
        message: format!("failed to read push status: {}", e),
    })? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let status: PushStatus =
            serde_json::from_str(line).map_err(|e| BuildError::PushFailed {
                message: format!("failed to decode push status: {}", e),
            })?;

        if let Some(message) = status.failure() {
            return Err(BuildError::PushFailed { message });
        }

        let update = progress.record(&status);
        // receiver gone: keep reading so errors still surface
        let _ = tx.send(update).await;
    }

    Ok(())
}

pub type PushBody = StreamReader<Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>, Bytes>;

/// POST /images/{name}/push against the daemon and return the raw status stream
pub async fn open_push_stream(
    endpoint: &DaemonEndpoint,
    repository: &str,
    tag: &str,
    registry_auth: &str,
) -> BuildResult<PushBody> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("/images/{}/push?tag={}", repository, tag))
        .header(hyper::header::HOST, "docker")
        .header("X-Registry-Auth", registry_auth)
        .body(Empty::<Bytes>::new())
        .map_err(|e| BuildError::PushFailed {
            message: format!("invalid push request: {}", e),
        })?;

    let response = dispatch(endpoint, request).await?;

    if response.status() != StatusCode::OK {
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map(|b| b.to_bytes())
            .unwrap_or_default();
        return Err(BuildError::PushFailed {
            message: daemon_error_message(status, &body),
        });
    }

    let body = BodyStream::new(response.into_body())
        .try_filter_map(|frame| async move { Ok::<_, hyper::Error>(frame.into_data().ok()) })
        .map_err(std::io::Error::other);
    let body: Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>> = Box::pin(body);

    Ok(StreamReader::new(body))
}

/// Send one request to the daemon over a fresh connection
pub(crate) async fn dispatch(
    endpoint: &DaemonEndpoint,
    request: Request<Empty<Bytes>>,
) -> BuildResult<Response<Incoming>> {
    match endpoint {
        #[cfg(unix)]
        DaemonEndpoint::Unix(path) => send(tokio::net::UnixStream::connect(path).await?, request).await,
        #[cfg(not(unix))]
        DaemonEndpoint::Unix(path) => Err(BuildError::InvalidConfig(format!(
            "Unix sockets are not supported here: {}",
            path.display()
        ))),
        DaemonEndpoint::Tcp(address) => {
            send(tokio::net::TcpStream::connect(address.as_str()).await?, request).await
        }
    }
}

async fn send<S>(stream: S, request: Request<Empty<Bytes>>) -> BuildResult<Response<Incoming>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| BuildError::PushFailed {
            message: format!("daemon handshake failed: {}", e),
        })?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!("Daemon connection closed: {}", e);
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| BuildError::PushFailed {
            message: format!("daemon request failed: {}", e),
        })
}

fn daemon_error_message(status: StatusCode, body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct DaemonError {
        message: String,
    }

    match serde_json::from_slice::<DaemonError>(body) {
        Ok(err) => err.message,
        Err(_) => format!("daemon returned {}", status),
    }
}

/// イメージプッシュを実行するハンドラ
pub struct ImagePusher {
    daemon: Arc<dyn Daemon>,
    auth: RegistryAuth,
}

impl ImagePusher {
    pub fn new(daemon: Arc<dyn Daemon>, auth: RegistryAuth) -> Self {
        Self { daemon, auth }
    }

    /// イメージをレジストリにプッシュし、完全なイメージ名を返す
    pub async fn push(&self, image: &str) -> BuildResult<String> {
        let (_, tag) = split_image_tag(image);
        validate_tag(&tag)?;

        let header = self.auth.push_header(image)?;

        println!("  → {}", image.cyan());
        let mut operation = self.daemon.push_image(image, &header).await?;

        let bar = PushProgressBar::new(image);
        while let Some(message) = operation.next().await {
            bar.update(&message);
        }

        match operation.finish().await {
            Ok(()) => {
                bar.finish_success();
                Ok(image.to_string())
            }
            Err(e) => {
                bar.finish_error(&e.to_string());
                Err(e)
            }
        }
    }
}
