//! BuildKit session identity and trace relay
//!
//! BuildKit correlates cache state by a session key derived from a stable
//! per-machine node id and the build context directory. Trace messages arrive
//! on the build output stream under the `moby.buildkit.trace` id; the client
//! decodes their protobuf payload and [`TraceRelay`] turns it into
//! [`SolveStatus`] events.

use bollard::models::{BuildInfo, BuildInfoAux};
use bollard::moby::buildkit::v1::StatusResponse;
use colored::Colorize;
use rand::RngCore;
use sha2::{Digest, Sha256};
use shipyard_config::{KEY_BUILDKIT_NODE_ID, Settings};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::mpsc;

pub const TRACE_MESSAGE_ID: &str = "moby.buildkit.trace";

/// Stable node id, created and persisted on first use.
/// A failed save is logged and the fresh id still returned.
pub fn build_node_id(settings: &mut dyn Settings) -> String {
    if let Some(id) = settings.get(KEY_BUILDKIT_NODE_ID)
        && !id.is_empty()
    {
        return id;
    }

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let id = hex::encode(bytes);

    settings.set(KEY_BUILDKIT_NODE_ID, &id);
    if let Err(e) = settings.save() {
        tracing::warn!("Failed to persist buildkit node id: {}", e);
    }

    id
}

/// Session key for builds of `context_dir` from this node
pub fn session_key(node_id: &str, context_dir: &Path) -> String {
    let digest = Sha256::digest(format!("{}:{}", node_id, context_dir.display()).as_bytes());
    format!("{:x}", digest)
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SolveStatus {
    #[prost(message, repeated, tag = "1")]
    pub vertexes: Vec<Vertex>,
    #[prost(message, repeated, tag = "2")]
    pub statuses: Vec<VertexStatus>,
    #[prost(message, repeated, tag = "3")]
    pub logs: Vec<VertexLog>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Vertex {
    #[prost(string, tag = "1")]
    pub digest: String,
    #[prost(string, repeated, tag = "2")]
    pub inputs: Vec<String>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(bool, tag = "4")]
    pub cached: bool,
    #[prost(message, optional, tag = "5")]
    pub started: Option<prost_types::Timestamp>,
    #[prost(message, optional, tag = "6")]
    pub completed: Option<prost_types::Timestamp>,
    #[prost(string, tag = "7")]
    pub error: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VertexStatus {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub vertex: String,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(int64, tag = "4")]
    pub current: i64,
    #[prost(int64, tag = "5")]
    pub total: i64,
    #[prost(message, optional, tag = "6")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(message, optional, tag = "7")]
    pub started: Option<prost_types::Timestamp>,
    #[prost(message, optional, tag = "8")]
    pub completed: Option<prost_types::Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VertexLog {
    #[prost(string, tag = "1")]
    pub vertex: String,
    #[prost(message, optional, tag = "2")]
    pub timestamp: Option<prost_types::Timestamp>,
    #[prost(int64, tag = "3")]
    pub stream: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub msg: Vec<u8>,
}

impl From<StatusResponse> for SolveStatus {
    fn from(status: StatusResponse) -> Self {
        Self {
            vertexes: status
                .vertexes
                .into_iter()
                .map(|v| Vertex {
                    digest: v.digest,
                    inputs: v.inputs,
                    name: v.name,
                    cached: v.cached,
                    started: v.started.map(|t| timestamp(t.seconds, t.nanos)),
                    completed: v.completed.map(|t| timestamp(t.seconds, t.nanos)),
                    error: v.error,
                })
                .collect(),
            statuses: status
                .statuses
                .into_iter()
                .map(|s| VertexStatus {
                    id: s.id,
                    vertex: s.vertex,
                    name: s.name,
                    current: s.current,
                    total: s.total,
                    timestamp: s.timestamp.map(|t| timestamp(t.seconds, t.nanos)),
                    started: s.started.map(|t| timestamp(t.seconds, t.nanos)),
                    completed: s.completed.map(|t| timestamp(t.seconds, t.nanos)),
                })
                .collect(),
            logs: status
                .logs
                .into_iter()
                .map(|l| VertexLog {
                    vertex: l.vertex,
                    timestamp: l.timestamp.map(|t| timestamp(t.seconds, t.nanos)),
                    stream: l.stream,
                    msg: l.msg,
                })
                .collect(),
        }
    }
}

fn timestamp(seconds: i64, nanos: i32) -> prost_types::Timestamp {
    prost_types::Timestamp { seconds, nanos }
}

/// Trace payload carried by one build-output message, if any
pub fn decode_trace(message: &BuildInfo) -> Option<SolveStatus> {
    if message.id.as_deref() != Some(TRACE_MESSAGE_ID) {
        return None;
    }

    match &message.aux {
        Some(BuildInfoAux::BuildKit(status)) => Some(status.clone().into()),
        _ => None,
    }
}

/// Forwards decoded trace events to a channel
#[derive(Clone)]
pub struct TraceRelay {
    events: mpsc::UnboundedSender<SolveStatus>,
}

impl TraceRelay {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SolveStatus>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    /// Returns true when the message was a trace and was forwarded
    pub fn relay(&self, message: &BuildInfo) -> bool {
        match decode_trace(message) {
            Some(status) => self.events.send(status).is_ok(),
            None => false,
        }
    }
}

/// Print trace events as numbered build steps
pub async fn print_trace(mut events: mpsc::UnboundedReceiver<SolveStatus>) {
    let mut steps: HashMap<String, usize> = HashMap::new();

    while let Some(status) = events.recv().await {
        for vertex in &status.vertexes {
            let next = steps.len() + 1;
            let step = *steps.entry(vertex.digest.clone()).or_insert(next);

            if !vertex.error.is_empty() {
                println!("#{} {} {}", step, "ERROR".red(), vertex.error);
            } else if vertex.cached {
                println!("#{} {} {}", step, vertex.name, "CACHED".cyan());
            } else if vertex.completed.is_some() {
                println!("#{} {} {}", step, vertex.name, "DONE".green());
            } else if vertex.started.is_some() {
                println!("#{} {}", step, vertex.name);
            }
        }

        for log in &status.logs {
            let step = steps.get(&log.vertex).copied().unwrap_or(0);
            for line in String::from_utf8_lossy(&log.msg).lines() {
                println!("#{} {}", step, line);
            }
        }
    }
}
