//! Authenticated session repurposed as a byte stream
//!
//! A remote builder accepts `ssh` logins where the application name is the
//! login principal and the platform access token is the password. Running
//! the remote `start` command wires the session's stdin/stdout straight
//! into the builder's Docker API socket.

use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// Fixed port the builder's tunnel endpoint listens on
pub const TUNNEL_PORT: u16 = 10022;

/// Remote command whose stdio becomes the tunneled stream
pub const REMOTE_COMMAND: &str = "start";

const TOKEN_ENV: &str = "SHIPYARD_TUNNEL_TOKEN";
const CONNECT_TIMEOUT_SECS: u32 = 5;

/// Where and as whom to open the tunnel
#[derive(Clone)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub token: String,
}

impl fmt::Debug for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl TunnelTarget {
    /// Build a target from a remote builder URL. Only the hostname is used;
    /// the tunnel always listens on [`TUNNEL_PORT`].
    pub fn from_builder_url(
        raw_url: &str,
        app_name: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self> {
        let parsed = url::Url::parse(raw_url).map_err(|e| TunnelError::InvalidTarget {
            address: raw_url.to_string(),
            message: e.to_string(),
        })?;

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TunnelError::InvalidTarget {
                address: raw_url.to_string(),
                message: "URL has no host".to_string(),
            })?;

        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: TUNNEL_PORT,
            user: app_name.into(),
            token: token.into(),
        })
    }
}

/// Anything the relay can pump bytes through and then close
#[async_trait]
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {
    async fn close(self: Box<Self>) -> io::Result<()>;
}

/// Opens tunnel streams on demand
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<Box<dyn TunnelStream>>;

    /// True once the remote end has rejected the credential
    fn credential_rejected(&self) -> bool {
        false
    }
}

/// One `ssh` session whose stdio is the stream
///
/// Deadlines are accepted and ignored: a child process pipe has no
/// socket-level deadline. Abort through the caller's cancellation token.
pub struct DaemonTunnelConnection {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    peer: String,
}

impl DaemonTunnelConnection {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn set_deadline(&self, _deadline: Instant) -> io::Result<()> {
        Ok(())
    }

    pub fn set_read_deadline(&self, _deadline: Instant) -> io::Result<()> {
        Ok(())
    }

    pub fn set_write_deadline(&self, _deadline: Instant) -> io::Result<()> {
        Ok(())
    }

    /// Close the session, then the process carrying it.
    /// Both are attempted; the first error is returned.
    pub async fn close(mut self) -> io::Result<()> {
        let session = self.stdin.shutdown().await;

        let parent = match self.child.try_wait() {
            Ok(Some(_)) => Ok(()),
            _ => self.child.kill().await,
        };

        session.and(parent)
    }
}

impl fmt::Debug for DaemonTunnelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonTunnelConnection")
            .field("peer", &self.peer)
            .field("pid", &self.child.id())
            .finish()
    }
}

impl AsyncRead for DaemonTunnelConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for DaemonTunnelConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

#[async_trait]
impl TunnelStream for DaemonTunnelConnection {
    async fn close(self: Box<Self>) -> io::Result<()> {
        DaemonTunnelConnection::close(*self).await
    }
}

/// Dials tunnel sessions with the system `ssh` client
///
/// The token is handed to `ssh` through a throwaway askpass helper that
/// reads it from the child's environment, so it never appears in argv.
pub struct SshDialer {
    target: TunnelTarget,
    program: PathBuf,
    askpass: PathBuf,
    rejected: Arc<AtomicBool>,
    _askpass_dir: tempfile::TempDir,
}

impl SshDialer {
    pub fn new(target: TunnelTarget) -> Result<Self> {
        Self::with_program(target, "ssh")
    }

    pub fn with_program(target: TunnelTarget, program: impl Into<PathBuf>) -> Result<Self> {
        let askpass_dir = tempfile::Builder::new()
            .prefix("shipyard-tunnel")
            .tempdir()?;
        let askpass = write_askpass(askpass_dir.path())?;

        Ok(Self {
            target,
            program: program.into(),
            askpass,
            rejected: Arc::new(AtomicBool::new(false)),
            _askpass_dir: askpass_dir,
        })
    }

    pub fn target(&self) -> &TunnelTarget {
        &self.target
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-T")
            .arg("-p")
            .arg(self.target.port.to_string())
            .arg("-l")
            .arg(&self.target.user)
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .args(["-o", "PubkeyAuthentication=no"])
            .args(["-o", "PreferredAuthentications=password,keyboard-interactive"])
            .args(["-o", "NumberOfPasswordPrompts=1"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS))
            .arg(&self.target.host)
            .arg(REMOTE_COMMAND);

        cmd.env("SSH_ASKPASS", &self.askpass)
            .env("SSH_ASKPASS_REQUIRE", "force")
            .env(TOKEN_ENV, &self.target.token)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd
    }

    /// Open one session
    pub async fn connect(&self) -> Result<DaemonTunnelConnection> {
        if self.credential_rejected() {
            return Err(TunnelError::Unauthorized);
        }

        tracing::debug!(
            "Opening tunnel session to {}@{}:{}",
            self.target.user,
            self.target.host,
            self.target.port
        );

        let mut child = self.command().spawn().map_err(TunnelError::Spawn)?;

        let (stdin, stdout, stderr) =
            match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
                (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
                _ => {
                    let _ = child.kill().await;
                    return Err(TunnelError::Connection(
                        "tunnel session pipes unavailable".to_string(),
                    ));
                }
            };

        spawn_stderr_pump(stderr, self.rejected.clone());

        Ok(DaemonTunnelConnection {
            child,
            stdin,
            stdout,
            peer: format!("{}:{}", self.target.host, self.target.port),
        })
    }
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(&self) -> Result<Box<dyn TunnelStream>> {
        let conn = self.connect().await?;
        Ok(Box::new(conn))
    }

    fn credential_rejected(&self) -> bool {
        self.rejected.load(Ordering::SeqCst)
    }
}

/// Whether an `ssh` diagnostic line means the credential was refused
pub fn is_auth_rejection(line: &str) -> bool {
    let line = line.to_ascii_lowercase();
    line.contains("permission denied")
        || line.contains("unable to authenticate")
        || line.contains("too many authentication failures")
}

/// Copy the session's stderr to ours so the remote side never blocks on a
/// full pipe, flagging credential rejections on the way through.
fn spawn_stderr_pump(stderr: ChildStderr, rejected: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut out = tokio::io::stderr();

        while let Ok(Some(line)) = lines.next_line().await {
            if is_auth_rejection(&line) {
                tracing::debug!("Tunnel credential rejected: {}", line);
                rejected.store(true, Ordering::SeqCst);
            }
            if out.write_all(format!("{}\n", line).as_bytes()).await.is_err() {
                break;
            }
        }
    });
}

fn write_askpass(dir: &Path) -> Result<PathBuf> {
    let path = dir.join("askpass.sh");
    std::fs::write(
        &path,
        format!("#!/bin/sh\nprintf '%s\\n' \"${}\"\n", TOKEN_ENV),
    )?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(path)
}
