//! Daemon readiness polling
//!
//! A daemon can accept connections before it is able to serve builds, so a
//! single successful ping is not enough. The daemon is declared ready only
//! after an unbroken run of successful probes spanning `healthy_streak`.

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

/// One health check against a candidate daemon
#[async_trait]
pub trait DaemonProbe: Send + Sync {
    async fn probe(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    /// Absolute limit for the whole wait
    pub deadline: Duration,
    /// Limit for a single probe
    pub probe_timeout: Duration,
    /// How long probes must keep succeeding before the daemon counts as ready
    pub healthy_streak: Duration,
    pub backoff: BackoffConfig,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(5 * 60),
            probe_timeout: Duration::from_secs(5),
            healthy_streak: Duration::from_secs(3),
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// The caller cancelled; not a failure
    Cancelled,
}

/// Poll `probe` until the daemon is ready, the deadline passes, or `cancel` fires.
///
/// A rejected credential ends the wait immediately with [`TunnelError::Unauthorized`].
pub async fn wait_for_daemon(
    probe: Arc<dyn DaemonProbe>,
    policy: &ReadinessPolicy,
    cancel: &CancellationToken,
) -> Result<Readiness> {
    let deadline = sleep(policy.deadline);
    tokio::pin!(deadline);

    let mut backoff = Backoff::new(policy.backoff.clone());
    let mut consecutive_successes: u32 = 0;
    let mut healthy_since = Instant::now();

    loop {
        let mut check = tokio::spawn({
            let probe = probe.clone();
            let limit = policy.probe_timeout;
            async move {
                match timeout(limit, probe.probe()).await {
                    Ok(result) => result,
                    Err(_) => Err(TunnelError::ProbeTimeout(limit)),
                }
            }
        });

        let result = tokio::select! {
            joined = &mut check => joined.unwrap_or_else(|e| {
                Err(TunnelError::Connection(format!("health probe aborted: {}", e)))
            }),
            _ = &mut deadline => {
                check.abort();
                return Err(TunnelError::Timeout(policy.deadline));
            }
            _ = cancel.cancelled() => {
                check.abort();
                tracing::warn!("Canceled");
                return Ok(Readiness::Cancelled);
            }
        };

        let wait = match result {
            Ok(()) => {
                if consecutive_successes == 0 {
                    // space out the confirming probes from the start of the streak
                    healthy_since = Instant::now();
                    backoff.reset();
                }
                consecutive_successes += 1;

                if healthy_since.elapsed() >= policy.healthy_streak {
                    tracing::info!("Remote builder is ready to build!");
                    return Ok(Readiness::Ready);
                }

                let wait = backoff.next_delay();
                tracing::debug!(
                    "Remote builder available, but pinging again in {:?} to be sure",
                    wait
                );
                wait
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                consecutive_successes = 0;
                let wait = backoff.next_delay();
                tracing::debug!(
                    "Remote builder unavailable, retrying in {:?} (err: {})",
                    wait,
                    err
                );
                wait
            }
        };

        tokio::select! {
            _ = sleep(wait) => {}
            _ = &mut deadline => return Err(TunnelError::Timeout(policy.deadline)),
            _ = cancel.cancelled() => {
                tracing::warn!("Canceled");
                return Ok(Readiness::Cancelled);
            }
        }
    }
}
