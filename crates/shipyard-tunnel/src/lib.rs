//! Remote build daemon tunnel
//!
//! Turns an authenticated `ssh` session into a byte stream the Docker
//! client can dial, exposes it on a loopback listener, and verifies the
//! daemon behind it is actually serving before a build starts.

pub mod backoff;
pub mod connection;
pub mod error;
pub mod readiness;
pub mod relay;

pub use backoff::{Backoff, BackoffConfig};
pub use connection::{
    DaemonTunnelConnection, Dialer, REMOTE_COMMAND, SshDialer, TUNNEL_PORT, TunnelStream,
    TunnelTarget,
};
pub use error::{Result, TunnelError};
pub use readiness::{DaemonProbe, Readiness, ReadinessPolicy, wait_for_daemon};
pub use relay::TunnelRelay;
