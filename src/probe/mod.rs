//! Remote health probe: the admission gate.
//!
//! Before a candidate host is persisted it must prove it can round-trip
//! an authenticated session, a file transfer, and a command execution.
//! The probe is a binary gate, not a health report: the captured output
//! must equal the configured success token exactly, and anything else
//! fails. Partial credit is deliberately disallowed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::registry::SshCredential;

pub mod ssh;

pub use ssh::SshTransport;

/// Failure from the remote-session transport. The prober maps it onto
/// the stage that was running when it happened.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Where a candidate host is probed.
#[derive(Debug)]
pub struct ProbeTarget<'a> {
    pub address: &'a str,
    pub port: u16,
    pub username: &'a str,
    pub credential: &'a SshCredential,
}

/// Probe failures, one per protocol stage. Callers must be able to act
/// differently on each, so these are never collapsed.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// Session open failed: unreachable host, refused auth, or timeout.
    /// The dominant expected failure mode.
    #[error("cannot reach host: {0}")]
    Connectivity(String),

    /// The health-check payload could not be uploaded.
    #[error("health-check upload failed: {0}")]
    Transfer(String),

    /// The health check ran but its output was not the success token.
    /// Carries the captured output for diagnostics.
    #[error("health check returned unexpected output: {output:?}")]
    Validation { output: String },
}

/// An open, authenticated remote session.
///
/// `exec` returns the combined captured output with at most the final
/// trailing newline stripped by the transport; no other trimming.
pub trait RemoteSession: Send {
    /// Transfer a local file to a remote path over this session.
    fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransportError>;

    /// Run a command and capture its combined textual output.
    fn exec(&mut self, command: &str) -> Result<String, TransportError>;

    /// Release the session. Called on every probe exit path.
    fn close(&mut self);
}

/// Opens authenticated remote sessions. Injected so tests can
/// substitute a fake.
pub trait RemoteTransport: Send + Sync {
    fn connect(
        &self,
        address: &str,
        port: u16,
        username: &str,
        credential: &SshCredential,
    ) -> Result<Box<dyn RemoteSession>, TransportError>;
}

/// The probe gate, as seen by the reconciler.
pub trait Prober: Send + Sync {
    /// Blocking; seconds-scale. Callers on an async runtime drive this
    /// through `spawn_blocking`.
    fn probe(&self, target: &ProbeTarget<'_>) -> Result<(), ProbeError>;
}

/// Configuration for the health probe.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Local path of the operator-provided health-check script.
    pub script_path: PathBuf,

    /// Remote path the script is uploaded to and executed from.
    pub remote_path: String,

    /// The single literal the script must print on success.
    pub success_token: String,

    /// TCP connect timeout; expiry is a connectivity failure.
    pub connect_timeout: Duration,

    /// Timeout covering upload and execution on the open session.
    pub exec_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            script_path: PathBuf::from("./check.sh"),
            remote_path: "/tmp/check.sh".to_string(),
            success_token: "ok!!!".to_string(),
            connect_timeout: Duration::from_secs(10),
            exec_timeout: Duration::from_secs(30),
        }
    }
}

/// Runs the probe protocol over an injected transport.
pub struct HealthProber {
    transport: Box<dyn RemoteTransport>,
    config: ProbeConfig,
}

impl HealthProber {
    pub fn new(transport: Box<dyn RemoteTransport>, config: ProbeConfig) -> Self {
        Self { transport, config }
    }

    /// Steps 2-5 of the protocol, separated out so the caller can close
    /// the session unconditionally around them.
    fn run_gate(&self, session: &mut dyn RemoteSession) -> Result<(), ProbeError> {
        session
            .upload(&self.config.script_path, &self.config.remote_path)
            .map_err(|e| ProbeError::Transfer(e.to_string()))?;

        let command = format!("sh {}", self.config.remote_path);
        let output = session
            .exec(&command)
            .map_err(|e| ProbeError::Validation {
                output: format!("(execution failed: {})", e),
            })?;

        // Exact comparison. Trailing whitespace, partial output, or the
        // token embedded in a longer string all fail the gate.
        if output == self.config.success_token {
            Ok(())
        } else {
            Err(ProbeError::Validation { output })
        }
    }
}

impl Prober for HealthProber {
    fn probe(&self, target: &ProbeTarget<'_>) -> Result<(), ProbeError> {
        let mut session = self
            .transport
            .connect(target.address, target.port, target.username, target.credential)
            .map_err(|e| ProbeError::Connectivity(e.to_string()))?;

        let outcome = self.run_gate(session.as_mut());

        // Scoped release: the session is closed on every exit path.
        session.close();

        match &outcome {
            Ok(()) => debug!(address = target.address, "probe passed"),
            Err(e) => debug!(address = target.address, error = %e, "probe failed"),
        }
        outcome
    }
}
