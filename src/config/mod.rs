//! Nodegate configuration.
//!
//! Loaded from a YAML file; every field has a default so a partial file
//! (or none at all) still yields a runnable config. The Kubernetes
//! bearer token is resolved from the environment, never from the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::probe::ProbeConfig;

/// Errors for config file I/O and parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodegateConfig {
    /// Bind address for the HTTP surface.
    pub bind_addr: String,

    /// Listen port for the HTTP surface.
    pub port: u16,

    /// Path of the redb registry database.
    pub registry_path: PathBuf,

    pub probe: ProbeSettings,

    pub kube: KubeSettings,
}

impl Default for NodegateConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8090,
            registry_path: PathBuf::from("nodegate.redb"),
            probe: ProbeSettings::default(),
            kube: KubeSettings::default(),
        }
    }
}

/// Health-probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeSettings {
    /// Local path of the health-check script to upload.
    pub script_path: PathBuf,

    /// Remote path the script is uploaded to and run from.
    pub remote_path: String,

    /// Literal the script must print on success.
    pub success_token: String,

    pub connect_timeout_secs: u64,

    pub exec_timeout_secs: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            script_path: PathBuf::from("./check.sh"),
            remote_path: "/tmp/check.sh".to_string(),
            success_token: "ok!!!".to_string(),
            connect_timeout_secs: 10,
            exec_timeout_secs: 30,
        }
    }
}

impl ProbeSettings {
    pub fn to_probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            script_path: self.script_path.clone(),
            remote_path: self.remote_path.clone(),
            success_token: self.success_token.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
        }
    }
}

/// Kubernetes control-plane settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KubeSettings {
    /// API server base URL.
    pub api_server: String,

    /// Name of the environment variable holding the bearer token.
    pub token_env: String,

    /// Accept the API server's certificate without verification.
    pub insecure_skip_tls_verify: bool,

    pub request_timeout_secs: u64,
}

impl Default for KubeSettings {
    fn default() -> Self {
        Self {
            api_server: "https://127.0.0.1:6443".to_string(),
            token_env: "NODEGATE_KUBE_TOKEN".to_string(),
            insecure_skip_tls_verify: false,
            request_timeout_secs: 15,
        }
    }
}

impl KubeSettings {
    /// Read the bearer token from the configured environment variable.
    pub fn resolve_token(&self) -> Option<String> {
        std::env::var(&self.token_env).ok().filter(|t| !t.is_empty())
    }
}

/// Load a config file from disk. This is the I/O boundary; parsing is
/// plain serde.
pub fn load_config_file(path: &Path) -> Result<NodegateConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config = serde_yaml::from_str(&content)?;
    Ok(config)
}
