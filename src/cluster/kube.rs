//! Kubernetes control-plane fetcher.
//!
//! Talks directly to the API server's `GET /api/v1/nodes` endpoint with
//! an optional bearer token and maps the NodeList wire format into
//! [`LiveNodeFact`]s. Any transport or decode failure surfaces as
//! [`ClusterError::Unavailable`]; an empty item list is a valid result.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{ClusterError, ClusterStateFetcher, LiveNodeFact};
use crate::config::KubeSettings;

/// Fetches live node facts from a Kubernetes API server.
pub struct KubeApiFetcher {
    client: Client,
    api_server: String,
    token: Option<String>,
}

impl KubeApiFetcher {
    /// Build a fetcher from config. The bearer token is resolved from
    /// the environment so it never lives in the config file.
    pub fn new(settings: &KubeSettings) -> Result<Self, ClusterError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .danger_accept_invalid_certs(settings.insecure_skip_tls_verify)
            .build()
            .map_err(|e| ClusterError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            api_server: settings.api_server.trim_end_matches('/').to_string(),
            token: settings.resolve_token(),
        })
    }
}

#[async_trait]
impl ClusterStateFetcher for KubeApiFetcher {
    async fn list_live_nodes(&self) -> Result<Vec<LiveNodeFact>, ClusterError> {
        let url = format!("{}/api/v1/nodes", self.api_server);

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClusterError::Unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| ClusterError::Unavailable(e.to_string()))?;

        let node_list: NodeList = response
            .json()
            .await
            .map_err(|e| ClusterError::Unavailable(e.to_string()))?;

        let facts: Vec<LiveNodeFact> = node_list.items.iter().map(fact_from_node).collect();
        debug!(count = facts.len(), "fetched live nodes");
        Ok(facts)
    }
}

// ============================================================================
// Wire format (the subset of the NodeList schema we read)
// ============================================================================

#[derive(Debug, Deserialize)]
struct NodeList {
    #[serde(default)]
    items: Vec<KubeNode>,
}

#[derive(Debug, Deserialize)]
struct KubeNode {
    #[serde(default)]
    status: KubeNodeStatus,
}

#[derive(Debug, Default, Deserialize)]
struct KubeNodeStatus {
    #[serde(default)]
    addresses: Vec<KubeNodeAddress>,

    #[serde(default)]
    capacity: HashMap<String, String>,

    #[serde(rename = "nodeInfo", default)]
    node_info: KubeNodeSystemInfo,
}

#[derive(Debug, Deserialize)]
struct KubeNodeAddress {
    #[serde(rename = "type")]
    kind: String,
    address: String,
}

#[derive(Debug, Default, Deserialize)]
struct KubeNodeSystemInfo {
    #[serde(default)]
    architecture: String,

    #[serde(rename = "containerRuntimeVersion", default)]
    container_runtime_version: String,

    #[serde(rename = "kubeletVersion", default)]
    kubelet_version: String,

    #[serde(rename = "kernelVersion", default)]
    kernel_version: String,

    #[serde(rename = "osImage", default)]
    os_image: String,
}

fn fact_from_node(node: &KubeNode) -> LiveNodeFact {
    let status = &node.status;
    let (address, hostname) = select_addresses(&status.addresses);

    LiveNodeFact {
        address,
        hostname,
        cores: status
            .capacity
            .get("cpu")
            .map(|q| parse_cores(q))
            .unwrap_or(0),
        memory_kb: status
            .capacity
            .get("memory")
            .map(|q| parse_quantity_kb(q))
            .unwrap_or(0),
        storage_kb: status
            .capacity
            .get("ephemeral-storage")
            .map(|q| parse_quantity_kb(q))
            .unwrap_or(0),
        architecture: status.node_info.architecture.clone(),
        container_runtime_version: status.node_info.container_runtime_version.clone(),
        kubelet_version: status.node_info.kubelet_version.clone(),
        kernel_version: status.node_info.kernel_version.clone(),
        os_image: status.node_info.os_image.clone(),
    }
}

/// Pick the primary address (InternalIP) and hostname by address type,
/// falling back to positional order for clusters that report
/// nonstandard types.
fn select_addresses(addresses: &[KubeNodeAddress]) -> (String, String) {
    let internal = addresses
        .iter()
        .find(|a| a.kind == "InternalIP")
        .or_else(|| addresses.first())
        .map(|a| a.address.clone())
        .unwrap_or_default();

    let hostname = addresses
        .iter()
        .find(|a| a.kind == "Hostname")
        .or_else(|| addresses.get(1))
        .map(|a| a.address.clone())
        .unwrap_or_default();

    (internal, hostname)
}

/// Parse a CPU quantity into whole cores. Handles plain integers and
/// millicore notation ("4", "4000m").
fn parse_cores(quantity: &str) -> u32 {
    let q = quantity.trim();
    if let Some(millis) = q.strip_suffix('m') {
        millis.parse::<u64>().map(|m| (m / 1000) as u32).unwrap_or(0)
    } else {
        q.parse().unwrap_or(0)
    }
}

/// Parse a Kubernetes resource quantity into raw kilobytes.
///
/// Binary suffixes (Ki/Mi/Gi/Ti/Pi), decimal suffixes (k/M/G/T/P), and
/// plain byte counts are accepted; anything unparseable yields 0 so a
/// malformed node never fails a whole fetch.
fn parse_quantity_kb(quantity: &str) -> u64 {
    let q = quantity.trim();
    let split = q
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(q.len());
    let (digits, suffix) = q.split_at(split);

    let Ok(amount) = digits.parse::<u64>() else {
        return 0;
    };

    // An overflowing amount is as malformed as a bad suffix; both
    // yield 0 rather than failing the fetch.
    let scale_binary = |factor: u64| amount.checked_mul(factor).unwrap_or(0);
    let scale_decimal = |factor: u64| amount.checked_mul(factor).map_or(0, |n| n / 1024);

    match suffix {
        "" => amount / 1024,
        "Ki" => amount,
        "Mi" => scale_binary(1024),
        "Gi" => scale_binary(1024 * 1024),
        "Ti" => scale_binary(1024 * 1024 * 1024),
        "Pi" => scale_binary(1024 * 1024 * 1024 * 1024),
        "k" => scale_decimal(1000),
        "M" => scale_decimal(1_000_000),
        "G" => scale_decimal(1_000_000_000),
        "T" => scale_decimal(1_000_000_000_000),
        "P" => scale_decimal(1_000_000_000_000_000),
        _ => 0,
    }
}
