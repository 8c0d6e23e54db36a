use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::probe::ProbeError;
use crate::reconcile::{AdmitError, ListError, MergedNodeView};
use crate::registry::{NodeCandidate, SshCredential};
use crate::server::state::AppState;

/// Add-node request body. The password is deserialized straight into a
/// redacted credential so it never shows up in request logging.
#[derive(Debug, Deserialize)]
pub struct AddNodeRequest {
    pub ip: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_password: SshCredential,
    pub cluster_id: i64,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Serialize)]
pub struct AddNodeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Machine-readable failure envelope. `kind` lets operators tell
/// "already exists" from "unreachable/unhealthy" from "backend down".
#[derive(Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
    /// Captured health-check output, present on validation failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Serialize)]
pub struct NodeListResponse {
    pub nodes: Vec<MergedNodeView>,
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Admit a candidate host into a cluster.
pub async fn add_node(
    State(state): State<AppState>,
    Json(request): Json<AddNodeRequest>,
) -> impl IntoResponse {
    let candidate = NodeCandidate {
        address: request.ip,
        ssh_port: request.ssh_port,
        ssh_user: request.ssh_user,
        ssh_credential: request.ssh_password,
        cluster_id: request.cluster_id,
    };

    match state.reconciler.admit(candidate).await {
        Ok(entry) => (
            StatusCode::CREATED,
            Json(AddNodeResponse {
                success: true,
                id: Some(entry.id),
                error: None,
            }),
        ),
        Err(e) => (
            admit_status(&e),
            Json(AddNodeResponse {
                success: false,
                id: None,
                error: Some(admit_error_body(e)),
            }),
        ),
    }
}

/// Bound nodes of one cluster, merged with live facts.
pub async fn list_bound_nodes(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
) -> impl IntoResponse {
    match state.reconciler.list_bound(cluster_id).await {
        Ok(nodes) => (StatusCode::OK, Json(NodeListResponse { nodes })).into_response(),
        Err(e) => list_error_response(e),
    }
}

/// Live nodes not registered to any cluster.
pub async fn list_unbound_nodes(State(state): State<AppState>) -> impl IntoResponse {
    match state.reconciler.list_unbound().await {
        Ok(nodes) => (StatusCode::OK, Json(NodeListResponse { nodes })).into_response(),
        Err(e) => list_error_response(e),
    }
}

fn admit_status(error: &AdmitError) -> StatusCode {
    match error {
        AdmitError::DuplicateAddress(_) => StatusCode::CONFLICT,
        AdmitError::Probe(ProbeError::Connectivity(_)) => StatusCode::BAD_GATEWAY,
        AdmitError::Probe(ProbeError::Transfer(_)) => StatusCode::BAD_GATEWAY,
        AdmitError::Probe(ProbeError::Validation { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
        AdmitError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn admit_error_body(error: AdmitError) -> ErrorBody {
    let message = error.to_string();
    match error {
        AdmitError::DuplicateAddress(_) => ErrorBody {
            kind: "duplicate_address",
            message,
            output: None,
        },
        AdmitError::Probe(ProbeError::Connectivity(_)) => ErrorBody {
            kind: "connectivity",
            message,
            output: None,
        },
        AdmitError::Probe(ProbeError::Transfer(_)) => ErrorBody {
            kind: "transfer",
            message,
            output: None,
        },
        AdmitError::Probe(ProbeError::Validation { output }) => ErrorBody {
            kind: "validation",
            message,
            output: Some(output),
        },
        AdmitError::Persistence(_) => ErrorBody {
            kind: "persistence",
            message,
            output: None,
        },
    }
}

fn list_error_response(error: ListError) -> axum::response::Response {
    let (status, kind) = match &error {
        ListError::Cluster(_) => (StatusCode::SERVICE_UNAVAILABLE, "cluster_unavailable"),
        ListError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "persistence"),
    };
    (
        status,
        Json(ErrorBody {
            kind,
            message: error.to_string(),
            output: None,
        }),
    )
        .into_response()
}
