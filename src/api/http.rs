//! HTTP API Server
//!
//! REST API for role queries, manual role changes, balancing and cluster
//! management.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cluster::{ClusterSummary, ControllerNode, NodeStatus, Region};
use crate::config::ApiConfig;
use crate::coordinator::{BalanceReport, CoordinatorStats, MastershipCoordinator};
use crate::error::{Error, Result};
use crate::gateway::SyncState;
use crate::role::{DeviceId, MastershipRole, MastershipTerm, NodeId, RoleRecord};

/// Shared application state
pub struct AppState {
    pub coordinator: Arc<MastershipCoordinator>,
    pub started_at: Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, coordinator: Arc<MastershipCoordinator>) -> Self {
        let state = Arc::new(AppState {
            coordinator,
            started_at: Instant::now(),
        });
        Self { config, state }
    }

    /// Get the state for sharing with other components
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            // Status and info
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            // Roles
            .route("/roles", get(handle_roles))
            .route(
                "/roles/:device",
                get(handle_role_info).post(handle_set_role).delete(handle_purge),
            )
            .route("/roles/:device/relinquish", post(handle_relinquish))
            .route("/roles/:device/request", post(handle_request_role))
            .route("/nodes/:node_id/devices", get(handle_devices_of))
            .route("/balance", post(handle_balance))
            // Cluster view
            .route("/cluster/nodes", get(handle_nodes).post(handle_add_node))
            .route("/cluster/nodes/:node_id/heartbeat", post(handle_heartbeat))
            .route("/cluster/nodes/:node_id/status", post(handle_node_status))
            .route("/regions", get(handle_regions))
            // Device layer feedback
            .route("/gateway", get(handle_gateway_states))
            .route("/gateway/:device/confirm", post(handle_confirm))
            .route("/gateway/:device/reject", post(handle_reject))
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub uptime_seconds: u64,
    pub devices: usize,
    pub local_masters: usize,
    pub cluster: ClusterSummary,
    pub stats: CoordinatorStats,
}

/// One device in the role snapshot
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceRole {
    pub device: DeviceId,
    pub master: Option<NodeId>,
    pub standbys: Vec<NodeId>,
    pub term: MastershipTerm,
}

impl DeviceRole {
    fn new(device: DeviceId, record: RoleRecord) -> Self {
        Self {
            device,
            master: record.master,
            standbys: record.standbys,
            term: record.term,
        }
    }
}

/// Role info of one device
#[derive(Debug, Serialize)]
pub struct RoleInfoResponse {
    #[serde(flatten)]
    pub role: DeviceRole,
    pub local_role: MastershipRole,
    pub sync: Option<SyncState>,
}

/// Set role request
#[derive(Debug, Deserialize, Serialize)]
pub struct SetRoleRequest {
    pub node: String,
    /// MASTER, STANDBY or NONE
    pub role: String,
}

/// Relinquish response
#[derive(Debug, Serialize, Deserialize)]
pub struct RelinquishResponse {
    pub device: DeviceId,
    pub master: Option<NodeId>,
}

/// Request role response
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestRoleResponse {
    pub device: DeviceId,
    pub role: MastershipRole,
}

/// Devices mastered by a node
#[derive(Debug, Serialize, Deserialize)]
pub struct DevicesOfResponse {
    pub node_id: NodeId,
    pub devices: Vec<DeviceId>,
}

/// Add node request
#[derive(Debug, Deserialize, Serialize)]
pub struct AddNodeRequest {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub inactive: bool,
}

/// Node status request
#[derive(Debug, Deserialize, Serialize)]
pub struct NodeStatusRequest {
    pub status: NodeStatus,
}

/// Generic acknowledgement
#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    pub message: Option<String>,
}

/// Device confirmation
#[derive(Debug, Deserialize, Serialize)]
pub struct ConfirmRequest {
    pub role: String,
}

/// Device rejection
#[derive(Debug, Deserialize, Serialize)]
pub struct RejectRequest {
    pub reason: String,
}

/// Gateway state of one device
#[derive(Debug, Serialize)]
pub struct GatewayStateResponse {
    pub device: DeviceId,
    #[serde(flatten)]
    pub state: SyncState,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error wrapper mapping crate errors onto HTTP statuses
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

/// HTTP status and error code for an error
fn classify(err: &Error) -> (StatusCode, &'static str) {
    match err {
        Error::InvalidNode(_) => (StatusCode::BAD_REQUEST, "INVALID_NODE"),
        Error::Config(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        Error::UnknownRegion(_) => (StatusCode::NOT_FOUND, "UNKNOWN_REGION"),
        Error::UnknownRegionConfig { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_REGION_CONFIG")
        }
        Error::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE"),
        Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = classify(&self.0);
        if status.is_server_error() {
            tracing::error!("API request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: format!("{} not found", what),
            code: "NOT_FOUND".to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let coordinator = &state.coordinator;
    Json(HealthResponse {
        healthy: coordinator
            .membership()
            .is_active(coordinator.local_node_id())
            .await,
        node_id: coordinator.local_node_id().to_string(),
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> ApiResult<StatusResponse> {
    let coordinator = &state.coordinator;
    let snapshot = coordinator.snapshot().await?;
    let local = coordinator.local_node_id();

    Ok(Json(StatusResponse {
        node_id: local.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        devices: snapshot.len(),
        local_masters: snapshot.iter().filter(|(_, r)| r.is_master(local)).count(),
        cluster: coordinator.membership().summary().await,
        stats: coordinator.stats(),
    }))
}

async fn handle_roles(State(state): State<Arc<AppState>>) -> ApiResult<Vec<DeviceRole>> {
    let snapshot = state.coordinator.snapshot().await?;
    Ok(Json(
        snapshot
            .into_iter()
            .map(|(device, record)| DeviceRole::new(device, record))
            .collect(),
    ))
}

async fn handle_role_info(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
) -> std::result::Result<Response, ApiError> {
    let device = DeviceId::new(device);
    let coordinator = &state.coordinator;

    let record = match coordinator.get_role_info(&device).await? {
        Some(record) => record,
        None => return Ok(not_found(&format!("Device {}", device))),
    };

    Ok(Json(RoleInfoResponse {
        local_role: record.role_of(coordinator.local_node_id()),
        sync: coordinator.gateway().state(&device).await,
        role: DeviceRole::new(device, record),
    })
    .into_response())
}

async fn handle_set_role(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Json(req): Json<SetRoleRequest>,
) -> ApiResult<DeviceRole> {
    let device = DeviceId::new(device);
    let role: MastershipRole = req.role.parse()?;
    let coordinator = &state.coordinator;

    coordinator
        .set_role(&NodeId::new(req.node), &device, role)
        .await?;
    let record = coordinator.get_role_info(&device).await?.unwrap_or_default();
    Ok(Json(DeviceRole::new(device, record)))
}

async fn handle_purge(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
) -> std::result::Result<Response, ApiError> {
    let device = DeviceId::new(device);
    match state.coordinator.purge(&device).await? {
        Some(record) => Ok(Json(DeviceRole::new(device, record)).into_response()),
        None => Ok(not_found(&format!("Device {}", device))),
    }
}

async fn handle_relinquish(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
) -> ApiResult<RelinquishResponse> {
    let device = DeviceId::new(device);
    let master = state.coordinator.relinquish_mastership(&device).await?;
    Ok(Json(RelinquishResponse { device, master }))
}

async fn handle_request_role(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
) -> ApiResult<RequestRoleResponse> {
    let device = DeviceId::new(device);
    let role = state.coordinator.request_role_for(&device).await?;
    Ok(Json(RequestRoleResponse { device, role }))
}

async fn handle_devices_of(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> ApiResult<DevicesOfResponse> {
    let node_id = NodeId::new(node_id);
    let devices = state.coordinator.get_devices_of(&node_id).await?;
    Ok(Json(DevicesOfResponse {
        node_id,
        devices: devices.into_iter().collect(),
    }))
}

async fn handle_balance(State(state): State<Arc<AppState>>) -> ApiResult<BalanceReport> {
    Ok(Json(state.coordinator.balance_roles().await?))
}

async fn handle_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<ControllerNode>> {
    Json(state.coordinator.membership().all_nodes().await)
}

async fn handle_add_node(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddNodeRequest>,
) -> std::result::Result<Response, ApiError> {
    if req.id.is_empty() {
        return Err(Error::InvalidNode("node id cannot be empty".into()).into());
    }
    let status = if req.inactive {
        NodeStatus::Inactive
    } else {
        NodeStatus::Active
    };
    let added = state
        .coordinator
        .membership()
        .add_node(NodeId::new(req.id.as_str()), req.address, status)
        .await;

    let (code, message) = if added {
        (StatusCode::CREATED, format!("Node {} added", req.id))
    } else {
        (StatusCode::OK, format!("Node {} already known", req.id))
    };
    Ok((
        code,
        Json(AckResponse {
            success: true,
            message: Some(message),
        }),
    )
        .into_response())
}

async fn handle_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
) -> ApiResult<AckResponse> {
    state
        .coordinator
        .membership()
        .record_heartbeat(&NodeId::new(node_id))
        .await?;
    Ok(Json(AckResponse {
        success: true,
        message: None,
    }))
}

async fn handle_node_status(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    Json(req): Json<NodeStatusRequest>,
) -> ApiResult<AckResponse> {
    let changed = state
        .coordinator
        .membership()
        .set_status(&NodeId::new(node_id.as_str()), req.status)
        .await?;
    Ok(Json(AckResponse {
        success: true,
        message: Some(if changed {
            format!("Node {} is now {}", node_id, req.status)
        } else {
            format!("Node {} already {}", node_id, req.status)
        }),
    }))
}

async fn handle_regions(State(state): State<Arc<AppState>>) -> Json<Vec<Region>> {
    Json(state.coordinator.regions().regions().await)
}

async fn handle_gateway_states(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<GatewayStateResponse>> {
    let states = state.coordinator.gateway().states().await;
    Json(
        states
            .into_iter()
            .map(|(device, state)| GatewayStateResponse { device, state })
            .collect(),
    )
}

async fn handle_confirm(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Json(req): Json<ConfirmRequest>,
) -> ApiResult<AckResponse> {
    let role: MastershipRole = req.role.parse()?;
    state
        .coordinator
        .gateway()
        .confirm_role(&DeviceId::new(device), role)
        .await;
    Ok(Json(AckResponse {
        success: true,
        message: None,
    }))
}

async fn handle_reject(
    State(state): State<Arc<AppState>>,
    Path(device): Path<String>,
    Json(req): Json<RejectRequest>,
) -> ApiResult<AckResponse> {
    state
        .coordinator
        .gateway()
        .reject_role(&DeviceId::new(device), &req.reason)
        .await;
    Ok(Json(AckResponse {
        success: true,
        message: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MembershipView, RegionIndex};
    use crate::coordinator::CoordinatorConfig;
    use crate::store::MemoryRoleStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn server() -> HttpServer {
        let membership = Arc::new(MembershipView::new(
            NodeId::new("node-1"),
            "127.0.0.1:8180".into(),
            Duration::from_secs(30),
        ));
        membership
            .add_node(NodeId::new("node-2"), "127.0.0.1:8181".into(), NodeStatus::Active)
            .await;
        let coordinator = Arc::new(MastershipCoordinator::new(
            Arc::new(MemoryRoleStore::new()),
            membership,
            Arc::new(RegionIndex::new()),
            CoordinatorConfig::default(),
        ));
        HttpServer::new(ApiConfig::default(), coordinator)
    }

    async fn call(
        server: &HttpServer,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = server.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            classify(&Error::InvalidNode("x".into())).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            classify(&Error::StoreUnavailable("down".into())).0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            classify(&Error::UnknownRegionConfig {
                region: "west".into(),
                reason: "no tiers".into()
            })
            .0,
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(classify(&Error::UnknownRegion("x".into())).0, StatusCode::NOT_FOUND);
        assert_eq!(
            classify(&Error::Internal("x".into())).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_set_and_read_role() {
        let server = server().await;

        let (status, body) = call(
            &server,
            "POST",
            "/roles/of:0001",
            Some(serde_json::json!({ "node": "node-2", "role": "master" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["master"], "node-2");
        assert_eq!(body["term"], 1);

        let (status, body) = call(&server, "GET", "/roles/of:0001", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["local_role"], "NONE");

        let (status, body) = call(&server, "GET", "/roles", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, body) = call(&server, "GET", "/nodes/node-2/devices", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["devices"][0], "of:0001");
    }

    #[tokio::test]
    async fn test_bad_requests_map_to_status_codes() {
        let server = server().await;

        let (status, body) = call(
            &server,
            "POST",
            "/roles/of:0001",
            Some(serde_json::json!({ "node": "ghost", "role": "MASTER" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_NODE");

        let (status, _) = call(
            &server,
            "POST",
            "/roles/of:0001",
            Some(serde_json::json!({ "node": "node-1", "role": "boss" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&server, "GET", "/roles/of:9999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&server, "DELETE", "/roles/of:9999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_request_relinquish_and_balance() {
        let server = server().await;

        let (status, body) = call(&server, "POST", "/roles/of:0001/request", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["role"], "MASTER");

        let (_, body) = call(&server, "POST", "/roles/of:0001/relinquish", None).await;
        assert_eq!(body["master"], serde_json::Value::Null);

        // The masterless device is picked up again by the balancer
        let (status, body) = call(&server, "POST", "/balance", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mutations"], 1);

        let (_, body) = call(&server, "GET", "/roles/of:0001", None).await;
        assert_eq!(body["master"], "node-1");
    }

    #[tokio::test]
    async fn test_cluster_feed() {
        let server = server().await;

        let (status, _) = call(
            &server,
            "POST",
            "/cluster/nodes",
            Some(serde_json::json!({ "id": "node-3", "address": "127.0.0.1:8182" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = call(
            &server,
            "POST",
            "/cluster/nodes/node-3/status",
            Some(serde_json::json!({ "status": "INACTIVE" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!server
            .state()
            .coordinator
            .membership()
            .is_active(&NodeId::new("node-3"))
            .await);

        let (status, _) = call(&server, "POST", "/cluster/nodes/node-3/heartbeat", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&server, "POST", "/cluster/nodes/ghost/heartbeat", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&server, "GET", "/cluster/nodes", None).await;
        assert_eq!(body.as_array().unwrap().len(), 3);

        let (_, body) = call(&server, "GET", "/health", None).await;
        assert_eq!(body["healthy"], true);
    }
}
