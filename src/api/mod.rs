//! Operator REST surface.
//!
//! Thin axum layer over the application value: handlers validate, call
//! into the registries and services, and map the internal error taxonomy
//! onto HTTP statuses. A request may fail; the process never does.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::app::App;
use crate::containers::ContainerBase;
use crate::discovery::{DiscoveryError, Feature, NodesGroup};
use crate::docker::{
    ClusterConfig, DockerError, GetContainersArg, Port, ResultCode, ServiceInfo,
};
use crate::jobs::{JobError, JobInfo, JobParameters};
use crate::nodes::{NodeHealth, NodeRecord};
use crate::source::{bind_single_cluster, DeployOptions, RootSource, SourceError};

/// Build the operator router.
pub fn create_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        // Clusters
        .route("/clusters", get(list_clusters))
        .route(
            "/clusters/{name}",
            put(create_cluster).delete(delete_cluster),
        )
        .route("/clusters/{name}/info", get(cluster_info))
        .route("/clusters/{name}/containers", get(list_cluster_containers))
        .route("/clusters/{name}/nodes", get(list_cluster_nodes))
        .route("/clusters/{name}/registries", get(cluster_registries))
        .route(
            "/clusters/{name}/nodes/{node}",
            post(attach_node).delete(detach_node),
        )
        .route(
            "/clusters/{name}/source",
            get(get_cluster_source).post(set_cluster_source),
        )
        // Root source
        .route("/source", get(get_root_source).post(set_root_source))
        // Nodes
        .route("/nodes", get(list_nodes))
        .route("/nodes/{name}", post(register_node).delete(remove_node))
        // Jobs
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/{id}", get(get_job).delete(cancel_job))
        .route("/jobs/{id}/log", get(job_log))
        .with_state(app)
}

// ============================================================================
// Error mapping
// ============================================================================

#[derive(Serialize)]
struct UiError {
    code: u16,
    message: String,
}

/// A request failure with its HTTP status.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(UiError {
                code: self.status.as_u16(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

fn to_status(code: ResultCode) -> StatusCode {
    match code {
        ResultCode::Ok => StatusCode::OK,
        ResultCode::NotFound => StatusCode::NOT_FOUND,
        ResultCode::NotModified => StatusCode::NOT_MODIFIED,
        ResultCode::Conflict => StatusCode::CONFLICT,
        ResultCode::Error => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<DiscoveryError> for ApiError {
    fn from(err: DiscoveryError) -> Self {
        let status = match &err {
            DiscoveryError::ClusterNotFound(_) => StatusCode::NOT_FOUND,
            DiscoveryError::NodeAdditionForbidden(_) => StatusCode::CONFLICT,
            DiscoveryError::Node(crate::nodes::NodeError::NotFound(_)) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let status = match &err {
            JobError::AlreadyRunning { .. } => StatusCode::CONFLICT,
            JobError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            JobError::UnknownType(_)
            | JobError::MissingParameter { .. }
            | JobError::InvalidParameter { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<SourceError> for ApiError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Empty | SourceError::TooManyClusters | SourceError::Decode(_) => {
                Self::new(StatusCode::BAD_REQUEST, err.to_string())
            }
            SourceError::Job(job) => job.into(),
        }
    }
}

impl From<DockerError> for ApiError {
    fn from(err: DockerError) -> Self {
        match &err {
            DockerError::Api { code, .. } => Self::new(to_status(*code), err.to_string()),
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}

// ============================================================================
// Health & version
// ============================================================================

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct UiApplicationInfo {
    version: &'static str,
}

async fn version() -> impl IntoResponse {
    Json(UiApplicationInfo {
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Clusters
// ============================================================================

#[derive(Serialize)]
struct UiCount {
    on: u32,
    off: u32,
}

#[derive(Serialize)]
struct UiCluster {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
    features: Vec<Feature>,
    containers: UiCount,
    nodes: UiCount,
}

async fn cluster_to_ui(group: &Arc<NodesGroup>) -> UiCluster {
    let config = group.config();
    // An unreachable cluster still lists; counters just stay at zero.
    let info = group.docker().get_info().await.unwrap_or_default();
    let mut features: Vec<Feature> = config.features.iter().copied().collect();
    features.sort_by_key(|f| format!("{f:?}"));
    UiCluster {
        name: config.name,
        title: config.title,
        description: config.description,
        filter: config.image_filter,
        features,
        containers: UiCount {
            on: info.containers,
            off: info.off_containers,
        },
        nodes: UiCount {
            on: info.node_count,
            off: info.off_node_count,
        },
    }
}

async fn list_clusters(State(app): State<Arc<App>>) -> impl IntoResponse {
    let mut out = Vec::new();
    for group in app.discovery.list() {
        out.push(cluster_to_ui(&group).await);
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Json(out)
}

#[derive(Deserialize, Default)]
struct UiClusterEditablePart {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    features: Option<Vec<Feature>>,
    #[serde(default)]
    config: Option<ClusterConfig>,
}

async fn create_cluster(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    body: Option<Json<UiClusterEditablePart>>,
) -> Result<StatusCode, ApiError> {
    let data = body.map(|Json(b)| b).unwrap_or_default();
    let group = app
        .discovery
        .get_or_create_cluster(&name, data.config.clone())
        .await?;
    if data.title.is_some()
        || data.description.is_some()
        || data.filter.is_some()
        || data.features.is_some()
    {
        group.update_config(|c| {
            if data.title.is_some() {
                c.title = data.title.clone();
            }
            if data.description.is_some() {
                c.description = data.description.clone();
            }
            if data.filter.is_some() {
                c.image_filter = data.filter.clone();
            }
            if let Some(features) = &data.features {
                c.features.extend(features.iter().copied());
            }
        });
    }
    group.flush().await;
    Ok(StatusCode::OK)
}

async fn delete_cluster(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    match app.discovery.delete_cluster(&name).await {
        Some(_) => Ok(StatusCode::OK),
        None => Err(ApiError::not_found(format!("Cluster '{name}' not found"))),
    }
}

async fn cluster_info(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> Result<Json<ServiceInfo>, ApiError> {
    let service = app
        .discovery
        .get_service(&name)
        .ok_or_else(|| ApiError::not_found(format!("Cluster '{name}' not found")))?;
    Ok(Json(service.get_info().await?))
}

async fn list_cluster_nodes(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    let group = app
        .discovery
        .get_cluster(&name)
        .ok_or_else(|| ApiError::not_found(format!("Cluster '{name}' not found")))?;
    Ok(Json(app.discovery.member_nodes(&group)))
}

async fn cluster_registries(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    let group = app
        .discovery
        .get_cluster(&name)
        .ok_or_else(|| ApiError::not_found(format!("Cluster '{name}' not found")))?;
    let allowed = group.config().config.registries;
    let available = app.registries.available_registries();
    let intersection = available
        .into_iter()
        .filter(|r| allowed.contains(r))
        .collect();
    Ok(Json(intersection))
}

// ============================================================================
// Containers
// ============================================================================

#[derive(Serialize)]
struct UiContainer {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<String>,
    image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    ports: String,
    labels: std::collections::HashMap<String, String>,
    run: bool,
    cluster: String,
}

/// Compact display form of a port list.
fn ports_to_string(ports: &[Port]) -> String {
    let mut out = String::new();
    for port in ports {
        if !out.is_empty() {
            out.push_str(", ");
        }
        out.push_str(&format!(
            "{} {}:{}",
            port.kind,
            port.ip.as_deref().unwrap_or(""),
            port.private_port
        ));
        if let Some(public) = port.public_port {
            out.push_str(&format!(" => {public}"));
        }
    }
    out
}

async fn list_cluster_containers(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<UiContainer>>, ApiError> {
    let service = app
        .discovery
        .get_service(&name)
        .ok_or_else(|| ApiError::not_found(format!("Cluster '{name}' not found")))?;
    let listing = service.get_containers(&GetContainersArg::new(true)).await?;
    let mut out: Vec<UiContainer> = listing
        .iter()
        .map(|row| {
            let base = ContainerBase::from_listing(row, service.node());
            let run = base.is_running();
            UiContainer {
                id: base.id,
                name: base.name,
                node: base.node,
                image: base.image,
                image_id: base.image_id,
                run,
                status: base.status,
                ports: ports_to_string(&base.ports),
                labels: base.labels,
                cluster: name.clone(),
            }
        })
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(out))
}

// ============================================================================
// Nodes
// ============================================================================

async fn list_nodes(State(app): State<Arc<App>>) -> Json<Vec<NodeRecord>> {
    let mut nodes = app.nodes.list();
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    Json(nodes)
}

#[derive(Deserialize)]
struct NodeRegistration {
    address: String,
    #[serde(default)]
    health: Option<NodeHealth>,
}

async fn register_node(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    Json(body): Json<NodeRegistration>,
) -> impl IntoResponse {
    let mut record = NodeRecord::new(name, body.address);
    if let Some(health) = body.health {
        record.health = health;
    }
    let merged = app.nodes.register(record).await;
    Json(merged)
}

async fn remove_node(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    match app.nodes.remove(&name).await {
        Some(_) => {
            app.containers.remove_node(&name).await;
            Ok(StatusCode::OK)
        }
        None => Err(ApiError::not_found(format!("Node '{name}' not found"))),
    }
}

async fn attach_node(
    State(app): State<Arc<App>>,
    Path((cluster, node)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    app.discovery.set_node_cluster(&node, Some(&cluster)).await?;
    Ok(StatusCode::OK)
}

/// Detach works through any cluster path, as long as the node exists.
async fn detach_node(
    State(app): State<Arc<App>>,
    Path((_cluster, node)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    app.discovery.set_node_cluster(&node, None).await?;
    Ok(StatusCode::OK)
}

// ============================================================================
// Source
// ============================================================================

async fn get_root_source(State(app): State<Arc<App>>) -> Json<RootSource> {
    Json(app.source.get_root_source().await)
}

async fn set_root_source(
    State(app): State<Arc<App>>,
    Json(root): Json<RootSource>,
) -> Result<Json<JobInfo>, ApiError> {
    let instance = app
        .source
        .set_root_source(&root, DeployOptions::default())?;
    Ok(Json(instance.info()))
}

async fn get_cluster_source(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
) -> Result<Json<RootSource>, ApiError> {
    app.source
        .get_cluster_source(&name)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Can not find cluster with name: {name}")))
}

async fn set_cluster_source(
    State(app): State<Arc<App>>,
    Path(name): Path<String>,
    Json(mut root): Json<RootSource>,
) -> Result<Json<JobInfo>, ApiError> {
    // The name in the path outranks the one in the document.
    bind_single_cluster(&mut root, &name)?;
    let instance = app
        .source
        .set_root_source(&root, DeployOptions::default())?;
    Ok(Json(instance.info()))
}

// ============================================================================
// Jobs
// ============================================================================

async fn list_jobs(State(app): State<Arc<App>>) -> Json<Vec<JobInfo>> {
    let mut jobs: Vec<JobInfo> = app.jobs.list().iter().map(|j| j.info()).collect();
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Json(jobs)
}

async fn create_job(
    State(app): State<Arc<App>>,
    Json(parameters): Json<JobParameters>,
) -> Result<(StatusCode, Json<JobInfo>), ApiError> {
    let instance = app.jobs.submit(parameters)?;
    Ok((StatusCode::CREATED, Json(instance.info())))
}

async fn get_job(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, ApiError> {
    app.jobs
        .get(&id)
        .map(|j| Json(j.info()))
        .ok_or_else(|| ApiError::not_found(format!("Job instance '{id}' not found")))
}

async fn job_log(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<String>>, ApiError> {
    app.jobs
        .get(&id)
        .map(|j| Json(j.progress_tail()))
        .ok_or_else(|| ApiError::not_found(format!("Job instance '{id}' not found")))
}

async fn cancel_job(
    State(app): State<Arc<App>>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, ApiError> {
    let instance = app.jobs.cancel(&id)?;
    Ok(Json(instance.info()))
}
