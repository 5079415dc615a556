//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "REST surface of the mock cloud control plane."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---

pub mod error;

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use mockcloud_common::VERSION;
use mockcloud_core::model::{
    CreateEnvironment, CreateSecurityGroup, CreateVm, CreateVolume, Environment, ListQuery, Page,
    SecurityGroup, Vm, Volume,
};
use mockcloud_core::{Accepted, JobRecord, ResourceService};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

pub use error::ApiError;

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Shared API state exposed to handlers.
#[derive(Debug, Clone)]
pub struct ApiState {
    service: Arc<ResourceService>,
}

impl ApiState {
    pub fn new(service: Arc<ResourceService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &ResourceService {
        &self.service
    }
}

/// Build the full router, `/api/v1` resources plus the root endpoints.
pub fn router(state: ApiState) -> Router {
    let v1 = Router::new()
        .route("/environments", post(create_environment).get(list_environments))
        .route(
            "/environments/:id",
            get(get_environment).delete(delete_environment),
        )
        .route(
            "/security-groups",
            post(create_security_group).get(list_security_groups),
        )
        .route(
            "/security-groups/:id",
            get(get_security_group).delete(delete_security_group),
        )
        .route("/vms", post(create_vm).get(list_vms))
        .route("/vms/:id", get(get_vm).delete(delete_vm))
        .route("/volumes", post(create_volume).get(list_volumes))
        .route("/volumes/:id", get(get_volume).delete(delete_volume))
        .route("/volumes/:id/attach/:vm_id", post(attach_volume))
        .route("/volumes/:id/detach", post(detach_volume))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/api/v1", v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handle to a running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// Bind `addr` and serve the REST API until [`ApiServer::shutdown`] is called.
pub fn spawn_api_server(state: ApiState, addr: SocketAddr) -> Result<ApiServer> {
    let app = router(state);

    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let addr = listener
        .local_addr()
        .context("failed to read API listener address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %addr, "api server listening");
        if let Err(err) = axum::serve(tcp_listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
        {
            error!(address = %addr, error = %err, "api server exited with error");
            return Err(err.into());
        }
        info!(address = %addr, "api server stopped");
        Ok(())
    });

    Ok(ApiServer {
        addr,
        shutdown: Some(shutdown_tx),
        task,
    })
}

fn parse_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::validation(format!("invalid id '{raw}'")))
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Mock Cloud API",
        "version": VERSION,
        "health": "/health",
    }))
}

/// Reports `degraded` once a store mutation failed to reach the journal.
async fn health(State(state): State<ApiState>) -> Json<Value> {
    match state.service.store().journal_failures() {
        0 => Json(json!({ "status": "healthy" })),
        failures => Json(json!({ "status": "degraded", "journal_failures": failures })),
    }
}

#[derive(Debug, Serialize)]
struct Deleted {
    message: String,
}

// Environments

#[derive(Debug, Serialize)]
struct EnvironmentList {
    environments: Vec<Environment>,
    total: usize,
}

async fn create_environment(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<CreateEnvironment>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Environment>)> {
    let Json(request) = payload?;
    let environment = state.service.create_environment(request)?;
    Ok((StatusCode::CREATED, Json(environment)))
}

async fn list_environments(
    State(state): State<ApiState>,
    query: std::result::Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<EnvironmentList>> {
    let Query(query) = query?;
    let Page { items, total } = state.service.list_environments(&query)?;
    Ok(Json(EnvironmentList {
        environments: items,
        total,
    }))
}

async fn get_environment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Environment>> {
    Ok(Json(state.service.get_environment(parse_id(&id)?)?))
}

async fn delete_environment(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Deleted>> {
    state.service.delete_environment(parse_id(&id)?)?;
    Ok(Json(Deleted {
        message: "Environment deleted successfully".into(),
    }))
}

// Security groups

#[derive(Debug, Serialize)]
struct SecurityGroupList {
    security_groups: Vec<SecurityGroup>,
    total: usize,
}

async fn create_security_group(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<CreateSecurityGroup>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SecurityGroup>)> {
    let Json(request) = payload?;
    let group = state.service.create_security_group(request)?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn list_security_groups(
    State(state): State<ApiState>,
    query: std::result::Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<SecurityGroupList>> {
    let Query(query) = query?;
    let Page { items, total } = state.service.list_security_groups(&query)?;
    Ok(Json(SecurityGroupList {
        security_groups: items,
        total,
    }))
}

async fn get_security_group(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SecurityGroup>> {
    Ok(Json(state.service.get_security_group(parse_id(&id)?)?))
}

async fn delete_security_group(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Deleted>> {
    state.service.delete_security_group(parse_id(&id)?)?;
    Ok(Json(Deleted {
        message: "Security group deleted successfully".into(),
    }))
}

// VMs

#[derive(Debug, Serialize)]
struct VmList {
    vms: Vec<Vm>,
    total: usize,
}

async fn create_vm(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<CreateVm>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Accepted<Vm>>)> {
    let Json(request) = payload?;
    let accepted = state.service.create_vm(request)?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn list_vms(
    State(state): State<ApiState>,
    query: std::result::Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<VmList>> {
    let Query(query) = query?;
    let Page { items, total } = state.service.list_vms(&query)?;
    Ok(Json(VmList { vms: items, total }))
}

async fn get_vm(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Json<Vm>> {
    Ok(Json(state.service.get_vm(parse_id(&id)?)?))
}

async fn delete_vm(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Accepted<Vm>>)> {
    let accepted = state.service.delete_vm(parse_id(&id)?)?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

// Volumes

#[derive(Debug, Serialize)]
struct VolumeList {
    volumes: Vec<Volume>,
    total: usize,
}

async fn create_volume(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<CreateVolume>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Accepted<Volume>>)> {
    let Json(request) = payload?;
    let accepted = state.service.create_volume(request)?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn list_volumes(
    State(state): State<ApiState>,
    query: std::result::Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<VolumeList>> {
    let Query(query) = query?;
    let Page { items, total } = state.service.list_volumes(&query)?;
    Ok(Json(VolumeList {
        volumes: items,
        total,
    }))
}

async fn get_volume(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Volume>> {
    Ok(Json(state.service.get_volume(parse_id(&id)?)?))
}

async fn delete_volume(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Accepted<Volume>>)> {
    let accepted = state.service.delete_volume(parse_id(&id)?)?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn attach_volume(
    State(state): State<ApiState>,
    Path((id, vm_id)): Path<(String, String)>,
) -> ApiResult<Json<Volume>> {
    let volume = state
        .service
        .attach_volume(parse_id(&id)?, parse_id(&vm_id)?)?;
    Ok(Json(volume))
}

async fn detach_volume(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Volume>> {
    Ok(Json(state.service.detach_volume(parse_id(&id)?)?))
}

// Jobs

#[derive(Debug, Default, Deserialize)]
struct JobQuery {
    #[serde(default)]
    resource_id: Option<Uuid>,
    #[serde(default)]
    skip: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct JobList {
    jobs: Vec<JobRecord>,
    total: usize,
}

async fn list_jobs(
    State(state): State<ApiState>,
    query: std::result::Result<Query<JobQuery>, QueryRejection>,
) -> ApiResult<Json<JobList>> {
    let Query(query) = query?;
    let paging = ListQuery {
        skip: query.skip,
        limit: query.limit,
        ..ListQuery::default()
    };
    let Page { items, total } = state.service.list_jobs(query.resource_id, &paging)?;
    Ok(Json(JobList { jobs: items, total }))
}

async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobRecord>> {
    Ok(Json(state.service.get_job(parse_id(&id)?)?))
}
