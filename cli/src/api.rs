// Control API for a running treadlink service
//
// `treadlink serve` exposes a local HTTP API (default 127.0.0.1:5678). Every
// route that needs the treadmill asks the supervisor for a connection first;
// other CLI commands are thin clients of this API.

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use treadlink_core::{
    ClientHandle, ConnectionSupervisor, PadMode, PadStatus, PeripheralError, SupervisorError,
    SupervisorStats, WorkoutSummary,
};

use crate::config::Config;
use crate::workouts::{WorkoutRecord, WorkoutStore};

pub const DEFAULT_API_ADDR: &str = "127.0.0.1:5678";

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub dist: f64,
    pub time: u32,
    pub steps: u32,
    pub speed: f64,
    pub belt_state: String,
    pub mode: Option<String>,
}

impl From<&PadStatus> for StatusResponse {
    fn from(status: &PadStatus) -> Self {
        Self {
            dist: status.distance_km,
            time: status.time_secs,
            steps: status.steps,
            speed: status.speed_kmh,
            belt_state: status.belt_state.label(),
            mode: status.mode.map(|m| m.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WalkResponse {
    pub steps: u32,
    pub distance: f64,
    pub time: u32,
}

impl From<&WorkoutSummary> for WalkResponse {
    fn from(summary: &WorkoutSummary) -> Self {
        Self {
            steps: summary.steps,
            distance: summary.distance_km,
            time: summary.duration_secs,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub address: String,
    pub state: String,
    pub connected_for_secs: Option<u64>,
    pub monitoring: bool,
    pub last_health: Option<String>,
    pub last_reset_reason: Option<String>,
    pub stats: ConnectionStats,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub scans: u64,
    pub connect_attempts: u64,
    pub successful_connects: u64,
    pub forced_resets: u64,
    pub health_checks: u64,
    pub monitor_restarts: u64,
}

impl From<SupervisorStats> for ConnectionStats {
    fn from(stats: SupervisorStats) -> Self {
        Self {
            scans: stats.scans,
            connect_attempts: stats.connect_attempts,
            successful_connects: stats.successful_connects,
            forced_resets: stats.forced_resets,
            health_checks: stats.health_checks,
            monitor_restarts: stats.monitor_restarts,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// Client functions for CLI commands

async fn call(base: &str, method: Method, path_and_query: &str) -> Result<Vec<u8>> {
    let client = hyper::Client::new();
    let req = Request::builder()
        .method(method)
        .uri(format!("http://{}{}", base, path_and_query))
        .body(Body::empty())?;

    let resp = client
        .request(req)
        .await
        .with_context(|| format!("Is `treadlink serve` running on {}?", base))?;

    let status = resp.status();
    let body_bytes = hyper::body::to_bytes(resp.into_body()).await?;

    if !status.is_success() {
        let message = serde_json::from_slice::<ErrorResponse>(&body_bytes)
            .map(|e| e.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body_bytes).into_owned());
        anyhow::bail!("API request failed with status {}: {}", status, message);
    }

    Ok(body_bytes.to_vec())
}

pub async fn get_status_via_api(base: &str) -> Result<StatusResponse> {
    let body = call(base, Method::GET, "/status").await?;
    serde_json::from_slice(&body).context("Failed to parse status response")
}

pub async fn start_walk_via_api(base: &str) -> Result<WalkResponse> {
    let body = call(base, Method::POST, "/startwalk").await?;
    serde_json::from_slice(&body).context("Failed to parse walk response")
}

pub async fn finish_walk_via_api(base: &str) -> Result<WalkResponse> {
    let body = call(base, Method::POST, "/finishwalk").await?;
    serde_json::from_slice(&body).context("Failed to parse walk response")
}

pub async fn get_mode_via_api(base: &str) -> Result<String> {
    let body = call(base, Method::GET, "/mode").await?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

pub async fn set_mode_via_api(base: &str, mode: PadMode) -> Result<String> {
    let body = call(base, Method::POST, &format!("/mode?new_mode={}", mode)).await?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

pub async fn get_connection_via_api(base: &str) -> Result<ConnectionResponse> {
    let body = call(base, Method::GET, "/connection").await?;
    serde_json::from_slice(&body).context("Failed to parse connection response")
}

// Server implementation

pub struct ApiContext {
    pub supervisor: Arc<ConnectionSupervisor>,
    pub workouts: Arc<WorkoutStore>,
    /// Config file that `POST /config/address` rewrites
    pub config_path: PathBuf,
    /// Budget for obtaining a connection per request
    pub request_timeout: Duration,
    /// Bound on each individual treadmill command
    pub command_timeout: Duration,
    /// Last walk figures the treadmill reported
    pub last_walk: Mutex<Option<WorkoutSummary>>,
}

enum RouteError {
    Unavailable(SupervisorError),
    Command(PeripheralError),
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<SupervisorError> for RouteError {
    fn from(err: SupervisorError) -> Self {
        RouteError::Unavailable(err)
    }
}

impl From<PeripheralError> for RouteError {
    fn from(err: PeripheralError) -> Self {
        RouteError::Command(err)
    }
}

impl From<anyhow::Error> for RouteError {
    fn from(err: anyhow::Error) -> Self {
        RouteError::Internal(err)
    }
}

impl RouteError {
    fn into_response(self) -> Response<Body> {
        let (status, message) = match self {
            RouteError::Unavailable(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            RouteError::Command(e) => (StatusCode::BAD_GATEWAY, e.to_string()),
            RouteError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            RouteError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            RouteError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)),
        };
        tracing::warn!("Request failed ({}): {}", status, message);
        json_response(status, &ErrorResponse { error: message })
    }
}

type RouteResult = std::result::Result<Response<Body>, RouteError>;

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_string(value) {
        Ok(json) => {
            let mut response = Response::new(Body::from(json));
            *response.status_mut() = status;
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode response: {}", e),
        ),
    }
}

fn text_response(status: StatusCode, text: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(Body::from(text.into()));
    *response.status_mut() = status;
    response
}

/// Value of `key` in the query string, decoded
fn query_param(req: &Request<Body>, key: &str) -> Option<String> {
    form_urlencoded::parse(req.uri().query()?.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

impl ApiContext {
    async fn client(&self) -> std::result::Result<ClientHandle, SupervisorError> {
        self.supervisor.get_connection(self.request_timeout).await
    }

    /// Run one treadmill command under the per-command bound
    async fn bounded<T>(
        &self,
        command: impl Future<Output = std::result::Result<T, PeripheralError>>,
    ) -> std::result::Result<T, PeripheralError> {
        tokio::time::timeout(self.command_timeout, command)
            .await
            .map_err(|_| PeripheralError::CommandTimeout(self.command_timeout))?
    }

    fn remember(&self, summary: WorkoutSummary) {
        *self.last_walk.lock() = Some(summary);
    }

    fn store(&self, summary: &WorkoutSummary) -> Result<()> {
        let record = WorkoutRecord::from_summary(summary);
        self.workouts.add(&record)?;
        tracing::info!(
            "Saved walk: {} steps, {:.2} km, {} min",
            record.steps,
            record.distance_km,
            record.duration_minutes
        );
        Ok(())
    }
}

async fn handle_request(
    req: Request<Body>,
    ctx: Arc<ApiContext>,
) -> std::result::Result<Response<Body>, Infallible> {
    tracing::debug!("{} {}", req.method(), req.uri());

    let result = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({ "status": "healthy" }),
        )),
        (&Method::GET, "/connection") => handle_connection(&ctx),
        (&Method::GET, "/config/address") => handle_get_address(&ctx),
        (&Method::POST, "/config/address") => {
            handle_set_address(query_param(&req, "address"), &ctx)
        }
        (&Method::GET, "/mode") => handle_get_mode(&ctx).await,
        (&Method::POST, "/mode") => {
            handle_set_mode(query_param(&req, "new_mode"), &ctx).await
        }
        (&Method::GET, "/status") => handle_status(&ctx).await,
        (&Method::GET, "/history") => handle_history(&ctx).await,
        (&Method::POST, "/save") => handle_save(&ctx),
        (&Method::POST, "/startwalk") => handle_start_walk(&ctx).await,
        (&Method::POST, "/finishwalk") => handle_finish_walk(&ctx).await,
        (&Method::POST, "/save_and_stop") => handle_save_and_stop(&ctx).await,
        _ => Err(RouteError::NotFound("Not found".to_string())),
    };

    Ok(result.unwrap_or_else(RouteError::into_response))
}

fn handle_connection(ctx: &ApiContext) -> RouteResult {
    let supervisor = &ctx.supervisor;
    let response = ConnectionResponse {
        address: supervisor.address().to_string(),
        state: supervisor.state().to_string(),
        connected_for_secs: supervisor.connected_since().map(|t| t.elapsed().as_secs()),
        monitoring: supervisor.is_monitoring(),
        last_health: supervisor
            .last_health()
            .map(|(_, result)| format!("{:?}", result.reason)),
        last_reset_reason: supervisor.last_reset_reason(),
        stats: supervisor.stats().into(),
    };
    Ok(json_response(StatusCode::OK, &response))
}

fn handle_get_address(ctx: &ApiContext) -> RouteResult {
    let config = Config::load_from(&ctx.config_path)?;
    Ok(text_response(StatusCode::OK, config.address))
}

fn handle_set_address(address: Option<String>, ctx: &ApiContext) -> RouteResult {
    let address = address
        .ok_or_else(|| RouteError::BadRequest("Missing address parameter".to_string()))?;

    let mut config = Config::load_from(&ctx.config_path)?;
    config
        .set_and_save("address", &address, &ctx.config_path)
        .map_err(|e| RouteError::BadRequest(format!("{:#}", e)))?;

    tracing::info!(
        "Treadmill address set to {}; takes effect on restart",
        config.address
    );
    handle_get_address(ctx)
}

async fn handle_get_mode(ctx: &ApiContext) -> RouteResult {
    let client = ctx.client().await?;
    let status = ctx.bounded(client.probe()).await?;

    match status.mode {
        Some(mode) => Ok(text_response(StatusCode::OK, mode.as_str())),
        None => Err(RouteError::BadRequest("Mode not supported".to_string())),
    }
}

async fn handle_set_mode(requested: Option<String>, ctx: &ApiContext) -> RouteResult {
    let requested = requested.unwrap_or_default();
    let mode = requested
        .parse::<PadMode>()
        .map_err(|e| RouteError::BadRequest(e.to_string()))?;

    let client = ctx.client().await?;
    ctx.bounded(client.switch_mode(mode)).await?;

    tracing::info!("Switched treadmill to {} mode", mode);
    Ok(text_response(StatusCode::OK, mode.as_str()))
}

async fn handle_status(ctx: &ApiContext) -> RouteResult {
    let client = ctx.client().await?;
    let status = ctx.bounded(client.probe()).await?;
    Ok(json_response(StatusCode::OK, &StatusResponse::from(&status)))
}

async fn handle_history(ctx: &ApiContext) -> RouteResult {
    let client = ctx.client().await?;
    let summary = ctx.bounded(client.request_history()).await?.workout();
    ctx.remember(summary);
    Ok(json_response(StatusCode::OK, &WalkResponse::from(&summary)))
}

fn handle_save(ctx: &ApiContext) -> RouteResult {
    let summary = (*ctx.last_walk.lock())
        .ok_or_else(|| RouteError::NotFound("No walk recorded yet".to_string()))?;
    ctx.store(&summary)?;
    Ok(json_response(StatusCode::OK, &WalkResponse::from(&summary)))
}

async fn handle_start_walk(ctx: &ApiContext) -> RouteResult {
    let client = ctx.client().await?;

    // Starting the belt toggles it, so go through standby first
    ctx.bounded(client.switch_mode(PadMode::Standby)).await?;
    ctx.bounded(client.switch_mode(PadMode::Manual)).await?;
    ctx.bounded(client.start_belt()).await?;
    let summary = ctx.bounded(client.request_history()).await?.workout();

    ctx.remember(summary);
    tracing::info!("Walk started");
    Ok(json_response(StatusCode::OK, &WalkResponse::from(&summary)))
}

async fn handle_finish_walk(ctx: &ApiContext) -> RouteResult {
    let client = ctx.client().await?;

    ctx.bounded(client.switch_mode(PadMode::Standby)).await?;
    let summary = ctx.bounded(client.request_history()).await?.workout();

    ctx.remember(summary);
    ctx.store(&summary)?;
    Ok(json_response(StatusCode::OK, &WalkResponse::from(&summary)))
}

async fn handle_save_and_stop(ctx: &ApiContext) -> RouteResult {
    let client = ctx.client().await?;

    let summary = ctx.bounded(client.probe()).await?.workout();
    ctx.store(&summary)?;
    ctx.bounded(client.switch_mode(PadMode::Standby)).await?;

    ctx.remember(summary);
    Ok(json_response(StatusCode::OK, &WalkResponse::from(&summary)))
}

/// Serve the control API until `shutdown` resolves
pub async fn start_api_server(
    ctx: ApiContext,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let ctx = Arc::new(ctx);

    let make_svc = make_service_fn(move |_conn| {
        let ctx = ctx.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle_request(req, ctx.clone()))) }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("Failed to bind control API on {}", addr))?
        .serve(make_svc)
        .with_graceful_shutdown(shutdown);

    tracing::info!("Control API listening on {}", addr);

    server.await.context("API server error")?;

    Ok(())
}
