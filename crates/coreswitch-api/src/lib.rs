//! coreswitch API - HTTP transport of the control surface
//!
//! Every route translates one request into one [`ControlSurface`] call and the
//! result back into JSON. Errors carry their kind so clients can branch on it.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use coreswitch_core::{ApiSettings, ControlSurface, Error, PingResult, StartCoreRequest};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiSettings::default().into()
    }
}

impl From<ApiSettings> for ApiConfig {
    fn from(settings: ApiSettings) -> Self {
        Self {
            bind_address: settings.bind_address,
            bind_port: settings.bind_port,
            enable_cors: settings.enable_cors,
        }
    }
}

#[derive(Clone)]
pub struct ApiState {
    surface: Arc<ControlSurface>,
    /// Parent of the per-request tokens; cancelled on shutdown
    shutdown: CancellationToken,
}

pub struct ApiServer {
    config: ApiConfig,
    state: ApiState,
}

impl ApiServer {
    pub fn new(surface: Arc<ControlSurface>, config: ApiConfig) -> Self {
        Self {
            config,
            state: ApiState {
                surface,
                shutdown: CancellationToken::new(),
            },
        }
    }

    pub fn router(&self) -> Router {
        let app = Router::new()
            .route("/", get(|| async { "coreswitch API" }))
            .route("/api/v1/core/start", post(start_core))
            .route("/api/v1/core/stop", post(stop_core))
            .route("/api/v1/core/running", get(is_core_running))
            .route("/api/v1/version", get(get_version))
            .route("/api/v1/ping", post(measure_ping))
            .route("/api/v1/logs", get(fetch_logs).delete(clear_logs))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            app.layer(CorsLayer::permissive())
        } else {
            app
        }
    }

    /// Serve until `shutdown` is cancelled; in-flight control calls are cancelled with it
    pub async fn run_with_shutdown(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.bind_port);
        let socket_addr: SocketAddr = addr.parse()?;
        let app = self.router();

        info!("API server listening on {}", socket_addr);

        let requests = self.state.shutdown.clone();
        axum::Server::try_bind(&socket_addr)?
            .serve(app.into_make_service())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                requests.cancel();
            })
            .await?;

        info!("API server stopped");
        Ok(())
    }
}

/// Error response: `{"error": kind, "message": text}`
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::AlreadyRunning | Error::AlreadyStarted | Error::NotRunning => StatusCode::CONFLICT,
        Error::ConfigInvalid(_) | Error::MissingField(_) | Error::KeyDerivation(_) | Error::UnsupportedNetwork(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::Cancelled => StatusCode::GATEWAY_TIMEOUT,
        Error::NetworkFailure(_) | Error::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
        Error::Io(_) | Error::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
        };
        (status_for(&self.0), Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct Success {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Running {
    pub running: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Version {
    pub version: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PingRequest {
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Logs {
    pub logs: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Cleared {
    pub cleared: bool,
}

async fn start_core(State(state): State<ApiState>, Json(request): Json<StartCoreRequest>) -> ApiResult<Success> {
    state
        .surface
        .start_core(&request, &state.shutdown.child_token())
        .await?;
    Ok(Json(Success { success: true }))
}

async fn stop_core(State(state): State<ApiState>) -> ApiResult<Success> {
    state.surface.stop_core().await?;
    Ok(Json(Success { success: true }))
}

async fn is_core_running(State(state): State<ApiState>) -> ApiResult<Running> {
    let running = state.surface.is_core_running().await?;
    Ok(Json(Running { running }))
}

async fn get_version(State(state): State<ApiState>) -> ApiResult<Version> {
    let version = state.surface.get_version()?;
    Ok(Json(Version { version }))
}

async fn measure_ping(State(state): State<ApiState>, Json(request): Json<PingRequest>) -> ApiResult<Vec<PingResult>> {
    let results = state
        .surface
        .measure_ping(&request.urls, &state.shutdown.child_token())
        .await?;
    Ok(Json(results))
}

async fn fetch_logs(State(state): State<ApiState>) -> ApiResult<Logs> {
    let logs = state.surface.fetch_logs()?;
    Ok(Json(Logs { logs }))
}

async fn clear_logs(State(state): State<ApiState>) -> ApiResult<Cleared> {
    let cleared = state.surface.clear_logs()?;
    Ok(Json(Cleared { cleared }))
}
