//! REST API route handlers for the daemon HTTP server
//!
//! Lifecycle operations on one profile are serialised through a per-profile
//! lock. A start holds that lock until its liveness check has resolved.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::DaemonState;
use crate::context::ManagerContext;
use crate::error::{ManagerError, ProcessError, StorageError};
use crate::profile::{self, Profile};
use crate::runtime;
use crate::supervisor::{ProcessInfo, ProcessStatus};
use crate::tail::LogTail;

// Error codes carried in API error bodies
pub const PROFILE_NOT_FOUND: i32 = -1;
pub const ALREADY_RUNNING: i32 = -2;
pub const INVALID_PROFILE: i32 = -3;
pub const BINARY_MISSING: i32 = -4;
pub const LAUNCH_FAILED: i32 = -5;
pub const STOP_FAILED: i32 = -6;
pub const PROFILE_RUNNING: i32 = -7;
pub const STORAGE_FAILED: i32 = -8;
pub const INTERNAL_ERROR: i32 = -32603;

/// Shared application state for route handlers
#[derive(Clone)]
pub struct AppState {
    pub ctx: ManagerContext,
    pub daemon_state: Arc<Mutex<DaemonState>>,
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub code: i32,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.code {
            PROFILE_NOT_FOUND => StatusCode::NOT_FOUND,
            ALREADY_RUNNING | PROFILE_RUNNING => StatusCode::CONFLICT,
            INVALID_PROFILE => StatusCode::BAD_REQUEST,
            BINARY_MISSING => StatusCode::PRECONDITION_FAILED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        let code = match &err {
            ManagerError::Validation(_) => INVALID_PROFILE,
            ManagerError::Storage(StorageError::NotFound { .. }) => PROFILE_NOT_FOUND,
            ManagerError::Storage(_) => STORAGE_FAILED,
            ManagerError::Process(ProcessError::AlreadyRunning { .. }) => ALREADY_RUNNING,
            ManagerError::Process(
                ProcessError::BinaryNotInstalled { .. } | ProcessError::VersionNotFound { .. },
            ) => BINARY_MISSING,
            ManagerError::Process(ProcessError::KillFailed { .. }) => STOP_FAILED,
            ManagerError::Process(_) => LAUNCH_FAILED,
            _ => INTERNAL_ERROR,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

/// Build the API router with all routes
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/profiles",
            get(handle_list_profiles).post(handle_save_profile),
        )
        .route(
            "/api/v1/profiles/:name",
            get(handle_get_profile).delete(handle_delete_profile),
        )
        .route("/api/v1/profiles/:name/start", post(handle_start))
        .route("/api/v1/profiles/:name/stop", post(handle_stop))
        .route("/api/v1/profiles/:name/status", get(handle_status))
        .route("/api/v1/profiles/:name/logs", get(handle_logs_sse))
        .route("/api/v1/profiles/:name/logs/buffer", get(handle_logs_buffer))
        .route("/api/v1/versions", get(handle_versions))
        .route("/api/v1/token", post(handle_generate_token))
        .route("/api/v1/events", get(handle_events_sse))
        .with_state(state)
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// A profile as shown to API clients; the token is masked
#[derive(Debug, Serialize, Deserialize)]
pub struct ProfileView {
    pub name: String,
    pub token: String,
    pub ip: String,
    pub api: bool,
    pub api_address: String,
    pub interface: String,
    pub runtime_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    pub status: ProcessStatus,
}

impl ProfileView {
    fn new(profile: &Profile, status: ProcessStatus) -> Self {
        Self {
            name: profile.name.clone(),
            token: profile.masked_token(),
            ip: profile.ip.clone(),
            api: profile.api,
            api_address: profile.api_address.clone(),
            interface: profile.interface.clone(),
            runtime_version: profile.runtime_version.clone(),
            api_url: profile.api_url(),
            status,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    pub starting: bool,
    pub pid: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopResponse {
    pub stopped: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogBufferResponse {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed: Option<PathBuf>,
    pub versions: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

// ============================================================================
// Profile Handlers
// ============================================================================

/// GET /api/v1/profiles
pub async fn handle_list_profiles(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProfileView>>, ApiError> {
    let profiles = state.ctx.store().list()?;

    let mut views = Vec::with_capacity(profiles.len());
    for profile in &profiles {
        let info = effective_status(&state, profile).await?;
        views.push(ProfileView::new(profile, info.status));
    }
    Ok(Json(views))
}

/// POST /api/v1/profiles
pub async fn handle_save_profile(
    State(state): State<AppState>,
    Json(profile): Json<Profile>,
) -> Result<Json<ProfileView>, ApiError> {
    let saved = state.ctx.store().save(&profile)?;
    tracing::info!("Saved profile '{}' via API", saved.name);

    let info = effective_status(&state, &saved).await?;
    Ok(Json(ProfileView::new(&saved, info.status)))
}

/// GET /api/v1/profiles/:name
pub async fn handle_get_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProfileView>, ApiError> {
    let profile = state.ctx.store().load(&name)?;
    let info = effective_status(&state, &profile).await?;
    Ok(Json(ProfileView::new(&profile, info.status)))
}

/// DELETE /api/v1/profiles/:name
///
/// Refused while the profile's process is alive.
pub async fn handle_delete_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    profile::validate_name(&name).map_err(ManagerError::from)?;

    let lock = state.daemon_state.lock().await.profile_lock(&name);
    let _guard = lock.lock().await;

    let target = Profile {
        name: name.clone(),
        ..Default::default()
    };
    if state.ctx.supervisor().is_alive(&target) {
        return Err(ApiError {
            code: PROFILE_RUNNING,
            message: format!("Profile '{}' is running; stop it first", name),
        });
    }

    state.ctx.store().delete(&name)?;
    state.daemon_state.lock().await.close_log_display(&name);
    tracing::info!("Deleted profile '{}' via API", name);
    Ok(Json(DeleteResponse { deleted: true }))
}

// ============================================================================
// Process Handlers
// ============================================================================

/// POST /api/v1/profiles/:name/start
///
/// Answers once the process is spawned. The outcome of the liveness check
/// arrives on `/api/v1/events`.
pub async fn handle_start(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<StartResponse>, ApiError> {
    let profile = state.ctx.store().load(&name)?;

    let lock = state.daemon_state.lock().await.profile_lock(&name);
    let guard = lock.lock_owned().await;

    let pending = state.ctx.supervisor().start(&profile).await?;
    let pid = pending.pid();
    {
        let mut daemon_state = state.daemon_state.lock().await;
        daemon_state.close_log_display(&name);
        daemon_state.set_transition(&name, ProcessStatus::Starting);
    }

    let daemon_state = state.daemon_state.clone();
    tokio::spawn(async move {
        let _guard = guard;
        let outcome = pending.outcome().await;
        tracing::debug!("Start check for '{}' finished: {:?}", name, outcome);
        daemon_state.lock().await.clear_transition(&name);
    });

    Ok(Json(StartResponse {
        starting: true,
        pid,
    }))
}

/// POST /api/v1/profiles/:name/stop
pub async fn handle_stop(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<StopResponse>, ApiError> {
    let profile = state.ctx.store().load(&name)?;

    let lock = state.daemon_state.lock().await.profile_lock(&name);
    let _guard = lock.lock().await;

    state
        .daemon_state
        .lock()
        .await
        .set_transition(&name, ProcessStatus::Stopping);
    let result = state.ctx.supervisor().stop(&profile).await;
    {
        let mut daemon_state = state.daemon_state.lock().await;
        daemon_state.clear_transition(&name);
        daemon_state.close_log_display(&name);
    }

    result?;
    Ok(Json(StopResponse { stopped: true }))
}

/// GET /api/v1/profiles/:name/status
pub async fn handle_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProcessInfo>, ApiError> {
    let profile = state.ctx.store().load(&name)?;
    Ok(Json(effective_status(&state, &profile).await?))
}

/// GET /api/v1/profiles/:name/logs - SSE stream of stdout and stderr lines
pub async fn handle_logs_sse(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let profile = state.ctx.store().load(&name)?;
    let process_state = state.ctx.supervisor().state_for(&profile)?;

    let stream = LogTail::for_process(&process_state, state.ctx.config().log_poll)
        .into_stream()
        .map(|line| Ok(Event::default().data(line)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /api/v1/profiles/:name/logs/buffer - recent output, bounded in size
///
/// The first request starts following the logs; the buffer then keeps the
/// latest output until the profile is stopped, restarted or deleted.
pub async fn handle_logs_buffer(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<LogBufferResponse>, ApiError> {
    let profile = state.ctx.store().load(&name)?;
    let process_state = state.ctx.supervisor().state_for(&profile)?;
    let config = state.ctx.config();

    let mut daemon_state = state.daemon_state.lock().await;
    let display = daemon_state.log_display(&name, || {
        LogTail::for_process(&process_state, config.log_poll).into_display(config.log_buffer_limit)
    });
    Ok(Json(LogBufferResponse {
        text: display.text(),
    }))
}

// ============================================================================
// Runtime Handlers
// ============================================================================

/// GET /api/v1/versions
pub async fn handle_versions(State(state): State<AppState>) -> Json<VersionsResponse> {
    let config = state.ctx.config();
    Json(VersionsResponse {
        installed: runtime::find_installed(config),
        versions: runtime::available_versions(config),
    })
}

/// POST /api/v1/token - a fresh network token from the binary
pub async fn handle_generate_token(
    State(state): State<AppState>,
) -> Result<Json<TokenResponse>, ApiError> {
    let token = runtime::generate_token(state.ctx.config())
        .await
        .map_err(ManagerError::from)?;
    Ok(Json(TokenResponse { token }))
}

// ============================================================================
// SSE Events
// ============================================================================

/// GET /api/v1/events - SSE stream of notifications
pub async fn handle_events_sse(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.ctx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result| {
        result
            .ok()
            .and_then(|notification| Event::default().json_data(&notification).ok())
            .map(Ok)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// On-disk status, overridden while the daemon is starting or stopping
async fn effective_status(state: &AppState, profile: &Profile) -> Result<ProcessInfo, ApiError> {
    let mut info = state.ctx.supervisor().status(profile)?;
    if let Some(transition) = state.daemon_state.lock().await.transition(&profile.name) {
        info.status = transition;
    }
    Ok(info)
}
