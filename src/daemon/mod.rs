//! Daemon mode: a local REST API over the profile store and supervisor
//!
//! Binds to loopback only. Every route requires the bearer token written
//! to the token file at startup.

pub mod auth;
pub mod routes;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::middleware;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;

use crate::context::ManagerContext;
use crate::error::ManagerError;
use crate::supervisor::ProcessStatus;
use crate::tail::LogDisplay;

use auth::AuthState;
use routes::AppState;

/// Default HTTP port for the daemon REST API
pub const DEFAULT_HTTP_PORT: u16 = 51830;

/// Daemon service exposing profile management over HTTP
pub struct DaemonService {
    ctx: ManagerContext,
    token_path: PathBuf,
    state: Arc<Mutex<DaemonState>>,
}

/// Bookkeeping the daemon keeps on top of the on-disk state
#[derive(Default)]
pub struct DaemonState {
    /// One lock per profile serialising start and stop
    locks: HashMap<String, Arc<Mutex<()>>>,
    /// Profiles currently between launch/stop and the settled state
    transitions: HashMap<String, ProcessStatus>,
    /// Bounded log buffers, created on first request
    displays: HashMap<String, LogDisplay>,
}

impl DaemonState {
    /// Lock guarding lifecycle operations on `name`
    pub fn profile_lock(&mut self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn set_transition(&mut self, name: &str, status: ProcessStatus) {
        self.transitions.insert(name.to_string(), status);
    }

    pub fn clear_transition(&mut self, name: &str) {
        self.transitions.remove(name);
    }

    pub fn transition(&self, name: &str) -> Option<ProcessStatus> {
        self.transitions.get(name).copied()
    }

    /// Log buffer of `name`, created with `open` if there is none yet
    pub fn log_display(&mut self, name: &str, open: impl FnOnce() -> LogDisplay) -> &LogDisplay {
        self.displays.entry(name.to_string()).or_insert_with(open)
    }

    /// Drop the log buffer of `name`, stopping its followers
    pub fn close_log_display(&mut self, name: &str) {
        if let Some(display) = self.displays.remove(name) {
            display.cancel();
        }
    }
}

impl DaemonService {
    /// Create a daemon; the token file defaults to `<state-dir>/api-token`
    pub fn new(ctx: ManagerContext, token_path: Option<PathBuf>) -> Self {
        let token_path =
            token_path.unwrap_or_else(|| auth::default_token_path(&ctx.config().state_dir));

        Self {
            ctx,
            token_path,
            state: Arc::new(Mutex::new(DaemonState::default())),
        }
    }

    pub fn token_path(&self) -> &PathBuf {
        &self.token_path
    }

    /// Full application router with auth and request tracing
    pub fn router(&self, token: String) -> axum::Router {
        let app_state = AppState {
            ctx: self.ctx.clone(),
            daemon_state: self.state.clone(),
        };
        let auth_state = AuthState::new(token);

        routes::build_router(app_state)
            .layer(middleware::from_fn_with_state(
                auth_state,
                auth::auth_middleware,
            ))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve the REST API on `127.0.0.1:port` until the task is dropped
    pub async fn run_http(&self, port: u16) -> Result<(), ManagerError> {
        let token = auth::generate_api_token();
        auth::write_token_file(&token, &self.token_path)?;

        let app = self.router(token);

        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("REST API listening on http://{}", addr);
        tracing::info!("Auth token file: {:?}", self.token_path);

        axum::serve(listener, app).await?;
        Ok(())
    }

    /// Remove the token file; supervised processes keep running
    pub async fn cleanup(&self) -> Result<(), ManagerError> {
        match std::fs::remove_file(&self.token_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
