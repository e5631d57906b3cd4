// ABOUTME: HTTP server setup and lifecycle for shellcast
// ABOUTME: Routes the WebSocket endpoint and /health, runs the sweeper, shuts down gracefully

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use shellcast_core::{
    Config, EventSink, JsonModeProcessor, OutputPostProcessor, SessionManager, TracingSink,
};

use crate::engine::Engine;

#[derive(Clone)]
struct AppState {
    engine: Engine,
    started: Instant,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    active_sessions: usize,
    busy_sessions: usize,
    max_sessions: usize,
    uptime_seconds: u64,
    started_at: DateTime<Utc>,
}

/// A bound, not yet running server.
pub struct Server {
    listener: TcpListener,
    router: Router,
    sessions: Arc<SessionManager>,
    config: Arc<Config>,
    shutdown: CancellationToken,
}

impl Server {
    /// Validate config, build shared state and bind the listener.
    pub async fn bind(config: Config, sink: Arc<dyn EventSink>) -> Result<Self> {
        Self::bind_with(config, sink, Arc::new(JsonModeProcessor)).await
    }

    pub async fn bind_with(
        config: Config,
        sink: Arc<dyn EventSink>,
        post_processor: Arc<dyn OutputPostProcessor>,
    ) -> Result<Self> {
        config.validate().context("validating configuration")?;
        let hooks = config.hook_runner().context("loading hooks")?;

        let config = Arc::new(config);
        let sessions = Arc::new(SessionManager::new(config.session_limits()));
        let shutdown = CancellationToken::new();

        let engine = Engine::new(
            Arc::clone(&config),
            Arc::clone(&sessions),
            hooks,
            post_processor,
            sink,
            shutdown.clone(),
        );
        let state = AppState {
            engine,
            started: Instant::now(),
            started_at: Utc::now(),
        };

        let router = Router::new()
            .route(&config.server.ws_path, get(ws_upgrade))
            .route("/health", get(health))
            .with_state(state);

        let listener = TcpListener::bind(&config.server.bind)
            .await
            .with_context(|| format!("binding {}", config.server.bind))?;

        Ok(Self {
            listener,
            router,
            sessions,
            config,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("reading local address")
    }

    /// Cancelling this token stops the server and closes every session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until the shutdown token fires.
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(
            %addr,
            ws_path = %self.config.server.ws_path,
            max_sessions = self.config.sessions.max_sessions,
            hooks = self.config.hooks.len(),
            "shellcast listening"
        );

        let sweeper = self
            .sessions
            .spawn_sweeper(self.config.sweep_interval(), self.shutdown.clone());

        let shutdown = self.shutdown.clone();
        let served = axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("running WebSocket server");

        // make sure everything stops even if serve failed on its own
        self.shutdown.cancel();
        let closed = self.sessions.shutdown_all().await;
        let _ = sweeper.await;
        info!(closed_sessions = closed, "Server shut down gracefully");
        served
    }
}

/// Bind from config and serve until Ctrl+C or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let server = Server::bind(config, Arc::new(TracingSink)).await?;
    let token = server.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });
    server.run().await
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let engine = state.engine.clone();
    ws.on_upgrade(move |socket| engine.handle_socket(socket))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.engine.sessions.stats().await;
    Json(HealthResponse {
        status: "healthy",
        service: "shellcast",
        version: env!("CARGO_PKG_VERSION"),
        active_sessions: stats.active_sessions,
        busy_sessions: stats.busy_sessions,
        max_sessions: stats.max_sessions,
        uptime_seconds: state.started.elapsed().as_secs(),
        started_at: state.started_at,
    })
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
