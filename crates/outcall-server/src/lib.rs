//! Outbound call server: webhook controller, media relay, streaming
//! conversation handler and live monitor.

pub mod api;
pub mod api_calls;
pub mod api_media;
pub mod api_monitor;
pub mod api_voice;
pub mod background;
pub mod config;
pub mod dialer;
pub mod middleware;
pub mod playback;
pub mod registry;
pub mod streaming;
pub mod twiml;

use api_monitor::MonitorHub;
use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use config::Config;
use dialer::CallControl;
use middleware::RateLimiter;
use outcall_calls::CallError;
use outcall_db::DbPool;
use outcall_dialog::{DialogPolicy, IntentClassifier, Script};
use outcall_voice::{AudioResolver, SpeechGateway};
use registry::TtlRegistry;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::sync::Arc;
use streaming::StreamingSession;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    pub config: Arc<Config>,
    /// Lines the agent speaks outside the module's questions.
    pub script: Arc<Script>,
    pub resolver: Arc<AudioResolver>,
    pub classifier: Arc<IntentClassifier>,
    pub gateway: Arc<dyn SpeechGateway>,
    /// Absent when no telephony credentials are configured.
    pub call_control: Option<Arc<dyn CallControl>>,
    pub monitor: MonitorHub,
    /// Live streaming sessions by call id.
    pub sessions: TtlRegistry<String, Arc<StreamingSession>>,
    /// Rate limiter state.
    pub rate_limiter: RateLimiter,
}

impl AppState {
    /// One shot per stage; silence ends the call.
    pub fn webhook_policy(&self) -> DialogPolicy {
        self.with_listen_timeouts(DialogPolicy::webhook())
    }

    pub fn streaming_policy(&self) -> DialogPolicy {
        DialogPolicy {
            max_reprompts: self.config.dialog.max_reprompts,
            ..self.with_listen_timeouts(DialogPolicy::streaming())
        }
    }

    fn with_listen_timeouts(&self, policy: DialogPolicy) -> DialogPolicy {
        DialogPolicy {
            greeting_listen_secs: self.config.dialog.greeting_listen_secs,
            answer_listen_secs: self.config.dialog.answer_listen_secs,
            ..policy
        }
    }
}

/// Failure of a blocking database operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database pool error: {0}")]
    Pool(String),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Runs `f` with a pooled connection on the blocking thread pool.
pub async fn with_conn<T, F>(pool: &DbPool, f: F) -> Result<T, StoreError>
where
    F: FnOnce(&Connection) -> Result<T, CallError> + Send + 'static,
    T: Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| StoreError::Pool(e.to_string()))?;
        f(&conn).map_err(StoreError::from)
    })
    .await?
}

/// Current time as RFC 3339, for transcript entries.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let audio_dir = state.resolver.local().dir().to_path_buf();
    tracing::info!(path = %audio_dir.display(), "serving cached audio at /audio");

    // Only call creation is rate limited; webhooks come from the vendor.
    let call_api = Router::new()
        .route("/api/calls", post(api_calls::create_call_handler))
        .route_layer(axum::middleware::from_fn(middleware::rate_limit_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/voice/turn", post(api_voice::turn_handler))
        .route("/voice/status", post(api_voice::status_handler))
        .route("/voice/media", get(api_media::media_ws_handler))
        .route("/monitor/{callId}", get(api_monitor::monitor_ws_handler))
        .route("/api/calls/{callId}", get(api_calls::get_call_handler))
        .merge(call_api)
        .nest_service("/audio", ServeDir::new(audio_dir))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
