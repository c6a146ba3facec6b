//! Outcall server binary.
//!
//! Starts an axum HTTP server with structured logging, database
//! initialization, background maintenance and graceful shutdown on
//! SIGTERM/SIGINT.

use outcall_server::{
    api_monitor::MonitorHub,
    app, background,
    config::load_config,
    dialer::{CallControl, TwilioDialer},
    middleware::RateLimiter,
    registry::TtlRegistry,
    AppState,
};
use outcall_dialog::IntentClassifier;
use outcall_voice::{
    AudioResolver, DeepgramGateway, HttpSynthesizer, LocalAudioCache, SqliteArtifactStore,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("OUTCALL_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = load_config(selected_config_path)
        .expect("failed to load configuration, the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Initialize database
    let pool = outcall_db::create_pool(
        &config.database.path,
        outcall_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool, check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = outcall_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    // Voice providers
    let local = LocalAudioCache::open(&config.audio_cache.dir)
        .await
        .expect("failed to open local audio cache directory");
    let synthesizer =
        HttpSynthesizer::new(config.synthesis.clone()).expect("failed to build synthesis client");
    if config.synthesis.api_key.is_empty() {
        tracing::warn!("synthesis API key not set, lines will use vendor speech");
    }
    let resolver = AudioResolver::new(
        local,
        Arc::new(SqliteArtifactStore::new(pool.clone())),
        Arc::new(synthesizer),
        config.audio_cache.public_base_url.clone(),
    );
    let classifier = IntentClassifier::from_config(&config.classifier)
        .expect("failed to build intent classifier");

    let call_control: Option<Arc<dyn CallControl>> = match TwilioDialer::new(config.telephony.clone())
    {
        Ok(dialer) => Some(Arc::new(dialer)),
        Err(e) => {
            tracing::warn!("outbound dialing disabled: {}", e);
            None
        }
    };

    let config = Arc::new(config);
    let state = AppState {
        pool,
        script: Arc::new(config.dialog.script.clone()),
        resolver: Arc::new(resolver),
        classifier: Arc::new(classifier),
        gateway: Arc::new(DeepgramGateway::new(config.recognition.clone())),
        call_control,
        monitor: MonitorHub::new(
            Duration::from_millis(config.monitor.grace_ms),
            config.monitor.observer_buffer,
        ),
        sessions: TtlRegistry::new(Duration::from_secs(config.registry.session_ttl_secs)),
        rate_limiter: RateLimiter::new(),
        config: Arc::clone(&config),
    };

    // Background tasks
    let shared = Arc::new(state.clone());
    tokio::spawn(background::start_registry_sweep(
        Arc::clone(&shared),
        config.registry.sweep_interval_secs,
    ));
    tokio::spawn(background::start_audio_purge(
        shared,
        u64::from(config.audio_cache.retention_days),
        config.audio_cache.purge_interval_secs,
    ));

    // Build application
    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, public_url = %config.server.public_url, "starting outcall server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address, is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("server error");

    tracing::info!("outcall server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
