//! Background tasks for the outcall server.
//!
//! Includes:
//! - Sweeping expired streaming sessions and rate-limit windows.
//! - Purging stale local audio files.

use crate::AppState;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Starts the registry sweep task.
///
/// Sessions whose recognizer went quiet for longer than the registry TTL are
/// dropped and their recognition connections closed.
pub async fn start_registry_sweep(state: Arc<AppState>, interval_secs: u64) {
    if interval_secs == 0 {
        tracing::warn!("registry sweep disabled (interval=0)");
        return;
    }
    let interval = Duration::from_secs(interval_secs);
    tracing::info!(interval_secs, "starting registry sweep task");

    loop {
        sleep(interval).await;
        sweep_once(&state);
    }
}

/// One sweep pass. Returns the number of streaming sessions evicted.
pub fn sweep_once(state: &AppState) -> usize {
    let expired = state.sessions.sweep();
    for session in &expired {
        tracing::info!(call_id = %session.call_id(), "evicting idle streaming session");
        session.stop();
    }
    let windows = state.rate_limiter.sweep();
    if windows > 0 {
        tracing::debug!(count = windows, "expired rate-limit windows dropped");
    }
    expired.len()
}

/// Starts the local audio purge task.
///
/// Unshared audio unused for `retention_days` is removed from disk. The
/// durable copy stays and is restored on the next miss.
pub async fn start_audio_purge(state: Arc<AppState>, retention_days: u64, interval_secs: u64) {
    if retention_days == 0 || interval_secs == 0 {
        tracing::warn!("audio purge task disabled (retention or interval is 0)");
        return;
    }
    let retention = Duration::from_secs(retention_days * 24 * 60 * 60);
    let interval = Duration::from_secs(interval_secs);
    tracing::info!(retention_days, interval_secs, "starting audio purge task");

    loop {
        sleep(interval).await;
        match state.resolver.purge_local(retention).await {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "purged stale local audio"),
            Err(e) => tracing::error!("failed to purge local audio: {}", e),
        }
    }
}
