//! Live monitor WebSocket: fans a call's transcript and progress out to
//! observers.
//!
//! Events are delivered to whoever is connected at publish time and never
//! stored. Each observer has a bounded outbound queue; a slow observer loses
//! events instead of stalling the call.

use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        Extension, Path, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use outcall_dialog::Signal;
use outcall_types::{CallStatus, Intent, Speaker, TranscriptEntry};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Event pushed to monitor observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    Transcript {
        speaker: Speaker,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        question: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        intent: Option<Intent>,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
        is_final: bool,
        at: String,
    },
    Status {
        status: CallStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Stage {
        stage: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        question: Option<usize>,
        step: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<Signal>,
    },
    CallEnded {
        status: CallStatus,
        reason: String,
    },
}

impl MonitorEvent {
    pub fn final_line(entry: &TranscriptEntry) -> Self {
        Self::Transcript {
            speaker: entry.speaker,
            text: entry.text.clone(),
            question: entry.question,
            intent: entry.intent,
            confidence: entry.confidence,
            is_final: true,
            at: entry.at.clone(),
        }
    }
}

type ObserverMap = HashMap<String, HashMap<Uuid, mpsc::Sender<String>>>;

/// Observers per call id.
#[derive(Clone)]
pub struct MonitorHub {
    observers: Arc<RwLock<ObserverMap>>,
    grace: Duration,
    buffer: usize,
}

impl MonitorHub {
    pub fn new(grace: Duration, buffer: usize) -> Self {
        Self {
            observers: Arc::new(RwLock::new(HashMap::new())),
            grace,
            buffer: buffer.max(1),
        }
    }

    /// Registers an observer and returns its id and event stream.
    pub async fn subscribe(&self, call_id: &str) -> (Uuid, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        self.observers
            .write()
            .await
            .entry(call_id.to_string())
            .or_default()
            .insert(id, tx);
        (id, rx)
    }

    /// Removes one observer; the call entry goes with its last observer.
    pub async fn unsubscribe(&self, call_id: &str, observer: Uuid) {
        let mut observers = self.observers.write().await;
        if let Some(set) = observers.get_mut(call_id) {
            set.remove(&observer);
            if set.is_empty() {
                observers.remove(call_id);
            }
        }
    }

    pub async fn observer_count(&self, call_id: &str) -> usize {
        self.observers
            .read()
            .await
            .get(call_id)
            .map_or(0, HashMap::len)
    }

    /// Sends `event` to the call's current observers. Returns how many
    /// accepted it.
    pub async fn publish(&self, call_id: &str, event: &MonitorEvent) -> usize {
        let observers = self.observers.read().await;
        let Some(set) = observers.get(call_id) else {
            return 0;
        };
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(call_id = %call_id, "failed to serialize monitor event: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        for (observer, sender) in set {
            match sender.try_send(json.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(
                    call_id = %call_id,
                    observer = %observer,
                    "dropping monitor event for slow observer: {}",
                    e
                ),
            }
        }
        delivered
    }

    /// Announces the end of a call, then disconnects its observers once the
    /// grace period has passed.
    pub async fn end_call(&self, call_id: &str, status: CallStatus, reason: &str) {
        self.publish(
            call_id,
            &MonitorEvent::CallEnded {
                status,
                reason: reason.to_string(),
            },
        )
        .await;

        let observers = Arc::clone(&self.observers);
        let grace = self.grace;
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(set) = observers.write().await.remove(&call_id) {
                tracing::debug!(call_id = %call_id, count = set.len(), "closing monitor observers");
            }
        });
    }
}

/// Handler for `GET /monitor/{callId}`.
pub async fn monitor_ws_handler(
    ws: WebSocketUpgrade,
    Path(call_id): Path<String>,
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, call_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, call_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (observer, mut rx) = state.monitor.subscribe(&call_id).await;
    tracing::debug!(call_id = %call_id, observer = %observer, "monitor observer connected");

    // Ends when the hub drops this observer or the socket goes away.
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(AxumMessage::Text(msg.into())).await.is_err() {
                return;
            }
        }
        let _ = sender.send(AxumMessage::Close(None)).await;
    });

    // Observers only listen; anything they send is ignored.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let AxumMessage::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.monitor.unsubscribe(&call_id, observer).await;
    tracing::debug!(call_id = %call_id, observer = %observer, "monitor observer disconnected");
}
