//! Media relay WebSocket: receives the vendor's forked call audio and feeds
//! it to the call's recognition session.

use crate::streaming::StreamingSession;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket},
        Extension, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use base64::Engine;
use outcall_calls::find_call_by_sid;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc};

/// Frame sent by the vendor over the media stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum MediaFrame {
    Connected {},
    Start { start: StreamStart },
    Media { media: MediaChunk },
    Mark {},
    Stop {},
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStart {
    pub stream_sid: String,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct MediaChunk {
    #[serde(default)]
    pub track: Option<String>,
    /// Base64 μ-law audio.
    pub payload: String,
}

/// Handler for `GET /voice/media`.
pub async fn media_ws_handler(
    ws: WebSocketUpgrade,
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut session: Option<Arc<StreamingSession>> = None;
    let mut dropped_frames: u64 = 0;

    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            AxumMessage::Text(text) => text,
            AxumMessage::Close(_) => break,
            _ => continue,
        };
        let frame = match serde_json::from_str::<MediaFrame>(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("ignoring unparseable media frame: {}", e);
                continue;
            }
        };

        match frame {
            MediaFrame::Connected {} => tracing::debug!("media stream connected"),
            MediaFrame::Start { start } => {
                if let Some(previous) = session.take() {
                    previous.stop();
                }
                let Some(call_id) = resolve_call_id(&state, &start).await else {
                    tracing::warn!(stream_sid = %start.stream_sid, "media stream for unknown call");
                    continue;
                };
                match StreamingSession::start(Arc::clone(&state), &call_id, start.call_sid).await {
                    Ok(started) => {
                        tracing::info!(
                            call_id = %call_id,
                            stream_sid = %start.stream_sid,
                            "media stream started"
                        );
                        session = Some(started);
                    }
                    Err(e) => {
                        tracing::warn!(call_id = %call_id, "cannot start streaming session: {}", e);
                    }
                }
            }
            MediaFrame::Media { media } => {
                if media.track.as_deref().is_some_and(|track| track != "inbound") {
                    continue;
                }
                let Some(active) = &session else {
                    continue;
                };
                match base64::engine::general_purpose::STANDARD.decode(media.payload.as_bytes()) {
                    Ok(audio) => {
                        if !active.sink().send_audio(audio) {
                            dropped_frames += 1;
                        }
                    }
                    Err(e) => tracing::debug!(call_id = %active.call_id(), "bad media payload: {}", e),
                }
            }
            MediaFrame::Mark {} => tracing::trace!("media mark"),
            MediaFrame::Stop {} => {
                tracing::info!("media stream stopped");
                break;
            }
        }
    }

    if let Some(active) = session {
        if dropped_frames > 0 {
            tracing::debug!(call_id = %active.call_id(), dropped_frames, "audio frames discarded");
        }
        active.stop();
    }
}

/// The call id passed as a stream parameter, or the call bound to the
/// vendor's call sid.
async fn resolve_call_id(state: &AppState, start: &StreamStart) -> Option<String> {
    if let Some(call_id) = start.custom_parameters.get("callId") {
        return Some(call_id.clone());
    }
    let sid = start.call_sid.clone()?;
    match crate::with_conn(&state.pool, move |conn| find_call_by_sid(conn, &sid)).await {
        Ok(call) => call.map(|call| call.id),
        Err(e) => {
            tracing::error!("call lookup for media stream failed: {}", e);
            None
        }
    }
}
