//! Webhook call progression controller.
//!
//! Each `POST /voice/turn` carries the step being answered in its query
//! string and the recognized speech in its form body. The handler rebuilds
//! the conversation state from the stored call, runs one transition, stores
//! the outcome and answers with the next voice document. Handlers never fail
//! towards the vendor: errors become a spoken apology and a hangup.
//!
//! A turn for a step the call has already passed is a replay. It renders the
//! same document from the stored answers and changes nothing.

use crate::api_monitor::MonitorEvent;
use crate::middleware::check_signature;
use crate::playback;
use crate::streaming::HOLD_SECS;
use crate::twiml::{Verb, VoiceResponse};
use crate::{now_rfc3339, with_conn, AppState, StoreError};
use axum::{
    body::Bytes,
    extract::{Extension, RawQuery},
    http::HeaderMap,
};
use outcall_calls::{
    apply_turn, attach_external_sid, get_call, get_module, record_status, CallError,
    StatusReport, TurnOutcome, TurnUpdate,
};
use outcall_dialog::{evaluation_for_status, ConversationMachine, DialogEvent, DialogState, Stage};
use outcall_types::{Call, CallStatus, Module, Speaker, VoiceKind};
use std::sync::Arc;
use thiserror::Error;

/// Errors that end a turn with the apology document.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("turn request has no call id")]
    MissingCallId,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TurnError {
    fn is_finalized(&self) -> bool {
        matches!(self, Self::Store(StoreError::Call(CallError::Finalized { .. })))
    }
}

/// Query parameters of a turn webhook.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnParams {
    pub step: u32,
    pub module_id: Option<String>,
    pub customer_id: Option<String>,
    pub call_id: Option<String>,
    pub voice: Option<String>,
}

impl TurnParams {
    /// Lenient parse: unknown keys are ignored and a bad step reads as 0.
    pub fn parse(query: Option<&str>) -> Self {
        let mut params = Self::default();
        let Some(query) = query else {
            return params;
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = value.trim().to_string();
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                "step" => params.step = value.parse().unwrap_or(0),
                "moduleId" => params.module_id = Some(value),
                "customerId" => params.customer_id = Some(value),
                "callId" => params.call_id = Some(value),
                "voice" => params.voice = Some(value),
                _ => {}
            }
        }
        params
    }

    /// Relative URL of the turn webhook for `step`.
    pub fn url_for_step(&self, step: u32) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("step", &step.to_string());
        for (key, value) in [
            ("moduleId", &self.module_id),
            ("customerId", &self.customer_id),
            ("callId", &self.call_id),
            ("voice", &self.voice),
        ] {
            if let Some(value) = value {
                query.append_pair(key, value);
            }
        }
        format!("/voice/turn?{}", query.finish())
    }
}

/// Vendor form fields of a turn webhook.
#[derive(Debug, Clone, Default)]
struct TurnForm {
    call_sid: Option<String>,
    speech: String,
    confidence: Option<f32>,
}

impl TurnForm {
    fn from_pairs(pairs: &[(String, String)]) -> Self {
        let mut form = Self::default();
        for (key, value) in pairs {
            match key.as_str() {
                "CallSid" if !value.is_empty() => form.call_sid = Some(value.clone()),
                "SpeechResult" => form.speech = value.trim().to_string(),
                "Confidence" => form.confidence = value.parse().ok(),
                _ => {}
            }
        }
        form
    }
}

fn form_pairs(body: &[u8]) -> Vec<(String, String)> {
    url::form_urlencoded::parse(body).into_owned().collect()
}

fn path_and_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path.to_string(),
    }
}

/// Handler for `POST /voice/turn`.
pub async fn turn_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> VoiceResponse {
    let pairs = form_pairs(&body);
    check_signature(
        &state,
        &headers,
        &path_and_query("/voice/turn", query.as_deref()),
        &pairs,
    );
    let params = TurnParams::parse(query.as_deref());
    let form = TurnForm::from_pairs(&pairs);

    match run_turn(&state, &params, &form).await {
        Ok(doc) => doc,
        Err(e) if e.is_finalized() => {
            tracing::info!(call_id = ?params.call_id, step = params.step, "turn for ended call");
            hangup()
        }
        Err(e) => {
            tracing::error!(
                call_id = ?params.call_id,
                step = params.step,
                "turn failed, apologizing: {}",
                e
            );
            apology(&state, &params).await
        }
    }
}

fn hangup() -> VoiceResponse {
    let mut doc = VoiceResponse::new();
    doc.push(Verb::Hangup);
    doc
}

async fn apology(state: &AppState, params: &TurnParams) -> VoiceResponse {
    let voice = params
        .voice
        .as_deref()
        .and_then(VoiceKind::from_key)
        .unwrap_or_default();
    let mut doc = VoiceResponse::new();
    doc.push(playback::system_line(&state.resolver, voice, &state.script.apology).await);
    doc.push(Verb::Hangup);
    doc
}

fn select_voice(params: &TurnParams, call: &Call) -> VoiceKind {
    match params.voice.as_deref() {
        Some(key) => {
            let (voice, known) = VoiceKind::from_key_or_default(key);
            if !known {
                tracing::warn!(call_id = %call.id, voice = key, "unknown voice, using default");
            }
            voice
        }
        None => call.voice,
    }
}

async fn load(
    state: &AppState,
    call_id: &str,
    call_sid: Option<String>,
) -> Result<(Call, Module), StoreError> {
    let call_id = call_id.to_string();
    with_conn(&state.pool, move |conn| {
        let mut call = get_call(conn, &call_id)?;
        if let (Some(sid), None) = (call_sid, call.external_sid.as_ref()) {
            attach_external_sid(conn, &call_id, &sid)?;
            call.external_sid = Some(sid);
        }
        let module = get_module(conn, &call.module_id)?;
        Ok((call, module))
    })
    .await
}

async fn run_turn(
    state: &AppState,
    params: &TurnParams,
    form: &TurnForm,
) -> Result<VoiceResponse, TurnError> {
    let call_id = params.call_id.clone().ok_or(TurnError::MissingCallId)?;
    let (call, module) = load(state, &call_id, form.call_sid.clone()).await?;
    if let Some(module_id) = &params.module_id {
        if *module_id != call.module_id {
            tracing::warn!(call_id = %call.id, module_id = %module_id, "turn module differs from call");
        }
    }

    let step = if params.step > call.current_step {
        tracing::warn!(
            call_id = %call.id,
            requested = params.step,
            stored = call.current_step,
            "turn is ahead of the call record, using the stored step"
        );
        call.current_step
    } else {
        params.step
    };
    let replay = call.current_step > step;
    if call.status.is_terminal() && !replay {
        return Ok(hangup());
    }

    let voice = select_voice(params, &call);
    let module_id = module.id.clone();
    let answered = call.answer_intents();
    let machine = ConversationMachine::new(
        Arc::new(module),
        Arc::clone(&state.script),
        call.customer.name.clone(),
        state.webhook_policy(),
    );
    let current = DialogState::resume(step, machine.question_count(), &answered);
    let event = event_for(state, &machine, &current, &call, form, replay).await;
    let transition = machine.transition(&current, event);

    let finish = transition.finish();
    let status = match finish {
        Some((status, _)) => Some(status),
        None if call.status != CallStatus::InProgress => Some(CallStatus::InProgress),
        None => None,
    };
    let update = TurnUpdate {
        next_step: transition.next.step,
        responses: transition.responses(),
        transcript: transition.transcript_entries(&now_rfc3339()),
        status,
        evaluation: finish.map(|(_, evaluation)| evaluation.clone()),
    };
    let entries = update.transcript.clone();
    let outcome = with_conn(&state.pool, move |conn| apply_turn(conn, &call_id, &update)).await?;

    match &outcome {
        TurnOutcome::Applied(stored) => {
            tracing::info!(
                call_id = %stored.id,
                step = stored.current_step,
                stage = transition.next.stage.name(),
                "turn applied"
            );
            for entry in &entries {
                state
                    .monitor
                    .publish(&stored.id, &MonitorEvent::final_line(entry))
                    .await;
            }
            state
                .monitor
                .publish(
                    &stored.id,
                    &MonitorEvent::Stage {
                        stage: transition.next.stage.name(),
                        question: transition.next.stage.question(),
                        step: transition.next.step,
                        signal: transition.signals().last().cloned(),
                    },
                )
                .await;
            if let (Some((status, _)), Stage::Done(ending)) = (finish, transition.next.stage) {
                state
                    .monitor
                    .end_call(&stored.id, status, ending.as_str())
                    .await;
            }
        }
        TurnOutcome::Replayed(stored) => {
            tracing::debug!(call_id = %stored.id, step = params.step, "replayed turn");
        }
    }

    let mut lines =
        playback::line_verbs(&state.resolver, voice, &module_id, transition.lines()).await;
    let mut doc = VoiceResponse::new();

    if current.stage == Stage::Greeting && state.config.telephony.media_streams {
        doc.push(Verb::StartStream {
            url: media_stream_url(&state.config.server.public_url),
            params: vec![("callId".to_string(), outcome.call().id.clone())],
        });
        for verb in lines {
            doc.push(verb);
        }
        doc.push(Verb::Pause { secs: HOLD_SECS });
        return Ok(doc);
    }

    if transition.hangs_up() || transition.listen_secs().is_none() {
        for verb in lines.drain(..) {
            doc.push(verb);
        }
        doc.push(Verb::Hangup);
    } else if let Some(timeout_secs) = transition.listen_secs() {
        let action = params.url_for_step(transition.next.step);
        doc.push(Verb::Gather {
            action: action.clone(),
            timeout_secs,
            children: lines,
        });
        doc.push(Verb::Redirect { url: action });
    }
    Ok(doc)
}

/// Builds the machine event for this turn. Availability is graded by
/// keywords; answers by the classifier, except on replay where the stored
/// grade is reused.
async fn event_for(
    state: &AppState,
    machine: &ConversationMachine,
    current: &DialogState,
    call: &Call,
    form: &TurnForm,
    replay: bool,
) -> DialogEvent {
    let text = form.speech.clone();
    let confidence = form.confidence;
    match current.stage {
        Stage::Greeting | Stage::Done(_) => DialogEvent::CallAnswered,
        _ if text.is_empty() => DialogEvent::Unclear { text, confidence },
        Stage::AwaitingAvailability => {
            let intent = if replay {
                stored_availability(call)
            } else {
                None
            }
            .unwrap_or_else(|| state.classifier.keywords().classify(&text));
            DialogEvent::Answer {
                text,
                intent,
                confidence,
            }
        }
        Stage::AwaitingAnswer(question) => {
            let stored = if replay {
                call.answer_intents().get(&question).copied()
            } else {
                None
            };
            let intent = match stored {
                Some(intent) => intent,
                None => {
                    let context = machine.question_text(question).unwrap_or_default();
                    state.classifier.classify(&text, context).await.intent()
                }
            };
            DialogEvent::Answer {
                text,
                intent,
                confidence,
            }
        }
    }
}

fn stored_availability(call: &Call) -> Option<outcall_types::Intent> {
    call.transcript
        .iter()
        .rev()
        .find(|entry| entry.speaker == Speaker::Customer && entry.question.is_none())
        .and_then(|entry| entry.intent)
}

/// `wss://` URL of the media relay for the public base URL.
pub fn media_stream_url(public_url: &str) -> String {
    let base = public_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{base}/voice/media")
}

/// Handler for `POST /voice/status`.
pub async fn status_handler(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> VoiceResponse {
    let pairs = form_pairs(&body);
    check_signature(
        &state,
        &headers,
        &path_and_query("/voice/status", query.as_deref()),
        &pairs,
    );

    let field = |name: &str| {
        pairs
            .iter()
            .find(|(key, value)| key == name && !value.is_empty())
            .map(|(_, value)| value.clone())
    };
    let Some(sid) = field("CallSid") else {
        tracing::warn!("status callback without CallSid");
        return VoiceResponse::new();
    };
    let status = match field("CallStatus").map(|s| s.parse::<CallStatus>()) {
        Some(Ok(status)) => status,
        other => {
            tracing::warn!(sid = %sid, status = ?other, "status callback with unknown status");
            return VoiceResponse::new();
        }
    };
    let report = StatusReport {
        status,
        duration_secs: field("CallDuration").and_then(|d| d.parse().ok()),
        recording_url: field("RecordingUrl"),
    };

    let lookup_sid = sid.clone();
    let result = with_conn(&state.pool, move |conn| {
        record_status(conn, &lookup_sid, &report, |call| {
            evaluation_for_status(call.status, &call.answer_intents())
        })
    })
    .await;

    match result {
        Ok(outcome) => {
            let call = &outcome.call;
            tracing::info!(
                call_id = %call.id,
                sid = %sid,
                reported = %status,
                status = %call.status,
                finalized = outcome.finalized,
                "call status recorded"
            );
            state
                .monitor
                .publish(
                    &call.id,
                    &MonitorEvent::Status {
                        status: call.status,
                        detail: None,
                    },
                )
                .await;
            if status.is_terminal() {
                if let Some(session) = state.sessions.remove(&call.id) {
                    session.stop();
                }
            }
            if outcome.finalized {
                state
                    .monitor
                    .end_call(&call.id, call.status, "status callback")
                    .await;
            }
        }
        Err(StoreError::Call(CallError::CallNotFound(_))) => {
            tracing::warn!(sid = %sid, "status callback for unknown call");
        }
        Err(e) => {
            tracing::error!(sid = %sid, "failed to record call status: {}", e);
        }
    }
    VoiceResponse::new()
}
