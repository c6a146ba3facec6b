//! Call creation and lookup API.

use crate::api::ApiError;
use crate::api_voice::TurnParams;
use crate::dialer::OutboundCall;
use crate::{with_conn, AppState};
use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
};
use outcall_calls::{attach_external_sid, create_call, get_call, get_module, CreateCallParams};
use outcall_dialog::Script;
use outcall_types::{AudioCategory, Call, Customer, Module, VoiceKind};
use outcall_voice::ResolveOptions;
use serde::Deserialize;
use std::sync::Arc;

/// Request body for `POST /api/calls`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCallRequest {
    pub module_id: String,
    pub customer: Customer,
    #[serde(default)]
    pub voice: Option<String>,
}

/// Every line a call of `module` can speak that is known before it starts.
pub fn prewarm_lines(
    script: &Script,
    module: &Module,
    customer_name: Option<&str>,
) -> Vec<(String, ResolveOptions)> {
    let greeting = script.greeting_for(customer_name, &module.name);
    let greeting_opts = if script.greeting_is_personal() {
        ResolveOptions::transient(AudioCategory::Greeting)
    } else {
        ResolveOptions::owned(AudioCategory::Greeting, &module.id)
    };

    let mut lines = vec![(greeting, greeting_opts)];
    lines.extend(module.questions.iter().map(|q| {
        (
            q.text.clone(),
            ResolveOptions::owned(AudioCategory::Question, &module.id),
        )
    }));
    lines.extend(
        script
            .shared_lines()
            .into_iter()
            .map(|text| (text.to_string(), ResolveOptions::shared(AudioCategory::System))),
    );
    lines
}

/// Handler for `POST /api/calls`.
pub async fn create_call_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<CreateCallRequest>,
) -> Result<(StatusCode, Json<Call>), ApiError> {
    if payload.module_id.trim().is_empty() {
        return Err(ApiError::BadRequest("moduleId is required".to_string()));
    }
    if payload.customer.id.trim().is_empty() {
        return Err(ApiError::BadRequest("customer.id is required".to_string()));
    }

    let voice = match payload.voice.as_deref() {
        Some(key) => {
            let (voice, known) = VoiceKind::from_key_or_default(key);
            if !known {
                tracing::warn!(voice = key, "unknown voice requested, using default");
            }
            voice
        }
        None => VoiceKind::default(),
    };

    let params = CreateCallParams {
        module_id: payload.module_id,
        customer: payload.customer,
        voice,
    };
    let (mut call, module) = with_conn(&state.pool, move |conn| {
        let module = get_module(conn, &params.module_id)?;
        let call = create_call(conn, &params)?;
        Ok((call, module))
    })
    .await?;

    let lines = prewarm_lines(&state.script, &module, call.customer.name.as_deref());
    let resolver = Arc::clone(&state.resolver);
    let call_id = call.id.clone();
    tokio::spawn(async move {
        let total = lines.len();
        let playable = resolver.prewarm(&lines, voice).await;
        tracing::info!(call_id = %call_id, playable, total, "call audio prewarmed");
    });

    let (Some(control), Some(phone)) = (&state.call_control, call.customer.phone.clone()) else {
        tracing::info!(call_id = %call.id, "call created without dialing");
        return Ok((StatusCode::CREATED, Json(call)));
    };

    let public_url = state.config.server.public_url.trim_end_matches('/');
    let first_turn = TurnParams {
        step: 0,
        module_id: Some(call.module_id.clone()),
        customer_id: Some(call.customer.id.clone()),
        call_id: Some(call.id.clone()),
        voice: Some(voice.key().to_string()),
    };
    let outbound = OutboundCall {
        call_id: call.id.clone(),
        to: phone,
        webhook_url: format!("{public_url}{}", first_turn.url_for_step(0)),
        status_callback_url: format!("{public_url}/voice/status"),
        record: state.config.telephony.record_calls,
    };

    let sid = control.place_call(&outbound).await.map_err(|e| {
        tracing::error!(call_id = %call.id, "failed to place call: {}", e);
        ApiError::InternalServerError("failed to place call".to_string())
    })?;

    let call_id = call.id.clone();
    let bound_sid = sid.clone();
    with_conn(&state.pool, move |conn| {
        attach_external_sid(conn, &call_id, &bound_sid)
    })
    .await?;
    call.external_sid = Some(sid);

    Ok((StatusCode::CREATED, Json(call)))
}

/// Handler for `GET /api/calls/{callId}`.
pub async fn get_call_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Result<Json<Call>, ApiError> {
    let call = with_conn(&state.pool, move |conn| get_call(conn, &call_id)).await?;
    Ok(Json(call))
}
