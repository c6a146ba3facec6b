use std::collections::BTreeMap;

use outcall_types::{Call, CallStatus, Customer, Evaluation, TranscriptEntry, VoiceKind};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::CallError;

const CALL_COLUMNS: &str = "id, module_id, customer_id, customer_name, phone_number, \
     external_sid, voice, status, duration_secs, current_step, responses, transcript, \
     evaluation, recording_url, created_at, updated_at";

/// Parameters for creating a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCallParams {
    pub module_id: String,
    pub customer: Customer,
    pub voice: VoiceKind,
}

/// Changes produced by one conversation turn.
#[derive(Debug, Clone, Default)]
pub struct TurnUpdate {
    /// Step the call will be at once this turn is applied. Must exceed the
    /// stored step for the update to take effect.
    pub next_step: u32,
    /// Answers to record, by question index.
    pub responses: Vec<(usize, String)>,
    pub transcript: Vec<TranscriptEntry>,
    pub status: Option<CallStatus>,
    pub evaluation: Option<Evaluation>,
}

/// Result of [`apply_turn`].
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// The update was written; carries the new record.
    Applied(Call),
    /// The step had already been applied; carries the unchanged record.
    Replayed(Call),
}

impl TurnOutcome {
    pub fn call(&self) -> &Call {
        match self {
            Self::Applied(call) | Self::Replayed(call) => call,
        }
    }
}

/// Vendor-reported call progress.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub status: CallStatus,
    pub duration_secs: Option<u32>,
    pub recording_url: Option<String>,
}

/// Result of [`record_status`].
#[derive(Debug, Clone)]
pub struct StatusOutcome {
    pub call: Call,
    /// True when this report moved the call into a terminal status.
    pub finalized: bool,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Creates a call in the `initiated` status at step 0.
pub fn create_call(conn: &Connection, params: &CreateCallParams) -> Result<Call, CallError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM modules WHERE id = ?1)",
        [&params.module_id],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(CallError::ModuleNotFound(params.module_id.clone()));
    }

    let call_id = uuid::Uuid::new_v4().to_string();
    let ts = now();
    conn.execute(
        "INSERT INTO calls (
            id, module_id, customer_id, customer_name, phone_number, voice,
            status, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            call_id,
            params.module_id,
            params.customer.id,
            params.customer.name,
            params.customer.phone,
            params.voice.key(),
            CallStatus::Initiated.as_str(),
            ts,
        ],
    )?;

    tracing::info!(call_id = %call_id, module_id = %params.module_id, "call created");
    get_call(conn, &call_id)
}

/// Retrieves a call by id.
pub fn get_call(conn: &Connection, call_id: &str) -> Result<Call, CallError> {
    let row = conn
        .query_row(
            &format!("SELECT {CALL_COLUMNS} FROM calls WHERE id = ?1"),
            [call_id],
            map_row_to_call_row,
        )
        .optional()?
        .ok_or_else(|| CallError::CallNotFound(call_id.to_string()))?;
    row.into_call()
}

/// Retrieves a call by the telephony vendor's session id.
pub fn find_call_by_sid(conn: &Connection, external_sid: &str) -> Result<Option<Call>, CallError> {
    conn.query_row(
        &format!("SELECT {CALL_COLUMNS} FROM calls WHERE external_sid = ?1"),
        [external_sid],
        map_row_to_call_row,
    )
    .optional()?
    .map(CallRow::into_call)
    .transpose()
}

/// Binds the vendor session id to a call. Rebinding the same id is a no-op.
pub fn attach_external_sid(
    conn: &Connection,
    call_id: &str,
    external_sid: &str,
) -> Result<(), CallError> {
    let changed = conn.execute(
        "UPDATE calls SET external_sid = ?2, updated_at = ?3
         WHERE id = ?1 AND (external_sid IS NULL OR external_sid = ?2)",
        params![call_id, external_sid, now()],
    )?;
    if changed == 0 {
        // Either unknown, or already bound to a different session.
        let call = get_call(conn, call_id)?;
        tracing::warn!(
            call_id,
            existing = ?call.external_sid,
            incoming = external_sid,
            "call already bound to another session"
        );
    }
    Ok(())
}

/// Applies one turn's changes.
///
/// A turn whose `next_step` does not exceed the stored step is a replay and
/// leaves the record untouched, even once the call is terminal.
///
/// # Errors
///
/// `CallError::Finalized` when a new turn arrives for a call that already has
/// a terminal status.
pub fn apply_turn(
    conn: &Connection,
    call_id: &str,
    update: &TurnUpdate,
) -> Result<TurnOutcome, CallError> {
    let tx = conn.unchecked_transaction()?;
    let mut call = get_call(&tx, call_id)?;

    if update.next_step <= call.current_step {
        tracing::debug!(
            call_id,
            stored = call.current_step,
            incoming = update.next_step,
            "turn already applied"
        );
        return Ok(TurnOutcome::Replayed(call));
    }
    if call.status.is_terminal() {
        return Err(CallError::Finalized {
            call_id: call_id.to_string(),
            status: call.status,
        });
    }

    for (question, text) in &update.responses {
        call.responses.insert(question.to_string(), text.clone());
    }
    call.transcript.extend(update.transcript.iter().cloned());
    if let Some(status) = update.status {
        call.status = status;
    }
    if let Some(evaluation) = &update.evaluation {
        call.evaluation = Some(evaluation.clone());
    }
    call.current_step = update.next_step;
    call.updated_at = now();

    tx.execute(
        "UPDATE calls SET
            status = ?2, current_step = ?3, responses = ?4, transcript = ?5,
            evaluation = ?6, updated_at = ?7
         WHERE id = ?1",
        params![
            call_id,
            call.status.as_str(),
            call.current_step,
            serde_json::to_string(&call.responses)?,
            serde_json::to_string(&call.transcript)?,
            call.evaluation
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            call.updated_at,
        ],
    )?;
    tx.commit()?;

    Ok(TurnOutcome::Applied(call))
}

/// Appends transcript lines without moving the step, for reprompts.
///
/// # Errors
///
/// `CallError::Finalized` once the call has a terminal status.
pub fn append_transcript(
    conn: &Connection,
    call_id: &str,
    entries: &[TranscriptEntry],
) -> Result<Call, CallError> {
    let tx = conn.unchecked_transaction()?;
    let mut call = get_call(&tx, call_id)?;
    if call.status.is_terminal() {
        return Err(CallError::Finalized {
            call_id: call_id.to_string(),
            status: call.status,
        });
    }

    call.transcript.extend(entries.iter().cloned());
    call.updated_at = now();
    tx.execute(
        "UPDATE calls SET transcript = ?2, updated_at = ?3 WHERE id = ?1",
        params![call_id, serde_json::to_string(&call.transcript)?, call.updated_at],
    )?;
    tx.commit()?;
    Ok(call)
}

/// Records a vendor status report for the call bound to `external_sid`.
///
/// Non-terminal reports never move a call backwards past `in-progress`.
/// When the report makes the call terminal and it has no evaluation yet,
/// `evaluate` supplies one. Reports arriving after the call is terminal only
/// fill in a missing duration or recording reference.
pub fn record_status<F>(
    conn: &Connection,
    external_sid: &str,
    report: &StatusReport,
    evaluate: F,
) -> Result<StatusOutcome, CallError>
where
    F: FnOnce(&Call) -> Evaluation,
{
    let tx = conn.unchecked_transaction()?;
    let mut call = find_call_by_sid(&tx, external_sid)?
        .ok_or_else(|| CallError::CallNotFound(external_sid.to_string()))?;

    let mut finalized = false;
    if !call.status.is_terminal() {
        if report.status.is_terminal() {
            call.status = report.status;
            if call.evaluation.is_none() {
                call.evaluation = Some(evaluate(&call));
            }
            finalized = true;
        } else if !regresses(call.status, report.status) {
            call.status = report.status;
        }
    }
    if call.duration_secs.is_none() {
        call.duration_secs = report.duration_secs;
    }
    if call.recording_url.is_none() {
        call.recording_url = report.recording_url.clone();
    }
    call.updated_at = now();

    tx.execute(
        "UPDATE calls SET
            status = ?2, duration_secs = ?3, recording_url = ?4, evaluation = ?5,
            updated_at = ?6
         WHERE id = ?1",
        params![
            call.id,
            call.status.as_str(),
            call.duration_secs,
            call.recording_url,
            call.evaluation
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            call.updated_at,
        ],
    )?;
    tx.commit()?;

    Ok(StatusOutcome { call, finalized })
}

fn regresses(current: CallStatus, incoming: CallStatus) -> bool {
    let answered = matches!(current, CallStatus::InProgress | CallStatus::Answered);
    let early = matches!(
        incoming,
        CallStatus::Initiated | CallStatus::Queued | CallStatus::Ringing
    );
    answered && early
}

/// Raw column values; JSON columns are decoded in [`CallRow::into_call`].
struct CallRow {
    id: String,
    module_id: String,
    customer_id: String,
    customer_name: Option<String>,
    phone_number: Option<String>,
    external_sid: Option<String>,
    voice: String,
    status: String,
    duration_secs: Option<u32>,
    current_step: u32,
    responses: String,
    transcript: String,
    evaluation: Option<String>,
    recording_url: Option<String>,
    created_at: String,
    updated_at: String,
}

fn map_row_to_call_row(row: &Row) -> rusqlite::Result<CallRow> {
    Ok(CallRow {
        id: row.get(0)?,
        module_id: row.get(1)?,
        customer_id: row.get(2)?,
        customer_name: row.get(3)?,
        phone_number: row.get(4)?,
        external_sid: row.get(5)?,
        voice: row.get(6)?,
        status: row.get(7)?,
        duration_secs: row.get(8)?,
        current_step: row.get(9)?,
        responses: row.get(10)?,
        transcript: row.get(11)?,
        evaluation: row.get(12)?,
        recording_url: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

impl CallRow {
    fn into_call(self) -> Result<Call, CallError> {
        let status = self.status.parse::<CallStatus>().map_err(|e| CallError::Corrupt {
            call_id: self.id.clone(),
            reason: format!("{e}"),
        })?;
        let voice = VoiceKind::from_key(&self.voice).ok_or_else(|| CallError::Corrupt {
            call_id: self.id.clone(),
            reason: format!("unknown voice '{}'", self.voice),
        })?;
        let responses: BTreeMap<String, String> = serde_json::from_str(&self.responses)?;
        let transcript: Vec<TranscriptEntry> = serde_json::from_str(&self.transcript)?;
        let evaluation: Option<Evaluation> = self
            .evaluation
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Call {
            id: self.id,
            module_id: self.module_id,
            customer: Customer {
                id: self.customer_id,
                name: self.customer_name,
                phone: self.phone_number,
            },
            external_sid: self.external_sid,
            voice,
            status,
            duration_secs: self.duration_secs,
            current_step: self.current_step,
            responses,
            transcript,
            evaluation,
            recording_url: self.recording_url,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
