//! Persistence for questionnaire modules and call records.
//!
//! All functions take a borrowed `rusqlite::Connection` and are meant to be
//! run inside `spawn_blocking` by the async server. Mutations of a call go
//! through [`apply_turn`] and [`record_status`], which enforce the two call
//! invariants:
//!
//! - `current_step` only moves forward; a turn whose step was already applied
//!   is reported as a replay and changes nothing.
//! - Once the status is terminal, responses, transcript, status and
//!   evaluation are frozen.

mod calls;
mod modules;

use outcall_types::CallStatus;
use thiserror::Error;

pub use calls::{
    append_transcript, apply_turn, attach_external_sid, create_call, find_call_by_sid, get_call,
    record_status, CreateCallParams, StatusOutcome, StatusReport, TurnOutcome, TurnUpdate,
};
pub use modules::{create_module, get_module, CreateModuleParams, NewQuestion};

/// Errors that can occur during module and call operations.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("module not found: {0}")]
    ModuleNotFound(String),
    #[error("call not found: {0}")]
    CallNotFound(String),
    #[error("call {call_id} is already {status}")]
    Finalized { call_id: String, status: CallStatus },
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt call record {call_id}: {reason}")]
    Corrupt { call_id: String, reason: String },
}
