//! Shared domain types for the outbound call service.
//!
//! Every crate in the workspace depends on this one for the vocabulary of a
//! call: modules and their questions, call records and statuses, transcript
//! entries, classified intents, voices and audio provenance. The crate holds
//! no I/O so it can be used from both the blocking database layer and the
//! async server.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod voice;

pub use voice::VoiceKind;

/// Error returned when a string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

impl ParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Categorical outcome of a customer answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Intent {
    Yes,
    No,
    Maybe,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "YES",
            Self::No => "NO",
            Self::Maybe => "MAYBE",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Intent {
    type Err = ParseError;

    /// Accepts the label in any case, surrounded by whitespace or trailing
    /// punctuation (`"Yes."`), and nothing else.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s
            .trim()
            .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace());
        match label.to_ascii_uppercase().as_str() {
            "YES" => Ok(Self::Yes),
            "NO" => Ok(Self::No),
            "MAYBE" => Ok(Self::Maybe),
            _ => Err(ParseError::new("intent", s)),
        }
    }
}

/// Lifecycle status of a call, using the telephony vendor's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    #[default]
    Initiated,
    Queued,
    Ringing,
    InProgress,
    Answered,
    Completed,
    Failed,
    Busy,
    NoAnswer,
    Canceled,
}

impl CallStatus {
    /// Terminal statuses freeze the call record.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Busy | Self::NoAnswer | Self::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Queued => "queued",
            Self::Ringing => "ringing",
            Self::InProgress => "in-progress",
            Self::Answered => "answered",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Busy => "busy",
            Self::NoAnswer => "no-answer",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "initiated" => Self::Initiated,
            "queued" => Self::Queued,
            "ringing" => Self::Ringing,
            "in-progress" => Self::InProgress,
            "answered" => Self::Answered,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "busy" => Self::Busy,
            "no-answer" => Self::NoAnswer,
            "canceled" | "cancelled" => Self::Canceled,
            _ => return Err(ParseError::new("call status", s)),
        };
        Ok(status)
    }
}

/// A scripted question asked during a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    /// Zero-based position within the module.
    pub order: u32,
    pub required: bool,
}

/// An ordered questionnaire. Immutable for the lifetime of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub id: String,
    pub name: String,
    pub questions: Vec<Question>,
}

/// Who is being called.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub name: Option<String>,
    pub phone: Option<String>,
}

/// Final judgement attached to a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub result: String,
    pub comments: String,
}

/// Party that produced a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Agent,
    Customer,
}

/// One line of the append-only call transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    /// Question this line answers or asks, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// RFC 3339 timestamp.
    pub at: String,
}

/// A single outbound call and everything learned during it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub id: String,
    pub module_id: String,
    pub customer: Customer,
    pub external_sid: Option<String>,
    pub voice: VoiceKind,
    pub status: CallStatus,
    pub duration_secs: Option<u32>,
    /// Index of the next webhook step. Never decreases.
    pub current_step: u32,
    /// Question ordinal (as a decimal string) to the customer's answer.
    pub responses: BTreeMap<String, String>,
    pub transcript: Vec<TranscriptEntry>,
    pub evaluation: Option<Evaluation>,
    pub recording_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Call {
    /// The most recent classified intent for each answered question, ordered
    /// by question index.
    pub fn answer_intents(&self) -> BTreeMap<usize, Intent> {
        let mut intents = BTreeMap::new();
        for entry in &self.transcript {
            if let (Speaker::Customer, Some(question), Some(intent)) =
                (entry.speaker, entry.question, entry.intent)
            {
                intents.insert(question, intent);
            }
        }
        intents
    }
}

/// What a synthesized line is used for. Stored with audio artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioCategory {
    Greeting,
    Confirmation,
    Question,
    Reprompt,
    Outro,
    System,
}

impl AudioCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::Confirmation => "confirmation",
            Self::Question => "question",
            Self::Reprompt => "reprompt",
            Self::Outro => "outro",
            Self::System => "system",
        }
    }
}

impl FromStr for AudioCategory {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "greeting" => Ok(Self::Greeting),
            "confirmation" => Ok(Self::Confirmation),
            "question" => Ok(Self::Question),
            "reprompt" => Ok(Self::Reprompt),
            "outro" => Ok(Self::Outro),
            "system" => Ok(Self::System),
            _ => Err(ParseError::new("audio category", s)),
        }
    }
}

/// Tier that produced a resolved line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AudioSource {
    Local,
    Durable,
    Synthesized,
    VendorFallback,
}

/// Bounded retry with exponential backoff for provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            base_delay_ms: 250,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// Policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}
