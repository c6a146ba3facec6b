//! Conversation logic for scripted outbound calls.
//!
//! - [`intent`] grades a free-text answer as YES, NO or MAYBE, asking a
//!   language model first and falling back to keyword matching.
//! - [`script`] holds the fixed lines the agent speaks.
//! - [`outro`] turns the graded answers into the closing line and the
//!   call's evaluation.
//! - [`machine`] is the stage machine shared by the webhook controller and
//!   the streaming handler: `transition(state, event) -> (next, outputs)`.
//!
//! Nothing here performs I/O except the model client in [`intent`].

pub mod error;
pub mod intent;
pub mod machine;
pub mod outro;
pub mod script;

pub use error::DialogError;
pub use intent::{
    ChatIntentModel, Classification, ClassifierConfig, IntentClassifier, IntentModel,
    IntentPrompt, KeywordClassifier,
};
pub use machine::{
    AvailabilityFallback, ConversationMachine, DialogEvent, DialogPolicy, DialogState, Ending,
    Line, LineScope, Output, Signal, Stage, Transition, NO_CLEAR_RESPONSE,
};
pub use outro::{evaluate_answers, evaluation_for_status, OutroTone};
pub use script::Script;
