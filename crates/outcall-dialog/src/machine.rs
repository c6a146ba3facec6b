//! The conversation stage machine.
//!
//! Both transports drive the same pure function:
//! `transition(state, event) -> Transition { next, outputs }`. The webhook
//! controller feeds one event per HTTP turn and rebuilds the state from the
//! persisted step; the streaming handler keeps the state in memory and feeds
//! final transcripts as they arrive. Everything the caller must do (speak,
//! listen, persist, hang up, notify observers) comes back as [`Output`]s, in
//! order.
//!
//! A call moves Greeting -> AwaitingAvailability -> AwaitingAnswer(0..n) ->
//! Done. `step` is the stage ordinal (0 greeting, 1 availability, `2 + i`
//! question `i`): it moves forward with the stage and stays put on a
//! reprompt, so a persisted step always resumes the same stage.

use std::collections::BTreeMap;
use std::sync::Arc;

use outcall_types::{
    AudioCategory, CallStatus, Evaluation, Intent, Module, Speaker, TranscriptEntry,
};
use serde::Serialize;

use crate::outro::{self, OutroTone};
use crate::script::Script;

/// Transcript text recorded when a question is skipped after the reprompt
/// budget is spent. Never stored as a response.
pub const NO_CLEAR_RESPONSE: &str = "no clear response";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    Completed,
    Declined,
    NoResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Greeting,
    AwaitingAvailability,
    AwaitingAnswer(usize),
    Done(Ending),
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::AwaitingAvailability => "awaiting_availability",
            Self::AwaitingAnswer(_) => "awaiting_answer",
            Self::Done(_) => "done",
        }
    }

    pub fn question(self) -> Option<usize> {
        match self {
            Self::AwaitingAnswer(q) => Some(q),
            _ => None,
        }
    }
}

impl Ending {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Declined => "declined",
            Self::NoResponse => "no_response",
        }
    }
}

/// Where a call stands in its conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogState {
    pub stage: Stage,
    /// Stage ordinal; unchanged by reprompts.
    pub step: u32,
    /// Consecutive unclear answers in the current stage. Not persisted.
    pub reprompts: u32,
    /// Classified answer per question; `None` until answered or when the
    /// question was skipped.
    pub intents: Vec<Option<Intent>>,
}

impl DialogState {
    pub fn new(question_count: usize) -> Self {
        Self {
            stage: Stage::Greeting,
            step: 0,
            reprompts: 0,
            intents: vec![None; question_count],
        }
    }

    /// Rebuilds the state for webhook step `step`, where each step is one
    /// stage: 0 greeting, 1 availability, `2 + i` question `i`. Steps past the
    /// last question map to a completed call.
    ///
    /// Only answers to questions before the current one are carried over, so
    /// replaying an old step sees the same state it saw the first time.
    pub fn resume(step: u32, question_count: usize, answered: &BTreeMap<usize, Intent>) -> Self {
        let stage = match step {
            0 => Stage::Greeting,
            1 => Stage::AwaitingAvailability,
            n if (n as usize - 2) < question_count => Stage::AwaitingAnswer(n as usize - 2),
            _ => Stage::Done(Ending::Completed),
        };
        let cutoff = match stage {
            Stage::AwaitingAnswer(q) => q,
            Stage::Done(_) => question_count,
            _ => 0,
        };
        let mut intents = vec![None; question_count];
        for (&question, &intent) in answered.range(..cutoff) {
            if let Some(slot) = intents.get_mut(question) {
                *slot = Some(intent);
            }
        }
        Self {
            stage,
            step,
            reprompts: 0,
            intents,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.stage, Stage::Done(_))
    }

    fn answered(&self) -> BTreeMap<usize, Intent> {
        self.intents
            .iter()
            .enumerate()
            .filter_map(|(q, intent)| intent.map(|i| (q, i)))
            .collect()
    }
}

/// Input to the machine. Transports decide whether a transcript is clear.
#[derive(Debug, Clone, PartialEq)]
pub enum DialogEvent {
    CallAnswered,
    Answer {
        text: String,
        intent: Intent,
        confidence: Option<f32>,
    },
    Unclear {
        text: String,
        confidence: Option<f32>,
    },
}

/// How widely a spoken line can be cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineScope {
    /// Same for every call.
    Shared,
    /// Belongs to the call's module.
    Module,
    /// Specific to one call.
    Call,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    pub category: AudioCategory,
    pub scope: LineScope,
    pub question: Option<usize>,
}

/// Progress notifications for observers. Never drive state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    Proceeding,
    Reprompt { question: Option<usize>, attempt: u32 },
    NextQuestion { question: usize },
    AllAnswered,
    Declined,
    NoResponse,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Say(Line),
    /// Open the microphone for up to `timeout_secs`.
    Listen { timeout_secs: u32 },
    /// Store `text` as the response to `question`.
    RecordAnswer { question: usize, text: String },
    /// The customer said something worth keeping in the transcript.
    Heard {
        text: String,
        question: Option<usize>,
        intent: Option<Intent>,
        confidence: Option<f32>,
    },
    Signal(Signal),
    Hangup,
    Finish {
        status: CallStatus,
        evaluation: Evaluation,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: DialogState,
    pub outputs: Vec<Output>,
}

impl Transition {
    pub fn responses(&self) -> Vec<(usize, String)> {
        self.outputs
            .iter()
            .filter_map(|o| match o {
                Output::RecordAnswer { question, text } => Some((*question, text.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn finish(&self) -> Option<(CallStatus, &Evaluation)> {
        self.outputs.iter().find_map(|o| match o {
            Output::Finish { status, evaluation } => Some((*status, evaluation)),
            _ => None,
        })
    }

    pub fn lines(&self) -> impl Iterator<Item = &Line> {
        self.outputs.iter().filter_map(|o| match o {
            Output::Say(line) => Some(line),
            _ => None,
        })
    }

    pub fn signals(&self) -> impl Iterator<Item = &Signal> {
        self.outputs.iter().filter_map(|o| match o {
            Output::Signal(signal) => Some(signal),
            _ => None,
        })
    }

    pub fn listen_secs(&self) -> Option<u32> {
        self.outputs.iter().find_map(|o| match o {
            Output::Listen { timeout_secs } => Some(*timeout_secs),
            _ => None,
        })
    }

    pub fn hangs_up(&self) -> bool {
        self.outputs.iter().any(|o| matches!(o, Output::Hangup))
    }

    /// Transcript lines for this transition, stamped with `at`.
    pub fn transcript_entries(&self, at: &str) -> Vec<TranscriptEntry> {
        self.outputs
            .iter()
            .filter_map(|o| match o {
                Output::Say(line) => Some(TranscriptEntry {
                    speaker: Speaker::Agent,
                    text: line.text.clone(),
                    question: line.question,
                    intent: None,
                    confidence: None,
                    at: at.to_string(),
                }),
                Output::Heard {
                    text,
                    question,
                    intent,
                    confidence,
                } => Some(TranscriptEntry {
                    speaker: Speaker::Customer,
                    text: text.clone(),
                    question: *question,
                    intent: *intent,
                    confidence: *confidence,
                    at: at.to_string(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// What to do when the availability check stays unclear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityFallback {
    /// Hang up and mark the call no-answer.
    NoResponse,
    /// Treat it as a decline.
    Decline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialogPolicy {
    pub max_reprompts: u32,
    pub availability_fallback: AvailabilityFallback,
    pub greeting_listen_secs: u32,
    pub answer_listen_secs: u32,
}

impl DialogPolicy {
    /// One shot per stage: silence at the availability check ends the call.
    pub fn webhook() -> Self {
        Self {
            max_reprompts: 0,
            availability_fallback: AvailabilityFallback::NoResponse,
            greeting_listen_secs: 12,
            answer_listen_secs: 20,
        }
    }

    pub fn streaming() -> Self {
        Self {
            max_reprompts: 2,
            availability_fallback: AvailabilityFallback::Decline,
            greeting_listen_secs: 12,
            answer_listen_secs: 20,
        }
    }
}

/// The conversation for one module and customer.
pub struct ConversationMachine {
    module: Arc<Module>,
    script: Arc<Script>,
    customer_name: Option<String>,
    policy: DialogPolicy,
}

impl ConversationMachine {
    pub fn new(
        module: Arc<Module>,
        script: Arc<Script>,
        customer_name: Option<String>,
        policy: DialogPolicy,
    ) -> Self {
        Self {
            module,
            script,
            customer_name,
            policy,
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn policy(&self) -> DialogPolicy {
        self.policy
    }

    pub fn question_count(&self) -> usize {
        self.module.questions.len()
    }

    /// The text of question `index`, for classifier context.
    pub fn question_text(&self, index: usize) -> Option<&str> {
        self.module.questions.get(index).map(|q| q.text.as_str())
    }

    pub fn transition(&self, state: &DialogState, event: DialogEvent) -> Transition {
        let mut next = state.clone();
        let mut outputs = Vec::new();

        match state.stage {
            Stage::Done(_) => {
                return Transition { next, outputs };
            }
            Stage::Greeting => self.greet(&mut next, &mut outputs),
            Stage::AwaitingAvailability => match event {
                DialogEvent::CallAnswered => {
                    return Transition { next, outputs };
                }
                DialogEvent::Answer {
                    text,
                    intent,
                    confidence,
                } => {
                    let heard = Output::Heard {
                        text: text.clone(),
                        question: None,
                        intent: Some(intent),
                        confidence,
                    };
                    match intent {
                        Intent::Yes => {
                            outputs.push(heard);
                            self.proceed(&mut next, &mut outputs);
                        }
                        Intent::No => {
                            outputs.push(heard);
                            self.decline(&mut next, &mut outputs, "customer declined the call");
                        }
                        Intent::Maybe => {
                            self.availability_unclear(&mut next, &mut outputs, &text, confidence)
                        }
                    }
                }
                DialogEvent::Unclear { text, confidence } => {
                    self.availability_unclear(&mut next, &mut outputs, &text, confidence)
                }
            },
            Stage::AwaitingAnswer(question) => match event {
                DialogEvent::CallAnswered => {
                    return Transition { next, outputs };
                }
                DialogEvent::Answer {
                    text,
                    intent,
                    confidence,
                } => {
                    outputs.push(Output::RecordAnswer {
                        question,
                        text: text.clone(),
                    });
                    outputs.push(Output::Heard {
                        text,
                        question: Some(question),
                        intent: Some(intent),
                        confidence,
                    });
                    if let Some(slot) = next.intents.get_mut(question) {
                        *slot = Some(intent);
                    }
                    self.advance(&mut next, &mut outputs, question);
                }
                DialogEvent::Unclear { text, confidence } => {
                    self.answer_unclear(&mut next, &mut outputs, question, &text, confidence)
                }
            },
        }

        if next.stage != state.stage {
            next.step = state.step.saturating_add(1);
        }
        Transition { next, outputs }
    }

    fn say(&self, outputs: &mut Vec<Output>, text: &str, category: AudioCategory, scope: LineScope) {
        outputs.push(Output::Say(Line {
            text: text.to_string(),
            category,
            scope,
            question: None,
        }));
    }

    fn greet(&self, next: &mut DialogState, outputs: &mut Vec<Output>) {
        let greeting = self
            .script
            .greeting_for(self.customer_name.as_deref(), &self.module.name);
        let scope = if self.script.greeting_is_personal() {
            LineScope::Call
        } else {
            LineScope::Module
        };
        self.say(outputs, &greeting, AudioCategory::Greeting, scope);
        self.say(
            outputs,
            &self.script.availability_prompt,
            AudioCategory::Greeting,
            LineScope::Shared,
        );
        outputs.push(Output::Listen {
            timeout_secs: self.policy.greeting_listen_secs,
        });
        next.stage = Stage::AwaitingAvailability;
        next.reprompts = 0;
    }

    fn proceed(&self, next: &mut DialogState, outputs: &mut Vec<Output>) {
        outputs.push(Output::Signal(Signal::Proceeding));
        self.say(
            outputs,
            &self.script.confirmation,
            AudioCategory::Confirmation,
            LineScope::Shared,
        );
        next.reprompts = 0;
        if self.question_count() == 0 {
            self.complete(next, outputs);
        } else {
            self.ask(next, outputs, 0);
        }
    }

    fn ask(&self, next: &mut DialogState, outputs: &mut Vec<Output>, question: usize) {
        outputs.push(Output::Signal(Signal::NextQuestion { question }));
        if let Some(q) = self.module.questions.get(question) {
            outputs.push(Output::Say(Line {
                text: q.text.clone(),
                category: AudioCategory::Question,
                scope: LineScope::Module,
                question: Some(question),
            }));
        }
        outputs.push(Output::Listen {
            timeout_secs: self.policy.answer_listen_secs,
        });
        next.stage = Stage::AwaitingAnswer(question);
        next.reprompts = 0;
    }

    fn advance(&self, next: &mut DialogState, outputs: &mut Vec<Output>, answered: usize) {
        if answered + 1 < self.question_count() {
            self.ask(next, outputs, answered + 1);
        } else {
            self.complete(next, outputs);
        }
    }

    fn complete(&self, next: &mut DialogState, outputs: &mut Vec<Output>) {
        outputs.push(Output::Signal(Signal::AllAnswered));
        let answered = next.answered();
        let tone = OutroTone::from_intents(answered.values().copied());
        self.say(outputs, tone.line(&self.script), AudioCategory::Outro, LineScope::Shared);
        self.say(outputs, &self.script.farewell, AudioCategory::Outro, LineScope::Shared);
        outputs.push(Output::Hangup);
        outputs.push(Output::Finish {
            status: CallStatus::Completed,
            evaluation: outro::evaluate_answers(&answered, self.question_count()),
        });
        next.stage = Stage::Done(Ending::Completed);
        next.reprompts = 0;
    }

    fn decline(&self, next: &mut DialogState, outputs: &mut Vec<Output>, reason: &str) {
        outputs.push(Output::Signal(Signal::Declined));
        self.say(outputs, &self.script.decline, AudioCategory::Outro, LineScope::Shared);
        outputs.push(Output::Hangup);
        outputs.push(Output::Finish {
            status: CallStatus::Completed,
            evaluation: outro::declined(reason),
        });
        next.stage = Stage::Done(Ending::Declined);
        next.reprompts = 0;
    }

    fn heard_unclear(
        outputs: &mut Vec<Output>,
        text: &str,
        question: Option<usize>,
        confidence: Option<f32>,
    ) {
        if !text.trim().is_empty() {
            outputs.push(Output::Heard {
                text: text.trim().to_string(),
                question,
                intent: None,
                confidence,
            });
        }
    }

    fn reprompt(
        &self,
        next: &mut DialogState,
        outputs: &mut Vec<Output>,
        question: Option<usize>,
    ) {
        let attempt = next.reprompts + 1;
        next.reprompts = attempt;
        outputs.push(Output::Signal(Signal::Reprompt { question, attempt }));
        if let Some(text) = self.script.reprompt(question.is_none(), attempt - 1) {
            self.say(outputs, text, AudioCategory::Reprompt, LineScope::Shared);
        }
        let timeout_secs = match question {
            None => self.policy.greeting_listen_secs,
            Some(_) => self.policy.answer_listen_secs,
        };
        outputs.push(Output::Listen { timeout_secs });
    }

    fn availability_unclear(
        &self,
        next: &mut DialogState,
        outputs: &mut Vec<Output>,
        text: &str,
        confidence: Option<f32>,
    ) {
        Self::heard_unclear(outputs, text, None, confidence);
        if next.reprompts < self.policy.max_reprompts {
            self.reprompt(next, outputs, None);
            return;
        }
        match self.policy.availability_fallback {
            AvailabilityFallback::Decline => {
                self.decline(next, outputs, "no clear answer to the availability check")
            }
            AvailabilityFallback::NoResponse => {
                outputs.push(Output::Signal(Signal::NoResponse));
                self.say(
                    outputs,
                    &self.script.no_response,
                    AudioCategory::System,
                    LineScope::Shared,
                );
                outputs.push(Output::Hangup);
                outputs.push(Output::Finish {
                    status: CallStatus::NoAnswer,
                    evaluation: outro::no_response(),
                });
                next.stage = Stage::Done(Ending::NoResponse);
                next.reprompts = 0;
            }
        }
    }

    fn answer_unclear(
        &self,
        next: &mut DialogState,
        outputs: &mut Vec<Output>,
        question: usize,
        text: &str,
        confidence: Option<f32>,
    ) {
        if next.reprompts < self.policy.max_reprompts {
            Self::heard_unclear(outputs, text, Some(question), confidence);
            self.reprompt(next, outputs, Some(question));
            return;
        }
        outputs.push(Output::Heard {
            text: NO_CLEAR_RESPONSE.to_string(),
            question: Some(question),
            intent: None,
            confidence,
        });
        if let Some(slot) = next.intents.get_mut(question) {
            *slot = None;
        }
        self.advance(next, outputs, question);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outcall_types::Question;

    fn module(questions: &[&str]) -> Arc<Module> {
        Arc::new(Module {
            id: "refi".into(),
            name: "Refinance".into(),
            questions: questions
                .iter()
                .enumerate()
                .map(|(i, text)| Question {
                    text: text.to_string(),
                    order: i as u32,
                    required: true,
                })
                .collect(),
        })
    }

    fn machine(questions: &[&str], policy: DialogPolicy) -> ConversationMachine {
        ConversationMachine::new(
            module(questions),
            Arc::new(Script::default()),
            Some("Dana".into()),
            policy,
        )
    }

    fn answer(text: &str, intent: Intent) -> DialogEvent {
        DialogEvent::Answer {
            text: text.into(),
            intent,
            confidence: Some(0.9),
        }
    }

    fn unclear() -> DialogEvent {
        DialogEvent::Unclear {
            text: "mm".into(),
            confidence: Some(0.2),
        }
    }

    #[test]
    fn greeting_opens_availability_check() {
        let m = machine(&["Q1"], DialogPolicy::webhook());
        let t = m.transition(&DialogState::new(1), DialogEvent::CallAnswered);
        assert_eq!(t.next.stage, Stage::AwaitingAvailability);
        assert_eq!(t.next.step, 1);
        assert_eq!(t.listen_secs(), Some(12));
        let first = t.lines().next().expect("greeting");
        assert!(first.text.starts_with("Hello Dana"));
        assert_eq!(first.scope, LineScope::Call);
    }

    #[test]
    fn two_question_scenario_completes() {
        let m = machine(&["Do you own?", "Any debts?"], DialogPolicy::webhook());
        let mut state = DialogState::new(2);
        let mut responses = Vec::new();
        for event in [
            DialogEvent::CallAnswered,
            answer("yes", Intent::Yes),
            answer("fifty thousand", Intent::Maybe),
            answer("no", Intent::No),
        ] {
            let t = m.transition(&state, event);
            assert!(t.next.step > state.step);
            responses.extend(t.responses());
            if t.next.is_done() {
                let (status, evaluation) = t.finish().expect("finish");
                assert_eq!(status, CallStatus::Completed);
                assert_eq!(evaluation.result, "undecided");
                assert!(t.hangs_up());
            }
            state = t.next;
        }
        assert_eq!(state.stage, Stage::Done(Ending::Completed));
        assert_eq!(
            responses,
            vec![(0, "fifty thousand".to_string()), (1, "no".to_string())]
        );
    }

    #[test]
    fn unclear_availability_on_webhook_is_no_answer() {
        let m = machine(&["Q1"], DialogPolicy::webhook());
        let state = DialogState::resume(1, 1, &BTreeMap::new());
        let t = m.transition(
            &state,
            DialogEvent::Unclear {
                text: String::new(),
                confidence: None,
            },
        );
        assert_eq!(t.next.stage, Stage::Done(Ending::NoResponse));
        assert_eq!(t.finish().map(|(s, _)| s), Some(CallStatus::NoAnswer));
        assert!(t.responses().is_empty());
        assert!(t.transcript_entries("t").iter().all(|e| e.speaker == Speaker::Agent));
    }

    #[test]
    fn declined_availability_hangs_up() {
        let m = machine(&["Q1"], DialogPolicy::webhook());
        let state = DialogState::resume(1, 1, &BTreeMap::new());
        let t = m.transition(&state, answer("no thanks", Intent::No));
        assert_eq!(t.next.stage, Stage::Done(Ending::Declined));
        let (status, evaluation) = t.finish().expect("finish");
        assert_eq!(status, CallStatus::Completed);
        assert_eq!(evaluation.result, "declined");
    }

    #[test]
    fn reprompts_are_bounded_then_force_progress() {
        let m = machine(&["Q1", "Q2"], DialogPolicy::streaming());
        let mut state = DialogState::resume(2, 2, &BTreeMap::new());
        assert_eq!(state.stage, Stage::AwaitingAnswer(0));

        for attempt in 1..=2 {
            let t = m.transition(&state, unclear());
            assert_eq!(t.next.stage, Stage::AwaitingAnswer(0));
            assert_eq!(t.next.step, 2);
            assert_eq!(t.next.reprompts, attempt);
            assert!(t
                .signals()
                .any(|s| *s == Signal::Reprompt { question: Some(0), attempt }));
            assert!(t.responses().is_empty());
            state = t.next;
        }

        let t = m.transition(&state, unclear());
        assert_eq!(t.next.stage, Stage::AwaitingAnswer(1));
        assert_eq!(t.next.step, 3);
        assert_eq!(t.next.reprompts, 0);
        assert!(t.responses().is_empty());
        let entries = t.transcript_entries("t");
        assert!(entries
            .iter()
            .any(|e| e.speaker == Speaker::Customer && e.text == NO_CLEAR_RESPONSE));
    }

    #[test]
    fn streaming_availability_assumes_decline_after_reprompts() {
        let m = machine(&["Q1"], DialogPolicy::streaming());
        let mut state = DialogState::resume(1, 1, &BTreeMap::new());
        for _ in 0..2 {
            state = m.transition(&state, unclear()).next;
        }
        assert_eq!(state.reprompts, 2);
        let t = m.transition(&state, answer("hmm maybe", Intent::Maybe));
        assert_eq!(t.next.stage, Stage::Done(Ending::Declined));
    }

    #[test]
    fn resuming_after_a_reprompt_lands_on_the_same_stage() {
        let m = machine(&["Q1", "Q2"], DialogPolicy::streaming());
        let answered = BTreeMap::new();

        let at_availability = DialogState::resume(1, 2, &answered);
        let t = m.transition(&at_availability, unclear());
        assert_eq!(t.next.stage, Stage::AwaitingAvailability);
        assert_eq!(t.next.step, 1);
        let resumed = DialogState::resume(t.next.step, 2, &answered);
        assert_eq!(resumed.stage, Stage::AwaitingAvailability);

        let at_question = DialogState::resume(2, 2, &answered);
        let t = m.transition(&at_question, unclear());
        assert_eq!(t.next.stage, Stage::AwaitingAnswer(0));
        let resumed = DialogState::resume(t.next.step, 2, &answered);
        assert_eq!(resumed.stage, Stage::AwaitingAnswer(0));
        assert_eq!(resumed.reprompts, 0);
    }

    #[test]
    fn reprompt_lines_get_more_directive() {
        let script = Script::default();
        let m = machine(&["Q1"], DialogPolicy::streaming());
        let state = DialogState::resume(2, 1, &BTreeMap::new());
        let first = m.transition(&state, unclear());
        let second = m.transition(&first.next, unclear());
        let text = |t: &Transition| t.lines().next().map(|l| l.text.clone());
        assert_eq!(text(&first), Some(script.question_reprompts[0].clone()));
        assert_eq!(text(&second), Some(script.question_reprompts[1].clone()));
    }

    #[test]
    fn resume_ignores_answers_at_or_after_the_current_question() {
        let answered: BTreeMap<usize, Intent> =
            [(0, Intent::Yes), (1, Intent::No)].into_iter().collect();
        let state = DialogState::resume(3, 3, &answered);
        assert_eq!(state.stage, Stage::AwaitingAnswer(1));
        assert_eq!(state.intents, vec![Some(Intent::Yes), None, None]);

        let done = DialogState::resume(9, 3, &answered);
        assert_eq!(done.stage, Stage::Done(Ending::Completed));
    }

    #[test]
    fn done_state_ignores_events() {
        let m = machine(&["Q1"], DialogPolicy::webhook());
        let state = DialogState::resume(5, 1, &BTreeMap::new());
        let t = m.transition(&state, answer("yes", Intent::Yes));
        assert!(t.outputs.is_empty());
        assert_eq!(t.next, state);
    }

    #[test]
    fn module_without_questions_goes_straight_to_outro() {
        let m = machine(&[], DialogPolicy::webhook());
        let state = DialogState::resume(1, 0, &BTreeMap::new());
        let t = m.transition(&state, answer("sure", Intent::Yes));
        assert_eq!(t.next.stage, Stage::Done(Ending::Completed));
        assert!(t.signals().any(|s| *s == Signal::AllAnswered));
    }
}
