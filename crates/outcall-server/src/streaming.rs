//! Streaming conversation handler.
//!
//! Once the vendor forks call audio to `/voice/media`, a [`StreamingSession`]
//! takes over the conversation from the webhook controller. Recognizer finals
//! drive the shared stage machine; partials only feed the monitor. Lines are
//! spoken by replacing the live call's instructions through [`CallControl`].
//!
//! At most one final is processed at a time per session. Finals that arrive
//! while one is in flight are dropped, not queued.
//!
//! [`CallControl`]: crate::dialer::CallControl

use crate::api_monitor::MonitorEvent;
use crate::playback;
use crate::twiml::{Verb, VoiceResponse};
use crate::{now_rfc3339, with_conn, AppState, StoreError};
use outcall_calls::{
    append_transcript, apply_turn, get_call, get_module, CallError, TurnOutcome, TurnUpdate,
};
use outcall_dialog::{ConversationMachine, DialogEvent, DialogState, Stage, Transition};
use outcall_types::{CallStatus, Speaker, TranscriptEntry, VoiceKind};
use outcall_voice::{AudioSink, RecognitionEvent, Transcript, VoiceError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Silence held after each prompt while the customer answers.
pub const HOLD_SECS: u32 = 120;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("call {0} has already ended")]
    Ended(String),
    #[error("speech recognition unavailable: {0}")]
    Recognition(#[from] VoiceError),
}

/// Live conversation state for one streamed call.
pub struct StreamingSession {
    call_id: String,
    call_sid: Option<String>,
    voice: VoiceKind,
    machine: ConversationMachine,
    dialog: AsyncMutex<DialogState>,
    /// Latest partial transcript.
    partial: Mutex<String>,
    processing: AtomicBool,
    sink: AudioSink,
}

/// Holds the session's processing flag; releases it on drop.
pub struct ProcessingGuard {
    session: Arc<StreamingSession>,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.session.processing.store(false, Ordering::Release);
    }
}

impl StreamingSession {
    /// Opens a recognition session for `call_id`, registers it, and starts
    /// consuming recognizer events. Replaces any previous session for the
    /// call.
    pub async fn start(
        state: Arc<AppState>,
        call_id: &str,
        call_sid: Option<String>,
    ) -> Result<Arc<Self>, StreamError> {
        let id = call_id.to_string();
        let (call, module) = with_conn(&state.pool, move |conn| {
            let call = get_call(conn, &id)?;
            let module = get_module(conn, &call.module_id)?;
            Ok((call, module))
        })
        .await?;
        if call.status.is_terminal() {
            return Err(StreamError::Ended(call.id));
        }

        // The webhook has already greeted; streaming picks up at the
        // availability check at the earliest.
        let dialog = DialogState::resume(
            call.current_step.max(1),
            module.questions.len(),
            &call.answer_intents(),
        );
        let machine = ConversationMachine::new(
            Arc::new(module),
            Arc::clone(&state.script),
            call.customer.name.clone(),
            state.streaming_policy(),
        );
        let stream = state.gateway.open(&call.id).await?;

        tracing::info!(
            call_id = %call.id,
            step = dialog.step,
            stage = dialog.stage.name(),
            "streaming session started"
        );
        let session = Arc::new(Self {
            call_id: call.id.clone(),
            call_sid: call_sid.or(call.external_sid),
            voice: call.voice,
            machine,
            dialog: AsyncMutex::new(dialog),
            partial: Mutex::new(String::new()),
            processing: AtomicBool::new(false),
            sink: stream.sink,
        });

        if let Some(previous) = state.sessions.remove(&session.call_id) {
            tracing::info!(call_id = %session.call_id, "replacing existing streaming session");
            previous.stop();
        }
        state
            .sessions
            .put(session.call_id.clone(), Arc::clone(&session));
        tokio::spawn(run(Arc::clone(&session), state, stream.events));
        Ok(session)
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn sink(&self) -> &AudioSink {
        &self.sink
    }

    /// Asks the recognizer to flush and close. The session unregisters
    /// itself once the recognizer reports closed.
    pub fn stop(&self) {
        self.sink.finish();
    }

    pub fn partial_text(&self) -> String {
        self.partial_buffer().clone()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    pub async fn dialog_state(&self) -> DialogState {
        self.dialog.lock().await.clone()
    }

    /// Claims the processing flag, or returns `None` if a final is already
    /// being processed.
    pub fn try_begin(self: &Arc<Self>) -> Option<ProcessingGuard> {
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(ProcessingGuard {
            session: Arc::clone(self),
        })
    }

    fn partial_buffer(&self) -> MutexGuard<'_, String> {
        self.partial
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn on_partial(&self, state: &AppState, transcript: Transcript) {
        let text = transcript.text.trim();
        if text.is_empty() {
            return;
        }
        *self.partial_buffer() = text.to_string();

        if transcript.confidence > state.config.dialog.partial_signal_confidence {
            let question = self.dialog.lock().await.stage.question();
            let intent = state.classifier.keywords().classify(text);
            state
                .monitor
                .publish(
                    &self.call_id,
                    &MonitorEvent::Transcript {
                        speaker: Speaker::Customer,
                        text: text.to_string(),
                        question,
                        intent: Some(intent),
                        confidence: Some(transcript.confidence),
                        is_final: false,
                        at: now_rfc3339(),
                    },
                )
                .await;
        }
    }

    async fn on_final(&self, state: &AppState, transcript: Transcript) {
        let text = transcript.text.trim().to_string();
        self.partial_buffer().clear();

        let current = self.dialog.lock().await.clone();
        if current.is_done() {
            tracing::debug!(call_id = %self.call_id, "final after conversation ended, ignoring");
            return;
        }

        let event = self
            .event_for(state, &current, text, transcript.confidence)
            .await;
        let transition = self.machine.transition(&current, event);
        if transition.outputs.is_empty() {
            return;
        }

        let entries = transition.transcript_entries(&now_rfc3339());
        let mut stored = self.persist(state, &current, &transition, &entries).await;
        if matches!(&stored, Err(e) if !is_finalized(e)) {
            tracing::warn!(call_id = %self.call_id, "persisting streaming turn failed, retrying");
            stored = self.persist(state, &current, &transition, &entries).await;
        }
        match stored {
            Ok(()) => {}
            Err(StoreError::Call(CallError::Finalized { status, .. })) => {
                tracing::info!(call_id = %self.call_id, %status, "call ended, stopping stream");
                self.stop();
                return;
            }
            Err(e) => {
                tracing::error!(
                    call_id = %self.call_id,
                    stage = current.stage.name(),
                    "failed to persist streaming turn, asking again: {}",
                    e
                );
                self.ask_again(state, &current).await;
                return;
            }
        }

        *self.dialog.lock().await = transition.next.clone();
        self.publish(state, &transition, &entries).await;
        self.speak(state, &transition).await;

        if let Some((status, _)) = transition.finish() {
            let reason = match transition.next.stage {
                Stage::Done(ending) => ending.as_str(),
                _ => "completed",
            };
            state.monitor.end_call(&self.call_id, status, reason).await;
            self.stop();
        }
    }

    async fn event_for(
        &self,
        state: &AppState,
        current: &DialogState,
        text: String,
        confidence: f32,
    ) -> DialogEvent {
        let dialog = &state.config.dialog;
        if confidence < dialog.min_confidence || text.chars().count() < dialog.min_chars {
            tracing::debug!(call_id = %self.call_id, confidence, "unclear final");
            return DialogEvent::Unclear {
                text,
                confidence: Some(confidence),
            };
        }

        let context = match current.stage.question() {
            Some(q) => self.machine.question_text(q).unwrap_or_default(),
            None => state.script.availability_prompt.as_str(),
        };
        let intent = state.classifier.classify(&text, context).await.intent();
        DialogEvent::Answer {
            text,
            intent,
            confidence: Some(confidence),
        }
    }

    /// Stores the turn. Reprompts only append to the transcript; every other
    /// transition moves the stored step.
    async fn persist(
        &self,
        state: &AppState,
        current: &DialogState,
        transition: &Transition,
        transcript: &[TranscriptEntry],
    ) -> Result<(), StoreError> {
        let call_id = self.call_id.clone();
        if transition.next.step == current.step {
            if transcript.is_empty() {
                return Ok(());
            }
            let entries = transcript.to_vec();
            with_conn(&state.pool, move |conn| {
                append_transcript(conn, &call_id, &entries)
            })
            .await?;
            return Ok(());
        }

        let (status, evaluation) = match transition.finish() {
            Some((status, evaluation)) => (Some(status), Some(evaluation.clone())),
            None => (None, None),
        };
        let update = TurnUpdate {
            next_step: transition.next.step,
            responses: transition.responses(),
            transcript: transcript.to_vec(),
            status,
            evaluation,
        };
        let outcome =
            with_conn(&state.pool, move |conn| apply_turn(conn, &call_id, &update)).await?;
        if let TurnOutcome::Replayed(call) = outcome {
            tracing::warn!(
                call_id = %self.call_id,
                stored = call.current_step,
                step = transition.next.step,
                "call record is ahead of the streaming session"
            );
        }
        Ok(())
    }

    /// Repeats the request for the current stage without moving it.
    async fn ask_again(&self, state: &AppState, current: &DialogState) {
        let (Some(control), Some(sid)) = (&state.call_control, &self.call_sid) else {
            return;
        };
        let Some(text) = state.script.reprompt(current.stage.question().is_none(), 0) else {
            return;
        };
        let mut doc = VoiceResponse::new();
        doc.push(playback::system_line(&state.resolver, self.voice, text).await);
        doc.push(Verb::Pause { secs: HOLD_SECS });
        if let Err(e) = control.update_call(sid, &doc.render()).await {
            tracing::warn!(call_id = %self.call_id, "failed to update live call: {}", e);
        }
    }

    async fn publish(&self, state: &AppState, transition: &Transition, entries: &[TranscriptEntry]) {
        for entry in entries {
            state
                .monitor
                .publish(&self.call_id, &MonitorEvent::final_line(entry))
                .await;
        }
        state
            .monitor
            .publish(
                &self.call_id,
                &MonitorEvent::Stage {
                    stage: transition.next.stage.name(),
                    question: transition.next.stage.question(),
                    step: transition.next.step,
                    signal: transition.signals().last().cloned(),
                },
            )
            .await;
    }

    async fn speak(&self, state: &AppState, transition: &Transition) {
        let (Some(control), Some(sid)) = (&state.call_control, &self.call_sid) else {
            tracing::debug!(call_id = %self.call_id, "no live call control, not speaking");
            return;
        };

        let mut doc = VoiceResponse::new();
        let verbs = playback::line_verbs(
            &state.resolver,
            self.voice,
            &self.machine.module().id,
            transition.lines(),
        )
        .await;
        for verb in verbs {
            doc.push(verb);
        }
        if transition.hangs_up() {
            doc.push(Verb::Hangup);
        } else {
            doc.push(Verb::Pause { secs: HOLD_SECS });
        }

        if let Err(e) = control.update_call(sid, &doc.render()).await {
            tracing::warn!(call_id = %self.call_id, "failed to update live call: {}", e);
        }
    }
}

async fn run(
    session: Arc<StreamingSession>,
    state: Arc<AppState>,
    mut events: mpsc::Receiver<RecognitionEvent>,
) {
    while let Some(event) = events.recv().await {
        state.sessions.touch(&session.call_id);
        match event {
            RecognitionEvent::Partial(transcript) => session.on_partial(&state, transcript).await,
            RecognitionEvent::Final(transcript) => match session.try_begin() {
                Some(guard) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        guard.session.on_final(&state, transcript).await;
                        drop(guard);
                    });
                }
                None => {
                    tracing::debug!(
                        call_id = %session.call_id,
                        "final arrived while processing, dropping"
                    );
                }
            },
            RecognitionEvent::Error(e) => {
                tracing::warn!(call_id = %session.call_id, "speech recognition error: {}", e);
                state
                    .monitor
                    .publish(
                        &session.call_id,
                        &MonitorEvent::Status {
                            status: CallStatus::InProgress,
                            detail: Some(format!("speech recognition error: {e}")),
                        },
                    )
                    .await;
            }
            RecognitionEvent::Closed => break,
        }
    }

    release(&state, &session);
    tracing::debug!(call_id = %session.call_id, "streaming session closed");
}

fn is_finalized(e: &StoreError) -> bool {
    matches!(e, StoreError::Call(CallError::Finalized { .. }))
}

/// Unregisters `session` unless it has already been replaced.
fn release(state: &AppState, session: &Arc<StreamingSession>) {
    if let Some(current) = state.sessions.get(&session.call_id) {
        if Arc::ptr_eq(&current, session) {
            state.sessions.remove(&session.call_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outcall_dialog::{DialogPolicy, Script};
    use outcall_types::{Module, Question};

    fn session() -> Arc<StreamingSession> {
        let module = Module {
            id: "m".into(),
            name: "Survey".into(),
            questions: vec![Question {
                text: "Are you happy?".into(),
                order: 0,
                required: true,
            }],
        };
        let (sink, _feed) = outcall_voice::audio_channel();
        Arc::new(StreamingSession {
            call_id: "c-1".into(),
            call_sid: None,
            voice: VoiceKind::default(),
            machine: ConversationMachine::new(
                Arc::new(module),
                Arc::new(Script::default()),
                None,
                DialogPolicy::streaming(),
            ),
            dialog: AsyncMutex::new(DialogState::resume(1, 1, &Default::default())),
            partial: Mutex::new(String::new()),
            processing: AtomicBool::new(false),
            sink,
        })
    }

    #[test]
    fn only_one_final_in_flight() {
        let session = session();
        let guard = session.try_begin().expect("first claim");
        assert!(session.is_processing());
        assert!(session.try_begin().is_none());
        drop(guard);
        assert!(!session.is_processing());
        assert!(session.try_begin().is_some());
    }

    #[test]
    fn guard_releases_on_panic() {
        let session = session();
        let claimed = Arc::clone(&session);
        let result = std::thread::spawn(move || {
            let _guard = claimed.try_begin().expect("claim");
            panic!("processing failed");
        })
        .join();
        assert!(result.is_err());
        assert!(!session.is_processing());
    }
}
