//! Streaming speech recognition.
//!
//! A [`SpeechGateway`] opens one recognition session per call and hands back
//! a [`RecognitionStream`]: an [`AudioSink`] for raw telephony audio and an
//! `mpsc` receiver of [`RecognitionEvent`]s. Opening returns immediately; the
//! provider connection is established in the background and audio written
//! before it is open is discarded.

use crate::config::RecognitionConfig;
use crate::error::VoiceError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

/// Audio frames buffered between the media relay and the provider socket.
const AUDIO_CHANNEL_CAPACITY: usize = 512;

/// Events buffered between the provider socket and the consumer.
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// How long to wait for trailing results after asking the provider to close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// One recognized word with timing in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Word {
    pub word: String,
    #[serde(default)]
    pub start: f32,
    #[serde(default)]
    pub end: f32,
    #[serde(default)]
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub confidence: f32,
    pub words: Vec<Word>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// Interim hypothesis; later events may revise it.
    Partial(Transcript),
    /// Settled text for a stretch of speech.
    Final(Transcript),
    /// The connection failed or was lost. No further transcripts follow.
    Error(String),
    /// The session ended. Always the last event.
    Closed,
}

/// Commands flowing from the [`AudioSink`] to the provider connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkCommand {
    Audio(Vec<u8>),
    Finish,
}

/// Write side of a recognition session.
#[derive(Debug, Clone)]
pub struct AudioSink {
    tx: mpsc::Sender<SinkCommand>,
    open: Arc<AtomicBool>,
    /// Finish travels outside the audio queue so a full buffer cannot lose it.
    finish: Arc<Notify>,
}

/// Read side of [`AudioSink`], owned by the connection task.
#[derive(Debug)]
pub struct AudioFeed {
    rx: mpsc::Receiver<SinkCommand>,
    open: Arc<AtomicBool>,
    finish: Arc<Notify>,
}

/// Creates a connected sink/feed pair. The sink starts closed.
pub fn audio_channel() -> (AudioSink, AudioFeed) {
    let (tx, rx) = mpsc::channel(AUDIO_CHANNEL_CAPACITY);
    let open = Arc::new(AtomicBool::new(false));
    let finish = Arc::new(Notify::new());
    (
        AudioSink {
            tx,
            open: Arc::clone(&open),
            finish: Arc::clone(&finish),
        },
        AudioFeed { rx, open, finish },
    )
}

impl AudioSink {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queues one audio frame. Returns `false` when the frame was discarded
    /// because the connection is not open or is not keeping up.
    pub fn send_audio(&self, frame: Vec<u8>) -> bool {
        if !self.is_open() {
            tracing::trace!(bytes = frame.len(), "recognizer not open, dropping audio");
            return false;
        }
        match self.tx.try_send(SinkCommand::Audio(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("recognizer audio buffer full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Asks the provider to flush and close the session. Audio still queued
    /// is discarded.
    pub fn finish(&self) {
        self.open.store(false, Ordering::Release);
        self.finish.notify_one();
    }
}

impl AudioFeed {
    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    /// Next command; a pending finish wins over queued audio.
    pub async fn recv(&mut self) -> Option<SinkCommand> {
        tokio::select! {
            biased;
            () = self.finish.notified() => Some(SinkCommand::Finish),
            command = self.rx.recv() => command,
        }
    }
}

/// An open recognition session.
#[derive(Debug)]
pub struct RecognitionStream {
    pub sink: AudioSink,
    pub events: mpsc::Receiver<RecognitionEvent>,
}

#[async_trait]
pub trait SpeechGateway: Send + Sync {
    /// Starts a recognition session for `call_id`.
    async fn open(&self, call_id: &str) -> Result<RecognitionStream, VoiceError>;
}

/// [`SpeechGateway`] for Deepgram's live transcription WebSocket.
#[derive(Debug, Clone)]
pub struct DeepgramGateway {
    config: RecognitionConfig,
}

impl DeepgramGateway {
    pub fn new(config: RecognitionConfig) -> Self {
        Self { config }
    }

    /// Listen URL with the telephony-tuned query parameters.
    pub fn listen_url(&self) -> Result<url::Url, VoiceError> {
        let c = &self.config;
        let mut params: Vec<(&str, String)> = vec![
            ("model", c.model.clone()),
            ("encoding", c.encoding.clone()),
            ("sample_rate", c.sample_rate.to_string()),
            ("channels", "1".to_string()),
            ("interim_results", "true".to_string()),
            ("endpointing", c.endpointing_ms.to_string()),
            ("punctuate", "true".to_string()),
            ("smart_format", "true".to_string()),
        ];
        for keyword in &c.keywords {
            params.push(("keywords", keyword.clone()));
        }
        url::Url::parse_with_params(&c.url, &params)
            .map_err(|e| VoiceError::Config(format!("invalid recognition url: {e}")))
    }
}

#[async_trait]
impl SpeechGateway for DeepgramGateway {
    async fn open(&self, call_id: &str) -> Result<RecognitionStream, VoiceError> {
        if self.config.api_key.is_empty() {
            return Err(VoiceError::Config("recognition API key not set".to_string()));
        }
        let url = self.listen_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::Recognition(format!("bad request: {e}")))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.config.api_key))
            .map_err(|e| VoiceError::Config(format!("invalid API key header: {e}")))?;
        request.headers_mut().insert("Authorization", auth);

        let (sink, feed) = audio_channel();
        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let keepalive = Duration::from_secs(self.config.keepalive_secs.max(1));
        let call_id = call_id.to_string();

        tokio::spawn(async move {
            run_connection(request, connect_timeout, keepalive, feed, event_tx, &call_id).await;
        });

        Ok(RecognitionStream { sink, events })
    }
}

async fn run_connection(
    request: tokio_tungstenite::tungstenite::handshake::client::Request,
    connect_timeout: Duration,
    keepalive: Duration,
    mut feed: AudioFeed,
    events: mpsc::Sender<RecognitionEvent>,
    call_id: &str,
) {
    let connected =
        tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request)).await;
    let ws = match connected {
        Ok(Ok((ws, _))) => ws,
        Ok(Err(e)) => {
            tracing::error!(call_id, error = %e, "recognizer connection failed");
            let _ = events.send(RecognitionEvent::Error(e.to_string())).await;
            let _ = events.send(RecognitionEvent::Closed).await;
            return;
        }
        Err(_) => {
            tracing::error!(call_id, "recognizer connection timed out");
            let _ = events
                .send(RecognitionEvent::Error("connection timed out".to_string()))
                .await;
            let _ = events.send(RecognitionEvent::Closed).await;
            return;
        }
    };

    tracing::info!(call_id, "recognizer connected");
    feed.set_open(true);
    let (mut write, mut read) = ws.split();
    let mut ticker = tokio::time::interval(keepalive);
    let mut last_audio = Instant::now();
    let mut lost: Option<String> = None;

    loop {
        tokio::select! {
            command = feed.recv() => match command {
                Some(SinkCommand::Audio(frame)) => {
                    if let Err(e) = write.send(Message::Binary(frame.into())).await {
                        lost = Some(e.to_string());
                        break;
                    }
                    last_audio = Instant::now();
                }
                Some(SinkCommand::Finish) | None => {
                    feed.set_open(false);
                    let _ = write
                        .send(Message::Text(r#"{"type":"CloseStream"}"#.into()))
                        .await;
                    drain(&mut read, &events).await;
                    break;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = parse_message(text.as_str()) {
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    lost = Some(format!("provider closed the connection: {frame:?}"));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    lost = Some(e.to_string());
                    break;
                }
                None => {
                    lost = Some("connection ended".to_string());
                    break;
                }
            },
            _ = ticker.tick() => {
                if last_audio.elapsed() >= keepalive {
                    let _ = write.send(Message::Text(r#"{"type":"KeepAlive"}"#.into())).await;
                }
            }
        }
    }

    feed.set_open(false);
    if let Some(reason) = lost {
        tracing::warn!(call_id, reason = %reason, "recognizer connection lost");
        let _ = events.send(RecognitionEvent::Error(reason)).await;
    }
    let _ = events.send(RecognitionEvent::Closed).await;
    tracing::debug!(call_id, "recognizer session ended");
}

async fn drain<S>(read: &mut S, events: &mpsc::Sender<RecognitionEvent>)
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while let Ok(Some(Ok(message))) = tokio::time::timeout_at(deadline, read.next()).await {
        match message {
            Message::Text(text) => {
                if let Some(event) = parse_message(text.as_str()) {
                    let _ = events.send(event).await;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

#[derive(Deserialize)]
struct ProviderMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<ProviderChannel>,
    #[serde(default)]
    is_final: bool,
}

#[derive(Deserialize)]
struct ProviderChannel {
    #[serde(default)]
    alternatives: Vec<ProviderAlternative>,
}

#[derive(Deserialize)]
struct ProviderAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    words: Vec<Word>,
}

/// Maps one provider message to an event. Metadata, utterance markers and
/// empty hypotheses produce nothing.
pub fn parse_message(text: &str) -> Option<RecognitionEvent> {
    let message: ProviderMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unparseable recognizer message");
            return None;
        }
    };
    if message.kind != "Results" {
        return None;
    }

    let best = message.channel?.alternatives.into_iter().next()?;
    let text = best.transcript.trim().to_string();
    if text.is_empty() {
        return None;
    }
    let transcript = Transcript {
        text,
        confidence: best.confidence,
        words: best.words,
    };
    Some(if message.is_final {
        RecognitionEvent::Final(transcript)
    } else {
        RecognitionEvent::Partial(transcript)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_results_become_final_events() {
        let raw = r#"{
            "type": "Results",
            "is_final": true,
            "speech_final": true,
            "channel": {"alternatives": [{
                "transcript": "yes please",
                "confidence": 0.93,
                "words": [{"word": "yes", "start": 0.1, "end": 0.4, "confidence": 0.95}]
            }]}
        }"#;
        match parse_message(raw) {
            Some(RecognitionEvent::Final(t)) => {
                assert_eq!(t.text, "yes please");
                assert!((t.confidence - 0.93).abs() < f32::EPSILON);
                assert_eq!(t.words[0].word, "yes");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn interim_results_become_partials() {
        let raw = r#"{"type":"Results","is_final":false,
            "channel":{"alternatives":[{"transcript":"ye","confidence":0.4}]}}"#;
        assert!(matches!(
            parse_message(raw),
            Some(RecognitionEvent::Partial(_))
        ));
    }

    #[test]
    fn empty_and_metadata_messages_are_ignored() {
        let empty = r#"{"type":"Results","is_final":true,
            "channel":{"alternatives":[{"transcript":"  ","confidence":0.0}]}}"#;
        assert_eq!(parse_message(empty), None);
        assert_eq!(parse_message(r#"{"type":"Metadata","request_id":"x"}"#), None);
        assert_eq!(parse_message("not json"), None);
    }

    #[tokio::test]
    async fn sink_drops_audio_until_open() {
        let (sink, mut feed) = audio_channel();
        assert!(!sink.send_audio(vec![0xff; 160]));

        feed.set_open(true);
        assert!(sink.send_audio(vec![0x7f; 160]));
        assert_eq!(feed.recv().await, Some(SinkCommand::Audio(vec![0x7f; 160])));
    }

    #[tokio::test]
    async fn finish_is_delivered_when_audio_buffer_is_full() {
        let (sink, mut feed) = audio_channel();
        feed.set_open(true);
        let mut queued = 0;
        while sink.send_audio(vec![0x7f; 160]) {
            queued += 1;
        }
        assert_eq!(queued, AUDIO_CHANNEL_CAPACITY);

        sink.finish();
        assert!(!sink.is_open());
        assert_eq!(feed.recv().await, Some(SinkCommand::Finish));
        assert!(!sink.send_audio(vec![0x7f; 160]));
    }

    #[test]
    fn listen_url_carries_telephony_params() {
        let gateway = DeepgramGateway::new(RecognitionConfig::default());
        let url = gateway.listen_url().expect("url");
        let query = url.query().unwrap_or_default();
        assert!(query.contains("encoding=mulaw"));
        assert!(query.contains("sample_rate=8000"));
        assert!(query.contains("endpointing=300"));
        assert!(query.contains("interim_results=true"));
        assert!(query.contains("keywords=yes%3A2"));
    }

    #[tokio::test]
    async fn open_without_key_is_a_config_error() {
        let gateway = DeepgramGateway::new(RecognitionConfig::default());
        let err = gateway.open("call-1").await.expect_err("no key");
        assert!(matches!(err, VoiceError::Config(_)));
    }
}
