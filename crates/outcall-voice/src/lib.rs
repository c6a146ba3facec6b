//! Voice infrastructure for outbound calls.
//!
//! Two directions of speech pass through this crate:
//!
//! - **Outbound**: every scripted line is turned into a playable audio URL by
//!   the [`AudioResolver`], which checks the local disk cache, then the
//!   durable artifact store, then a speech-synthesis provider. When synthesis
//!   is unavailable the resolver answers with a vendor-TTS instruction
//!   instead of an error, so a line can always be spoken.
//! - **Inbound**: the [`SpeechGateway`] keeps one streaming recognition
//!   connection per call and emits typed partial/final transcript events.

pub mod cache;
pub mod config;
pub mod error;
pub mod resolver;
pub mod stt;
pub mod tts;

pub use cache::{artifact_key, ArtifactStore, LocalAudioCache, NewArtifact, SqliteArtifactStore};
pub use config::{AudioCacheConfig, RecognitionConfig, SynthesisConfig};
pub use error::VoiceError;
pub use resolver::{AudioResolver, ResolveOptions, ResolvedAudio};
pub use stt::{
    audio_channel, AudioFeed, AudioSink, DeepgramGateway, RecognitionEvent, RecognitionStream,
    SinkCommand, SpeechGateway, Transcript, Word,
};
pub use tts::{HttpSynthesizer, SpeechSynthesizer};
