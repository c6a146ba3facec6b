use crate::config::SynthesisConfig;
use crate::error::VoiceError;
use async_trait::async_trait;
use outcall_types::VoiceKind;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;

/// Maximum text input size for synthesis (4 KiB). A scripted line never
/// comes close; anything larger is a bug upstream.
const MAX_SYNTHESIS_INPUT_BYTES: usize = 4 * 1024;

/// Turns text into encoded audio (MP3).
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: VoiceKind) -> Result<Vec<u8>, VoiceError>;
}

#[derive(Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
}

/// Synthesis over the provider's HTTP API, with a per-attempt timeout and
/// bounded retries on throttling and server errors.
#[derive(Debug, Clone)]
pub struct HttpSynthesizer {
    client: reqwest::Client,
    config: SynthesisConfig,
}

impl HttpSynthesizer {
    pub fn new(config: SynthesisConfig) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    async fn attempt(&self, text: &str, voice: VoiceKind) -> Result<Vec<u8>, Attempt> {
        let url = format!(
            "{}/v1/text-to-speech/{}",
            self.config.base_url.trim_end_matches('/'),
            voice.synthesis_voice_id()
        );
        let body = SynthesisRequest {
            text,
            model_id: &self.config.model_id,
            voice_settings: VoiceSettings {
                stability: self.config.stability,
                similarity_boost: self.config.similarity_boost,
            },
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.config.api_key)
            .header("accept", "audio/mpeg")
            .json(&body)
            .send()
            .await
            .map_err(|e| Attempt::Retry(VoiceError::Http(e)))?;

        let status = response.status();
        if !status.is_success() {
            let error = VoiceError::Synthesis(format!("provider returned {status}"));
            return Err(if retryable(status) {
                Attempt::Retry(error)
            } else {
                Attempt::Fatal(error)
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Attempt::Retry(VoiceError::Http(e)))?;
        if bytes.is_empty() {
            return Err(Attempt::Fatal(VoiceError::Synthesis(
                "provider returned empty audio".to_string(),
            )));
        }
        Ok(bytes.to_vec())
    }
}

enum Attempt {
    Retry(VoiceError),
    Fatal(VoiceError),
}

fn retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str, voice: VoiceKind) -> Result<Vec<u8>, VoiceError> {
        if self.config.api_key.is_empty() {
            return Err(VoiceError::Config("synthesis API key not set".to_string()));
        }
        if text.trim().is_empty() {
            return Err(VoiceError::Synthesis("empty text".to_string()));
        }
        if text.len() > MAX_SYNTHESIS_INPUT_BYTES {
            return Err(VoiceError::Synthesis(format!(
                "text exceeds maximum size: {} bytes (limit: {} bytes)",
                text.len(),
                MAX_SYNTHESIS_INPUT_BYTES
            )));
        }

        let policy = self.config.retry;
        let attempts = policy.attempts.max(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            match self.attempt(text, voice).await {
                Ok(audio) => return Ok(audio),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(e)) => {
                    tracing::debug!(attempt, error = %e, "synthesis attempt failed");
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(policy.delay_for(attempt)).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| VoiceError::Synthesis("no synthesis attempt made".to_string())))
    }
}
