use outcall_types::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

fn default_synthesis_base_url() -> String {
    "https://api.elevenlabs.io".to_string()
}

fn default_synthesis_model() -> String {
    "eleven_turbo_v2_5".to_string()
}

fn default_synthesis_timeout_secs() -> u64 {
    15
}

fn default_stability() -> f32 {
    0.5
}

fn default_similarity_boost() -> f32 {
    0.75
}

/// Speech-synthesis provider settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// Provider API key. Synthesis is skipped (vendor TTS is used) when empty.
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_synthesis_base_url")]
    pub base_url: String,
    #[serde(default = "default_synthesis_model")]
    pub model_id: String,
    /// Per-attempt request timeout.
    #[serde(default = "default_synthesis_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_stability")]
    pub stability: f32,
    #[serde(default = "default_similarity_boost")]
    pub similarity_boost: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_synthesis_base_url(),
            model_id: default_synthesis_model(),
            timeout_secs: default_synthesis_timeout_secs(),
            retry: RetryPolicy::default(),
            stability: default_stability(),
            similarity_boost: default_similarity_boost(),
        }
    }
}

impl fmt::Debug for SynthesisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthesisConfig")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("model_id", &self.model_id)
            .field("timeout_secs", &self.timeout_secs)
            .field("retry", &self.retry)
            .finish()
    }
}

fn default_recognition_url() -> String {
    "wss://api.deepgram.com/v1/listen".to_string()
}

fn default_recognition_model() -> String {
    "nova-2-phonecall".to_string()
}

fn default_encoding() -> String {
    "mulaw".to_string()
}

fn default_sample_rate() -> u32 {
    8_000
}

fn default_endpointing_ms() -> u32 {
    300
}

fn default_keywords() -> Vec<String> {
    ["yes:2", "no:2", "yeah:1.5", "nope:1.5", "sure:1.5", "maybe:1.5"]
        .iter()
        .map(|k| k.to_string())
        .collect()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_keepalive_secs() -> u64 {
    5
}

/// Streaming speech-recognition settings. Defaults are tuned for μ-law
/// 8 kHz telephony audio.
#[derive(Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_recognition_url")]
    pub url: String,
    #[serde(default = "default_recognition_model")]
    pub model: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Silence, in milliseconds, that ends an utterance.
    #[serde(default = "default_endpointing_ms")]
    pub endpointing_ms: u32,
    /// `word:boost` pairs for short answers the model tends to miss.
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle interval after which a keep-alive frame is sent.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: default_recognition_url(),
            model: default_recognition_model(),
            encoding: default_encoding(),
            sample_rate: default_sample_rate(),
            endpointing_ms: default_endpointing_ms(),
            keywords: default_keywords(),
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

impl fmt::Debug for RecognitionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecognitionConfig")
            .field("api_key", &"[REDACTED]")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("encoding", &self.encoding)
            .field("sample_rate", &self.sample_rate)
            .field("endpointing_ms", &self.endpointing_ms)
            .field("keywords", &self.keywords)
            .finish()
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data/audio")
}

fn default_public_base_url() -> String {
    "http://localhost:3000/audio".to_string()
}

fn default_retention_days() -> u32 {
    7
}

fn default_purge_interval_secs() -> u64 {
    3_600
}

/// Local audio cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioCacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// URL prefix under which the cache directory is served.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// Unshared entries unused for longer than this are evicted locally.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl Default for AudioCacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            public_base_url: default_public_base_url(),
            retention_days: default_retention_days(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}
