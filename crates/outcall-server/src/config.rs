//! Server configuration loading from file and environment variables.

use outcall_dialog::{ClassifierConfig, Script};
use outcall_voice::{AudioCacheConfig, RecognitionConfig, SynthesisConfig};
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Telephony vendor account and webhook behaviour.
    #[serde(default)]
    pub telephony: TelephonyConfig,

    #[serde(default)]
    pub synthesis: SynthesisConfig,

    #[serde(default)]
    pub recognition: RecognitionConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub audio_cache: AudioCacheConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub dialog: DialogConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally reachable base URL, used in webhook and stream URLs handed
    /// to the telephony vendor.
    #[serde(default = "default_public_url")]
    pub public_url: String,

    /// Call-creation requests allowed per client IP per minute.
    #[serde(default = "default_call_rate_limit")]
    pub call_rate_limit: u32,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "outcall_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Telephony vendor settings.
#[derive(Clone, Deserialize)]
pub struct TelephonyConfig {
    #[serde(default)]
    pub account_sid: String,

    /// Used for placing calls and for webhook signature checks.
    #[serde(default)]
    pub auth_token: String,

    /// Caller id for outbound calls.
    #[serde(default)]
    pub from_number: String,

    #[serde(default = "default_telephony_api_base")]
    pub api_base_url: String,

    /// Check `X-Twilio-Signature` on webhooks. Mismatches are logged only.
    #[serde(default = "default_true")]
    pub validate_signatures: bool,

    /// Fork call audio to `/voice/media` and let the streaming handler run
    /// the conversation after the greeting.
    #[serde(default)]
    pub media_streams: bool,

    /// Ask the vendor to record calls.
    #[serde(default)]
    pub record_calls: bool,
}

impl TelephonyConfig {
    /// Whether outbound calls can be placed.
    pub fn can_dial(&self) -> bool {
        !self.account_sid.is_empty() && !self.auth_token.is_empty() && !self.from_number.is_empty()
    }
}

impl fmt::Debug for TelephonyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelephonyConfig")
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"[REDACTED]")
            .field("from_number", &self.from_number)
            .field("api_base_url", &self.api_base_url)
            .field("validate_signatures", &self.validate_signatures)
            .field("media_streams", &self.media_streams)
            .field("record_calls", &self.record_calls)
            .finish()
    }
}

/// In-memory registry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Streaming sessions idle longer than this are swept.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Live monitor settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// How long observers stay connected after a call ends.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,

    /// Per-observer outbound buffer; events beyond it are dropped.
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
}

/// Conversation tuning and wording.
#[derive(Debug, Clone, Deserialize)]
pub struct DialogConfig {
    /// Finals below this confidence are unclear.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,

    /// Finals shorter than this many characters are unclear.
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,

    /// Partials above this confidence emit an intent hint to observers.
    #[serde(default = "default_partial_signal_confidence")]
    pub partial_signal_confidence: f32,

    #[serde(default = "default_max_reprompts")]
    pub max_reprompts: u32,

    #[serde(default = "default_greeting_listen_secs")]
    pub greeting_listen_secs: u32,

    #[serde(default = "default_answer_listen_secs")]
    pub answer_listen_secs: u32,

    #[serde(default)]
    pub script: Script,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_public_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_call_rate_limit() -> u32 {
    30
}

fn default_db_path() -> String {
    "outcall.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_telephony_api_base() -> String {
    "https://api.twilio.com".to_string()
}

fn default_true() -> bool {
    true
}

fn default_session_ttl_secs() -> u64 {
    2 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_grace_ms() -> u64 {
    5_000
}

fn default_observer_buffer() -> usize {
    256
}

fn default_min_confidence() -> f32 {
    0.5
}

fn default_min_chars() -> usize {
    2
}

fn default_partial_signal_confidence() -> f32 {
    0.8
}

fn default_max_reprompts() -> u32 {
    2
}

fn default_greeting_listen_secs() -> u32 {
    12
}

fn default_answer_listen_secs() -> u32 {
    20
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: default_public_url(),
            call_rate_limit: default_call_rate_limit(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            api_base_url: default_telephony_api_base(),
            validate_signatures: true,
            media_streams: false,
            record_calls: false,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
            observer_buffer: default_observer_buffer(),
        }
    }
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            min_chars: default_min_chars(),
            partial_signal_confidence: default_partial_signal_confidence(),
            max_reprompts: default_max_reprompts(),
            greeting_listen_secs: default_greeting_listen_secs(),
            answer_listen_secs: default_answer_listen_secs(),
            script: Script::default(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

fn env_override(name: &str, target: &mut String) {
    if let Ok(value) = std::env::var(name) {
        *target = value;
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `OUTCALL_HOST`, `OUTCALL_PORT`, `OUTCALL_PUBLIC_URL`
/// - `OUTCALL_DB_PATH`
/// - `OUTCALL_LOG_LEVEL`, `OUTCALL_LOG_JSON` (set to "true" to enable)
/// - `OUTCALL_TWILIO_ACCOUNT_SID`, `OUTCALL_TWILIO_AUTH_TOKEN`
/// - `OUTCALL_ELEVENLABS_API_KEY`, `OUTCALL_DEEPGRAM_API_KEY`,
///   `OUTCALL_CLASSIFIER_API_KEY`
///
/// `OUTCALL_PUBLIC_URL` also moves the audio URL prefix to `<url>/audio`.
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("OUTCALL_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("OUTCALL_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(public_url) = std::env::var("OUTCALL_PUBLIC_URL") {
        let public_url = public_url.trim_end_matches('/').to_string();
        config.audio_cache.public_base_url = format!("{public_url}/audio");
        config.server.public_url = public_url;
    }
    env_override("OUTCALL_DB_PATH", &mut config.database.path);
    env_override("OUTCALL_LOG_LEVEL", &mut config.logging.level);
    if let Ok(json) = std::env::var("OUTCALL_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    env_override("OUTCALL_TWILIO_ACCOUNT_SID", &mut config.telephony.account_sid);
    env_override("OUTCALL_TWILIO_AUTH_TOKEN", &mut config.telephony.auth_token);
    env_override("OUTCALL_ELEVENLABS_API_KEY", &mut config.synthesis.api_key);
    env_override("OUTCALL_DEEPGRAM_API_KEY", &mut config.recognition.api_key);
    env_override("OUTCALL_CLASSIFIER_API_KEY", &mut config.classifier.api_key);

    Ok(config)
}
