//! Answer classification.

use crate::error::DialogError;
use async_trait::async_trait;
use outcall_types::{Intent, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const UNCERTAIN: &[&str] = &[
    "maybe",
    "perhaps",
    "not sure",
    "i'm not sure",
    "don't know",
    "do not know",
    "not certain",
    "depends",
    "later",
    "possibly",
];

const NEGATIVE: &[&str] = &[
    "no",
    "nope",
    "nah",
    "not interested",
    "not now",
    "not really",
    "no thanks",
    "don't",
    "do not",
    "never",
    "stop",
    "remove me",
    "wrong number",
    "busy",
    "can't",
    "cannot",
    "not a good time",
];

const POSITIVE: &[&str] = &[
    "yes",
    "yeah",
    "yep",
    "yup",
    "sure",
    "okay",
    "ok",
    "of course",
    "definitely",
    "absolutely",
    "certainly",
    "go ahead",
    "sounds good",
    "i am",
    "i do",
    "interested",
    "correct",
    "right",
    "please",
];

/// Deterministic classification by phrase lookup.
///
/// Phrases match on whole words. Uncertain phrases win over negative ones,
/// which win over positive ones, so "I'm not sure" is MAYBE and
/// "not interested" is NO. Anything unmatched is MAYBE.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    uncertain: Vec<Vec<String>>,
    negative: Vec<Vec<String>>,
    positive: Vec<Vec<String>>,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(UNCERTAIN, NEGATIVE, POSITIVE)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .replace('’', "'")
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn contains_phrase(tokens: &[String], phrase: &[String]) -> bool {
    !phrase.is_empty() && tokens.windows(phrase.len()).any(|window| window == phrase)
}

impl KeywordClassifier {
    pub fn new(uncertain: &[&str], negative: &[&str], positive: &[&str]) -> Self {
        let compile = |phrases: &[&str]| phrases.iter().map(|p| tokenize(p)).collect();
        Self {
            uncertain: compile(uncertain),
            negative: compile(negative),
            positive: compile(positive),
        }
    }

    pub fn classify(&self, utterance: &str) -> Intent {
        let tokens = tokenize(utterance);
        let hit = |set: &[Vec<String>]| set.iter().any(|p| contains_phrase(&tokens, p));
        if hit(&self.uncertain) {
            Intent::Maybe
        } else if hit(&self.negative) {
            Intent::No
        } else if hit(&self.positive) {
            Intent::Yes
        } else {
            Intent::Maybe
        }
    }
}

/// Prompt sent to an [`IntentModel`].
#[derive(Debug, Clone, PartialEq)]
pub struct IntentPrompt {
    pub system: String,
    pub user: String,
}

impl IntentPrompt {
    pub fn new(utterance: &str, question: &str) -> Self {
        Self {
            system: "You grade a customer's spoken answer on a phone survey. \
                     Reply with exactly one word: YES, NO, or MAYBE. \
                     YES means agreement or a concrete positive answer, NO means refusal \
                     or a negative answer, MAYBE means anything else."
                .to_string(),
            user: format!("Question: {question}\nAnswer: {utterance}"),
        }
    }
}

/// A generative model that completes an [`IntentPrompt`].
#[async_trait]
pub trait IntentModel: Send + Sync {
    async fn complete(&self, prompt: &IntentPrompt) -> Result<String, DialogError>;
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_timeout_ms() -> u64 {
    3_000
}

/// Intent model settings. The model is disabled when `api_key` is empty.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            model: default_model(),
            timeout_ms: default_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl fmt::Debug for ClassifierConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifierConfig")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("timeout_ms", &self.timeout_ms)
            .field("retry", &self.retry)
            .finish()
    }
}

/// [`IntentModel`] over an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct ChatIntentModel {
    client: reqwest::Client,
    config: ClassifierConfig,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

impl ChatIntentModel {
    pub fn new(config: ClassifierConfig) -> Result<Self, DialogError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl IntentModel for ChatIntentModel {
    async fn complete(&self, prompt: &IntentPrompt) -> Result<String, DialogError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: 0.0,
            max_tokens: 2,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DialogError::Model(format!("provider returned {status}")));
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| DialogError::Model("response had no content".to_string()))
    }
}

/// How an intent was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Model(Intent),
    Keyword(Intent),
}

impl Classification {
    pub fn intent(self) -> Intent {
        match self {
            Self::Model(intent) | Self::Keyword(intent) => intent,
        }
    }
}

/// Model-first classifier with a keyword fallback. Never fails.
pub struct IntentClassifier {
    model: Option<Arc<dyn IntentModel>>,
    keywords: KeywordClassifier,
    timeout: Duration,
    retry: RetryPolicy,
}

impl IntentClassifier {
    pub fn new(model: Option<Arc<dyn IntentModel>>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            model,
            keywords: KeywordClassifier::default(),
            timeout,
            retry,
        }
    }

    /// A classifier that only uses keywords.
    pub fn keywords_only() -> Self {
        Self::new(None, Duration::ZERO, RetryPolicy::none())
    }

    /// Builds the classifier described by `config`.
    pub fn from_config(config: &ClassifierConfig) -> Result<Self, DialogError> {
        let model: Option<Arc<dyn IntentModel>> = if config.api_key.is_empty() {
            None
        } else {
            Some(Arc::new(ChatIntentModel::new(config.clone())?))
        };
        Ok(Self::new(
            model,
            Duration::from_millis(config.timeout_ms),
            config.retry,
        ))
    }

    pub fn keywords(&self) -> &KeywordClassifier {
        &self.keywords
    }

    pub async fn classify(&self, utterance: &str, question: &str) -> Classification {
        let utterance = utterance.trim();
        if utterance.is_empty() {
            return Classification::Keyword(Intent::Maybe);
        }
        let Some(model) = &self.model else {
            return Classification::Keyword(self.keywords.classify(utterance));
        };

        let prompt = IntentPrompt::new(utterance, question);
        let attempts = self.retry.attempts.max(1);
        for attempt in 0..attempts {
            let result = match tokio::time::timeout(self.timeout, model.complete(&prompt)).await {
                Ok(Ok(raw)) => raw
                    .parse::<Intent>()
                    .map_err(|_| DialogError::InvalidOutput(raw)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(DialogError::Timeout(self.timeout.as_millis() as u64)),
            };
            match result {
                Ok(intent) => return Classification::Model(intent),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "intent model attempt failed");
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        let intent = self.keywords.classify(utterance);
        tracing::warn!(intent = %intent, "intent model unavailable, used keyword fallback");
        Classification::Keyword(intent)
    }
}
