//! Tiered audio resolution.
//!
//! `resolve()` never fails: every lookup ends in either a URL for a playable
//! file or an instruction for the telephony vendor to speak the text itself.
//!
//! Tier order is local disk, durable store, synthesis. Synthesis for a given
//! key happens under a per-key lock, so concurrent misses for the same line
//! synthesize it once and the others pick up the written file.

use crate::cache::{artifact_key, ArtifactStore, LocalAudioCache, NewArtifact};
use crate::error::VoiceError;
use crate::tts::SpeechSynthesizer;
use outcall_types::{AudioCategory, AudioSource, VoiceKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Metadata attached to a line when it is first synthesized.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub category: AudioCategory,
    /// Shared lines are never evicted from the local tier.
    pub shared: bool,
    pub owner_module: Option<String>,
}

impl ResolveOptions {
    pub fn shared(category: AudioCategory) -> Self {
        Self {
            category,
            shared: true,
            owner_module: None,
        }
    }

    pub fn owned(category: AudioCategory, module_id: impl Into<String>) -> Self {
        Self {
            category,
            shared: false,
            owner_module: Some(module_id.into()),
        }
    }

    /// A one-off line, e.g. one that contains the customer's name.
    pub fn transient(category: AudioCategory) -> Self {
        Self {
            category,
            shared: false,
            owner_module: None,
        }
    }
}

/// How a line should be played.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedAudio {
    /// Play the file at `url`.
    Playable { url: String, source: AudioSource },
    /// Let the telephony vendor speak `text` with its built-in voice.
    VendorTts {
        text: String,
        voice: &'static str,
        language: &'static str,
    },
}

impl ResolvedAudio {
    pub fn source(&self) -> AudioSource {
        match self {
            Self::Playable { source, .. } => *source,
            Self::VendorTts { .. } => AudioSource::VendorFallback,
        }
    }

    fn vendor(text: &str, voice: VoiceKind) -> Self {
        Self::VendorTts {
            text: text.trim().to_string(),
            voice: voice.vendor_voice(),
            language: voice.language(),
        }
    }
}

pub struct AudioResolver {
    local: LocalAudioCache,
    store: Arc<dyn ArtifactStore>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    public_base_url: String,
    key_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AudioResolver {
    pub fn new(
        local: LocalAudioCache,
        store: Arc<dyn ArtifactStore>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            local,
            store,
            synthesizer,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn local(&self) -> &LocalAudioCache {
        &self.local
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, LocalAudioCache::file_name(key))
    }

    fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .key_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Entries only the map still holds are idle.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(key.to_string()).or_default().clone()
    }

    fn bump_usage(&self, key: &str) {
        let store = Arc::clone(&self.store);
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.touch(&key).await {
                tracing::warn!(key = %key, error = %e, "failed to record audio usage");
            }
        });
    }

    async fn local_hit(&self, key: &str) -> bool {
        match self.local.contains(key).await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(key, error = %e, "local audio cache unreadable");
                false
            }
        }
    }

    /// Resolves `text` spoken in `voice` to something playable.
    pub async fn resolve(
        &self,
        text: &str,
        voice: VoiceKind,
        opts: &ResolveOptions,
    ) -> ResolvedAudio {
        let key = artifact_key(text, voice);

        if self.local_hit(&key).await {
            self.bump_usage(&key);
            return ResolvedAudio::Playable {
                url: self.url_for(&key),
                source: AudioSource::Local,
            };
        }

        let lock = self.key_lock(&key);
        let _guard = lock.lock().await;

        // Another resolver may have filled the tier while we waited.
        if self.local_hit(&key).await {
            self.bump_usage(&key);
            return ResolvedAudio::Playable {
                url: self.url_for(&key),
                source: AudioSource::Local,
            };
        }

        match self.store.load(&key).await {
            Ok(Some(content)) => match self.local.write(&key, &content).await {
                Ok(()) => {
                    self.bump_usage(&key);
                    tracing::debug!(key = %key, "audio restored from durable store");
                    return ResolvedAudio::Playable {
                        url: self.url_for(&key),
                        source: AudioSource::Durable,
                    };
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "failed to repopulate local audio");
                    return ResolvedAudio::vendor(text, voice);
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "durable audio lookup failed");
            }
        }

        let content = match self.synthesizer.synthesize(text, voice).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    voice = voice.key(),
                    error = %e,
                    "synthesis failed, using vendor speech"
                );
                return ResolvedAudio::vendor(text, voice);
            }
        };

        let written = self.local.write(&key, &content).await;
        let artifact = NewArtifact {
            key: key.clone(),
            content,
            text: text.trim().to_string(),
            voice,
            category: opts.category,
            shared: opts.shared,
            owner_module: opts.owner_module.clone(),
        };
        if let Err(e) = self.store.save(artifact).await {
            tracing::warn!(key = %key, error = %e, "failed to persist synthesized audio");
        }

        match written {
            Ok(()) => {
                tracing::info!(
                    key = %key,
                    category = opts.category.as_str(),
                    "synthesized new audio"
                );
                ResolvedAudio::Playable {
                    url: self.url_for(&key),
                    source: AudioSource::Synthesized,
                }
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to write synthesized audio");
                ResolvedAudio::vendor(text, voice)
            }
        }
    }

    /// Resolves every line up front so later turns hit the local tier.
    /// Returns how many lines ended up playable.
    pub async fn prewarm(&self, lines: &[(String, ResolveOptions)], voice: VoiceKind) -> usize {
        let mut playable = 0;
        for (text, opts) in lines {
            if matches!(
                self.resolve(text, voice, opts).await,
                ResolvedAudio::Playable { .. }
            ) {
                playable += 1;
            }
        }
        playable
    }

    /// Evicts local copies of unshared lines unused for longer than
    /// `retention`. Durable copies stay and repopulate the disk on demand.
    pub async fn purge_local(&self, retention: Duration) -> Result<usize, VoiceError> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| VoiceError::Config(format!("retention out of range: {e}")))?;
        let cutoff = chrono::Utc::now() - retention;
        let keys = self.store.stale_keys(cutoff).await?;

        let mut removed = 0;
        for key in keys {
            if self.local.remove(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
