//! The two storage tiers behind the audio resolver.
//!
//! The local tier is a directory of `<key>.mp3` files served over HTTP. The
//! durable tier keeps the same bytes plus metadata (category, sharing, usage)
//! in SQLite. The tiers are written independently; a file missing from disk
//! is repopulated from the durable copy on the next lookup.

use crate::error::VoiceError;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use outcall_db::DbPool;
use outcall_types::{AudioCategory, VoiceKind};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const AUDIO_EXTENSION: &str = "mp3";

/// Content-addressed key for a spoken line: SHA-256 over voice and text.
pub fn artifact_key(text: &str, voice: VoiceKind) -> String {
    let mut hasher = Sha256::new();
    hasher.update(voice.key().as_bytes());
    hasher.update([0u8]);
    hasher.update(text.trim().as_bytes());
    hex::encode(hasher.finalize())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Audio files on local disk.
#[derive(Debug)]
pub struct LocalAudioCache {
    dir: PathBuf,
    tmp_counter: AtomicU64,
}

impl LocalAudioCache {
    /// Opens (creating if needed) the cache directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, VoiceError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name under which `key` is stored and served.
    pub fn file_name(key: &str) -> String {
        format!("{key}.{AUDIO_EXTENSION}")
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(Self::file_name(key))
    }

    pub async fn contains(&self, key: &str) -> Result<bool, VoiceError> {
        match tokio::fs::metadata(self.path_for(key)).await {
            Ok(meta) => Ok(meta.is_file() && meta.len() > 0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes `content` under `key`. The file appears atomically, so a reader
    /// never serves a partial write.
    pub async fn write(&self, key: &str, content: &[u8]) -> Result<(), VoiceError> {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .dir
            .join(format!(".{key}.{}.{n}.part", std::process::id()));
        tokio::fs::write(&tmp, content).await?;
        if let Err(e) = tokio::fs::rename(&tmp, self.path_for(key)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Removes the local copy of `key`. Returns whether a file was removed.
    pub async fn remove(&self, key: &str) -> Result<bool, VoiceError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// An artifact to persist in the durable tier.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub key: String,
    pub content: Vec<u8>,
    pub text: String,
    pub voice: VoiceKind,
    pub category: AudioCategory,
    pub shared: bool,
    pub owner_module: Option<String>,
}

/// Durable audio storage.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Returns the stored bytes for `key`, if any.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, VoiceError>;

    /// Stores a new artifact with a usage count of one. Content is
    /// write-once: saving an existing key leaves the stored bytes untouched.
    async fn save(&self, artifact: NewArtifact) -> Result<(), VoiceError>;

    /// Records one more use of `key`.
    async fn touch(&self, key: &str) -> Result<(), VoiceError>;

    /// Keys of unshared artifacts last used before `cutoff`.
    async fn stale_keys(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, VoiceError>;
}

/// [`ArtifactStore`] backed by the `audio_artifacts` table.
#[derive(Clone)]
pub struct SqliteArtifactStore {
    pool: DbPool,
}

impl SqliteArtifactStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, VoiceError>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, VoiceError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(|e| VoiceError::Cache(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl ArtifactStore for SqliteArtifactStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, VoiceError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            let content = conn
                .query_row(
                    "SELECT content FROM audio_artifacts WHERE key = ?1",
                    [&key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(content)
        })
        .await
    }

    async fn save(&self, artifact: NewArtifact) -> Result<(), VoiceError> {
        self.blocking(move |conn| {
            let now = timestamp(Utc::now());
            conn.execute(
                "INSERT OR IGNORE INTO audio_artifacts (
                    key, content, text, voice, category, shared, owner_module,
                    usage_count, created_at, last_used_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)",
                params![
                    artifact.key,
                    artifact.content,
                    artifact.text,
                    artifact.voice.key(),
                    artifact.category.as_str(),
                    artifact.shared,
                    artifact.owner_module,
                    now,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn touch(&self, key: &str) -> Result<(), VoiceError> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "UPDATE audio_artifacts
                 SET usage_count = usage_count + 1, last_used_at = ?2
                 WHERE key = ?1",
                params![key, timestamp(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }

    async fn stale_keys(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, VoiceError> {
        let cutoff = timestamp(cutoff);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM audio_artifacts
                 WHERE shared = 0 AND last_used_at < ?1",
            )?;
            let rows = stmt.query_map([&cutoff], |row| row.get(0))?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?);
            }
            Ok(keys)
        })
        .await
    }
}
