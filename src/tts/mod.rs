//! Text-to-speech pipeline: sanitization, idempotent synthesis, artifact
//! garbage collection.
//!
//! Synthesis is fire-and-forget from the oracle path; this module never
//! raises toward its caller. Every failure becomes a [`TtsResult::Err`]
//! value carrying a catalog code.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::TtsConfig;
use crate::session::SessionStore;
use crate::types::{sha256_hex, Capability, CoreError, CoreResult, SessionId};

/// One synthesis request. Identity is content-addressed: identical
/// `(session, persona, sanitized text)` collide on the same artifact.
#[derive(Debug, Clone)]
pub struct TtsRequest {
    pub session_id: SessionId,
    pub persona_id: String,
    /// Sequence of the oracle response the text came from
    pub sequence: u32,
    pub text: String,
}

/// Non-raising synthesis outcome.
#[derive(Debug, Clone)]
pub enum TtsResult {
    Ok {
        path: PathBuf,
        cached: bool,
        duration_ms: Option<u64>,
    },
    Err {
        code: &'static str,
        message: String,
    },
}

impl TtsResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, TtsResult::Ok { .. })
    }

    fn error(code: &'static str, message: impl Into<String>) -> Self {
        TtsResult::Err {
            code,
            message: message.into(),
        }
    }
}

/// Synthesis capability.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    async fn synthesize_speech(&self, text: &str, voice: &str, format: &str)
        -> CoreResult<Vec<u8>>;

    async fn check_health(&self) -> bool;
}

/// OpenAI-compatible `audio/speech` client.
pub struct HttpTtsEngine {
    client: reqwest::Client,
    config: TtsConfig,
    api_key: String,
}

impl HttpTtsEngine {
    pub fn new(config: TtsConfig, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            config,
            api_key,
        }
    }
}

#[async_trait]
impl TtsEngine for HttpTtsEngine {
    async fn synthesize_speech(
        &self,
        text: &str,
        voice: &str,
        format: &str,
    ) -> CoreResult<Vec<u8>> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.config.model,
                "voice": voice,
                "input": text,
                "response_format": format,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::CapabilityTimeout {
                        capability: Capability::Tts,
                        waited_secs: self.config.timeout_secs,
                    }
                } else {
                    CoreError::CapabilityFailure {
                        capability: Capability::Tts,
                        message: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::CapabilityFailure {
                capability: Capability::Tts,
                message: format!("endpoint returned {status}: {body}"),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CoreError::CapabilityFailure {
                capability: Capability::Tts,
                message: format!("failed to read audio body: {e}"),
            })?;
        Ok(bytes.to_vec())
    }

    async fn check_health(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// The idempotent synthesis pipeline over a session store.
pub struct TtsPipeline {
    engine: Arc<dyn TtsEngine>,
    store: SessionStore,
    config: TtsConfig,
    /// Per-idempotency-key locks so parallel requests for the same text
    /// produce exactly one provider call and one artifact.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TtsPipeline {
    pub fn new(engine: Arc<dyn TtsEngine>, store: SessionStore, config: TtsConfig) -> Self {
        Self {
            engine,
            store,
            config,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub async fn check_health(&self) -> bool {
        self.config.enabled && self.engine.check_health().await
    }

    /// Artifact path for a request: `audio/tts/<NNN>_<persona>.<fmt>`.
    pub fn artifact_path(&self, request: &TtsRequest) -> PathBuf {
        self.store.tts_dir(&request.session_id).join(format!(
            "{:03}_{}.{}",
            request.sequence, request.persona_id, self.config.format
        ))
    }

    /// Synthesize a request. Never raises; every outcome is a value.
    pub async fn synthesize(&self, request: &TtsRequest) -> TtsResult {
        if !self.config.enabled {
            return TtsResult::error("tts_disabled", "synthesis is disabled by configuration");
        }

        let sanitized = sanitize_text(&request.text);
        if sanitized.is_empty() {
            return TtsResult::error("empty_text", "nothing speakable after sanitization");
        }
        if sanitized.chars().count() > self.config.max_text_len {
            return TtsResult::error(
                "text_too_long",
                format!(
                    "sanitized text has {} chars (cap {})",
                    sanitized.chars().count(),
                    self.config.max_text_len
                ),
            );
        }

        let key = idempotency_key(&request.session_id, &request.persona_id, &sanitized);
        let key_lock = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = key_lock.lock().await;

        let path = self.artifact_path(request);
        if artifact_exists(&path) {
            debug!(key = %key, path = %path.display(), "tts artifact cache hit");
            return TtsResult::Ok {
                path,
                cached: true,
                duration_ms: None,
            };
        }

        let started = std::time::Instant::now();
        let synthesis = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            self.engine
                .synthesize_speech(&sanitized, &self.config.voice, &self.config.format),
        )
        .await;

        let bytes = match synthesis {
            Ok(Ok(bytes)) if !bytes.is_empty() => bytes,
            Ok(Ok(_)) => return TtsResult::error("tts_failed", "provider returned empty audio"),
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "tts synthesis failed");
                return TtsResult::error(e.catalog_code(), e.to_string());
            }
            Err(_) => {
                warn!(key = %key, "tts synthesis timed out");
                return TtsResult::error(
                    "tts_timeout",
                    format!("synthesis exceeded {}s", self.config.timeout_secs),
                );
            }
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                return TtsResult::error("io_failure", format!("mkdir failed: {e}"));
            }
        }
        if let Err(e) = fs::write(&path, &bytes) {
            return TtsResult::error("io_failure", format!("artifact write failed: {e}"));
        }
        // Sidecar records the content address of the artifact.
        let _ = fs::write(path.with_extension("key"), &key);

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(key = %key, path = %path.display(), duration_ms, "tts artifact written");
        TtsResult::Ok {
            path,
            cached: false,
            duration_ms: Some(duration_ms),
        }
    }
}

fn artifact_exists(path: &PathBuf) -> bool {
    fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Content address of a synthesis request: first 16 hex chars of
/// `sha256(session ‖ persona ‖ sanitized_text)`.
pub fn idempotency_key(session_id: &SessionId, persona_id: &str, sanitized_text: &str) -> String {
    let digest = sha256_hex(
        format!("{}\u{1f}{}\u{1f}{}", session_id, persona_id, sanitized_text).as_bytes(),
    );
    digest[..16].to_string()
}

static MARKDOWN_MARKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[*_`#>~|]+").expect("static regex"));
static LINKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("static regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

/// Strip inline formatting and non-speakable characters.
pub fn sanitize_text(text: &str) -> String {
    let text = LINKS.replace_all(text, "$1");
    let text = MARKDOWN_MARKS.replace_all(&text, "");
    let text: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == ' ')
        .filter(|c| {
            c.is_alphanumeric()
                || c.is_whitespace()
                || matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | '\'' | '"' | '-' | '(' | ')' | '%')
        })
        .collect();
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// Result of one garbage-collection sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub removed: usize,
    pub bytes_freed: u64,
}

/// Remove TTS artifacts past the retention window, then oldest-first
/// until total storage is under the cap.
pub fn gc_sweep(store: &SessionStore, config: &TtsConfig) -> CoreResult<GcStats> {
    let mut stats = GcStats::default();
    let retention = Duration::from_secs(config.gc_retention_hours * 3600);
    let cap_bytes = config.gc_max_storage_mb * 1024 * 1024;
    let now = SystemTime::now();

    // (mtime, size, path) of every artifact under sessions/*/audio/tts/.
    let mut artifacts: Vec<(SystemTime, u64, PathBuf)> = Vec::new();
    for entry in walkdir::WalkDir::new(store.root())
        .min_depth(4)
        .max_depth(4)
        .into_iter()
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        let in_tts_dir = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n == "tts")
            .unwrap_or(false);
        if !in_tts_dir {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let mtime = meta.modified().unwrap_or(now);
        artifacts.push((mtime, meta.len(), path.to_path_buf()));
    }

    // Age pass.
    artifacts.retain(|(mtime, size, path)| {
        let expired = now
            .duration_since(*mtime)
            .map(|age| age > retention)
            .unwrap_or(false);
        if expired {
            if fs::remove_file(path).is_ok() {
                stats.removed += 1;
                stats.bytes_freed += size;
            }
            false
        } else {
            true
        }
    });

    // Cap pass: oldest first.
    let mut total: u64 = artifacts.iter().map(|(_, size, _)| size).sum();
    if total > cap_bytes {
        artifacts.sort_by_key(|(mtime, _, _)| *mtime);
        for (_, size, path) in &artifacts {
            if total <= cap_bytes {
                break;
            }
            if fs::remove_file(path).is_ok() {
                stats.removed += 1;
                stats.bytes_freed += size;
                total -= size;
            }
        }
    }

    if stats.removed > 0 {
        info!(removed = stats.removed, bytes = stats.bytes_freed, "tts gc sweep");
    }
    Ok(stats)
}
