//! Configuration management
//!
//! Layered configuration: defaults, then `config.toml` from the platform
//! config directory, then environment variable overrides. API keys are
//! resolved keyring-first with an environment fallback.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const KEYRING_SERVICE: &str = "vox-oracle";
const KEYRING_API_KEY_USER: &str = "llm-api-key";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Telegram transport settings
    #[serde(default)]
    pub telegram: TelegramConfig,
    /// Filesystem layout
    #[serde(default)]
    pub paths: PathsConfig,
    /// Transcription capability settings
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    /// Embedding + search settings
    #[serde(default)]
    pub search: SearchConfig,
    /// Oracle/LLM dispatch settings
    #[serde(default)]
    pub oracle: OracleConfig,
    /// Text-to-speech pipeline settings
    #[serde(default)]
    pub tts: TtsConfig,
    /// UI rendering and pacing settings
    #[serde(default)]
    pub ui: UiConfig,
    /// Narrative pipeline adapter settings
    #[serde(default)]
    pub narrative: NarrativeConfig,
}

/// Telegram transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token from @BotFather (format: 123456:ABC-DEF...)
    #[serde(default)]
    pub bot_token: String,
    /// The single chat id the bot accepts events from
    #[serde(default)]
    pub allowed_chat_id: i64,
    /// API base URL (for self-hosted bot API servers)
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            allowed_chat_id: 0,
            api_base: default_api_base(),
        }
    }
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && self.bot_token.contains(':') && self.allowed_chat_id != 0
    }
}

/// Filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root directory holding one subdirectory per session
    #[serde(default = "default_sessions_root")]
    pub sessions_root: PathBuf,
    /// Directory scanned for oracle persona templates
    #[serde(default = "default_oracles_dir")]
    pub oracles_dir: PathBuf,
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("vox-oracle"))
        .unwrap_or_else(|| PathBuf::from("./vox-oracle"))
}

fn default_sessions_root() -> PathBuf {
    data_dir().join("sessions")
}

fn default_oracles_dir() -> PathBuf {
    data_dir().join("oracles")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            sessions_root: default_sessions_root(),
            oracles_dir: default_oracles_dir(),
        }
    }
}

/// Transcription capability settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Whisper-compatible HTTP endpoint
    #[serde(default = "default_transcription_endpoint")]
    pub endpoint: String,
    /// Model identifier passed to the endpoint
    #[serde(default = "default_transcription_model")]
    pub model: String,
    /// Expected language hint (empty = autodetect)
    #[serde(default)]
    pub language: String,
    /// Per-segment timeout in seconds
    #[serde(default = "default_transcription_timeout")]
    pub timeout_secs: u64,
    /// Bounded work-queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Incoming voice file extension
    #[serde(default = "default_audio_ext")]
    pub audio_ext: String,
}

fn default_transcription_endpoint() -> String {
    "http://127.0.0.1:8080/v1/audio/transcriptions".to_string()
}

fn default_transcription_model() -> String {
    "whisper-large-v3".to_string()
}

fn default_transcription_timeout() -> u64 {
    120
}

fn default_queue_capacity() -> usize {
    256
}

fn default_audio_ext() -> String {
    "ogg".to_string()
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_transcription_endpoint(),
            model: default_transcription_model(),
            language: String::new(),
            timeout_secs: default_transcription_timeout(),
            queue_capacity: default_queue_capacity(),
            audio_ext: default_audio_ext(),
        }
    }
}

/// Embedding + search settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Embeddings endpoint (OpenAI-compatible)
    #[serde(default = "default_embedding_endpoint")]
    pub embedding_endpoint: String,
    /// Embedding model identifier
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Embedding dimension
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
    /// Minimum cosine similarity for a semantic hit
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    /// Maximum results per query
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Query timeout in seconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
    /// Characters of context around each preview hit
    #[serde(default = "default_preview_radius")]
    pub preview_radius: usize,
}

fn default_embedding_endpoint() -> String {
    "https://openrouter.ai/api/v1/embeddings".to_string()
}

fn default_embedding_model() -> String {
    "openai/text-embedding-3-small".to_string()
}

fn default_embedding_dim() -> usize {
    1536
}

fn default_min_score() -> f32 {
    0.6
}

fn default_max_results() -> usize {
    5
}

fn default_query_timeout() -> u64 {
    60
}

fn default_preview_radius() -> usize {
    60
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            embedding_endpoint: default_embedding_endpoint(),
            embedding_model: default_embedding_model(),
            embedding_dim: default_embedding_dim(),
            min_score: default_min_score(),
            max_results: default_max_results(),
            query_timeout_secs: default_query_timeout(),
            preview_radius: default_preview_radius(),
        }
    }
}

/// Oracle/LLM dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Chat-completions endpoint (OpenAI-compatible)
    #[serde(default = "default_llm_endpoint")]
    pub llm_endpoint: String,
    /// Model used for oracle feedback
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    /// Placeholder token replaced by the assembled context
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
    /// Persona registry cache TTL in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// LLM call timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub llm_timeout_secs: u64,
}

fn default_llm_endpoint() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}

fn default_llm_model() -> String {
    "anthropic/claude-sonnet-4.5".to_string()
}

fn default_placeholder() -> String {
    "{{CONTEXT}}".to_string()
}

fn default_cache_ttl() -> u64 {
    10
}

fn default_llm_timeout() -> u64 {
    30
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            llm_endpoint: default_llm_endpoint(),
            llm_model: default_llm_model(),
            placeholder: default_placeholder(),
            cache_ttl_secs: default_cache_ttl(),
            llm_timeout_secs: default_llm_timeout(),
        }
    }
}

/// Text-to-speech pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Master switch; when off synthesize() short-circuits
    #[serde(default)]
    pub enabled: bool,
    /// Speech endpoint (OpenAI-compatible audio/speech)
    #[serde(default = "default_tts_endpoint")]
    pub endpoint: String,
    /// Synthesis model identifier
    #[serde(default = "default_tts_model")]
    pub model: String,
    /// Voice identifier
    #[serde(default = "default_tts_voice")]
    pub voice: String,
    /// Output format/extension
    #[serde(default = "default_tts_format")]
    pub format: String,
    /// Synthesis timeout in seconds
    #[serde(default = "default_tts_timeout")]
    pub timeout_secs: u64,
    /// Maximum sanitized text length accepted
    #[serde(default = "default_tts_max_len")]
    pub max_text_len: usize,
    /// Artifacts older than this many hours are collected
    #[serde(default = "default_gc_retention")]
    pub gc_retention_hours: u64,
    /// Total artifact storage cap in megabytes
    #[serde(default = "default_gc_max_mb")]
    pub gc_max_storage_mb: u64,
    /// Seconds between garbage-collection sweeps
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
}

fn default_tts_endpoint() -> String {
    "https://api.openai.com/v1/audio/speech".to_string()
}

fn default_tts_model() -> String {
    "tts-1".to_string()
}

fn default_tts_voice() -> String {
    "alloy".to_string()
}

fn default_tts_format() -> String {
    "ogg".to_string()
}

fn default_tts_timeout() -> u64 {
    45
}

fn default_tts_max_len() -> usize {
    4000
}

fn default_gc_retention() -> u64 {
    72
}

fn default_gc_max_mb() -> u64 {
    512
}

fn default_gc_interval() -> u64 {
    3600
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_tts_endpoint(),
            model: default_tts_model(),
            voice: default_tts_voice(),
            format: default_tts_format(),
            timeout_secs: default_tts_timeout(),
            max_text_len: default_tts_max_len(),
            gc_retention_hours: default_gc_retention(),
            gc_max_storage_mb: default_gc_max_mb(),
            gc_interval_secs: default_gc_interval(),
        }
    }
}

/// UI rendering and pacing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfig {
    /// Per-message byte cap before pagination kicks in
    #[serde(default = "default_message_byte_cap")]
    pub message_byte_cap: usize,
    /// Above this many bytes the payload becomes a file attachment
    #[serde(default = "default_attachment_threshold")]
    pub attachment_threshold: usize,
    /// Minimum seconds between progress edits for one operation
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,
    /// Seconds before a pending intent (e.g. awaiting a search query) expires
    #[serde(default = "default_intent_timeout")]
    pub intent_timeout_secs: u64,
    /// Grace window for draining background work on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_message_byte_cap() -> usize {
    4096
}

fn default_attachment_threshold() -> usize {
    32 * 1024
}

fn default_progress_interval() -> u64 {
    5
}

fn default_intent_timeout() -> u64 {
    120
}

fn default_shutdown_grace() -> u64 {
    10
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            message_byte_cap: default_message_byte_cap(),
            attachment_threshold: default_attachment_threshold(),
            progress_interval_secs: default_progress_interval(),
            intent_timeout_secs: default_intent_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// Narrative pipeline adapter settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NarrativeConfig {
    /// External command invoked over `process/input.txt`; empty disables
    #[serde(default)]
    pub command: String,
}

impl Config {
    /// Platform path of the config file.
    pub fn config_file_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("vox-oracle"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Load configuration: defaults <- config.toml <- environment.
    pub fn load() -> Result<Self> {
        let mut config = match std::fs::read_to_string(Self::config_file_path()) {
            Ok(contents) => {
                toml::from_str(&contents).context("Failed to parse config.toml")?
            }
            Err(_) => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("VOX_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Ok(chat) = std::env::var("VOX_ALLOWED_CHAT_ID") {
            if let Ok(id) = chat.parse() {
                self.telegram.allowed_chat_id = id;
            }
        }
        if let Ok(root) = std::env::var("VOX_SESSIONS_ROOT") {
            self.paths.sessions_root = PathBuf::from(root);
        }
        if let Ok(dir) = std::env::var("VOX_ORACLES_DIR") {
            self.paths.oracles_dir = PathBuf::from(dir);
        }
        if let Ok(endpoint) = std::env::var("VOX_TRANSCRIPTION_ENDPOINT") {
            self.transcription.endpoint = endpoint;
        }
        if let Ok(enabled) = std::env::var("VOX_TTS_ENABLED") {
            self.tts.enabled = enabled.parse().unwrap_or(false);
        }
        if let Ok(cmd) = std::env::var("VOX_NARRATIVE_COMMAND") {
            self.narrative.command = cmd;
        }
    }

    /// Validate values that would otherwise fail deep inside a pipeline.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.search.min_score) {
            anyhow::bail!("search.min_score must be in [0, 1]");
        }
        if self.search.max_results == 0 {
            anyhow::bail!("search.max_results must be positive");
        }
        if self.ui.message_byte_cap == 0 {
            anyhow::bail!("ui.message_byte_cap must be positive");
        }
        if self.tts.max_text_len == 0 {
            anyhow::bail!("tts.max_text_len must be positive");
        }
        Ok(())
    }
}

/// Resolve the LLM/embedding API key: keyring first, then environment.
pub fn get_api_key() -> Result<String> {
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, KEYRING_API_KEY_USER) {
        if let Ok(key) = entry.get_password() {
            if !key.is_empty() {
                return Ok(key);
            }
        }
    }
    std::env::var("VOX_API_KEY")
        .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
        .context("No API key found. Store one with 'vox-oracle doctor --set-api-key' or set VOX_API_KEY.")
}

/// Store the LLM/embedding API key in the keyring.
pub fn set_api_key(key: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_API_KEY_USER)
        .context("Keyring unavailable")?;
    entry.set_password(key).context("Failed to store API key")?;
    Ok(())
}
