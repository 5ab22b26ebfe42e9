//! Vox Oracle - Voice Session Orchestrator Library
//!
//! A stateful, session-oriented orchestrator between Telegram and three
//! asynchronous pipelines:
//! - speech-to-text transcription of captured audio segments
//! - semantic embedding + similarity search over past sessions
//! - LLM-driven oracle feedback with optional text-to-speech delivery
//!
//! Sessions are append-only timelines of audio segments persisted as
//! self-describing directories, so every artifact is auditable and
//! replayable across restarts.

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod config;
pub mod session; // Must come before the pipelines that consume it
pub mod transcription;
pub mod embedding;
pub mod llm;
pub mod oracle;
pub mod tts;
pub mod telegram;

// UI and orchestration
pub mod presentation;
pub mod router;
pub mod daemon;
pub mod narrative;
pub mod cli;

// Re-export commonly used types for convenience
pub use config::Config;

pub use session::{
    AudioCapture, CreateOutcome, Session, SessionManager, SessionState, SessionStore,
    TranscriptionStatus,
};

pub use embedding::{SearchEngine, SearchResponse};

pub use router::{Event, Router};

pub use types::{ChatId, CoreError, CoreResult, SessionId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Voice Session Orchestrator", NAME, VERSION)
}
