//! Shared types used across modules
//!
//! This module contains identifiers and the typed error taxonomy that are
//! used by multiple modules to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Telegram chat identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session identifier: the creation timestamp as `YYYY-MM-DD_HH-MM-SS`.
///
/// The literal doubles as the session's directory name, so it must stay
/// filesystem-safe and lexicographically ordered by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Build an id from a creation timestamp.
    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self(ts.format("%Y-%m-%d_%H-%M-%S").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check the `YYYY-MM-DD_HH-MM-SS` shape without fully parsing it.
    pub fn is_well_formed(&self) -> bool {
        let s = &self.0;
        s.len() == 19
            && s.as_bytes().get(10) == Some(&b'_')
            && chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d_%H-%M-%S").is_ok()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The external capabilities the core calls out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Transcription,
    Embedding,
    Llm,
    Tts,
    Transport,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Transcription => write!(f, "transcription"),
            Capability::Embedding => write!(f, "embedding"),
            Capability::Llm => write!(f, "llm"),
            Capability::Tts => write!(f, "tts"),
            Capability::Transport => write!(f, "transport"),
        }
    }
}

/// Typed error taxonomy for the session core.
///
/// Capability failures are converted into these variants at the capability
/// boundary; user-facing layers map them onto the humanized catalog via
/// [`CoreError::catalog_code`]. Panics are reserved for invariant
/// violations that must not happen.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {message}")]
    Validation { code: &'static str, message: String },

    #[error("illegal transition from {from} on {event}")]
    IllegalTransition { from: &'static str, event: &'static str },

    #[error("{capability} timed out after {waited_secs}s")]
    CapabilityTimeout {
        capability: Capability,
        waited_secs: u64,
    },

    #[error("{capability} failed: {message}")]
    CapabilityFailure {
        capability: Capability,
        message: String,
    },

    #[error("session {id} is corrupt: {reason}")]
    CorruptSession { id: String, reason: String },

    #[error("resource exhausted: {what}")]
    Exhausted { what: String },

    #[error("i/o failure during {operation}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }

    /// Stable code used to look up the humanized catalog entry.
    pub fn catalog_code(&self) -> &'static str {
        match self {
            CoreError::Validation { code, .. } => code,
            CoreError::IllegalTransition { .. } => "illegal_transition",
            CoreError::CapabilityTimeout { capability, .. } => match capability {
                Capability::Transcription => "transcription_timeout",
                Capability::Embedding => "embedding_timeout",
                Capability::Llm => "llm_timeout",
                Capability::Tts => "tts_timeout",
                Capability::Transport => "transport_timeout",
            },
            CoreError::CapabilityFailure { capability, .. } => match capability {
                Capability::Transcription => "transcription_failed",
                Capability::Embedding => "embedding_failed",
                Capability::Llm => "llm_failed",
                Capability::Tts => "tts_failed",
                Capability::Transport => "transport_failed",
            },
            CoreError::CorruptSession { .. } => "corrupt_session",
            CoreError::Exhausted { .. } => "exhausted",
            CoreError::Io { .. } => "io_failure",
            CoreError::Internal(_) => "internal",
        }
    }

    /// Whether the user can meaningfully retry the failed operation.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, CoreError::Internal(_) | CoreError::CorruptSession { .. })
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Compute the hex-encoded SHA-256 digest of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
