//! Speech-to-text capability and the transcription queue.
//!
//! The core talks to a [`Transcriber`] behind a narrow trait; the one
//! real implementation posts audio files to a Whisper-compatible HTTP
//! endpoint. Errors never escape the capability boundary untyped.

pub mod queue;

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::TranscriptionConfig;
use crate::types::{Capability, CoreError, CoreResult};

pub use queue::{ProgressEvent, ProgressKind, TranscriptionQueue, TranscriptionWorker};

/// Result of transcribing one audio segment.
#[derive(Debug, Clone)]
pub struct TranscriptOutput {
    pub text: String,
    pub language: Option<String>,
    pub confidence: Option<f32>,
}

/// Speech-to-text capability.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_path: &Path) -> CoreResult<TranscriptOutput>;

    /// Cheap readiness probe used by the doctor command.
    async fn is_ready(&self) -> bool;
}

/// Whisper-compatible HTTP transcriber.
pub struct HttpTranscriber {
    client: reqwest::Client,
    config: TranscriptionConfig,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
}

impl HttpTranscriber {
    pub fn new(config: TranscriptionConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .expect("Failed to create HTTP client");
        Self { client, config }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, audio_path: &Path) -> CoreResult<TranscriptOutput> {
        let bytes = tokio::fs::read(audio_path)
            .await
            .map_err(|e| CoreError::io("read audio for transcription", e))?;
        let filename = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.ogg".to_string());

        let mut form = reqwest::multipart::Form::new()
            .text("model", self.config.model.clone())
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(filename),
            );
        if !self.config.language.is_empty() {
            form = form.text("language", self.config.language.clone());
        }

        debug!(path = %audio_path.display(), "posting audio for transcription");

        let response = self
            .client
            .post(&self.config.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::CapabilityTimeout {
                        capability: Capability::Transcription,
                        waited_secs: self.config.timeout_secs,
                    }
                } else {
                    CoreError::CapabilityFailure {
                        capability: Capability::Transcription,
                        message: e.to_string(),
                    }
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::CapabilityFailure {
                capability: Capability::Transcription,
                message: format!("endpoint returned {status}: {body}"),
            });
        }

        let parsed: TranscriptionResponse =
            response.json().await.map_err(|e| CoreError::CapabilityFailure {
                capability: Capability::Transcription,
                message: format!("malformed transcription response: {e}"),
            })?;

        Ok(TranscriptOutput {
            text: parsed.text,
            language: parsed.language,
            confidence: None,
        })
    }

    async fn is_ready(&self) -> bool {
        // A HEAD against the endpoint host answers "is anything there".
        self.client
            .head(&self.config.endpoint)
            .send()
            .await
            .is_ok()
    }
}
