//! Per-session embedding index.
//!
//! Each READY session carries one fixed-dimension vector over the
//! concatenation of all its successful transcripts, persisted as
//! `embeddings.json` inside the session directory. Reopen-and-finalize
//! recomputes the vector over the full corpus; incremental embedding is
//! rejected so the vector stays semantically coherent with the whole
//! session.

use std::fs;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::embedding::Embedder;
use crate::session::model::{Session, TranscriptionStatus};
use crate::session::{SessionManager, SessionStore};
use crate::types::{sha256_hex, CoreError, CoreResult, SessionId};

/// Persisted per-session embedding record (`embeddings.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEmbedding {
    pub session_id: SessionId,
    pub model: String,
    pub dimension: usize,
    pub vector: Vec<f32>,
    pub source_text_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Index diagnostics for the doctor command and `get_index_status`.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub indexed_sessions: usize,
    pub total_sessions: usize,
    pub model: String,
    pub dimension: usize,
}

/// Computes and persists session vectors.
pub struct EmbeddingIndexer {
    store: SessionStore,
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingIndexer {
    pub fn new(store: SessionStore, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Concatenate all successful transcripts in sequence order.
    pub fn corpus_text(&self, session: &Session) -> CoreResult<String> {
        let mut parts = Vec::new();
        for segment in &session.audio_entries {
            if segment.transcription_status != TranscriptionStatus::Success {
                continue;
            }
            let Some(filename) = &segment.transcript_filename else {
                continue;
            };
            match self.store.read_transcript(&session.id, filename) {
                Ok(text) => parts.push(text),
                Err(e) => {
                    warn!(session_id = %session.id, sequence = segment.sequence, error = %e,
                        "transcript unreadable, skipped from corpus");
                }
            }
        }
        Ok(parts.join("\n\n"))
    }

    /// Embed the session's full corpus and persist the record. A session
    /// without any successful transcript text yields no vector.
    pub async fn index_session(&self, session: &Session) -> CoreResult<Option<SessionEmbedding>> {
        let corpus = self.corpus_text(session)?;
        if corpus.trim().is_empty() {
            info!(session_id = %session.id, "empty corpus, session left unindexed");
            return Ok(None);
        }

        let source_text_hash = sha256_hex(corpus.as_bytes());
        // Unchanged corpus keeps its vector (reopen with no new audio).
        if let Some(existing) = self.load(&session.id) {
            if existing.source_text_hash == source_text_hash {
                return Ok(Some(existing));
            }
        }

        let vector = self.embedder.embed(&corpus).await?;
        let record = SessionEmbedding {
            session_id: session.id.clone(),
            model: self.embedder.model_name().to_string(),
            dimension: vector.len(),
            vector,
            source_text_hash,
            created_at: Utc::now(),
        };
        self.persist(&record)?;
        info!(session_id = %session.id, dim = record.dimension, "session indexed");
        Ok(Some(record))
    }

    fn persist(&self, record: &SessionEmbedding) -> CoreResult<()> {
        let path = self.store.embeddings_path(&record.session_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string(record)
            .map_err(|e| CoreError::Internal(format!("embedding serialization failed: {e}")))?;
        fs::write(&tmp, json).map_err(|e| CoreError::io("write embedding tmp", e))?;
        fs::rename(&tmp, &path).map_err(|e| CoreError::io("rename embedding", e))?;
        Ok(())
    }

    /// Load a session's embedding record, if present and well formed.
    pub fn load(&self, id: &SessionId) -> Option<SessionEmbedding> {
        let contents = fs::read_to_string(self.store.embeddings_path(id)).ok()?;
        match serde_json::from_str::<SessionEmbedding>(&contents) {
            Ok(record) if record.session_id == *id => Some(record),
            Ok(_) => {
                warn!(session_id = %id, "embedding record claims another session, ignored");
                None
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "malformed embedding record ignored");
                None
            }
        }
    }

    pub fn status(&self, sessions: &[Session]) -> IndexStatus {
        let indexed = sessions
            .iter()
            .filter(|s| self.load(&s.id).is_some())
            .count();
        IndexStatus {
            indexed_sessions: indexed,
            total_sessions: sessions.len(),
            model: self.embedder.model_name().to_string(),
            dimension: self.embedder.dimension(),
        }
    }
}

/// Background worker consuming embedding jobs emitted by the
/// transcription queue: TRANSCRIBED → EMBEDDING → READY.
pub struct IndexerWorker {
    indexer: EmbeddingIndexer,
    manager: Arc<SessionManager>,
    rx: mpsc::UnboundedReceiver<SessionId>,
    shutdown: broadcast::Receiver<()>,
}

impl IndexerWorker {
    pub fn new(
        indexer: EmbeddingIndexer,
        manager: Arc<SessionManager>,
        rx: mpsc::UnboundedReceiver<SessionId>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            indexer,
            manager,
            rx,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("embedding indexer started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => break,
                job = self.rx.recv() => {
                    match job {
                        Some(id) => self.process(&id).await,
                        None => break,
                    }
                }
            }
        }
        info!("embedding indexer stopped");
    }

    async fn process(&self, id: &SessionId) {
        let session = match self.manager.begin_embedding(id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(session_id = %id, error = %e, "embedding job skipped");
                return;
            }
        };

        // Embedding failure degrades gracefully: the session still
        // reaches READY and search falls back to the text tier.
        match self.indexer.index_session(&session).await {
            Ok(_) => {}
            Err(e) => {
                error!(session_id = %id, error = %e, "session embedding failed");
                let _ = self
                    .manager
                    .with_session_mut(id, |s| {
                        s.log_error(crate::session::model::SessionErrorEntry {
                            timestamp: Utc::now(),
                            operation: "embedding".into(),
                            target: id.to_string(),
                            message: e.to_string(),
                            recoverable: true,
                        });
                        Ok(())
                    })
                    .await;
            }
        }

        if let Err(e) = self.manager.complete_embedding(id, Utc::now()).await {
            error!(session_id = %id, error = %e, "embedding completion transition failed");
        }
    }
}
