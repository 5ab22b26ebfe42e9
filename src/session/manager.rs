//! Session lifecycle operations and the active-session registry.
//!
//! The manager exclusively owns session mutation: every operation that
//! touches a session's metadata runs under that session's dedicated
//! mutex, loaded fresh from the store and persisted before the lock is
//! released. Cross-session operations never hold two session locks at
//! once.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::session::audio::{AudioCapture, IntegrityReport, OrphanReport};
use crate::session::model::{
    Session, SessionErrorEntry, SessionEvent, SessionState, TranscriptionStatus,
};
use crate::session::store::SessionStore;
use crate::types::{ChatId, CoreError, CoreResult, SessionId};

/// Outcome of a create-session request.
#[derive(Debug)]
pub enum CreateOutcome {
    Created(Session),
    /// An active (COLLECTING) session already exists for the chat. The
    /// caller resolves the conflict with user-visible confirmation; there
    /// is never a silent auto-finalize.
    Conflict { active: Session },
}

pub struct SessionManager {
    store: SessionStore,
    capture: AudioCapture,
    /// chat → active COLLECTING session
    active: Mutex<HashMap<ChatId, SessionId>>,
    /// Per-session mutation locks
    locks: Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(store: SessionStore, capture: AudioCapture) -> Self {
        Self {
            store,
            capture,
            active: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    async fn lock_for(&self, id: &SessionId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run a closure over a freshly loaded session under its mutex,
    /// persisting the result.
    pub async fn with_session_mut<T>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut Session) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut session = self.store.load(id)?;
        let out = f(&mut session)?;
        self.store.save(&session)?;
        Ok(out)
    }

    /// Read-only snapshot of a session.
    pub async fn get_session(&self, id: &SessionId) -> CoreResult<Session> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        self.store.load(id)
    }

    /// The active COLLECTING session for a chat, if any.
    pub async fn active_session(&self, chat_id: ChatId) -> Option<SessionId> {
        self.active.lock().await.get(&chat_id).cloned()
    }

    /// Create a new session, surfacing a conflict when the chat already
    /// has an active one.
    pub async fn create_session(&self, chat_id: ChatId, now: DateTime<Utc>) -> CoreResult<CreateOutcome> {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.get(&chat_id) {
            match self.store.load(existing) {
                Ok(session) if session.state == SessionState::Collecting => {
                    return Ok(CreateOutcome::Conflict { active: session });
                }
                // Registry out of date (deleted or advanced); fall through.
                _ => {
                    active.remove(&chat_id);
                }
            }
        }

        let mut session = Session::new(chat_id, now);
        // Two sessions inside one second would collide on id; nudge forward.
        while self.store.exists(&session.id) {
            session = Session::new(chat_id, session.created_at + chrono::Duration::seconds(1));
        }
        self.store.save(&session)?;
        active.insert(chat_id, session.id.clone());
        info!(session_id = %session.id, chat_id = %chat_id, "session created");
        Ok(CreateOutcome::Created(session))
    }

    /// Append an audio chunk to the chat's active session.
    pub async fn add_audio_chunk(
        &self,
        id: &SessionId,
        bytes: &[u8],
        received_at: DateTime<Utc>,
        duration_seconds: Option<f64>,
    ) -> CoreResult<crate::session::model::AudioSegment> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut session = self.store.load(id)?;
        // AudioCapture persists the snapshot itself on success.
        self.capture
            .add_audio_chunk(&mut session, bytes, received_at, duration_seconds)
    }

    /// Finalize a COLLECTING (or INTERRUPTED) session. Returns the
    /// session snapshot; the caller enqueues its pending segments.
    pub async fn finalize_session(&self, id: &SessionId, now: DateTime<Utc>) -> CoreResult<Session> {
        let session = self
            .with_session_mut(id, |session| {
                if session.audio_entries.is_empty() {
                    return Err(CoreError::validation(
                        "empty_session",
                        "session has no audio to finalize",
                    ));
                }
                session.apply(SessionEvent::Finalize, now)?;
                Ok(session.clone())
            })
            .await?;
        self.active.lock().await.remove(&session.chat_id);
        info!(session_id = %id, pending = session.pending_segments().count(), "session finalized");
        Ok(session)
    }

    /// Reopen a READY session for another capture cycle.
    ///
    /// The active slot for the chat is reserved before the transition so
    /// the one-COLLECTING-session-per-chat invariant holds without ever
    /// holding the registry and a session lock at the same time.
    pub async fn reopen_session(&self, id: &SessionId, now: DateTime<Utc>) -> CoreResult<Session> {
        let chat_id = self.get_session(id).await?.chat_id;
        {
            let mut active = self.active.lock().await;
            if let Some(existing) = active.get(&chat_id) {
                if existing != id {
                    return Err(CoreError::validation(
                        "active_session_exists",
                        format!("chat already has active session {existing}"),
                    ));
                }
            }
            active.insert(chat_id, id.clone());
        }

        match self
            .with_session_mut(id, |session| {
                session.apply(SessionEvent::Reopen, now)?;
                Ok(session.clone())
            })
            .await
        {
            Ok(session) => {
                info!(session_id = %id, epoch = session.reopen_count, "session reopened");
                Ok(session)
            }
            Err(err) => {
                // Release the reservation; the transition never happened.
                let mut active = self.active.lock().await;
                if active.get(&chat_id) == Some(id) {
                    active.remove(&chat_id);
                }
                Err(err)
            }
        }
    }

    /// Resume an INTERRUPTED session back into COLLECTING.
    pub async fn resume_interrupted(&self, id: &SessionId, now: DateTime<Utc>) -> CoreResult<Session> {
        let session = self
            .with_session_mut(id, |session| {
                session.apply(SessionEvent::Resume, now)?;
                Ok(session.clone())
            })
            .await?;
        self.active
            .lock()
            .await
            .insert(session.chat_id, id.clone());
        Ok(session)
    }

    /// Delete a session and its directory outright.
    pub async fn discard_session(&self, id: &SessionId) -> CoreResult<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        if let Ok(session) = self.store.load(id) {
            let mut active = self.active.lock().await;
            if active.get(&session.chat_id) == Some(id) {
                active.remove(&session.chat_id);
            }
        }
        self.store.delete(id)?;
        info!(session_id = %id, "session discarded");
        Ok(())
    }

    /// Startup sweep: any session persisted in COLLECTING has no live
    /// owner after a restart and is moved to INTERRUPTED. Orphan audio
    /// files are re-adopted in the same pass.
    pub async fn detect_interrupted_sessions(&self) -> CoreResult<Vec<Session>> {
        let mut interrupted = Vec::new();
        for id in self.store.list_ids()? {
            let lock = self.lock_for(&id).await;
            let _guard = lock.lock().await;
            let mut session = match self.store.load(&id) {
                Ok(s) => s,
                Err(CoreError::CorruptSession { .. }) => {
                    self.store.move_aside(&id)?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if session.state != SessionState::Collecting {
                continue;
            }
            if let Err(e) = self.capture.recover_orphans(&mut session) {
                warn!(session_id = %id, error = %e, "orphan recovery failed during sweep");
            }
            session.apply(SessionEvent::CrashSweep, Utc::now())?;
            self.store.save(&session)?;
            warn!(session_id = %id, "session classified as interrupted");
            interrupted.push(session);
        }
        Ok(interrupted)
    }

    /// Rebuild the active registry from persisted state (called once at
    /// startup, after the interrupted sweep).
    pub async fn rebuild_active_registry(&self) -> CoreResult<()> {
        let mut active = self.active.lock().await;
        active.clear();
        for session in self.store.load_all()? {
            if session.state == SessionState::Collecting {
                active.insert(session.chat_id, session.id.clone());
            }
        }
        Ok(())
    }

    /// Set the session's derived name. Allowed once, when the source is
    /// still the timestamp; uniqueness across sessions is enforced by
    /// appending "(n)".
    pub async fn update_session_name(&self, id: &SessionId, name: &str) -> CoreResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoreError::validation("empty_name", "derived name is empty"));
        }
        let taken: Vec<String> = self
            .store
            .load_all()?
            .into_iter()
            .filter(|s| s.id != *id)
            .map(|s| s.intelligible_name)
            .collect();
        let unique = dedup_name(name, &taken);

        self.with_session_mut(id, |session| {
            if session.name_source == crate::session::model::NameSource::Transcript {
                return Err(CoreError::validation(
                    "name_already_set",
                    "session name was already derived",
                ));
            }
            session.intelligible_name = unique.clone();
            session.name_source = crate::session::model::NameSource::Transcript;
            Ok(unique.clone())
        })
        .await
    }

    /// Record a segment's transcription result.
    pub async fn record_transcription(
        &self,
        id: &SessionId,
        sequence: u32,
        result: Result<String, CoreError>,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        // Write the transcript outside the metadata mutation to keep the
        // critical section small; the filename is deterministic.
        let transcript_filename = match &result {
            Ok(text) => {
                let session = self.get_session(id).await?;
                let segment = session.segment(sequence).ok_or_else(|| {
                    CoreError::Internal(format!("segment {sequence} missing in {id}"))
                })?;
                let stem = segment
                    .local_filename
                    .rsplit_once('.')
                    .map(|(stem, _)| stem.to_string())
                    .unwrap_or_else(|| segment.local_filename.clone());
                let filename = format!("{stem}.txt");
                self.store.write_transcript(id, &filename, text)?;
                Some(filename)
            }
            Err(_) => None,
        };

        self.with_session_mut(id, |session| {
            let segment = session
                .segment_mut(sequence)
                .ok_or_else(|| CoreError::Internal(format!("segment {sequence} missing in {id}")))?;
            match &result {
                Ok(_) => {
                    segment.transcription_status = TranscriptionStatus::Success;
                    segment.transcript_filename = transcript_filename.clone();
                }
                Err(err) => {
                    segment.transcription_status = TranscriptionStatus::Failed;
                    let entry = SessionErrorEntry {
                        timestamp: now,
                        operation: "transcription".into(),
                        target: format!("segment {sequence}"),
                        message: err.to_string(),
                        recoverable: true,
                    };
                    session.log_error(entry);
                }
            }
            session.processing_status = session.aggregate_status();
            Ok(())
        })
        .await
    }

    /// All pending segments settled: advance the state machine.
    pub async fn complete_transcription(
        &self,
        id: &SessionId,
        now: DateTime<Utc>,
    ) -> CoreResult<Session> {
        self.with_session_mut(id, |session| {
            let (success, _) = session.transcription_counts();
            session.apply(
                SessionEvent::TranscriptionDone {
                    any_success: success > 0,
                },
                now,
            )?;
            Ok(session.clone())
        })
        .await
    }

    /// TRANSCRIBED → EMBEDDING.
    pub async fn begin_embedding(&self, id: &SessionId) -> CoreResult<Session> {
        self.with_session_mut(id, |session| {
            session.begin_embedding()?;
            Ok(session.clone())
        })
        .await
    }

    /// EMBEDDING → READY.
    pub async fn complete_embedding(&self, id: &SessionId, now: DateTime<Utc>) -> CoreResult<Session> {
        self.with_session_mut(id, |session| {
            session.apply(SessionEvent::EmbeddingDone, now)?;
            Ok(session.clone())
        })
        .await
    }

    /// Reset FAILED segments to PENDING for a retry pass. Returns the
    /// sequences that were reset.
    pub async fn reset_failed_segments(&self, id: &SessionId) -> CoreResult<Vec<u32>> {
        self.with_session_mut(id, |session| {
            let mut reset = Vec::new();
            for segment in &mut session.audio_entries {
                if segment.transcription_status == TranscriptionStatus::Failed {
                    segment.transcription_status = TranscriptionStatus::Pending;
                    reset.push(segment.sequence);
                }
            }
            if !reset.is_empty() && session.state == SessionState::Error {
                session.state = SessionState::Transcribing;
            }
            session.processing_status = session.aggregate_status();
            Ok(reset)
        })
        .await
    }

    /// Checksum verification over one session.
    pub async fn verify_integrity(&self, id: &SessionId) -> CoreResult<IntegrityReport> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let session = self.store.load(id)?;
        self.capture.verify_integrity(&session)
    }

    /// Disk/metadata reconciliation over one session.
    pub async fn recover_orphans(&self, id: &SessionId) -> CoreResult<OrphanReport> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut session = self.store.load(id)?;
        self.capture.recover_orphans(&mut session)
    }
}

/// Make `name` unique against `taken` by appending "(n)".
fn dedup_name(name: &str, taken: &[String]) -> String {
    if !taken.iter().any(|t| t == name) {
        return name.to_string();
    }
    for n in 2.. {
        let candidate = format!("{name} ({n})");
        if !taken.iter().any(|t| *t == candidate) {
            return candidate;
        }
    }
    unreachable!("dedup counter exhausted")
}

/// Derive a short display name from transcript text: drop stop words,
/// keep the first few meaningful tokens.
pub fn derive_name(transcript: &str) -> Option<String> {
    const MAX_TOKENS: usize = 4;
    // Portuguese and English function words seen at the start of speech.
    const STOP_WORDS: &[&str] = &[
        "a", "o", "e", "de", "da", "do", "das", "dos", "em", "um", "uma", "que", "com", "para",
        "por", "na", "no", "se", "eu", "ele", "ela", "isso", "essa", "esse", "mas", "como",
        "the", "and", "of", "to", "in", "is", "it", "this", "that", "a", "an", "so", "well",
        "ok", "okay", "então", "aí", "né", "tá",
    ];

    let tokens: Vec<&str> = transcript
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|t| t.chars().count() > 1)
        .filter(|t| !STOP_WORDS.contains(&t.to_lowercase().as_str()))
        .take(MAX_TOKENS)
        .collect();

    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}
