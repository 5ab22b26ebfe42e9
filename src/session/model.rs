//! Session data model and state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChatId, CoreError, CoreResult, SessionId};

/// Lifecycle state of a session.
///
/// Legal transitions:
/// `COLLECTING → TRANSCRIBING → TRANSCRIBED → EMBEDDING → READY`, with
/// `READY → COLLECTING` on reopen, `COLLECTING → INTERRUPTED` on crash
/// detection, `INTERRUPTED → COLLECTING` on resume and any state →
/// `ERROR` on unrecoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Collecting,
    Transcribing,
    Transcribed,
    Embedding,
    Ready,
    Interrupted,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Collecting => "COLLECTING",
            SessionState::Transcribing => "TRANSCRIBING",
            SessionState::Transcribed => "TRANSCRIBED",
            SessionState::Embedding => "EMBEDDING",
            SessionState::Ready => "READY",
            SessionState::Interrupted => "INTERRUPTED",
            SessionState::Error => "ERROR",
        }
    }

    /// Whether audio ingestion is accepted in this state.
    pub fn accepts_audio(&self) -> bool {
        matches!(self, SessionState::Collecting)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events driving the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Finalize,
    /// Transcription settled; true when at least one segment succeeded.
    TranscriptionDone { any_success: bool },
    EmbeddingDone,
    Reopen,
    /// Startup sweep found the session COLLECTING with no live owner.
    CrashSweep,
    /// Explicit user resume of an interrupted session.
    Resume,
    Fail,
}

impl SessionEvent {
    fn name(&self) -> &'static str {
        match self {
            SessionEvent::Finalize => "finalize",
            SessionEvent::TranscriptionDone { .. } => "transcription_done",
            SessionEvent::EmbeddingDone => "embedding_done",
            SessionEvent::Reopen => "reopen",
            SessionEvent::CrashSweep => "crash_sweep",
            SessionEvent::Resume => "resume",
            SessionEvent::Fail => "fail",
        }
    }
}

/// Per-segment transcription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TranscriptionStatus {
    Pending,
    Success,
    Failed,
}

/// Aggregate processing status over all segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Idle,
    InProgress,
    Complete,
    Failed,
}

/// One captured audio segment. Append-only; bytes on disk are immutable
/// after a successful write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSegment {
    /// 1-indexed, gapless within the session
    pub sequence: u32,
    pub received_at: DateTime<Utc>,
    pub local_filename: String,
    pub file_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// SHA-256 of the audio bytes, hex encoded
    pub checksum: String,
    pub transcription_status: TranscriptionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_filename: Option<String>,
    /// 0 for original capture; the reopen cycle number otherwise
    #[serde(default)]
    pub reopen_epoch: u32,
}

/// One entry in a session's error log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub target: String,
    pub message: String,
    pub recoverable: bool,
}

/// Per-session UI preferences, persisted in metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UiPreferences {
    /// Strip decorative glyphs from rendered messages
    #[serde(default)]
    pub simplified_ui: bool,
    /// Include prior oracle responses in subsequent oracle contexts
    #[serde(default = "default_true")]
    pub include_llm_history: bool,
}

fn default_true() -> bool {
    true
}

impl Default for UiPreferences {
    fn default() -> Self {
        Self {
            simplified_ui: false,
            include_llm_history: true,
        }
    }
}

/// How the session's display name was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameSource {
    Timestamp,
    Transcript,
}

/// The root entity: an append-only timeline of audio segments governed by
/// the state machine above, owned exclusively by the session manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub chat_id: ChatId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
    pub intelligible_name: String,
    pub name_source: NameSource,
    pub processing_status: ProcessingStatus,
    #[serde(default)]
    pub reopen_count: u32,
    #[serde(default)]
    pub ui_preferences: UiPreferences,
    #[serde(default)]
    pub audio_entries: Vec<AudioSegment>,
    #[serde(default)]
    pub errors: Vec<SessionErrorEntry>,
}

impl Session {
    /// Create a new COLLECTING session for a chat at the given instant.
    pub fn new(chat_id: ChatId, created_at: DateTime<Utc>) -> Self {
        let id = SessionId::from_timestamp(created_at);
        Self {
            intelligible_name: id.0.clone(),
            id,
            chat_id,
            state: SessionState::Collecting,
            created_at,
            finalized_at: None,
            name_source: NameSource::Timestamp,
            processing_status: ProcessingStatus::Idle,
            reopen_count: 0,
            ui_preferences: UiPreferences::default(),
            audio_entries: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Apply a lifecycle event, mutating state per the transition table.
    ///
    /// Rejections surface [`CoreError::IllegalTransition`]; no state is
    /// changed on rejection.
    pub fn apply(&mut self, event: SessionEvent, now: DateTime<Utc>) -> CoreResult<()> {
        use SessionEvent as E;
        use SessionState as S;

        let next = match (self.state, event) {
            (S::Collecting, E::Finalize) => S::Transcribing,
            (S::Collecting, E::CrashSweep) => S::Interrupted,
            (S::Transcribing, E::TranscriptionDone { any_success: true }) => S::Transcribed,
            (S::Transcribing, E::TranscriptionDone { any_success: false }) => S::Error,
            (S::Embedding, E::EmbeddingDone) => S::Ready,
            (S::Ready, E::Reopen) => {
                self.reopen_count += 1;
                self.finalized_at = None;
                S::Collecting
            }
            (S::Interrupted, E::Resume) => S::Collecting,
            (S::Interrupted, E::Finalize) => S::Transcribing,
            (_, E::Fail) => S::Error,
            (from, event) => {
                return Err(CoreError::IllegalTransition {
                    from: from.as_str(),
                    event: event.name(),
                })
            }
        };

        if matches!(event, E::Finalize) {
            self.finalized_at = Some(now);
        }
        self.state = next;
        self.processing_status = self.aggregate_status();
        Ok(())
    }

    /// Enter the EMBEDDING state from TRANSCRIBED.
    pub fn begin_embedding(&mut self) -> CoreResult<()> {
        if self.state != SessionState::Transcribed {
            return Err(CoreError::IllegalTransition {
                from: self.state.as_str(),
                event: "begin_embedding",
            });
        }
        self.state = SessionState::Embedding;
        Ok(())
    }

    /// The epoch assigned to segments captured in the current open cycle.
    pub fn current_epoch(&self) -> u32 {
        self.reopen_count
    }

    /// The next segment sequence number (1-indexed, dense).
    pub fn next_sequence(&self) -> u32 {
        self.audio_entries.len() as u32 + 1
    }

    pub fn segment(&self, sequence: u32) -> Option<&AudioSegment> {
        self.audio_entries.get(sequence.checked_sub(1)? as usize)
    }

    pub fn segment_mut(&mut self, sequence: u32) -> Option<&mut AudioSegment> {
        self.audio_entries.get_mut(sequence.checked_sub(1)? as usize)
    }

    /// Segments still awaiting transcription.
    pub fn pending_segments(&self) -> impl Iterator<Item = &AudioSegment> {
        self.audio_entries
            .iter()
            .filter(|e| e.transcription_status == TranscriptionStatus::Pending)
    }

    /// Aggregate status derived from segment statuses.
    pub fn aggregate_status(&self) -> ProcessingStatus {
        if self.audio_entries.is_empty() {
            return ProcessingStatus::Idle;
        }
        let mut pending = 0usize;
        let mut success = 0usize;
        for entry in &self.audio_entries {
            match entry.transcription_status {
                TranscriptionStatus::Pending => pending += 1,
                TranscriptionStatus::Success => success += 1,
                TranscriptionStatus::Failed => {}
            }
        }
        if pending > 0 {
            if self.state == SessionState::Collecting {
                ProcessingStatus::Idle
            } else {
                ProcessingStatus::InProgress
            }
        } else if success > 0 {
            ProcessingStatus::Complete
        } else {
            ProcessingStatus::Failed
        }
    }

    /// Append an error entry, trimming the log to the most recent 50.
    pub fn log_error(&mut self, entry: SessionErrorEntry) {
        self.errors.push(entry);
        if self.errors.len() > 50 {
            let excess = self.errors.len() - 50;
            self.errors.drain(..excess);
        }
    }

    /// Structural validation applied on every load.
    ///
    /// Checks the dense 1..N sequence invariant, checksum shape and
    /// epoch monotonicity. Content checksums are verified separately by
    /// [`crate::session::AudioCapture::verify_integrity`].
    pub fn validate(&self) -> CoreResult<()> {
        if !self.id.is_well_formed() {
            return Err(self.corrupt(format!("malformed session id '{}'", self.id)));
        }
        for (i, entry) in self.audio_entries.iter().enumerate() {
            let expected = i as u32 + 1;
            if entry.sequence != expected {
                return Err(self.corrupt(format!(
                    "segment sequence {} at position {} (expected {})",
                    entry.sequence, i, expected
                )));
            }
            if entry.checksum.len() != 64 || !entry.checksum.chars().all(|c| c.is_ascii_hexdigit())
            {
                return Err(self.corrupt(format!(
                    "segment {} has malformed checksum",
                    entry.sequence
                )));
            }
            if entry.reopen_epoch > self.reopen_count {
                return Err(self.corrupt(format!(
                    "segment {} epoch {} exceeds reopen count {}",
                    entry.sequence, entry.reopen_epoch, self.reopen_count
                )));
            }
            if entry.transcription_status == TranscriptionStatus::Success
                && entry.transcript_filename.is_none()
            {
                return Err(self.corrupt(format!(
                    "segment {} marked SUCCESS without a transcript file",
                    entry.sequence
                )));
            }
        }
        // Epochs never decrease along the timeline.
        for pair in self.audio_entries.windows(2) {
            if pair[1].reopen_epoch < pair[0].reopen_epoch {
                return Err(self.corrupt("segment epochs decrease along the timeline".into()));
            }
        }
        Ok(())
    }

    fn corrupt(&self, reason: String) -> CoreError {
        CoreError::CorruptSession {
            id: self.id.0.clone(),
            reason,
        }
    }

    /// Counts of (successful, total) segments.
    pub fn transcription_counts(&self) -> (usize, usize) {
        let success = self
            .audio_entries
            .iter()
            .filter(|e| e.transcription_status == TranscriptionStatus::Success)
            .count();
        (success, self.audio_entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
    }

    fn segment(seq: u32, epoch: u32) -> AudioSegment {
        AudioSegment {
            sequence: seq,
            received_at: t0(),
            local_filename: format!("{:03}_100000.ogg", seq),
            file_size_bytes: 10,
            duration_seconds: Some(1.5),
            checksum: "a".repeat(64),
            transcription_status: TranscriptionStatus::Pending,
            transcript_filename: None,
            reopen_epoch: epoch,
        }
    }

    #[test]
    fn test_new_session_is_collecting() {
        let s = Session::new(ChatId(42), t0());
        assert_eq!(s.id.as_str(), "2025-01-01_10-00-00");
        assert_eq!(s.state, SessionState::Collecting);
        assert_eq!(s.reopen_count, 0);
        assert!(s.ui_preferences.include_llm_history);
        assert_eq!(s.processing_status, ProcessingStatus::Idle);
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut s = Session::new(ChatId(1), t0());
        s.audio_entries.push(segment(1, 0));
        s.apply(SessionEvent::Finalize, t0()).unwrap();
        assert_eq!(s.state, SessionState::Transcribing);
        assert!(s.finalized_at.is_some());

        s.segment_mut(1).unwrap().transcription_status = TranscriptionStatus::Success;
        s.segment_mut(1).unwrap().transcript_filename = Some("001_100000.txt".into());
        s.apply(SessionEvent::TranscriptionDone { any_success: true }, t0())
            .unwrap();
        assert_eq!(s.state, SessionState::Transcribed);

        s.begin_embedding().unwrap();
        assert_eq!(s.state, SessionState::Embedding);
        s.apply(SessionEvent::EmbeddingDone, t0()).unwrap();
        assert_eq!(s.state, SessionState::Ready);
        assert_eq!(s.processing_status, ProcessingStatus::Complete);
    }

    #[test]
    fn test_reopen_increments_epoch() {
        let mut s = Session::new(ChatId(1), t0());
        s.state = SessionState::Ready;
        s.apply(SessionEvent::Reopen, t0()).unwrap();
        assert_eq!(s.state, SessionState::Collecting);
        assert_eq!(s.reopen_count, 1);
        assert_eq!(s.current_epoch(), 1);
        assert!(s.finalized_at.is_none());
    }

    #[test]
    fn test_all_failed_moves_to_error() {
        let mut s = Session::new(ChatId(1), t0());
        s.audio_entries.push(segment(1, 0));
        s.apply(SessionEvent::Finalize, t0()).unwrap();
        s.segment_mut(1).unwrap().transcription_status = TranscriptionStatus::Failed;
        s.apply(SessionEvent::TranscriptionDone { any_success: false }, t0())
            .unwrap();
        assert_eq!(s.state, SessionState::Error);
        assert_eq!(s.processing_status, ProcessingStatus::Failed);
    }

    #[test]
    fn test_illegal_transitions_rejected_without_mutation() {
        let mut s = Session::new(ChatId(1), t0());
        let err = s.apply(SessionEvent::Reopen, t0()).unwrap_err();
        assert!(matches!(err, CoreError::IllegalTransition { .. }));
        assert_eq!(s.state, SessionState::Collecting);
        assert_eq!(s.reopen_count, 0);

        s.state = SessionState::Transcribing;
        assert!(s.apply(SessionEvent::Finalize, t0()).is_err());
        assert!(s.apply(SessionEvent::CrashSweep, t0()).is_err());
    }

    #[test]
    fn test_interrupted_paths() {
        let mut s = Session::new(ChatId(1), t0());
        s.apply(SessionEvent::CrashSweep, t0()).unwrap();
        assert_eq!(s.state, SessionState::Interrupted);

        let mut resumed = s.clone();
        resumed.apply(SessionEvent::Resume, t0()).unwrap();
        assert_eq!(resumed.state, SessionState::Collecting);

        s.apply(SessionEvent::Finalize, t0()).unwrap();
        assert_eq!(s.state, SessionState::Transcribing);
    }

    #[test]
    fn test_validate_dense_sequences() {
        let mut s = Session::new(ChatId(1), t0());
        s.audio_entries.push(segment(1, 0));
        s.audio_entries.push(segment(2, 0));
        assert!(s.validate().is_ok());

        s.audio_entries[1].sequence = 3;
        let err = s.validate().unwrap_err();
        assert!(matches!(err, CoreError::CorruptSession { .. }));
    }

    #[test]
    fn test_validate_epoch_bounds() {
        let mut s = Session::new(ChatId(1), t0());
        s.audio_entries.push(segment(1, 2));
        assert!(s.validate().is_err());

        s.reopen_count = 2;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_metadata_roundtrip() {
        let mut s = Session::new(ChatId(42), t0());
        s.audio_entries.push(segment(1, 0));
        let json = serde_json::to_string_pretty(&s).unwrap();
        assert!(json.contains("\"COLLECTING\""));
        assert!(json.contains("\"PENDING\""));
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, s.id);
        assert_eq!(back.state, s.state);
        assert_eq!(back.audio_entries.len(), 1);
    }
}
