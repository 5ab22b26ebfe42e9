//! Atomic JSON persistence of session metadata and the session directory
//! layout.
//!
//! ```text
//! sessions/<id>/
//!   metadata.json
//!   embeddings.json
//!   audio/<NNN>_<hhmmss>.<ext>
//!   audio/tts/<NNN>_<persona>.<fmt>
//!   transcripts/<NNN>_<hhmmss>.txt
//!   llm_responses/<NNN>_<persona>.txt
//!   logs/llm_traffic.jsonl
//!   process/input.txt
//!   process/output/
//! ```
//!
//! Writes serialize to a temporary file in the session directory, sync,
//! then rename over `metadata.json`, so readers observe either the prior
//! snapshot or the new one, never a partial write.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::session::model::Session;
use crate::types::{CoreError, CoreResult, SessionId};

const METADATA_FILE: &str = "metadata.json";
const METADATA_TMP: &str = "metadata.json.tmp";

/// Filesystem-backed session store rooted at a sessions directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn audio_dir(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join("audio")
    }

    pub fn tts_dir(&self, id: &SessionId) -> PathBuf {
        self.audio_dir(id).join("tts")
    }

    pub fn transcripts_dir(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join("transcripts")
    }

    pub fn responses_dir(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join("llm_responses")
    }

    pub fn logs_dir(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join("logs")
    }

    pub fn process_dir(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join("process")
    }

    pub fn embeddings_path(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join("embeddings.json")
    }

    fn metadata_path(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join(METADATA_FILE)
    }

    pub fn exists(&self, id: &SessionId) -> bool {
        self.metadata_path(id).is_file()
    }

    /// Persist a session snapshot atomically.
    pub fn save(&self, session: &Session) -> CoreResult<()> {
        let dir = self.session_dir(&session.id);
        fs::create_dir_all(&dir).map_err(|e| CoreError::io("create session dir", e))?;

        let json = serde_json::to_string_pretty(session)
            .map_err(|e| CoreError::Internal(format!("metadata serialization failed: {e}")))?;

        let tmp = dir.join(METADATA_TMP);
        {
            let mut file =
                fs::File::create(&tmp).map_err(|e| CoreError::io("create metadata tmp", e))?;
            file.write_all(json.as_bytes())
                .map_err(|e| CoreError::io("write metadata tmp", e))?;
            file.sync_all()
                .map_err(|e| CoreError::io("sync metadata tmp", e))?;
        }
        fs::rename(&tmp, self.metadata_path(&session.id))
            .map_err(|e| CoreError::io("rename metadata", e))?;

        debug!(session_id = %session.id, state = %session.state, "session saved");
        Ok(())
    }

    /// Load and structurally validate a session.
    pub fn load(&self, id: &SessionId) -> CoreResult<Session> {
        let path = self.metadata_path(id);
        let contents = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::validation("session_not_found", format!("session {id} does not exist"))
            } else {
                CoreError::io("read metadata", e)
            }
        })?;

        let session: Session =
            serde_json::from_str(&contents).map_err(|e| CoreError::CorruptSession {
                id: id.0.clone(),
                reason: format!("malformed metadata: {e}"),
            })?;

        if session.id != *id {
            return Err(CoreError::CorruptSession {
                id: id.0.clone(),
                reason: format!("metadata claims id '{}'", session.id),
            });
        }
        session.validate()?;
        Ok(session)
    }

    /// Ids of all session directories, sorted ascending (= chronological).
    pub fn list_ids(&self) -> CoreResult<Vec<SessionId>> {
        let mut ids = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(CoreError::io("read sessions root", e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| CoreError::io("read sessions root", e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let id = SessionId(name);
            if id.is_well_formed() && self.exists(&id) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load every readable session, skipping corrupt ones with a warning.
    pub fn load_all(&self) -> CoreResult<Vec<Session>> {
        let mut sessions = Vec::new();
        for id in self.list_ids()? {
            match self.load(&id) {
                Ok(session) => sessions.push(session),
                Err(err) => warn!(session_id = %id, error = %err, "skipping unreadable session"),
            }
        }
        Ok(sessions)
    }

    /// Remove a session directory entirely.
    pub fn delete(&self, id: &SessionId) -> CoreResult<()> {
        let dir = self.session_dir(id);
        if dir.is_dir() {
            fs::remove_dir_all(&dir).map_err(|e| CoreError::io("delete session dir", e))?;
        }
        Ok(())
    }

    /// Rename a corrupt session directory aside so recovery can proceed.
    pub fn move_aside(&self, id: &SessionId) -> CoreResult<PathBuf> {
        let from = self.session_dir(id);
        let to = self.root.join(format!(
            "{}.corrupt-{}",
            id.as_str(),
            Utc::now().format("%Y%m%d%H%M%S")
        ));
        fs::rename(&from, &to).map_err(|e| CoreError::io("move session aside", e))?;
        warn!(session_id = %id, moved_to = %to.display(), "corrupt session moved aside");
        Ok(to)
    }

    /// Write a transcript next to the audio it came from.
    pub fn write_transcript(
        &self,
        id: &SessionId,
        filename: &str,
        text: &str,
    ) -> CoreResult<PathBuf> {
        let dir = self.transcripts_dir(id);
        fs::create_dir_all(&dir).map_err(|e| CoreError::io("create transcripts dir", e))?;
        let path = dir.join(filename);
        fs::write(&path, text).map_err(|e| CoreError::io("write transcript", e))?;
        Ok(path)
    }

    /// Read the transcript for a segment, if present.
    pub fn read_transcript(&self, id: &SessionId, filename: &str) -> CoreResult<String> {
        fs::read_to_string(self.transcripts_dir(id).join(filename))
            .map_err(|e| CoreError::io("read transcript", e))
    }

    /// Append one JSON line to the session's LLM traffic log.
    pub fn append_llm_traffic(&self, id: &SessionId, line: &serde_json::Value) -> CoreResult<()> {
        let dir = self.logs_dir(id);
        fs::create_dir_all(&dir).map_err(|e| CoreError::io("create logs dir", e))?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("llm_traffic.jsonl"))
            .map_err(|e| CoreError::io("open llm traffic log", e))?;
        writeln!(file, "{line}").map_err(|e| CoreError::io("append llm traffic log", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::{AudioSegment, TranscriptionStatus};
    use crate::types::ChatId;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn store() -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        (dir, store)
    }

    fn sample_session() -> Session {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let mut s = Session::new(ChatId(42), t0);
        s.audio_entries.push(AudioSegment {
            sequence: 1,
            received_at: t0,
            local_filename: "001_100000.ogg".into(),
            file_size_bytes: 10,
            duration_seconds: None,
            checksum: "b".repeat(64),
            transcription_status: TranscriptionStatus::Pending,
            transcript_filename: None,
            reopen_epoch: 0,
        });
        s
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_tmp, store) = store();
        let session = sample_session();
        store.save(&session).unwrap();

        let loaded = store.load(&session.id).unwrap();
        assert_eq!(
            serde_json::to_value(&loaded).unwrap(),
            serde_json::to_value(&session).unwrap()
        );
        // No temp file left behind.
        assert!(!store.session_dir(&session.id).join(METADATA_TMP).exists());
    }

    #[test]
    fn test_load_missing_is_validation_error() {
        let (_tmp, store) = store();
        let err = store.load(&SessionId::from("2025-01-01_00-00-00")).unwrap_err();
        assert_eq!(err.catalog_code(), "session_not_found");
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let (_tmp, store) = store();
        let session = sample_session();
        store.save(&session).unwrap();
        std::fs::write(
            store.session_dir(&session.id).join(METADATA_FILE),
            "{ not json",
        )
        .unwrap();
        let err = store.load(&session.id).unwrap_err();
        assert!(matches!(err, CoreError::CorruptSession { .. }));
    }

    #[test]
    fn test_load_rejects_gapped_sequences() {
        let (_tmp, store) = store();
        let mut session = sample_session();
        session.audio_entries[0].sequence = 2;
        // Bypass save-side validation by writing the JSON directly.
        let dir = store.session_dir(&session.id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(METADATA_FILE),
            serde_json::to_string(&session).unwrap(),
        )
        .unwrap();
        let err = store.load(&session.id).unwrap_err();
        assert!(matches!(err, CoreError::CorruptSession { .. }));
    }

    #[test]
    fn test_list_ids_sorted_and_filtered() {
        let (_tmp, store) = store();
        let t = Utc.with_ymd_and_hms(2025, 1, 2, 8, 0, 0).unwrap();
        let older = Session::new(ChatId(1), t - chrono::Duration::hours(1));
        let newer = Session::new(ChatId(1), t);
        store.save(&newer).unwrap();
        store.save(&older).unwrap();
        // A stray non-session directory is ignored.
        std::fs::create_dir_all(store.root().join("not-a-session")).unwrap();

        let ids = store.list_ids().unwrap();
        assert_eq!(ids, vec![older.id.clone(), newer.id.clone()]);
    }

    #[test]
    fn test_delete_and_move_aside() {
        let (_tmp, store) = store();
        let session = sample_session();
        store.save(&session).unwrap();

        let aside = store.move_aside(&session.id).unwrap();
        assert!(aside.exists());
        assert!(!store.exists(&session.id));

        let session2 = sample_session();
        store.save(&session2).unwrap();
        store.delete(&session2.id).unwrap();
        assert!(!store.session_dir(&session2.id).exists());
    }

    #[test]
    fn test_transcript_roundtrip() {
        let (_tmp, store) = store();
        let session = sample_session();
        store.save(&session).unwrap();
        store
            .write_transcript(&session.id, "001_100000.txt", "hello world")
            .unwrap();
        let text = store.read_transcript(&session.id, "001_100000.txt").unwrap();
        assert_eq!(text, "hello world");
    }
}
