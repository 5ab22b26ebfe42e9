//! Audio segment ingestion and on-disk reconciliation.
//!
//! A chunk append is one logical atomic step: the next sequence is chosen
//! while the session's mutex is held by the caller, bytes go to a temp
//! file, the checksum is computed, the temp file is renamed to its final
//! name and only then is the metadata snapshot written. A failure before
//! the metadata write leaves no trace beyond a removed temp file; a crash
//! between rename and metadata write is healed by the orphan pass.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::session::model::{AudioSegment, Session, TranscriptionStatus};
use crate::session::store::SessionStore;
use crate::types::{sha256_hex, CoreError, CoreResult};

/// Audio ingestion over a session store. Callers serialize per-session
/// access; this type performs the write protocol itself.
#[derive(Debug, Clone)]
pub struct AudioCapture {
    store: SessionStore,
    audio_ext: String,
}

/// Outcome of a checksum verification pass.
#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub verified: Vec<u32>,
    pub mismatched: Vec<u32>,
    pub missing: Vec<u32>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty() && self.missing.is_empty()
    }
}

/// Outcome of reconciling on-disk audio files against metadata.
#[derive(Debug, Default)]
pub struct OrphanReport {
    /// Files found on disk with no metadata entry, now re-adopted
    pub adopted: Vec<String>,
    /// Metadata entries whose file is gone
    pub missing: Vec<u32>,
}

impl AudioCapture {
    pub fn new(store: SessionStore, audio_ext: impl Into<String>) -> Self {
        Self {
            store,
            audio_ext: audio_ext.into(),
        }
    }

    /// Append one audio chunk to a COLLECTING session.
    ///
    /// Duplicate delivery of the most recent chunk (same checksum as the
    /// last segment) is an idempotent no-op returning the existing
    /// segment; the same bytes at a later point in the timeline are a new
    /// segment.
    pub fn add_audio_chunk(
        &self,
        session: &mut Session,
        bytes: &[u8],
        received_at: DateTime<Utc>,
        duration_seconds: Option<f64>,
    ) -> CoreResult<AudioSegment> {
        if !session.state.accepts_audio() {
            return Err(CoreError::IllegalTransition {
                from: session.state.as_str(),
                event: "audio_received",
            });
        }
        if bytes.is_empty() {
            return Err(CoreError::validation("empty_audio", "audio chunk has no bytes"));
        }

        let checksum = sha256_hex(bytes);
        if let Some(last) = session.audio_entries.last() {
            if last.checksum == checksum {
                debug!(
                    session_id = %session.id,
                    sequence = last.sequence,
                    "duplicate chunk replay ignored"
                );
                return Ok(last.clone());
            }
        }

        let sequence = session.next_sequence();
        let filename = format!(
            "{:03}_{}.{}",
            sequence,
            received_at.format("%H%M%S"),
            self.audio_ext
        );

        let audio_dir = self.store.audio_dir(&session.id);
        fs::create_dir_all(&audio_dir).map_err(|e| CoreError::io("create audio dir", e))?;

        let tmp = audio_dir.join(format!(".{filename}.tmp"));
        let final_path = audio_dir.join(&filename);

        let write_result = (|| -> CoreResult<()> {
            fs::write(&tmp, bytes).map_err(|e| CoreError::io("write audio tmp", e))?;
            fs::rename(&tmp, &final_path).map_err(|e| CoreError::io("rename audio", e))?;
            Ok(())
        })();
        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }

        let segment = AudioSegment {
            sequence,
            received_at,
            local_filename: filename,
            file_size_bytes: bytes.len() as u64,
            duration_seconds,
            checksum,
            transcription_status: TranscriptionStatus::Pending,
            transcript_filename: None,
            reopen_epoch: session.current_epoch(),
        };
        session.audio_entries.push(segment.clone());
        session.processing_status = session.aggregate_status();
        self.store.save(session)?;

        info!(
            session_id = %session.id,
            sequence,
            bytes = segment.file_size_bytes,
            epoch = segment.reopen_epoch,
            "audio segment appended"
        );
        Ok(segment)
    }

    /// Verify that every segment's bytes on disk still match its checksum.
    pub fn verify_integrity(&self, session: &Session) -> CoreResult<IntegrityReport> {
        let audio_dir = self.store.audio_dir(&session.id);
        let mut report = IntegrityReport::default();
        for entry in &session.audio_entries {
            let path = audio_dir.join(&entry.local_filename);
            match fs::read(&path) {
                Ok(bytes) => {
                    if sha256_hex(&bytes) == entry.checksum {
                        report.verified.push(entry.sequence);
                    } else {
                        warn!(
                            session_id = %session.id,
                            sequence = entry.sequence,
                            "audio checksum mismatch"
                        );
                        report.mismatched.push(entry.sequence);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    report.missing.push(entry.sequence);
                }
                Err(e) => return Err(CoreError::io("read audio for verification", e)),
            }
        }
        Ok(report)
    }

    /// Reconcile on-disk audio files against metadata.
    ///
    /// Files present on disk but absent from metadata (a crash between
    /// audio rename and metadata write) are re-adopted in filename order
    /// with freshly computed checksums and dense sequence numbers.
    pub fn recover_orphans(&self, session: &mut Session) -> CoreResult<OrphanReport> {
        let audio_dir = self.store.audio_dir(&session.id);
        let mut report = OrphanReport::default();

        for entry in &session.audio_entries {
            if !audio_dir.join(&entry.local_filename).is_file() {
                report.missing.push(entry.sequence);
            }
        }

        let known: std::collections::HashSet<&str> = session
            .audio_entries
            .iter()
            .map(|e| e.local_filename.as_str())
            .collect();

        let mut orphans: Vec<PathBuf> = Vec::new();
        if audio_dir.is_dir() {
            let entries =
                fs::read_dir(&audio_dir).map_err(|e| CoreError::io("read audio dir", e))?;
            for entry in entries {
                let entry = entry.map_err(|e| CoreError::io("read audio dir", e))?;
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') || known.contains(name.as_str()) {
                    continue;
                }
                orphans.push(path);
            }
        }
        orphans.sort();

        for path in orphans {
            let bytes = fs::read(&path).map_err(|e| CoreError::io("read orphan audio", e))?;
            let sequence = session.next_sequence();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            session.audio_entries.push(AudioSegment {
                sequence,
                received_at: file_mtime(&path).unwrap_or_else(Utc::now),
                local_filename: name.clone(),
                file_size_bytes: bytes.len() as u64,
                duration_seconds: None,
                checksum: sha256_hex(&bytes),
                transcription_status: TranscriptionStatus::Pending,
                transcript_filename: None,
                reopen_epoch: session.current_epoch(),
            });
            report.adopted.push(name);
        }

        if !report.adopted.is_empty() {
            session.processing_status = session.aggregate_status();
            self.store.save(session)?;
            info!(
                session_id = %session.id,
                adopted = report.adopted.len(),
                "orphan audio files re-adopted"
            );
        }
        Ok(report)
    }
}

fn file_mtime(path: &PathBuf) -> Option<DateTime<Utc>> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::SessionEvent;
    use crate::types::ChatId;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SessionStore, AudioCapture, Session) {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions"));
        let capture = AudioCapture::new(store.clone(), "ogg");
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let session = Session::new(ChatId(42), t0);
        store.save(&session).unwrap();
        (tmp, store, capture, session)
    }

    #[test]
    fn test_append_writes_bytes_and_metadata() {
        let (_tmp, store, capture, mut session) = setup();
        let t = session.created_at;

        let seg = capture
            .add_audio_chunk(&mut session, b"0123456789", t, Some(2.0))
            .unwrap();
        assert_eq!(seg.sequence, 1);
        assert_eq!(seg.checksum, sha256_hex(b"0123456789"));
        assert_eq!(seg.reopen_epoch, 0);

        let on_disk = std::fs::read(store.audio_dir(&session.id).join(&seg.local_filename)).unwrap();
        assert_eq!(on_disk, b"0123456789");

        let reloaded = store.load(&session.id).unwrap();
        assert_eq!(reloaded.audio_entries.len(), 1);
        assert_eq!(reloaded.audio_entries[0].checksum, seg.checksum);
    }

    #[test]
    fn test_sequences_are_dense() {
        let (_tmp, _store, capture, mut session) = setup();
        let t = session.created_at;
        for i in 0..5u8 {
            capture
                .add_audio_chunk(&mut session, &[i; 4], t, None)
                .unwrap();
        }
        let seqs: Vec<u32> = session.audio_entries.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        session.validate().unwrap();
    }

    #[test]
    fn test_duplicate_replay_is_noop() {
        let (_tmp, _store, capture, mut session) = setup();
        let t = session.created_at;
        let first = capture.add_audio_chunk(&mut session, b"same", t, None).unwrap();
        let second = capture.add_audio_chunk(&mut session, b"same", t, None).unwrap();
        assert_eq!(second.sequence, first.sequence);
        assert_eq!(session.audio_entries.len(), 1);

        // Same bytes later in the timeline become a new segment.
        capture.add_audio_chunk(&mut session, b"other", t, None).unwrap();
        let third = capture.add_audio_chunk(&mut session, b"same", t, None).unwrap();
        assert_eq!(third.sequence, 3);
        assert_eq!(session.audio_entries.len(), 3);
    }

    #[test]
    fn test_rejected_outside_collecting() {
        let (_tmp, _store, capture, mut session) = setup();
        let t = session.created_at;
        capture.add_audio_chunk(&mut session, b"a", t, None).unwrap();
        session.apply(SessionEvent::Finalize, t).unwrap();

        let err = capture
            .add_audio_chunk(&mut session, b"b", t, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::IllegalTransition { .. }));
        assert_eq!(session.audio_entries.len(), 1);
    }

    #[test]
    fn test_verify_integrity_flags_tampering() {
        let (_tmp, store, capture, mut session) = setup();
        let t = session.created_at;
        let seg = capture.add_audio_chunk(&mut session, b"payload", t, None).unwrap();

        let report = capture.verify_integrity(&session).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.verified, vec![1]);

        std::fs::write(
            store.audio_dir(&session.id).join(&seg.local_filename),
            b"tampered",
        )
        .unwrap();
        let report = capture.verify_integrity(&session).unwrap();
        assert_eq!(report.mismatched, vec![1]);
    }

    #[test]
    fn test_recover_orphans_adopts_unlisted_files() {
        let (_tmp, store, capture, mut session) = setup();
        let t = session.created_at;
        capture.add_audio_chunk(&mut session, b"known", t, None).unwrap();

        // Simulate a crash after audio rename but before metadata write.
        std::fs::write(store.audio_dir(&session.id).join("002_100100.ogg"), b"lost").unwrap();

        let report = capture.recover_orphans(&mut session).unwrap();
        assert_eq!(report.adopted, vec!["002_100100.ogg".to_string()]);
        assert_eq!(session.audio_entries.len(), 2);
        assert_eq!(session.audio_entries[1].sequence, 2);
        assert_eq!(session.audio_entries[1].checksum, sha256_hex(b"lost"));
        session.validate().unwrap();

        // A second pass adopts nothing.
        let report = capture.recover_orphans(&mut session).unwrap();
        assert!(report.adopted.is_empty());
    }
}
