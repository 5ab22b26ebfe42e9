//! Narrative pipeline adapter.
//!
//! The artifact chain that turns a finalized session's transcripts into
//! narrative outputs is an external collaborator. The contract is
//! file-based only: this adapter consolidates transcripts into
//! `process/input.txt`, invokes the configured command with the input
//! file and output directory as arguments, and maps failures onto the
//! documented exit codes.

use std::fs;
use std::path::PathBuf;

use tracing::{error, info, warn};

use crate::session::model::{Session, TranscriptionStatus};
use crate::session::SessionStore;
use crate::types::{CoreError, CoreResult, SessionId};

/// Adapter exit codes.
pub const EXIT_OK: i32 = 0;
pub const EXIT_USAGE: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_VALIDATION: i32 = 3;
pub const EXIT_CAPABILITY: i32 = 4;
pub const EXIT_INTERNAL: i32 = 5;

/// Consolidate a session's successful transcripts into
/// `process/input.txt`, returning its path.
pub fn prepare_input(store: &SessionStore, session: &Session) -> CoreResult<PathBuf> {
    let mut blocks = Vec::new();
    for segment in &session.audio_entries {
        if segment.transcription_status != TranscriptionStatus::Success {
            continue;
        }
        let Some(filename) = &segment.transcript_filename else {
            continue;
        };
        match store.read_transcript(&session.id, filename) {
            Ok(body) => blocks.push(format!(
                "[{} — {}]\n{}",
                segment.sequence,
                segment.received_at.format("%Y-%m-%d %H:%M:%S"),
                body
            )),
            Err(e) => {
                warn!(session_id = %session.id, sequence = segment.sequence, error = %e,
                    "transcript skipped from consolidated input");
            }
        }
    }
    if blocks.is_empty() {
        return Err(CoreError::validation(
            "no_transcripts",
            "session has no successful transcripts to consolidate",
        ));
    }

    let dir = store.process_dir(&session.id);
    fs::create_dir_all(&dir).map_err(|e| CoreError::io("create process dir", e))?;
    let path = dir.join("input.txt");
    fs::write(&path, blocks.join("\n\n")).map_err(|e| CoreError::io("write process input", e))?;
    Ok(path)
}

/// Invokes the external artifact chain over one session.
pub struct NarrativeAdapter {
    store: SessionStore,
    command: String,
}

impl NarrativeAdapter {
    pub fn new(store: SessionStore, command: impl Into<String>) -> Self {
        Self {
            store,
            command: command.into(),
        }
    }

    /// Run the chain. Returns the process exit code per the adapter
    /// contract; never panics.
    pub async fn run(&self, id: &SessionId) -> i32 {
        if self.command.trim().is_empty() {
            error!("narrative.command is not configured");
            return EXIT_CONFIG;
        }

        let session = match self.store.load(id) {
            Ok(session) => session,
            Err(e) => {
                error!(session_id = %id, error = %e, "session unavailable");
                return EXIT_VALIDATION;
            }
        };

        let input = match prepare_input(&self.store, &session) {
            Ok(path) => path,
            Err(CoreError::Validation { .. }) => {
                error!(session_id = %id, "nothing to narrate");
                return EXIT_VALIDATION;
            }
            Err(e) => {
                error!(session_id = %id, error = %e, "input consolidation failed");
                return EXIT_INTERNAL;
            }
        };

        let output_dir = self.store.process_dir(id).join("output");
        if let Err(e) = fs::create_dir_all(&output_dir) {
            error!(error = %e, "cannot create output directory");
            return EXIT_INTERNAL;
        }

        // Whitespace-split invocation; the chain owns its own parsing
        // beyond that.
        let mut parts = self.command.split_whitespace();
        let Some(program) = parts.next() else {
            return EXIT_CONFIG;
        };
        let mut command = tokio::process::Command::new(program);
        command
            .args(parts)
            .arg(&input)
            .arg(&output_dir)
            .current_dir(self.store.session_dir(id));

        info!(session_id = %id, program, "narrative chain starting");
        match command.status().await {
            Ok(status) if status.success() => {
                info!(session_id = %id, "narrative chain finished");
                EXIT_OK
            }
            Ok(status) => {
                error!(session_id = %id, code = ?status.code(), "narrative chain failed");
                EXIT_CAPABILITY
            }
            Err(e) => {
                error!(session_id = %id, error = %e, "narrative chain could not start");
                EXIT_CAPABILITY
            }
        }
    }
}
