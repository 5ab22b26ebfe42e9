//! Oracle dispatch: context assembly, LLM invocation, response
//! persistence.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::OracleConfig;
use crate::llm::Llm;
use crate::oracle::personas::PersonaRegistry;
use crate::session::model::{Session, TranscriptionStatus};
use crate::session::SessionStore;
use crate::types::{CoreError, CoreResult, SessionId};

/// Stand-in injected when a referenced file cannot be read.
const MISSING_FILE_PLACEHOLDER: &str = "[ARQUIVO AUSENTE]";

/// A persisted oracle response on disk.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub sequence: u32,
    pub persona_id: String,
    pub filename: String,
    pub written_at: DateTime<Utc>,
}

/// Result of one oracle pass.
#[derive(Debug, Clone)]
pub struct OracleOutcome {
    pub persona_id: String,
    pub persona_name: String,
    pub sequence: u32,
    pub text: String,
    pub path: std::path::PathBuf,
}

pub struct OracleDispatcher {
    store: SessionStore,
    registry: Arc<PersonaRegistry>,
    llm: Arc<dyn Llm>,
    config: OracleConfig,
    /// Serializes response-sequence assignment per process
    seq_lock: Mutex<()>,
}

impl OracleDispatcher {
    pub fn new(
        store: SessionStore,
        registry: Arc<PersonaRegistry>,
        llm: Arc<dyn Llm>,
        config: OracleConfig,
    ) -> Self {
        Self {
            store,
            registry,
            llm,
            config,
            seq_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &PersonaRegistry {
        &self.registry
    }

    /// Run one oracle pass over a session.
    pub async fn run(&self, session: &Session, persona_id: &str) -> CoreResult<OracleOutcome> {
        let persona = self.registry.get(persona_id).await?;
        let context = self.assemble_context(session)?;
        if context.transcripts == 0 {
            return Err(CoreError::validation(
                "no_transcripts",
                "session has no successful transcripts for the oracle to read",
            ));
        }

        let prompt = fill_template(&persona.template, &self.config.placeholder, &context.text);
        let token_estimate = prompt.chars().count() / 4;
        info!(
            session_id = %session.id,
            persona = %persona.id,
            transcripts = context.transcripts,
            prior_responses = context.prior_responses,
            include_history = session.ui_preferences.include_llm_history,
            token_estimate,
            "oracle context assembled"
        );

        let started = std::time::Instant::now();
        let result = self
            .llm
            .complete(&prompt, Duration::from_secs(self.config.llm_timeout_secs))
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        // Audit line regardless of outcome.
        let _ = self.store.append_llm_traffic(
            &session.id,
            &serde_json::json!({
                "at": Utc::now().to_rfc3339(),
                "persona": persona.id,
                "prompt_chars": prompt.len(),
                "transcripts": context.transcripts,
                "prior_responses": context.prior_responses,
                "include_history": session.ui_preferences.include_llm_history,
                "latency_ms": latency_ms,
                "ok": result.is_ok(),
            }),
        );

        let text = result?;

        let _guard = self.seq_lock.lock().await;
        let sequence = self.next_response_sequence(&session.id)?;
        let filename = format!("{:03}_{}.txt", sequence, persona.id);
        let dir = self.store.responses_dir(&session.id);
        fs::create_dir_all(&dir).map_err(|e| CoreError::io("create responses dir", e))?;
        let path = dir.join(&filename);
        fs::write(&path, &text).map_err(|e| CoreError::io("write oracle response", e))?;

        info!(session_id = %session.id, persona = %persona.id, sequence, latency_ms,
            "oracle response persisted");
        Ok(OracleOutcome {
            persona_id: persona.id,
            persona_name: persona.display_name,
            sequence,
            text,
            path,
        })
    }

    /// Chronological context: transcripts always, prior oracle responses
    /// only when the session's preference asks for the spiral.
    fn assemble_context(&self, session: &Session) -> CoreResult<AssembledContext> {
        let mut blocks: Vec<String> = Vec::new();
        let mut transcripts = 0usize;

        for segment in &session.audio_entries {
            if segment.transcription_status != TranscriptionStatus::Success {
                continue;
            }
            let Some(filename) = &segment.transcript_filename else {
                continue;
            };
            let body = match self.store.read_transcript(&session.id, filename) {
                Ok(text) => text,
                Err(e) => {
                    warn!(session_id = %session.id, sequence = segment.sequence, error = %e,
                        "transcript missing from oracle context");
                    MISSING_FILE_PLACEHOLDER.to_string()
                }
            };
            blocks.push(format!(
                "[TRANSCRIÇÃO {} — {}]\n{}",
                segment.sequence,
                segment.received_at.format("%Y-%m-%d %H:%M:%S"),
                body
            ));
            transcripts += 1;
        }

        let mut prior_responses = 0usize;
        if session.ui_preferences.include_llm_history {
            for stored in self.list_responses(&session.id)? {
                let path = self.store.responses_dir(&session.id).join(&stored.filename);
                let body = match fs::read_to_string(&path) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(session_id = %session.id, file = %stored.filename, error = %e,
                            "oracle response missing from context");
                        MISSING_FILE_PLACEHOLDER.to_string()
                    }
                };
                blocks.push(format!(
                    "[ORÁCULO: {} — {}]\n{}",
                    stored.persona_id,
                    stored.written_at.format("%Y-%m-%d %H:%M:%S"),
                    body
                ));
                prior_responses += 1;
            }
        }

        Ok(AssembledContext {
            text: blocks.join("\n\n"),
            transcripts,
            prior_responses,
        })
    }

    /// Stored responses in sequence order.
    pub fn list_responses(&self, id: &SessionId) -> CoreResult<Vec<StoredResponse>> {
        let dir = self.store.responses_dir(id);
        let mut responses = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(responses),
            Err(e) => return Err(CoreError::io("read responses dir", e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| CoreError::io("read responses dir", e))?;
            let filename = entry.file_name().to_string_lossy().into_owned();
            let Some(parsed) = parse_response_filename(&filename) else {
                continue;
            };
            let written_at = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            responses.push(StoredResponse {
                sequence: parsed.0,
                persona_id: parsed.1,
                filename,
                written_at,
            });
        }
        responses.sort_by_key(|r| r.sequence);
        Ok(responses)
    }

    fn next_response_sequence(&self, id: &SessionId) -> CoreResult<u32> {
        Ok(self
            .list_responses(id)?
            .last()
            .map(|r| r.sequence + 1)
            .unwrap_or(1))
    }
}

struct AssembledContext {
    text: String,
    transcripts: usize,
    prior_responses: usize,
}

/// Replace the placeholder; append the context when the template has no
/// slot for it.
fn fill_template(template: &str, placeholder: &str, context: &str) -> String {
    if template.contains(placeholder) {
        template.replace(placeholder, context)
    } else {
        format!("{}\n\n{}", template.trim_end(), context)
    }
}

/// `<NNN>_<persona>.txt` → (sequence, persona id).
fn parse_response_filename(filename: &str) -> Option<(u32, String)> {
    let stem = filename.strip_suffix(".txt")?;
    let (seq, persona) = stem.split_once('_')?;
    let sequence: u32 = seq.parse().ok()?;
    if persona.is_empty() {
        return None;
    }
    Some((sequence, persona.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::AudioSegment;
    use crate::types::{Capability, ChatId};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Echoes the prompt back so tests can inspect context assembly.
    struct EchoLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Llm for EchoLlm {
        async fn complete(&self, prompt: &str, _timeout: Duration) -> CoreResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("ECHO:\n{prompt}"))
        }
        fn model_name(&self) -> &str {
            "echo"
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl Llm for FailingLlm {
        async fn complete(&self, _prompt: &str, timeout: Duration) -> CoreResult<String> {
            Err(CoreError::CapabilityTimeout {
                capability: Capability::Llm,
                waited_secs: timeout.as_secs(),
            })
        }
        fn model_name(&self) -> &str {
            "failing"
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
    }

    fn setup(llm: Arc<dyn Llm>) -> (TempDir, SessionStore, OracleDispatcher, Session) {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions"));
        let oracles = tmp.path().join("oracles");
        std::fs::create_dir_all(&oracles).unwrap();
        std::fs::write(
            oracles.join("sabio.md"),
            "# O Sábio\n\nReflita sobre:\n{{CONTEXT}}\n\nResponda com sabedoria.",
        )
        .unwrap();

        let registry = Arc::new(PersonaRegistry::new(oracles, Duration::from_secs(10)));
        let dispatcher =
            OracleDispatcher::new(store.clone(), registry, llm, OracleConfig::default());

        let mut session = Session::new(ChatId(1), t0());
        store
            .write_transcript(&session.id, "001_100000.txt", "primeira fala")
            .unwrap();
        session.audio_entries.push(AudioSegment {
            sequence: 1,
            received_at: t0(),
            local_filename: "001_100000.ogg".into(),
            file_size_bytes: 4,
            duration_seconds: None,
            checksum: "e".repeat(64),
            transcription_status: TranscriptionStatus::Success,
            transcript_filename: Some("001_100000.txt".into()),
            reopen_epoch: 0,
        });
        store.save(&session).unwrap();
        (tmp, store, dispatcher, session)
    }

    #[tokio::test]
    async fn test_dispatch_persists_sequenced_responses() {
        let llm = Arc::new(EchoLlm {
            calls: AtomicUsize::new(0),
        });
        let (_tmp, store, dispatcher, session) = setup(llm.clone());

        let first = dispatcher.run(&session, "sabio").await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.persona_name, "O Sábio");
        assert!(first.path.ends_with("llm_responses/001_sabio.txt"));
        assert!(first.text.contains("[TRANSCRIÇÃO 1 — 2025-01-01 10:00:00]"));
        assert!(first.text.contains("primeira fala"));
        assert!(first.text.contains("Responda com sabedoria."));

        let second = dispatcher.run(&session, "sabio").await.unwrap();
        assert_eq!(second.sequence, 2);
        // Spiral feedback: the prior response is in the new context.
        assert!(second.text.contains("[ORÁCULO: sabio —"));

        // Audit log collected both calls.
        let log = std::fs::read_to_string(
            store.logs_dir(&session.id).join("llm_traffic.jsonl"),
        )
        .unwrap();
        assert_eq!(log.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_history_preference_excludes_prior_responses() {
        let llm = Arc::new(EchoLlm {
            calls: AtomicUsize::new(0),
        });
        let (_tmp, store, dispatcher, mut session) = setup(llm);

        dispatcher.run(&session, "sabio").await.unwrap();
        session.ui_preferences.include_llm_history = false;
        store.save(&session).unwrap();

        let outcome = dispatcher.run(&session, "sabio").await.unwrap();
        assert!(!outcome.text.contains("[ORÁCULO:"));
        assert_eq!(outcome.sequence, 2);
    }

    #[tokio::test]
    async fn test_no_transcripts_is_validation_error() {
        let llm = Arc::new(EchoLlm {
            calls: AtomicUsize::new(0),
        });
        let (_tmp, store, dispatcher, _session) = setup(llm.clone());
        let empty = Session::new(ChatId(2), t0() + chrono::Duration::minutes(1));
        store.save(&empty).unwrap();

        let err = dispatcher.run(&empty, "sabio").await.unwrap_err();
        assert_eq!(err.catalog_code(), "no_transcripts");
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_llm_timeout_writes_no_response() {
        let (_tmp, store, dispatcher, session) = setup(Arc::new(FailingLlm));
        let err = dispatcher.run(&session, "sabio").await.unwrap_err();
        assert_eq!(err.catalog_code(), "llm_timeout");
        assert!(dispatcher.list_responses(&session.id).unwrap().is_empty());
        // Failure still audited.
        let log = std::fs::read_to_string(
            store.logs_dir(&session.id).join("llm_traffic.jsonl"),
        )
        .unwrap();
        assert!(log.contains("\"ok\":false"));
    }

    #[tokio::test]
    async fn test_missing_transcript_becomes_placeholder() {
        let llm = Arc::new(EchoLlm {
            calls: AtomicUsize::new(0),
        });
        let (_tmp, store, dispatcher, session) = setup(llm);
        std::fs::remove_file(
            store
                .transcripts_dir(&session.id)
                .join("001_100000.txt"),
        )
        .unwrap();

        let outcome = dispatcher.run(&session, "sabio").await.unwrap();
        assert!(outcome.text.contains(MISSING_FILE_PLACEHOLDER));
    }

    #[test]
    fn test_fill_template_appends_without_placeholder() {
        let filled = fill_template("sem slot", "{{CONTEXT}}", "ctx");
        assert_eq!(filled, "sem slot\n\nctx");
        let filled = fill_template("antes {{CONTEXT}} depois", "{{CONTEXT}}", "ctx");
        assert_eq!(filled, "antes ctx depois");
    }

    #[test]
    fn test_parse_response_filename() {
        assert_eq!(
            parse_response_filename("003_sabio.txt"),
            Some((3, "sabio".into()))
        );
        assert_eq!(parse_response_filename("nope.txt"), None);
        assert_eq!(parse_response_filename("001_.txt"), None);
        assert_eq!(parse_response_filename("001_sabio.md"), None);
    }
}
