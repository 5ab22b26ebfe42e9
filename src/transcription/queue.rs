//! The transcription queue: an ordered, bounded queue of per-segment work
//! items drained by a single cooperative worker.
//!
//! One consumer keeps per-session ordering trivial: segments of a session
//! are transcribed in sequence order because they are enqueued in
//! sequence order. Work items are deduplicated by (session, sequence), so
//! queueing a session twice without state advance enqueues nothing new.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::session::model::{NameSource, Session, SessionState, TranscriptionStatus};
use crate::session::SessionManager;
use crate::transcription::Transcriber;
use crate::types::{Capability, ChatId, CoreError, CoreResult, SessionId};

/// One unit of transcription work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub session_id: SessionId,
    pub sequence: u32,
}

/// Progress event kinds; state transitions always pass the UI throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    Started,
    Step,
    Completed,
    Failed,
}

/// Structured progress emitted by the worker, consumed by presentation.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub session_id: SessionId,
    pub chat_id: ChatId,
    pub current: usize,
    pub total: usize,
    pub step: String,
    pub kind: ProgressKind,
}

/// Producer half: enqueues pending segments with dedup and backpressure.
#[derive(Clone)]
pub struct TranscriptionQueue {
    tx: mpsc::Sender<WorkItem>,
    inflight: Arc<StdMutex<HashSet<WorkItem>>>,
}

impl TranscriptionQueue {
    /// Create the queue and hand back the receiver for the worker.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<WorkItem>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                inflight: Arc::new(StdMutex::new(HashSet::new())),
            },
            rx,
        )
    }

    /// Enqueue every PENDING segment of a session. Returns the number of
    /// segments newly queued; duplicates are skipped.
    pub fn queue_session(&self, session: &Session) -> CoreResult<usize> {
        let mut queued = 0usize;
        for segment in session.pending_segments() {
            let item = WorkItem {
                session_id: session.id.clone(),
                sequence: segment.sequence,
            };
            {
                let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
                if !inflight.insert(item.clone()) {
                    continue;
                }
            }
            if let Err(e) = self.tx.try_send(item.clone()) {
                self.inflight
                    .lock()
                    .expect("inflight lock poisoned")
                    .remove(&item);
                return match e {
                    mpsc::error::TrySendError::Full(_) => Err(CoreError::Exhausted {
                        what: "transcription queue is saturated".into(),
                    }),
                    mpsc::error::TrySendError::Closed(_) => Err(CoreError::Internal(
                        "transcription queue worker is gone".into(),
                    )),
                };
            }
            queued += 1;
        }
        debug!(session_id = %session.id, queued, "segments enqueued");
        Ok(queued)
    }

    /// Number of items currently queued or being processed.
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().expect("inflight lock poisoned").len()
    }

    fn settle(&self, item: &WorkItem) {
        self.inflight
            .lock()
            .expect("inflight lock poisoned")
            .remove(item);
    }
}

/// Consumer half: the single worker task.
pub struct TranscriptionWorker {
    queue: TranscriptionQueue,
    rx: mpsc::Receiver<WorkItem>,
    manager: Arc<SessionManager>,
    transcriber: Arc<dyn Transcriber>,
    progress_tx: mpsc::UnboundedSender<ProgressEvent>,
    embed_tx: mpsc::UnboundedSender<SessionId>,
    timeout: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl TranscriptionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: TranscriptionQueue,
        rx: mpsc::Receiver<WorkItem>,
        manager: Arc<SessionManager>,
        transcriber: Arc<dyn Transcriber>,
        progress_tx: mpsc::UnboundedSender<ProgressEvent>,
        embed_tx: mpsc::UnboundedSender<SessionId>,
        timeout: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            queue,
            rx,
            manager,
            transcriber,
            progress_tx,
            embed_tx,
            timeout,
            shutdown,
        }
    }

    /// Drain the queue until shutdown. The item in flight is finished
    /// before the loop exits.
    pub async fn run(mut self) {
        info!("transcription worker started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => {
                    info!("transcription worker stopping");
                    break;
                }
                item = self.rx.recv() => {
                    match item {
                        Some(item) => {
                            self.process(&item).await;
                            self.queue.settle(&item);
                        }
                        None => break,
                    }
                }
            }
        }
    }

    async fn process(&self, item: &WorkItem) {
        let session = match self.manager.get_session(&item.session_id).await {
            Ok(s) => s,
            Err(e) => {
                warn!(session_id = %item.session_id, error = %e, "work item for unloadable session dropped");
                return;
            }
        };
        // The item may be stale: session advanced, retried elsewhere, or
        // segment already settled.
        if session.state != SessionState::Transcribing {
            debug!(session_id = %session.id, state = %session.state, "skipping stale work item");
            return;
        }
        let Some(segment) = session.segment(item.sequence) else {
            warn!(session_id = %session.id, sequence = item.sequence, "work item without segment");
            return;
        };
        if segment.transcription_status != TranscriptionStatus::Pending {
            return;
        }

        let (done_before, total) = progress_counts(&session);
        self.emit(
            &session,
            done_before,
            total,
            format!("transcrevendo segmento {}", item.sequence),
            if done_before == 0 {
                ProgressKind::Started
            } else {
                ProgressKind::Step
            },
        );

        let audio_path = self
            .manager
            .store()
            .audio_dir(&session.id)
            .join(&segment.local_filename);

        let result = match tokio::time::timeout(self.timeout, self.transcriber.transcribe(&audio_path))
            .await
        {
            Ok(inner) => inner,
            Err(_) => Err(CoreError::CapabilityTimeout {
                capability: Capability::Transcription,
                waited_secs: self.timeout.as_secs(),
            }),
        };

        let succeeded = result.is_ok();
        let transcript_text = result.as_ref().ok().map(|t| t.text.clone());
        if let Err(e) = self
            .manager
            .record_transcription(
                &item.session_id,
                item.sequence,
                result.map(|t| t.text),
                Utc::now(),
            )
            .await
        {
            error!(session_id = %item.session_id, sequence = item.sequence, error = %e,
                "failed to record transcription result");
            return;
        }

        // First successful transcript of the first segment names the session.
        if succeeded && item.sequence == 1 && session.name_source == NameSource::Timestamp {
            if let Some(text) = &transcript_text {
                if let Some(name) = crate::session::manager::derive_name(text) {
                    match self.manager.update_session_name(&item.session_id, &name).await {
                        Ok(unique) => info!(session_id = %item.session_id, name = %unique, "session named"),
                        Err(e) => debug!(session_id = %item.session_id, error = %e, "name derivation skipped"),
                    }
                }
            }
        }

        let session = match self.manager.get_session(&item.session_id).await {
            Ok(s) => s,
            Err(_) => return,
        };
        let (done, total) = progress_counts(&session);

        if session.pending_segments().count() == 0 {
            match self.manager.complete_transcription(&item.session_id, Utc::now()).await {
                Ok(completed) if completed.state == SessionState::Transcribed => {
                    self.emit(
                        &completed,
                        done,
                        total,
                        "transcrição concluída".into(),
                        ProgressKind::Completed,
                    );
                    if self.embed_tx.send(item.session_id.clone()).is_err() {
                        warn!(session_id = %item.session_id, "embedding worker unavailable");
                    }
                }
                Ok(completed) => {
                    // All segments failed: the session is in ERROR.
                    self.emit(
                        &completed,
                        done,
                        total,
                        "transcrição falhou em todos os segmentos".into(),
                        ProgressKind::Failed,
                    );
                }
                Err(e) => {
                    error!(session_id = %item.session_id, error = %e, "completion transition failed");
                }
            }
        } else {
            self.emit(
                &session,
                done,
                total,
                format!("segmento {} processado", item.sequence),
                ProgressKind::Step,
            );
        }
    }

    fn emit(&self, session: &Session, current: usize, total: usize, step: String, kind: ProgressKind) {
        let event = ProgressEvent {
            session_id: session.id.clone(),
            chat_id: session.chat_id,
            current,
            total,
            step,
            kind,
        };
        let _ = self.progress_tx.send(event);
    }
}

/// Settled/total segment counts for one session's transcription pass.
pub fn progress_counts(session: &Session) -> (usize, usize) {
    let total = session.audio_entries.len();
    let done = session
        .audio_entries
        .iter()
        .filter(|e| e.transcription_status != TranscriptionStatus::Pending)
        .count();
    (done, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AudioCapture, CreateOutcome, SessionStore};
    use crate::transcription::TranscriptOutput;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::path::Path;
    use tempfile::TempDir;

    /// Canned transcriber: fails for segments whose audio contains "bad".
    struct FakeTranscriber;

    #[async_trait]
    impl Transcriber for FakeTranscriber {
        async fn transcribe(&self, audio_path: &Path) -> CoreResult<TranscriptOutput> {
            let bytes = std::fs::read(audio_path).unwrap();
            if bytes.windows(3).any(|w| w == b"bad") {
                return Err(CoreError::CapabilityFailure {
                    capability: Capability::Transcription,
                    message: "unintelligible".into(),
                });
            }
            Ok(TranscriptOutput {
                text: format!("transcript of {} bytes", bytes.len()),
                language: Some("pt".into()),
                confidence: Some(0.9),
            })
        }

        async fn is_ready(&self) -> bool {
            true
        }
    }

    struct Harness {
        _tmp: TempDir,
        manager: Arc<SessionManager>,
        queue: TranscriptionQueue,
        embed_rx: mpsc::UnboundedReceiver<SessionId>,
        progress_rx: mpsc::UnboundedReceiver<ProgressEvent>,
        shutdown_tx: broadcast::Sender<()>,
        worker: tokio::task::JoinHandle<()>,
    }

    fn t0() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions"));
        let capture = AudioCapture::new(store.clone(), "ogg");
        let manager = Arc::new(SessionManager::new(store, capture));
        let (queue, rx) = TranscriptionQueue::new(64);
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (embed_tx, embed_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = TranscriptionWorker::new(
            queue.clone(),
            rx,
            manager.clone(),
            Arc::new(FakeTranscriber),
            progress_tx,
            embed_tx,
            Duration::from_secs(5),
            shutdown_rx,
        );
        let worker = tokio::spawn(worker.run());
        Harness {
            _tmp: tmp,
            manager,
            queue,
            embed_rx,
            progress_rx,
            shutdown_tx,
            worker,
        }
    }

    async fn finalized_session(h: &Harness, chunks: &[&[u8]]) -> SessionId {
        let CreateOutcome::Created(session) =
            h.manager.create_session(ChatId(42), t0()).await.unwrap()
        else {
            panic!()
        };
        for chunk in chunks {
            h.manager
                .add_audio_chunk(&session.id, chunk, t0(), None)
                .await
                .unwrap();
        }
        h.manager.finalize_session(&session.id, t0()).await.unwrap();
        session.id
    }

    async fn wait_for_state(h: &Harness, id: &SessionId, state: SessionState) -> Session {
        for _ in 0..100 {
            let session = h.manager.get_session(id).await.unwrap();
            if session.state == state {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session never reached {state}");
    }

    #[tokio::test]
    async fn test_worker_transcribes_and_signals_embedding() {
        let mut h = harness();
        let id = finalized_session(&h, &[b"hello audio"]).await;
        let session = h.manager.get_session(&id).await.unwrap();
        assert_eq!(h.queue.queue_session(&session).unwrap(), 1);

        let done = wait_for_state(&h, &id, SessionState::Transcribed).await;
        let seg = done.segment(1).unwrap();
        assert_eq!(seg.transcription_status, TranscriptionStatus::Success);
        assert!(seg.transcript_filename.is_some());

        // Embedding job was emitted for this session.
        let embedded = h.embed_rx.recv().await.unwrap();
        assert_eq!(embedded, id);

        // Name derived from the first transcript.
        assert_eq!(done.name_source, NameSource::Transcript);

        h.shutdown_tx.send(()).unwrap();
        h.worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_all_failures_move_session_to_error() {
        let mut h = harness();
        let id = finalized_session(&h, &[b"bad one"]).await;
        let session = h.manager.get_session(&id).await.unwrap();
        h.queue.queue_session(&session).unwrap();

        let done = wait_for_state(&h, &id, SessionState::Error).await;
        assert_eq!(
            done.segment(1).unwrap().transcription_status,
            TranscriptionStatus::Failed
        );
        assert!(!done.errors.is_empty());

        // Terminal progress event is Failed.
        let mut last = None;
        while let Ok(ev) = h.progress_rx.try_recv() {
            last = Some(ev);
        }
        assert_eq!(last.unwrap().kind, ProgressKind::Failed);

        h.shutdown_tx.send(()).unwrap();
        h.worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_failure_still_completes() {
        let h = harness();
        let id = finalized_session(&h, &[b"good", b"bad apple", b"also good"]).await;
        let session = h.manager.get_session(&id).await.unwrap();
        assert_eq!(h.queue.queue_session(&session).unwrap(), 3);

        let done = wait_for_state(&h, &id, SessionState::Transcribed).await;
        let statuses: Vec<_> = done
            .audio_entries
            .iter()
            .map(|e| e.transcription_status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                TranscriptionStatus::Success,
                TranscriptionStatus::Failed,
                TranscriptionStatus::Success
            ]
        );

        h.shutdown_tx.send(()).unwrap();
        h.worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_dedup_by_session_and_sequence() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions"));
        let capture = AudioCapture::new(store.clone(), "ogg");
        let manager = Arc::new(SessionManager::new(store, capture));
        // No worker draining: items stay inflight.
        let (queue, _rx) = TranscriptionQueue::new(64);

        let CreateOutcome::Created(session) =
            manager.create_session(ChatId(1), t0()).await.unwrap()
        else {
            panic!()
        };
        manager.add_audio_chunk(&session.id, b"a", t0(), None).await.unwrap();
        manager.add_audio_chunk(&session.id, b"b", t0(), None).await.unwrap();
        let session = manager.finalize_session(&session.id, t0()).await.unwrap();

        assert_eq!(queue.queue_session(&session).unwrap(), 2);
        // Second call without state advance enqueues nothing new.
        assert_eq!(queue.queue_session(&session).unwrap(), 0);
        assert_eq!(queue.inflight_count(), 2);
    }

    #[tokio::test]
    async fn test_saturated_queue_returns_exhausted() {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path().join("sessions"));
        let capture = AudioCapture::new(store.clone(), "ogg");
        let manager = Arc::new(SessionManager::new(store, capture));
        let (queue, _rx) = TranscriptionQueue::new(1);

        let CreateOutcome::Created(session) =
            manager.create_session(ChatId(1), t0()).await.unwrap()
        else {
            panic!()
        };
        manager.add_audio_chunk(&session.id, b"a", t0(), None).await.unwrap();
        manager.add_audio_chunk(&session.id, b"b", t0(), None).await.unwrap();
        let session = manager.finalize_session(&session.id, t0()).await.unwrap();

        let err = queue.queue_session(&session).unwrap_err();
        assert_eq!(err.catalog_code(), "exhausted");
    }
}
