//! Shared harness for the integration tests: capability fakes and a
//! fully wired world over a temporary sessions root.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use vox_oracle::config::Config;
use vox_oracle::embedding::{EmbeddingIndexer, HashEmbedder, IndexerWorker, SearchEngine};
use vox_oracle::llm::Llm;
use vox_oracle::oracle::{OracleDispatcher, PersonaRegistry};
use vox_oracle::presentation::ProgressReporter;
use vox_oracle::router::{ConversationState, Router};
use vox_oracle::session::{AudioCapture, SessionManager, SessionStore};
use vox_oracle::telegram::{ChatTransport, Keyboard, MessageRef};
use vox_oracle::transcription::{
    TranscriptOutput, Transcriber, TranscriptionQueue, TranscriptionWorker,
};
use vox_oracle::tts::{TtsEngine, TtsPipeline};
use vox_oracle::types::{Capability, ChatId, CoreError, CoreResult, SessionId};

/// Transport that records everything instead of talking to Telegram.
#[derive(Default)]
pub struct FakeTransport {
    pub sent: Mutex<Vec<(ChatId, String, Option<Keyboard>)>>,
    pub edited: Mutex<Vec<(i64, String)>>,
    pub voices: Mutex<Vec<std::path::PathBuf>>,
    pub files: Mutex<Vec<std::path::PathBuf>>,
    pub acks: Mutex<Vec<String>>,
    /// Bytes returned for any download_voice call
    pub voice_bytes: Mutex<Vec<u8>>,
    next_message_id: AtomicUsize,
}

impl FakeTransport {
    pub fn with_voice_bytes(bytes: &[u8]) -> Self {
        let transport = Self::default();
        *transport.voice_bytes.lock().unwrap() = bytes.to_vec();
        transport
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, t, _)| t.clone()).collect()
    }

    pub fn last_keyboard(&self) -> Option<Keyboard> {
        self.sent.lock().unwrap().iter().rev().find_map(|(_, _, k)| k.clone())
    }

    /// Every callback token currently visible on any sent keyboard.
    pub fn all_tokens(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, _, k)| k.as_ref())
            .flat_map(|k| k.rows.iter())
            .flat_map(|row| row.iter())
            .map(|b| b.token.clone())
            .collect()
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> CoreResult<MessageRef> {
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        self.sent
            .lock()
            .unwrap()
            .push((chat, text.to_string(), keyboard.cloned()));
        Ok(MessageRef {
            chat_id: chat,
            message_id: id,
        })
    }

    async fn edit_text(
        &self,
        message: MessageRef,
        text: &str,
        _keyboard: Option<&Keyboard>,
    ) -> CoreResult<()> {
        self.edited
            .lock()
            .unwrap()
            .push((message.message_id, text.to_string()));
        Ok(())
    }

    async fn send_voice(&self, _chat: ChatId, path: &Path) -> CoreResult<()> {
        self.voices.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    async fn send_file(&self, _chat: ChatId, path: &Path, _caption: Option<&str>) -> CoreResult<()> {
        self.files.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    async fn download_voice(&self, _file_id: &str) -> CoreResult<Vec<u8>> {
        Ok(self.voice_bytes.lock().unwrap().clone())
    }

    async fn answer_callback(&self, callback_id: &str, _text: Option<&str>) -> CoreResult<()> {
        self.acks.lock().unwrap().push(callback_id.to_string());
        Ok(())
    }
}

/// Transcriber returning "hello world"-style canned text; audio bytes
/// containing "bad" fail.
pub struct FakeTranscriber {
    pub canned: Mutex<Vec<String>>,
    pub calls: AtomicUsize,
}

impl FakeTranscriber {
    pub fn new(texts: &[&str]) -> Self {
        Self {
            canned: Mutex::new(texts.iter().rev().map(|s| s.to_string()).collect()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, audio_path: &Path) -> CoreResult<TranscriptOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes = std::fs::read(audio_path).unwrap_or_default();
        if bytes.windows(3).any(|w| w == b"bad") {
            return Err(CoreError::CapabilityFailure {
                capability: Capability::Transcription,
                message: "unintelligible audio".into(),
            });
        }
        let text = self
            .canned
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| "fala transcrita".to_string());
        Ok(TranscriptOutput {
            text,
            language: Some("pt".into()),
            confidence: Some(0.95),
        })
    }

    async fn is_ready(&self) -> bool {
        true
    }
}

/// LLM echoing a fixed response.
pub struct FakeLlm;

#[async_trait]
impl Llm for FakeLlm {
    async fn complete(&self, _prompt: &str, _timeout: Duration) -> CoreResult<String> {
        Ok("resposta do oráculo".to_string())
    }

    fn model_name(&self) -> &str {
        "fake"
    }
}

/// Counting TTS engine producing deterministic bytes.
#[derive(Default)]
pub struct CountingTts {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TtsEngine for CountingTts {
    async fn synthesize_speech(&self, text: &str, _voice: &str, _format: &str) -> CoreResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("AUDIO:{text}").into_bytes())
    }

    async fn check_health(&self) -> bool {
        true
    }
}

/// A fully wired router + workers over a temp directory.
pub struct World {
    pub tmp: tempfile::TempDir,
    pub config: Config,
    pub store: SessionStore,
    pub manager: Arc<SessionManager>,
    pub queue: TranscriptionQueue,
    pub search: Arc<SearchEngine>,
    pub router: Router,
    pub transport: Arc<FakeTransport>,
    pub transcriber: Arc<FakeTranscriber>,
    pub tts_engine: Arc<CountingTts>,
    pub shutdown: broadcast::Sender<()>,
}

impl World {
    /// Run one query with the configured defaults.
    pub async fn run_search(&self, query: &str) -> vox_oracle::SearchResponse {
        self.search
            .search(
                query,
                CHAT,
                self.config.search.max_results,
                self.config.search.min_score,
            )
            .await
            .unwrap()
    }
}

pub const CHAT: ChatId = ChatId(42);

/// Build the world. `transcripts` are the canned texts handed out by the
/// fake transcriber in order.
pub fn build_world(transcripts: &[&str]) -> World {
    let tmp = tempfile::TempDir::new().unwrap();
    let sessions_root = tmp.path().join("sessions");
    let oracles_dir = tmp.path().join("oracles");
    std::fs::create_dir_all(&oracles_dir).unwrap();
    std::fs::write(
        oracles_dir.join("sabio.md"),
        "# O Sábio\n\nContexto:\n{{CONTEXT}}\n",
    )
    .unwrap();

    let mut config = Config::default();
    config.paths.sessions_root = sessions_root.clone();
    config.paths.oracles_dir = oracles_dir.clone();
    config.telegram.allowed_chat_id = CHAT.0;
    config.tts.enabled = true;
    config.ui.intent_timeout_secs = 2;

    let store = SessionStore::new(&sessions_root);
    let capture = AudioCapture::new(store.clone(), "ogg");
    let manager = Arc::new(SessionManager::new(store.clone(), capture));

    let embedder = Arc::new(HashEmbedder::new(32));
    let search = Arc::new(SearchEngine::new(
        store.clone(),
        EmbeddingIndexer::new(store.clone(), embedder.clone()),
        embedder.clone(),
        config.search.clone(),
    ));

    let registry = Arc::new(PersonaRegistry::new(&oracles_dir, Duration::from_secs(10)));
    let oracle = Arc::new(OracleDispatcher::new(
        store.clone(),
        registry,
        Arc::new(FakeLlm),
        config.oracle.clone(),
    ));

    let tts_engine = Arc::new(CountingTts::default());
    let tts = Arc::new(TtsPipeline::new(
        tts_engine.clone(),
        store.clone(),
        config.tts.clone(),
    ));

    let transport = Arc::new(FakeTransport::with_voice_bytes(b"voice-bytes"));

    let (queue, queue_rx) = TranscriptionQueue::new(64);
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let (embed_tx, embed_rx) = mpsc::unbounded_channel();
    let (shutdown, _) = broadcast::channel(4);

    let transcriber = Arc::new(FakeTranscriber::new(transcripts));
    let worker = TranscriptionWorker::new(
        queue.clone(),
        queue_rx,
        manager.clone(),
        transcriber.clone(),
        progress_tx,
        embed_tx.clone(),
        Duration::from_secs(5),
        shutdown.subscribe(),
    );
    tokio::spawn(worker.run());

    let indexer_worker = IndexerWorker::new(
        EmbeddingIndexer::new(store.clone(), embedder.clone()),
        manager.clone(),
        embed_rx,
        shutdown.subscribe(),
    );
    tokio::spawn(indexer_worker.run());

    let reporter = ProgressReporter::new(
        transport.clone(),
        store.clone(),
        progress_rx,
        Duration::from_secs(config.ui.progress_interval_secs),
        shutdown.subscribe(),
    );
    tokio::spawn(reporter.run());

    let router = Router::new(
        config.clone(),
        manager.clone(),
        queue.clone(),
        search.clone(),
        oracle,
        tts,
        transport.clone(),
        ConversationState::new(),
        embed_tx.clone(),
    );

    World {
        tmp,
        config,
        store,
        manager,
        queue,
        search,
        router,
        transport,
        transcriber,
        tts_engine,
        shutdown,
    }
}

/// Wait until a session reaches `state` or panic after ~2s.
pub async fn wait_for_state(
    world: &World,
    id: &SessionId,
    state: vox_oracle::SessionState,
) -> vox_oracle::Session {
    for _ in 0..100 {
        let session = world.manager.get_session(id).await.unwrap();
        if session.state == state {
            return session;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session {id} never reached {state}");
}
