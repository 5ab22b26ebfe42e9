//! Supervisor: component wiring, startup recovery sweep, background
//! loops and graceful shutdown.
//!
//! Startup order: config → store + interrupted sweep → transcription
//! worker → TTS GC loop → oracle cache refresher → transport handlers →
//! event loop. Shutdown stops accepting transport events, lets the
//! in-flight transcription item drain within a bounded grace window and
//! exits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::config::{self, Config};
use crate::embedding::indexer::IndexerWorker;
use crate::embedding::{Embedder, EmbeddingIndexer, HashEmbedder, HttpEmbedder, SearchEngine};
use crate::llm::HttpLlm;
use crate::oracle::{OracleDispatcher, PersonaRegistry};
use crate::presentation::ProgressReporter;
use crate::router::{ConversationState, Event, Router};
use crate::session::{AudioCapture, SessionManager, SessionStore};
use crate::telegram::{ChatTransport, TelegramClient, TelegramUpdate};
use crate::transcription::{HttpTranscriber, TranscriptionQueue, TranscriptionWorker};
use crate::tts::{gc_sweep, HttpTtsEngine, TtsPipeline};
use crate::types::ChatId;

/// Run the daemon until a termination signal arrives.
pub async fn run(config: Config) -> Result<()> {
    config.validate()?;
    if !config.telegram.is_configured() {
        anyhow::bail!(
            "Telegram transport is not configured. Set VOX_BOT_TOKEN and VOX_ALLOWED_CHAT_ID."
        );
    }

    std::fs::create_dir_all(&config.paths.sessions_root)
        .context("Failed to create sessions root")?;

    let api_key = config::get_api_key().unwrap_or_default();
    if api_key.is_empty() {
        warn!("no API key available; embeddings fall back to the hash backend and oracle calls will fail");
    }

    // ---- component graph -------------------------------------------------

    let store = SessionStore::new(&config.paths.sessions_root);
    let capture = AudioCapture::new(store.clone(), config.transcription.audio_ext.clone());
    let manager = Arc::new(SessionManager::new(store.clone(), capture));

    let embedder: Arc<dyn Embedder> = if api_key.is_empty() {
        Arc::new(HashEmbedder::new(config.search.embedding_dim))
    } else {
        Arc::new(HttpEmbedder::new(config.search.clone(), api_key.clone()))
    };
    let search = Arc::new(SearchEngine::new(
        store.clone(),
        EmbeddingIndexer::new(store.clone(), embedder.clone()),
        embedder.clone(),
        config.search.clone(),
    ));

    let registry = Arc::new(PersonaRegistry::new(
        &config.paths.oracles_dir,
        Duration::from_secs(config.oracle.cache_ttl_secs),
    ));
    let llm = Arc::new(HttpLlm::new(config.oracle.clone(), api_key.clone()));
    let oracle = Arc::new(OracleDispatcher::new(
        store.clone(),
        registry.clone(),
        llm,
        config.oracle.clone(),
    ));

    let tts_engine = Arc::new(HttpTtsEngine::new(config.tts.clone(), api_key));
    let tts = Arc::new(TtsPipeline::new(tts_engine, store.clone(), config.tts.clone()));

    let client = TelegramClient::new(config.telegram.clone());
    let transport: Arc<dyn ChatTransport> = Arc::new(client.clone());

    let (queue, queue_rx) = TranscriptionQueue::new(config.transcription.queue_capacity);
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    let (embed_tx, embed_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    // ---- startup recovery sweep ------------------------------------------

    let interrupted = manager
        .detect_interrupted_sessions()
        .await
        .context("interrupted-session sweep failed")?;
    manager
        .rebuild_active_registry()
        .await
        .context("active-session registry rebuild failed")?;
    if !interrupted.is_empty() {
        warn!(count = interrupted.len(), "interrupted sessions detected");
    }

    // ---- background tasks ------------------------------------------------

    let transcriber = Arc::new(HttpTranscriber::new(config.transcription.clone()));
    let worker = TranscriptionWorker::new(
        queue.clone(),
        queue_rx,
        manager.clone(),
        transcriber,
        progress_tx,
        embed_tx.clone(),
        Duration::from_secs(config.transcription.timeout_secs),
        shutdown_tx.subscribe(),
    );
    let worker_handle = tokio::spawn(worker.run());

    let indexer_worker = IndexerWorker::new(
        EmbeddingIndexer::new(store.clone(), embedder.clone()),
        manager.clone(),
        embed_rx,
        shutdown_tx.subscribe(),
    );
    let indexer_handle = tokio::spawn(indexer_worker.run());

    let reporter = ProgressReporter::new(
        transport.clone(),
        store.clone(),
        progress_rx,
        Duration::from_secs(config.ui.progress_interval_secs),
        shutdown_tx.subscribe(),
    );
    let reporter_handle = tokio::spawn(reporter.run());

    let gc_handle = {
        let store = store.clone();
        let tts_config = config.tts.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(tts_config.gc_interval_secs.max(60)));
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = gc_sweep(&store, &tts_config) {
                            warn!(error = %e, "tts gc sweep failed");
                        }
                    }
                }
            }
        })
    };

    let refresher_handle = {
        let registry = registry.clone();
        let ttl = Duration::from_secs(config.oracle.cache_ttl_secs.max(1));
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ttl * 4);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        registry.refresh().await;
                        if let Err(e) = registry.list().await {
                            warn!(error = %e, "persona rescan failed");
                        }
                    }
                }
            }
        })
    };

    // ---- router + event loop ---------------------------------------------

    let allowed_chat = ChatId(config.telegram.allowed_chat_id);
    let router = Router::new(
        config.clone(),
        manager.clone(),
        queue.clone(),
        search,
        oracle,
        tts,
        transport.clone(),
        ConversationState::new(),
        embed_tx.clone(),
    );

    for session in &interrupted {
        if session.chat_id == allowed_chat {
            router.announce_interrupted(session).await;
        }
    }

    info!("vox-oracle daemon running");
    let mut shutdown = shutdown_tx.subscribe();
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if wait_for_termination().await.is_ok() {
            info!("termination signal received");
            let _ = signal_tx.send(());
        }
    });

    let mut offset: Option<i64> = None;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            polled = client.get_updates(offset) => {
                match polled {
                    Ok(updates) => {
                        for update in updates {
                            offset = Some(update.update_id + 1);
                            if let Some(event) = event_from_update(update, allowed_chat) {
                                // Per-chat ordering: events are handled in
                                // arrival order on this task.
                                router.handle_event(event).await;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "update poll failed, backing off");
                        tokio::time::sleep(Duration::from_secs(3)).await;
                    }
                }
            }
        }
    }

    // ---- graceful shutdown -----------------------------------------------

    info!("draining background tasks");
    let _ = shutdown_tx.send(());
    let grace = Duration::from_secs(config.ui.shutdown_grace_secs);
    for (name, handle) in [
        ("transcription worker", worker_handle),
        ("embedding indexer", indexer_handle),
        ("progress reporter", reporter_handle),
        ("tts gc", gc_handle),
        ("persona refresher", refresher_handle),
    ] {
        if tokio::time::timeout(grace, handle).await.is_err() {
            error!(task = name, "did not drain within grace window");
        }
    }
    info!("daemon stopped");
    Ok(())
}

async fn wait_for_termination() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// Convert one transport update into a typed router event, dropping
/// traffic from unauthorized chats.
fn event_from_update(update: TelegramUpdate, allowed: ChatId) -> Option<Event> {
    if let Some(message) = update.message {
        let chat = ChatId(message.chat.id);
        if chat != allowed {
            warn!(chat_id = %chat, "ignoring message from unauthorized chat");
            return None;
        }
        if let Some(voice) = message.voice {
            return Some(Event::Voice {
                chat,
                file_id: voice.file_id,
                duration_secs: Some(voice.duration as f64),
            });
        }
        if let Some(audio) = message.audio {
            return Some(Event::Voice {
                chat,
                file_id: audio.file_id,
                duration_secs: Some(audio.duration as f64),
            });
        }
        if let Some(body) = message.text {
            if let Some(command) = body.strip_prefix('/') {
                let name = command
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .split('@')
                    .next()
                    .unwrap_or("")
                    .to_string();
                return Some(Event::Command { chat, name });
            }
            return Some(Event::Text { chat, text: body });
        }
        return None;
    }

    if let Some(callback) = update.callback_query {
        let chat = callback
            .message
            .as_ref()
            .map(|m| ChatId(m.chat.id))
            .unwrap_or(ChatId(callback.from.id));
        if chat != allowed {
            warn!(chat_id = %chat, "ignoring callback from unauthorized chat");
            return None;
        }
        let data = callback.data.unwrap_or_default();
        return Some(Event::Callback {
            chat,
            callback_id: callback.id,
            data,
        });
    }
    None
}
