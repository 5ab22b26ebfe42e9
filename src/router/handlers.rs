//! Event handling: commands, text, voice and the callback routing table.
//!
//! One handler per callback namespace; every callback is acknowledged
//! (success, no-op or warning) before this module returns. Errors are
//! humanized through the catalog and never surface as raw objects.

use std::path::Component;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::embedding::{MatchType, SearchEngine, SearchResponse};
use crate::narrative;
use crate::oracle::OracleDispatcher;
use crate::presentation::messages::{render, text, Register};
use crate::presentation::{humanize, Paginator};
use crate::router::callbacks::{CallbackToken, Namespace};
use crate::router::state::{ConversationState, PendingDialog, PendingIntent};
use crate::session::model::{Session, SessionState};
use crate::session::{CreateOutcome, SessionManager};
use crate::telegram::{ChatTransport, Keyboard};
use crate::transcription::TranscriptionQueue;
use crate::tts::{TtsPipeline, TtsRequest, TtsResult};
use crate::types::{ChatId, CoreError, CoreResult, SessionId};

/// Typed transport events consumed by the router.
#[derive(Debug, Clone)]
pub enum Event {
    Text {
        chat: ChatId,
        text: String,
    },
    Voice {
        chat: ChatId,
        file_id: String,
        duration_secs: Option<f64>,
    },
    Command {
        chat: ChatId,
        name: String,
    },
    Callback {
        chat: ChatId,
        callback_id: String,
        data: String,
    },
}

pub struct Router {
    config: Config,
    manager: Arc<SessionManager>,
    queue: TranscriptionQueue,
    search: Arc<SearchEngine>,
    oracle: Arc<OracleDispatcher>,
    tts: Arc<TtsPipeline>,
    transport: Arc<dyn ChatTransport>,
    state: ConversationState,
    /// Embedding jobs for finalizations with nothing left to transcribe
    embed_tx: tokio::sync::mpsc::UnboundedSender<SessionId>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        manager: Arc<SessionManager>,
        queue: TranscriptionQueue,
        search: Arc<SearchEngine>,
        oracle: Arc<OracleDispatcher>,
        tts: Arc<TtsPipeline>,
        transport: Arc<dyn ChatTransport>,
        state: ConversationState,
        embed_tx: tokio::sync::mpsc::UnboundedSender<SessionId>,
    ) -> Self {
        Self {
            config,
            manager,
            queue,
            search,
            oracle,
            tts,
            transport,
            state,
            embed_tx,
        }
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    /// Entry point; never propagates errors to the event loop.
    pub async fn handle_event(&self, event: Event) {
        let result = match event {
            Event::Text { chat, text } => self.handle_text(chat, &text).await,
            Event::Voice {
                chat,
                file_id,
                duration_secs,
            } => self.handle_voice(chat, &file_id, duration_secs).await,
            Event::Command { chat, name } => self.handle_command(chat, &name).await,
            Event::Callback {
                chat,
                callback_id,
                data,
            } => {
                self.handle_callback(chat, &callback_id, &data).await;
                Ok(())
            }
        };
        if let Err((chat, err)) = result {
            self.report_error(chat, &err).await;
        }
    }

    /// The startup recovery prompt for one interrupted session.
    pub async fn announce_interrupted(&self, session: &Session) {
        let chat = session.chat_id;
        self.state
            .set_dialog(
                chat,
                PendingDialog::Recovery {
                    session: session.id.clone(),
                },
            )
            .await;
        let register = self.register(chat).await;
        let body = render(
            "recovery_prompt",
            register,
            &[("name", session.intelligible_name.clone())],
        );
        let keyboard = Keyboard::new()
            .row(vec![Keyboard::button("▶️ Retomar", "recover:resume_session")])
            .row(vec![Keyboard::button(
                "✅ Finalizar como está",
                "recover:finalize_orphan",
            )])
            .row(vec![Keyboard::button("🗑️ Descartar", "recover:discard_orphan")]);
        if let Err(e) = self.transport.send_text(chat, &body, Some(&keyboard)).await {
            error!(chat_id = %chat, error = %e, "recovery prompt undeliverable");
        }
    }

    // ---- plain events ----------------------------------------------------

    async fn handle_text(&self, chat: ChatId, body: &str) -> Result<(), (ChatId, CoreError)> {
        if let Some(PendingIntent::AwaitingSearchQuery) = self.state.take_intent(chat).await {
            return self
                .run_search(chat, body)
                .await
                .map_err(|e| (chat, e));
        }
        let register = self.register(chat).await;
        self.send(chat, text("text_hint", register), None)
            .await
            .map_err(|e| (chat, e))
    }

    async fn handle_voice(
        &self,
        chat: ChatId,
        file_id: &str,
        duration_secs: Option<f64>,
    ) -> Result<(), (ChatId, CoreError)> {
        let flow = async {
            let session_id = match self.manager.active_session(chat).await {
                Some(id) => id,
                None => match self.manager.create_session(chat, Utc::now()).await? {
                    CreateOutcome::Created(session) => {
                        let register = self.register(chat).await;
                        self.send(
                            chat,
                            &render(
                                "session_started",
                                register,
                                &[("name", session.intelligible_name.clone())],
                            ),
                            None,
                        )
                        .await?;
                        session.id
                    }
                    CreateOutcome::Conflict { active } => active.id,
                },
            };

            let bytes = self.transport.download_voice(file_id).await?;
            let segment = self
                .manager
                .add_audio_chunk(&session_id, &bytes, Utc::now(), duration_secs)
                .await?;

            let register = self.register(chat).await;
            self.send(
                chat,
                &render(
                    "audio_received",
                    register,
                    &[
                        ("sequence", segment.sequence.to_string()),
                        ("size", human_size(segment.file_size_bytes)),
                    ],
                ),
                None,
            )
            .await?;
            Ok(())
        };
        flow.await.map_err(|e| (chat, e))
    }

    async fn handle_command(&self, chat: ChatId, name: &str) -> Result<(), (ChatId, CoreError)> {
        let result = match name {
            "start" => self.show_welcome(chat).await,
            "new" => self.create_flow(chat).await,
            "finalize" => self.finalize_flow(chat).await,
            "search" => self.search_intent(chat).await,
            "sessions" => self.sessions_list(chat).await,
            "status" => self.status(chat).await,
            "oracles" => self.oracles_list(chat).await,
            _ => {
                let register = self.register(chat).await;
                self.send(chat, text("help", register), Some(&self.main_keyboard()))
                    .await
            }
        };
        result.map_err(|e| (chat, e))
    }

    // ---- callback routing ------------------------------------------------

    /// Parse and route one callback. The acknowledgment always fires.
    async fn handle_callback(&self, chat: ChatId, callback_id: &str, data: &str) {
        let outcome = match CallbackToken::parse(data) {
            Ok(token) => self.route(chat, &token).await,
            Err(err) => Err(err),
        };

        let ack = match &outcome {
            Ok(ack) => ack.clone(),
            Err(_) => Some("⚠️".to_string()),
        };
        if let Err(e) = self
            .transport
            .answer_callback(callback_id, ack.as_deref())
            .await
        {
            warn!(error = %e, "callback acknowledgment failed");
        }
        if let Err(err) = outcome {
            self.report_error(chat, &err).await;
        }
    }

    /// The routing table: one handler per namespace. Returns the short
    /// acknowledgment text, if any.
    async fn route(&self, chat: ChatId, token: &CallbackToken) -> CoreResult<Option<String>> {
        match token.namespace {
            Namespace::Action => self.on_action(chat, token).await,
            Namespace::Confirm => self.on_confirm(chat, token).await,
            Namespace::Recover => self.on_recover(chat, token).await,
            Namespace::Page => self.on_page(chat, token).await,
            Namespace::Search => self.on_search(chat, token).await,
            Namespace::Pref => self.on_pref(chat, token).await,
            Namespace::Oracle => self.on_oracle(chat, token).await,
            Namespace::Toggle => self.on_toggle(chat, token).await,
            Namespace::Retry => self.on_retry(chat, token).await,
            Namespace::Help => self.on_help(chat, token).await,
            Namespace::GetFile => self.on_get_file(chat, token).await,
        }
    }

    async fn on_action(&self, chat: ChatId, token: &CallbackToken) -> CoreResult<Option<String>> {
        match token.verb.as_str() {
            "new_session" => self.create_flow(chat).await?,
            "finalize" => self.finalize_flow(chat).await?,
            "search" => self.search_intent(chat).await?,
            "sessions" => self.sessions_list(chat).await?,
            "status" => self.status(chat).await?,
            "oracles" => self.oracles_list(chat).await?,
            "reopen" => self.reopen_flow(chat).await?,
            "transcript" => self.send_transcript(chat).await?,
            _ => {
                return Err(CoreError::validation(
                    "invalid_token",
                    format!("unknown action verb '{}'", token.verb),
                ))
            }
        }
        Ok(None)
    }

    async fn on_confirm(&self, chat: ChatId, token: &CallbackToken) -> CoreResult<Option<String>> {
        if token.verb != "session_conflict" {
            return Err(CoreError::validation(
                "invalid_token",
                format!("unknown dialog '{}'", token.verb),
            ));
        }
        let Some(PendingDialog::SessionConflict { active }) = self.state.take_dialog(chat).await
        else {
            return Err(CoreError::validation(
                "invalid_token",
                "no pending conflict dialog",
            ));
        };
        let register = self.register(chat).await;

        match token.arg.as_deref() {
            Some("finalize_current") => {
                self.finalize_session_and_queue(chat, &active).await?;
                self.create_flow(chat).await?;
                Ok(Some("Sessão anterior finalizada".to_string()))
            }
            Some("discard_current") => {
                let name = self.display_name(&active).await;
                self.manager.discard_session(&active).await?;
                self.send(
                    chat,
                    &render("session_discarded", register, &[("name", name)]),
                    None,
                )
                .await?;
                self.create_flow(chat).await?;
                Ok(Some("Sessão anterior descartada".to_string()))
            }
            Some("return") => {
                let name = self.display_name(&active).await;
                self.send(
                    chat,
                    &render("conflict_return", register, &[("name", name)]),
                    None,
                )
                .await?;
                Ok(None)
            }
            other => Err(CoreError::validation(
                "invalid_token",
                format!("unknown conflict choice {other:?}"),
            )),
        }
    }

    async fn on_recover(&self, chat: ChatId, token: &CallbackToken) -> CoreResult<Option<String>> {
        let Some(PendingDialog::Recovery { session }) = self.state.take_dialog(chat).await else {
            return Err(CoreError::validation(
                "invalid_token",
                "no pending recovery dialog",
            ));
        };
        let register = self.register(chat).await;

        match token.verb.as_str() {
            "resume_session" => {
                let resumed = self.manager.resume_interrupted(&session, Utc::now()).await?;
                self.send(
                    chat,
                    &render(
                        "session_resumed",
                        register,
                        &[("name", resumed.intelligible_name)],
                    ),
                    None,
                )
                .await?;
                Ok(Some("Sessão retomada".to_string()))
            }
            "finalize_orphan" => {
                self.finalize_session_and_queue(chat, &session).await?;
                Ok(Some("Transcrição iniciada".to_string()))
            }
            "discard_orphan" => {
                let name = self.display_name(&session).await;
                self.manager.discard_session(&session).await?;
                self.send(
                    chat,
                    &render("session_discarded", register, &[("name", name)]),
                    None,
                )
                .await?;
                Ok(Some("Sessão descartada".to_string()))
            }
            other => {
                // Put the dialog back: the press was malformed, not a
                // resolution.
                self.state
                    .set_dialog(chat, PendingDialog::Recovery { session })
                    .await;
                Err(CoreError::validation(
                    "invalid_token",
                    format!("unknown recovery verb '{other}'"),
                ))
            }
        }
    }

    async fn on_page(&self, chat: ChatId, token: &CallbackToken) -> CoreResult<Option<String>> {
        if token.verb == "current" {
            return Ok(Some(String::new()));
        }
        let n: usize = token.verb.parse().map_err(|_| {
            CoreError::validation("invalid_token", format!("bad page '{}'", token.verb))
        })?;
        let edit = self
            .state
            .with_pager(chat, |pager, message| {
                pager.goto(n);
                (message, pager.current_page().to_string(), pager.keyboard())
            })
            .await;
        match edit {
            Some((message, page, keyboard)) => {
                self.transport
                    .edit_text(message, &page, Some(&keyboard))
                    .await?;
                Ok(Some(String::new()))
            }
            None => Err(CoreError::validation(
                "invalid_token",
                "no paginated message active",
            )),
        }
    }

    async fn on_search(&self, chat: ChatId, token: &CallbackToken) -> CoreResult<Option<String>> {
        if token.verb != "select" {
            return Err(CoreError::validation(
                "invalid_token",
                format!("unknown search verb '{}'", token.verb),
            ));
        }
        let id = SessionId(token.arg.clone().ok_or_else(|| {
            CoreError::validation("invalid_token", "search:select without session id")
        })?);
        self.state.set_focus(chat, id.clone()).await;
        self.show_session_detail(chat, &id).await?;
        Ok(None)
    }

    async fn on_pref(&self, chat: ChatId, token: &CallbackToken) -> CoreResult<Option<String>> {
        if token.verb != "simplified" {
            return Err(CoreError::validation(
                "invalid_token",
                format!("unknown preference '{}'", token.verb),
            ));
        }
        let id = self.focused_or_active(chat).await?;
        let simplified = self
            .manager
            .with_session_mut(&id, |session| {
                session.ui_preferences.simplified_ui = !session.ui_preferences.simplified_ui;
                Ok(session.ui_preferences.simplified_ui)
            })
            .await?;
        let register = Register::from_simplified(simplified);
        let what = if simplified {
            "interface simplificada ativada"
        } else {
            "interface decorada ativada"
        };
        self.send(
            chat,
            &render("pref_updated", register, &[("what", what.to_string())]),
            None,
        )
        .await?;
        Ok(Some(String::new()))
    }

    async fn on_oracle(&self, chat: ChatId, token: &CallbackToken) -> CoreResult<Option<String>> {
        let persona_id = token.verb.clone();
        let session_id = self.focused_or_latest_ready(chat).await?;
        let session = self.manager.get_session(&session_id).await?;
        let register = self.register(chat).await;

        let persona = self.oracle.registry().get(&persona_id).await?;
        self.send(
            chat,
            &render(
                "oracle_thinking",
                register,
                &[("name", persona.display_name.clone())],
            ),
            None,
        )
        .await?;

        // The dispatch chain (LLM → text delivery → voice artifact) runs
        // detached so one oracle does not block the event loop or other
        // chains.
        let oracle = self.oracle.clone();
        let tts = self.tts.clone();
        let transport = self.transport.clone();
        let ui = self.config.ui.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            match oracle.run(&session, &persona_id).await {
                Ok(outcome) => {
                    let header = render(
                        "oracle_header",
                        register,
                        &[("name", outcome.persona_name.clone())],
                    );
                    let body = format!("{header}\n\n{}", outcome.text);
                    send_long_detached(&transport, &state, chat, &body, &ui).await;

                    // Voice is best-effort; the text is already out.
                    let request = TtsRequest {
                        session_id: session.id.clone(),
                        persona_id: outcome.persona_id.clone(),
                        sequence: outcome.sequence,
                        text: outcome.text.clone(),
                    };
                    match tts.synthesize(&request).await {
                        TtsResult::Ok { path, .. } => {
                            if let Err(e) = transport.send_voice(chat, &path).await {
                                warn!(error = %e, "voice delivery failed");
                            }
                        }
                        TtsResult::Err { code, message } => {
                            info!(code, %message, "tts skipped");
                        }
                    }
                }
                Err(err) => {
                    let rendered = humanize(&err, register);
                    let _ = transport
                        .send_text(chat, &rendered.text, Some(&rendered.keyboard))
                        .await;
                }
            }
        });
        Ok(Some("Consultando…".to_string()))
    }

    async fn on_toggle(&self, chat: ChatId, token: &CallbackToken) -> CoreResult<Option<String>> {
        if token.verb != "history" {
            return Err(CoreError::validation(
                "invalid_token",
                format!("unknown flag '{}'", token.verb),
            ));
        }
        let id = self.focused_or_active(chat).await?;
        let include = self
            .manager
            .with_session_mut(&id, |session| {
                session.ui_preferences.include_llm_history =
                    !session.ui_preferences.include_llm_history;
                Ok(session.ui_preferences.include_llm_history)
            })
            .await?;
        let register = self.register(chat).await;
        let what = if include {
            "oráculos anteriores entram no contexto"
        } else {
            "oráculos anteriores ficam fora do contexto"
        };
        self.send(
            chat,
            &render("pref_updated", register, &[("what", what.to_string())]),
            None,
        )
        .await?;
        Ok(Some(String::new()))
    }

    async fn on_retry(&self, chat: ChatId, token: &CallbackToken) -> CoreResult<Option<String>> {
        if token.verb != "transcription" {
            return Err(CoreError::validation(
                "invalid_token",
                format!("unknown retry target '{}'", token.verb),
            ));
        }
        let id = self.focused_or_active(chat).await?;
        let reset = self.manager.reset_failed_segments(&id).await?;
        if reset.is_empty() {
            return Ok(Some("Nada a reprocessar".to_string()));
        }
        let session = self.manager.get_session(&id).await?;
        let queued = self.queue.queue_session(&session)?;
        let register = self.register(chat).await;
        self.send(
            chat,
            &render(
                "retry_scheduled",
                register,
                &[("count", queued.to_string())],
            ),
            None,
        )
        .await?;
        Ok(None)
    }

    async fn on_help(&self, chat: ChatId, token: &CallbackToken) -> CoreResult<Option<String>> {
        let register = self.register(chat).await;
        match token.verb.as_str() {
            "menu" => self.show_welcome(chat).await?,
            "errors" => {
                let id = self.focused_or_active(chat).await?;
                let session = self.manager.get_session(&id).await?;
                let body = if session.errors.is_empty() {
                    "Nenhum erro registrado nesta sessão.".to_string()
                } else {
                    session
                        .errors
                        .iter()
                        .rev()
                        .take(10)
                        .map(|e| {
                            format!(
                                "{} — {} ({})",
                                e.timestamp.format("%d/%m %H:%M"),
                                e.operation,
                                e.target
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                };
                self.send(chat, &body, None).await?;
            }
            _ => {
                self.send(chat, text("help", register), Some(&self.main_keyboard()))
                    .await?;
            }
        }
        Ok(None)
    }

    async fn on_get_file(&self, chat: ChatId, token: &CallbackToken) -> CoreResult<Option<String>> {
        let relpath = std::path::Path::new(&token.verb);
        let traversal = relpath.is_absolute()
            || relpath
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
        if traversal {
            return Err(CoreError::validation(
                "invalid_token",
                format!("refusing path '{}'", token.verb),
            ));
        }
        let path = self.manager.store().root().join(relpath);
        if !path.is_file() {
            return Err(CoreError::validation(
                "session_not_found",
                format!("no such file '{}'", token.verb),
            ));
        }
        self.transport.send_file(chat, &path, None).await?;
        Ok(Some(String::new()))
    }

    // ---- flows -----------------------------------------------------------

    async fn show_welcome(&self, chat: ChatId) -> CoreResult<()> {
        let register = self.register(chat).await;
        self.send(chat, text("welcome", register), Some(&self.main_keyboard()))
            .await
    }

    async fn create_flow(&self, chat: ChatId) -> CoreResult<()> {
        let register = self.register(chat).await;
        match self.manager.create_session(chat, Utc::now()).await? {
            CreateOutcome::Created(session) => {
                self.send(
                    chat,
                    &render(
                        "session_started",
                        register,
                        &[("name", session.intelligible_name)],
                    ),
                    None,
                )
                .await
            }
            CreateOutcome::Conflict { active } => {
                self.state
                    .set_dialog(
                        chat,
                        PendingDialog::SessionConflict {
                            active: active.id.clone(),
                        },
                    )
                    .await;
                let body = render(
                    "conflict_dialog",
                    register,
                    &[
                        ("name", active.intelligible_name.clone()),
                        ("count", active.audio_entries.len().to_string()),
                    ],
                );
                let keyboard = Keyboard::new()
                    .row(vec![Keyboard::button(
                        "✅ Finalizar a atual",
                        "confirm:session_conflict:finalize_current",
                    )])
                    .row(vec![Keyboard::button(
                        "🗑️ Descartar a atual",
                        "confirm:session_conflict:discard_current",
                    )])
                    .row(vec![Keyboard::button(
                        "↩️ Voltar para ela",
                        "confirm:session_conflict:return",
                    )]);
                self.send(chat, &body, Some(&keyboard)).await
            }
        }
    }

    async fn finalize_flow(&self, chat: ChatId) -> CoreResult<()> {
        let id = self
            .manager
            .active_session(chat)
            .await
            .ok_or_else(|| CoreError::validation("no_active_session", "no active session"))?;
        self.finalize_session_and_queue(chat, &id).await
    }

    async fn finalize_session_and_queue(&self, chat: ChatId, id: &SessionId) -> CoreResult<()> {
        let session = self.manager.finalize_session(id, Utc::now()).await?;
        let queued = self.queue.queue_session(&session)?;

        // A reopen-finalize cycle with no new audio has nothing PENDING,
        // so no worker item will ever fire the completion transition.
        // Drive it here: straight through embedding back to READY.
        if queued == 0 && session.pending_segments().count() == 0 {
            let completed = self.manager.complete_transcription(id, Utc::now()).await?;
            if completed.state == SessionState::Transcribed
                && self.embed_tx.send(id.clone()).is_err()
            {
                warn!(session_id = %id, "embedding worker unavailable");
            }
        }

        let register = self.register(chat).await;
        self.send(
            chat,
            &render(
                "session_finalized",
                register,
                &[
                    ("name", session.intelligible_name.clone()),
                    ("count", queued.to_string()),
                ],
            ),
            None,
        )
        .await
    }

    async fn reopen_flow(&self, chat: ChatId) -> CoreResult<()> {
        let id = self
            .state
            .focus(chat)
            .await
            .ok_or_else(|| CoreError::validation("session_not_found", "no session selected"))?;
        let session = self.manager.reopen_session(&id, Utc::now()).await?;
        let register = self.register(chat).await;
        self.send(
            chat,
            &render(
                "session_reopened",
                register,
                &[
                    ("name", session.intelligible_name),
                    ("epoch", session.reopen_count.to_string()),
                ],
            ),
            None,
        )
        .await
    }

    async fn search_intent(&self, chat: ChatId) -> CoreResult<()> {
        let register = self.register(chat).await;
        self.send(chat, text("search_prompt", register), None).await?;

        let state = self.state.clone();
        let transport = self.transport.clone();
        let timeout = Duration::from_secs(self.config.ui.intent_timeout_secs);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if state.expire_intent(chat).await.is_some() {
                let _ = transport
                    .send_text(chat, text("search_cancelled", register), None)
                    .await;
            }
        });
        self.state
            .set_intent(chat, PendingIntent::AwaitingSearchQuery, timer)
            .await;
        Ok(())
    }

    async fn run_search(&self, chat: ChatId, query: &str) -> CoreResult<()> {
        let response = self
            .search
            .search(
                query,
                chat,
                self.config.search.max_results,
                self.config.search.min_score,
            )
            .await?;
        let register = self.register(chat).await;
        let (body, keyboard) = render_search_response(&response, register);
        self.send(chat, &body, Some(&keyboard)).await
    }

    async fn sessions_list(&self, chat: ChatId) -> CoreResult<()> {
        let results = self.search.list_chronological(chat, 10, 0)?;
        let register = self.register(chat).await;
        if results.is_empty() {
            return self
                .send(chat, text("welcome", register), Some(&self.main_keyboard()))
                .await;
        }
        let mut keyboard = Keyboard::new();
        let mut lines = Vec::new();
        for result in &results {
            lines.push(format!(
                "{} — {} áudio(s)",
                result.display_name, result.audio_count
            ));
            keyboard = keyboard.row(vec![Keyboard::button(
                result.display_name.clone(),
                format!("search:select:{}", result.session_id),
            )]);
        }
        self.send(chat, &lines.join("\n"), Some(&keyboard)).await
    }

    async fn status(&self, chat: ChatId) -> CoreResult<()> {
        let id = self
            .focused_or_active(chat)
            .await?;
        self.show_session_detail(chat, &id).await
    }

    async fn show_session_detail(&self, chat: ChatId, id: &SessionId) -> CoreResult<()> {
        let session = self.manager.get_session(id).await?;
        let register = Register::from_simplified(session.ui_preferences.simplified_ui);
        let body = render(
            "status_line",
            register,
            &[
                ("name", session.intelligible_name.clone()),
                ("state", session.state.to_string()),
                ("count", session.audio_entries.len().to_string()),
                ("epoch", session.reopen_count.to_string()),
            ],
        );
        let mut keyboard = Keyboard::new();
        let mut first_row = Vec::new();
        if session.state == SessionState::Ready {
            first_row.push(Keyboard::button("🔄 Reabrir", "action:reopen"));
            first_row.push(Keyboard::button("📄 Transcrição", "action:transcript"));
        }
        if session
            .audio_entries
            .iter()
            .any(|e| e.transcription_status == crate::session::TranscriptionStatus::Failed)
        {
            first_row.push(Keyboard::button("🔁 Reprocessar", "retry:transcription"));
        }
        if !first_row.is_empty() {
            keyboard = keyboard.row(first_row);
        }
        keyboard = keyboard.row(vec![
            Keyboard::button("🔮 Oráculos", "action:oracles"),
            Keyboard::button("🧵 Histórico", "toggle:history"),
            Keyboard::button("🔡 Interface", "pref:simplified"),
        ]);
        if !session.errors.is_empty() {
            keyboard = keyboard.row(vec![Keyboard::button("🧾 Erros", "help:errors")]);
        }
        self.send(chat, &body, Some(&keyboard)).await
    }

    async fn oracles_list(&self, chat: ChatId) -> CoreResult<()> {
        let personas = self.oracle.registry().list().await?;
        let register = self.register(chat).await;
        if personas.is_empty() {
            return self.send(chat, text("no_personas", register), None).await;
        }
        let mut keyboard = Keyboard::new();
        for persona in &personas {
            keyboard = keyboard.row(vec![Keyboard::button(
                persona.display_name.clone(),
                format!("oracle:{}", persona.id),
            )]);
        }
        self.send(chat, "🔮 Escolha um oráculo:", Some(&keyboard))
            .await
    }

    async fn send_transcript(&self, chat: ChatId) -> CoreResult<()> {
        let id = self.focused_or_active(chat).await?;
        let session = self.manager.get_session(&id).await?;
        let path = narrative::prepare_input(self.manager.store(), &session)?;
        self.transport
            .send_file(chat, &path, Some(&session.intelligible_name))
            .await
    }

    // ---- helpers ---------------------------------------------------------

    async fn focused_or_active(&self, chat: ChatId) -> CoreResult<SessionId> {
        if let Some(id) = self.state.focus(chat).await {
            return Ok(id);
        }
        self.manager
            .active_session(chat)
            .await
            .ok_or_else(|| CoreError::validation("no_active_session", "no session in focus"))
    }

    async fn focused_or_latest_ready(&self, chat: ChatId) -> CoreResult<SessionId> {
        if let Some(id) = self.state.focus(chat).await {
            return Ok(id);
        }
        let mut sessions: Vec<Session> = self
            .manager
            .store()
            .load_all()?
            .into_iter()
            .filter(|s| s.chat_id == chat && s.state == SessionState::Ready)
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
            .into_iter()
            .next()
            .map(|s| s.id)
            .ok_or_else(|| CoreError::validation("no_transcripts", "no ready session"))
    }

    async fn register(&self, chat: ChatId) -> Register {
        let id = match self.state.focus(chat).await {
            Some(id) => Some(id),
            None => self.manager.active_session(chat).await,
        };
        if let Some(id) = id {
            if let Ok(session) = self.manager.get_session(&id).await {
                return Register::from_simplified(session.ui_preferences.simplified_ui);
            }
        }
        Register::Decorated
    }

    async fn display_name(&self, id: &SessionId) -> String {
        self.manager
            .get_session(id)
            .await
            .map(|s| s.intelligible_name)
            .unwrap_or_else(|_| id.to_string())
    }

    fn main_keyboard(&self) -> Keyboard {
        Keyboard::new()
            .row(vec![
                Keyboard::button("🆕 Nova sessão", "action:new_session"),
                Keyboard::button("✅ Finalizar", "action:finalize"),
            ])
            .row(vec![
                Keyboard::button("🔎 Buscar", "action:search"),
                Keyboard::button("📚 Sessões", "action:sessions"),
            ])
            .row(vec![
                Keyboard::button("🔮 Oráculos", "action:oracles"),
                Keyboard::button("ℹ️ Ajuda", "help:menu"),
            ])
    }

    async fn send(&self, chat: ChatId, body: &str, keyboard: Option<&Keyboard>) -> CoreResult<()> {
        send_long(
            &*self.transport,
            &self.state,
            chat,
            body,
            keyboard,
            &self.config.ui,
        )
        .await
    }

    async fn report_error(&self, chat: ChatId, err: &CoreError) {
        warn!(chat_id = %chat, error = %err, code = err.catalog_code(), "user-visible failure");
        let register = self.register(chat).await;
        let rendered = humanize(err, register);
        if let Err(e) = self
            .transport
            .send_text(chat, &rendered.text, Some(&rendered.keyboard))
            .await
        {
            error!(chat_id = %chat, error = %e, "error report undeliverable");
        }
    }
}

/// Deliver a payload, paginating above the byte cap and attaching as a
/// file above the attachment threshold.
async fn send_long(
    transport: &dyn ChatTransport,
    state: &ConversationState,
    chat: ChatId,
    body: &str,
    keyboard: Option<&Keyboard>,
    ui: &crate::config::UiConfig,
) -> CoreResult<()> {
    if body.len() > ui.attachment_threshold {
        let path = std::env::temp_dir().join(format!("vox-oracle-{}.txt", uuid::Uuid::new_v4()));
        std::fs::write(&path, body).map_err(|e| CoreError::io("write attachment", e))?;
        let result = transport.send_file(chat, &path, None).await;
        let _ = std::fs::remove_file(&path);
        return result;
    }

    if body.len() > ui.message_byte_cap {
        let mut pager = Paginator::new(body, ui.message_byte_cap);
        let mut nav = pager.keyboard();
        if let Some(extra) = keyboard {
            for row in &extra.rows {
                nav = nav.row(row.clone());
            }
        }
        let first = pager.goto(0).to_string();
        let message = transport.send_text(chat, &first, Some(&nav)).await?;
        state.set_pager(chat, pager, message).await;
        return Ok(());
    }

    transport.send_text(chat, body, keyboard).await.map(|_| ())
}

async fn send_long_detached(
    transport: &Arc<dyn ChatTransport>,
    state: &ConversationState,
    chat: ChatId,
    body: &str,
    ui: &crate::config::UiConfig,
) {
    if let Err(e) = send_long(&**transport, state, chat, body, None, ui).await {
        warn!(chat_id = %chat, error = %e, "oracle delivery failed");
    }
}

fn render_search_response(response: &SearchResponse, register: Register) -> (String, Keyboard) {
    let mode = match response.match_type {
        MatchType::Semantic => "semântica",
        MatchType::Text => "texto",
        MatchType::Chronological => "recentes",
    };
    let header = if response.match_type == MatchType::Chronological {
        text("search_empty", register).to_string()
    } else {
        render(
            "search_header",
            register,
            &[
                ("query", crate::telegram::escape_html(&response.query)),
                ("mode", mode.to_string()),
            ],
        )
    };

    let mut lines = vec![header];
    let mut keyboard = Keyboard::new();
    for (i, result) in response.results.iter().enumerate() {
        let mut line = format!(
            "{}. {} ({} áudio(s), {})",
            i + 1,
            result.display_name,
            result.audio_count,
            result.created_at.format("%d/%m/%Y")
        );
        if result.match_type != MatchType::Chronological {
            line.push_str(&format!(" — {:.0}%", result.score * 100.0));
        }
        if let Some(preview) = result.previews.first() {
            let (start, len) = preview.highlight;
            let snippet = if register == Register::Decorated {
                let chars: Vec<char> = preview.text.chars().collect();
                let before: String = chars[..start].iter().collect();
                let hit: String = chars[start..start + len].iter().collect();
                let after: String = chars[start + len..].iter().collect();
                format!(
                    "…{}<b>{}</b>{}…",
                    crate::telegram::escape_html(&before),
                    crate::telegram::escape_html(&hit),
                    crate::telegram::escape_html(&after)
                )
            } else {
                format!("…{}…", preview.text)
            };
            line.push('\n');
            line.push_str(&snippet);
        }
        lines.push(line);
        keyboard = keyboard.row(vec![Keyboard::button(
            format!("{}. {}", i + 1, result.display_name),
            format!("search:select:{}", result.session_id),
        )]);
    }
    (lines.join("\n\n"), keyboard)
}

fn human_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.0} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}
