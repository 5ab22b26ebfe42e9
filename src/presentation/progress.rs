//! Progress rendering with edit-in-place throttling.
//!
//! One pinned message per (chat, session) operation is edited as the
//! worker advances. Successive edits are suppressed unless the
//! configured interval has elapsed or the event is a state transition
//! (start, completion, failure), which always renders.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::presentation::messages::{render, Register};
use crate::session::SessionStore;
use crate::telegram::{ChatTransport, MessageRef};
use crate::transcription::{ProgressEvent, ProgressKind};
use crate::types::SessionId;

struct Pinned {
    message: MessageRef,
    last_edit: Instant,
}

/// Consumes worker progress events and keeps the chat updated.
pub struct ProgressReporter {
    transport: Arc<dyn ChatTransport>,
    store: SessionStore,
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    interval: Duration,
    pinned: HashMap<SessionId, Pinned>,
    shutdown: broadcast::Receiver<()>,
}

impl ProgressReporter {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        store: SessionStore,
        rx: mpsc::UnboundedReceiver<ProgressEvent>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            transport,
            store,
            rx,
            interval,
            pinned: HashMap::new(),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.recv() => break,
                event = self.rx.recv() => {
                    match event {
                        Some(event) => self.handle(event).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle(&mut self, event: ProgressEvent) {
        let is_transition = event.kind != ProgressKind::Step;
        if !is_transition {
            if let Some(pinned) = self.pinned.get(&event.session_id) {
                if pinned.last_edit.elapsed() < self.interval {
                    debug!(session_id = %event.session_id, "progress edit throttled");
                    return;
                }
            }
        }

        let register = self
            .store
            .load(&event.session_id)
            .map(|s| Register::from_simplified(s.ui_preferences.simplified_ui))
            .unwrap_or(Register::Decorated);
        let text = render(
            "transcription_progress",
            register,
            &[
                ("step", event.step.clone()),
                ("current", event.current.to_string()),
                ("total", event.total.to_string()),
            ],
        );

        match self.pinned.get(&event.session_id) {
            Some(pinned) => {
                let message = pinned.message;
                if let Err(e) = self.transport.edit_text(message, &text, None).await {
                    warn!(session_id = %event.session_id, error = %e, "progress edit failed");
                }
                self.pinned.insert(
                    event.session_id.clone(),
                    Pinned {
                        message,
                        last_edit: Instant::now(),
                    },
                );
            }
            None => match self.transport.send_text(event.chat_id, &text, None).await {
                Ok(message) => {
                    self.pinned.insert(
                        event.session_id.clone(),
                        Pinned {
                            message,
                            last_edit: Instant::now(),
                        },
                    );
                }
                Err(e) => {
                    warn!(session_id = %event.session_id, error = %e, "progress send failed");
                }
            },
        }

        // Terminal events unpin so a later operation starts fresh.
        if matches!(event.kind, ProgressKind::Completed | ProgressKind::Failed) {
            self.pinned.remove(&event.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::Keyboard;
    use crate::types::{ChatId, CoreResult};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: StdMutex<Vec<String>>,
        edited: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatTransport for RecordingTransport {
        async fn send_text(
            &self,
            chat: ChatId,
            text: &str,
            _keyboard: Option<&Keyboard>,
        ) -> CoreResult<MessageRef> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(MessageRef {
                chat_id: chat,
                message_id: self.sent.lock().unwrap().len() as i64,
            })
        }

        async fn edit_text(
            &self,
            _message: MessageRef,
            text: &str,
            _keyboard: Option<&Keyboard>,
        ) -> CoreResult<()> {
            self.edited.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_voice(&self, _chat: ChatId, _path: &Path) -> CoreResult<()> {
            Ok(())
        }

        async fn send_file(
            &self,
            _chat: ChatId,
            _path: &Path,
            _caption: Option<&str>,
        ) -> CoreResult<()> {
            Ok(())
        }

        async fn download_voice(&self, _file_id: &str) -> CoreResult<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn answer_callback(&self, _id: &str, _text: Option<&str>) -> CoreResult<()> {
            Ok(())
        }
    }

    fn event(kind: ProgressKind, current: usize) -> ProgressEvent {
        ProgressEvent {
            session_id: SessionId::from("2025-01-01_10-00-00"),
            chat_id: ChatId(42),
            current,
            total: 3,
            step: format!("passo {current}"),
            kind,
        }
    }

    #[tokio::test]
    async fn test_steps_are_throttled_but_transitions_pass() {
        let tmp = tempfile::TempDir::new().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let reporter = ProgressReporter::new(
            transport.clone(),
            SessionStore::new(tmp.path().join("sessions")),
            rx,
            Duration::from_secs(3600),
            shutdown_rx,
        );
        let handle = tokio::spawn(reporter.run());

        tx.send(event(ProgressKind::Started, 0)).unwrap();
        // Rapid steps inside the interval: suppressed.
        tx.send(event(ProgressKind::Step, 1)).unwrap();
        tx.send(event(ProgressKind::Step, 2)).unwrap();
        // Terminal transition: always rendered.
        tx.send(event(ProgressKind::Completed, 3)).unwrap();
        drop(tx);
        handle.await.unwrap();
        drop(shutdown_tx);

        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        let edited = transport.edited.lock().unwrap();
        assert_eq!(edited.len(), 1);
        assert!(edited[0].contains("3/3"));
    }

    #[tokio::test]
    async fn test_new_operation_after_terminal_pins_fresh_message() {
        let tmp = tempfile::TempDir::new().unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let reporter = ProgressReporter::new(
            transport.clone(),
            SessionStore::new(tmp.path().join("sessions")),
            rx,
            Duration::from_secs(0),
            shutdown_rx,
        );
        let handle = tokio::spawn(reporter.run());

        tx.send(event(ProgressKind::Started, 0)).unwrap();
        tx.send(event(ProgressKind::Completed, 3)).unwrap();
        tx.send(event(ProgressKind::Started, 0)).unwrap();
        drop(tx);
        handle.await.unwrap();

        // Second Started sent a new message rather than editing the old.
        assert_eq!(transport.sent.lock().unwrap().len(), 2);
    }
}
