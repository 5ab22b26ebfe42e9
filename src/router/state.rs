//! Per-chat conversational state.
//!
//! A small in-memory map keyed by chat id. Each chat holds at most one
//! pending intent (with its cancellation timer), at most one pending
//! confirmation dialog, the current focus session and the active
//! paginator. Accessed only from the router task; the mutex exists for
//! the timer callbacks.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::presentation::Paginator;
use crate::telegram::MessageRef;
use crate::types::{ChatId, SessionId};

/// What the next plain-text message from a chat will be consumed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingIntent {
    AwaitingSearchQuery,
}

/// A confirmation dialog awaiting one callback choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingDialog {
    /// create_session hit an active session
    SessionConflict { active: SessionId },
    /// Startup sweep found an interrupted session
    Recovery { session: SessionId },
}

struct IntentSlot {
    intent: PendingIntent,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct ChatSlot {
    intent: Option<IntentSlot>,
    dialog: Option<PendingDialog>,
    focus: Option<SessionId>,
    pager: Option<(Paginator, MessageRef)>,
}

/// The conversational state map.
#[derive(Clone, Default)]
pub struct ConversationState {
    inner: Arc<Mutex<HashMap<ChatId, ChatSlot>>>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a pending intent, replacing (and cancelling) any prior
    /// one. `timer` is the already-spawned expiry task; it is aborted if
    /// the intent is consumed or replaced first.
    pub async fn set_intent(&self, chat: ChatId, intent: PendingIntent, timer: JoinHandle<()>) {
        let mut map = self.inner.lock().await;
        let replaced = map
            .entry(chat)
            .or_default()
            .intent
            .replace(IntentSlot { intent, timer });
        if let Some(old) = replaced {
            old.timer.abort();
        }
    }

    /// Consume the pending intent, aborting its timer.
    pub async fn take_intent(&self, chat: ChatId) -> Option<PendingIntent> {
        let mut map = self.inner.lock().await;
        map.get_mut(&chat).and_then(|slot| slot.intent.take()).map(|slot| {
            slot.timer.abort();
            slot.intent
        })
    }

    /// Clear the intent from an expiry timer. Returns the intent if it
    /// was still pending, so the caller can announce the cancellation.
    /// The caller IS the timer, so nothing is aborted here.
    pub async fn expire_intent(&self, chat: ChatId) -> Option<PendingIntent> {
        let mut map = self.inner.lock().await;
        map.get_mut(&chat)
            .and_then(|slot| slot.intent.take())
            .map(|slot| slot.intent)
    }

    pub async fn set_dialog(&self, chat: ChatId, dialog: PendingDialog) {
        let mut map = self.inner.lock().await;
        map.entry(chat).or_default().dialog = Some(dialog);
    }

    pub async fn take_dialog(&self, chat: ChatId) -> Option<PendingDialog> {
        let mut map = self.inner.lock().await;
        map.get_mut(&chat).and_then(|slot| slot.dialog.take())
    }

    pub async fn peek_dialog(&self, chat: ChatId) -> Option<PendingDialog> {
        let map = self.inner.lock().await;
        map.get(&chat).and_then(|slot| slot.dialog.clone())
    }

    pub async fn set_focus(&self, chat: ChatId, session: SessionId) {
        let mut map = self.inner.lock().await;
        map.entry(chat).or_default().focus = Some(session);
    }

    pub async fn focus(&self, chat: ChatId) -> Option<SessionId> {
        let map = self.inner.lock().await;
        map.get(&chat).and_then(|slot| slot.focus.clone())
    }

    pub async fn set_pager(&self, chat: ChatId, pager: Paginator, message: MessageRef) {
        let mut map = self.inner.lock().await;
        map.entry(chat).or_default().pager = Some((pager, message));
    }

    /// Mutate the chat's paginator in place, returning the closure's
    /// result; `None` when no paginator is active.
    pub async fn with_pager<T>(
        &self,
        chat: ChatId,
        f: impl FnOnce(&mut Paginator, MessageRef) -> T,
    ) -> Option<T> {
        let mut map = self.inner.lock().await;
        map.get_mut(&chat)
            .and_then(|slot| slot.pager.as_mut())
            .map(|(pager, message)| f(pager, *message))
    }

    /// Drop all state for a chat.
    pub async fn clear(&self, chat: ChatId) {
        self.inner.lock().await.remove(&chat);
    }
}
