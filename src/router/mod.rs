//! UI routing: typed transport events, the closed callback grammar and
//! per-chat conversational state.

pub mod callbacks;
pub mod handlers;
pub mod state;

pub use callbacks::{CallbackToken, Namespace};
pub use handlers::{Event, Router};
pub use state::{ConversationState, PendingDialog, PendingIntent};
