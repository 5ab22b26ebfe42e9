//! Session core: data model, persistence, audio capture, lifecycle.
//!
//! A session is an append-only timeline of audio segments materialized as
//! a directory under the sessions root. The model module owns the state
//! machine, the store owns atomic persistence, the audio module owns
//! segment ingestion and the manager ties lifecycle operations together.

pub mod audio;
pub mod manager;
pub mod model;
pub mod store;

pub use audio::{AudioCapture, IntegrityReport, OrphanReport};
pub use manager::{CreateOutcome, SessionManager};
pub use model::{
    AudioSegment, ProcessingStatus, Session, SessionErrorEntry, SessionEvent, SessionState,
    TranscriptionStatus, UiPreferences,
};
pub use store::SessionStore;
