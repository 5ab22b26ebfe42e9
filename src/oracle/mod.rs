//! Oracle feedback: persona templates and LLM dispatch.
//!
//! An oracle is a plain-text persona template discovered by scanning a
//! configured directory. Dispatch assembles the session's transcripts
//! (and, when the session prefers it, prior oracle responses) into the
//! template's context slot, calls the LLM and persists the response
//! under `llm_responses/`.

pub mod dispatch;
pub mod personas;

pub use dispatch::{OracleDispatcher, OracleOutcome};
pub use personas::{Persona, PersonaRegistry};
