//! Persona Call - hands-free spoken conversations with AI personas
//!
//! A call is a sequence of turns. The client side records an utterance,
//! submits it, plays the reply and, in call mode, re-opens the microphone.
//! The server side transcribes the utterance, persists it, generates and
//! synthesizes a reply and returns everything in one response.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────── client ────────────────┐        ┌──────────── server ────────────┐
//! │ CallHandle ─▶ CallSession (state)      │        │ api::turn ─▶ DedupLedger       │
//! │   CaptureBuffer ─▶ SubmissionGuard ────┼─ HTTP ─┼▶ TurnProcessor                 │
//! │   PlaybackController ◀─────────────────┼────────┼─ STT ▸ store ▸ LLM ▸ TTS       │
//! └────────────────────────────────────────┘        └────────────────────────────────┘
//! ```

pub mod api;
pub mod call;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod llm;
pub mod persona;
pub mod turn;
pub mod voice;

pub use config::Config;
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
pub use persona::{Persona, PersonaCatalog, PersonaMode};
