//! Client side of a voice call
//!
//! [`CallSession`] is the turn state machine; [`CallHandle`] is the command
//! interface a UI or the terminal runner drives it through.

pub mod client;
pub mod session;
pub mod state;

pub use client::{HttpTurnClient, TurnClient, TurnReply, TurnSubmission};
pub use session::{CallCommand, CallHandle, CallOptions, CallSession};
pub use state::{CallFlags, CallSnapshot, TurnState, TurnSummary};
