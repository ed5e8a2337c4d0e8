//! Turn states and the transitions between them

use std::fmt;

/// What the call is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    /// Ready for the user to speak
    #[default]
    Idle,
    /// Microphone open, capture in progress
    Recording,
    /// Capture finished, waiting for the turn endpoint
    Processing,
    /// Playing the reply
    Responding,
    /// Terminal; every resource has been released
    CallEnded,
}

impl TurnState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Processing => "processing",
            Self::Responding => "responding",
            Self::CallEnded => "call_ended",
        }
    }

    /// Whether `self -> to` is a legal transition
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::Recording)
                | (Self::Recording, Self::Processing)
                | (Self::Processing, Self::Responding | Self::Idle)
                | (Self::Responding, Self::Idle | Self::Recording)
                | (
                    Self::Idle | Self::Recording | Self::Processing | Self::Responding,
                    Self::CallEnded
                )
        )
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orthogonal call flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFlags {
    pub muted: bool,
    pub call_active: bool,
    pub auto_listen: bool,
}

impl CallFlags {
    /// Whether the microphone may be opened
    #[must_use]
    pub const fn may_record(self) -> bool {
        !self.muted
    }

    /// Whether a finished reply should re-open the microphone
    #[must_use]
    pub const fn should_auto_listen(self) -> bool {
        self.call_active && self.auto_listen && !self.muted
    }
}

/// Summary of the last completed turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnSummary {
    pub user_text: String,
    pub ai_text: String,
    pub has_audio: bool,
    pub conversation_id: String,
}

/// Observable state of a call session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub state: TurnState,
    pub flags: CallFlags,

    /// Submissions sent to the turn endpoint
    pub submissions: u64,

    /// Most recent completed turn
    pub last_turn: Option<TurnSummary>,

    /// Most recent error to show the user
    pub last_error: Option<String>,

    /// Whether `last_error` may be retried as-is
    pub retryable: bool,

    /// Transient, non-error notice (e.g. a dropped duplicate)
    pub notice: Option<String>,
}

impl CallSnapshot {
    #[must_use]
    pub const fn new(flags: CallFlags) -> Self {
        Self {
            state: TurnState::Idle,
            flags,
            submissions: 0,
            last_turn: None,
            last_error: None,
            retryable: false,
            notice: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TurnState; 5] = [
        TurnState::Idle,
        TurnState::Recording,
        TurnState::Processing,
        TurnState::Responding,
        TurnState::CallEnded,
    ];

    #[test]
    fn test_recording_only_from_idle_or_responding() {
        for from in ALL {
            let expected = matches!(from, TurnState::Idle | TurnState::Responding);
            assert_eq!(from.can_transition(TurnState::Recording), expected, "{from}");
        }
    }

    #[test]
    fn test_call_ended_is_terminal() {
        for to in ALL {
            assert!(!TurnState::CallEnded.can_transition(to));
        }
        for from in ALL.into_iter().filter(|s| *s != TurnState::CallEnded) {
            assert!(from.can_transition(TurnState::CallEnded));
        }
    }

    #[test]
    fn test_processing_exits() {
        assert!(TurnState::Processing.can_transition(TurnState::Responding));
        assert!(TurnState::Processing.can_transition(TurnState::Idle));
        assert!(!TurnState::Processing.can_transition(TurnState::Recording));
        assert!(!TurnState::Idle.can_transition(TurnState::Responding));
    }

    #[test]
    fn test_auto_listen_flags() {
        let flags = CallFlags {
            muted: false,
            call_active: true,
            auto_listen: true,
        };
        assert!(flags.should_auto_listen());
        assert!(!CallFlags { muted: true, ..flags }.should_auto_listen());
        assert!(!CallFlags { call_active: false, ..flags }.should_auto_listen());
        assert!(!CallFlags { muted: true, ..flags }.may_record());
    }
}
