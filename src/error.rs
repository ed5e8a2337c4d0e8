//! Error types for persona calls

use thiserror::Error;

/// Result type alias for persona call operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in the voice turn pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The user or platform refused microphone access
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// No audio device, or no supported encoding on the device
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Recording ended without any audio chunks
    #[error("capture contained no audio")]
    EmptyCapture,

    /// Submission rejected as a duplicate of one already accepted
    #[error("duplicate request: {0}")]
    DuplicateRequest(String),

    /// Transcription produced no text
    #[error("transcript was empty")]
    EmptyTranscript,

    /// Reply generation error
    #[error("generation error: {0}")]
    Generation(String),

    /// Audio error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Turn submission did not complete in time
    #[error("request timed out after {0:?}")]
    NetworkTimeout(std::time::Duration),

    /// Missing or invalid credentials
    #[error("unauthorized")]
    Unauthorized,

    /// Conversation or persona not found
    #[error("not found: {0}")]
    NotFound(String),

    /// The turn endpoint answered with an error body
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// A server turn task panicked or was cancelled
    #[error("turn aborted: {0}")]
    TurnAborted(String),

    /// The call session is no longer running
    #[error("call session ended")]
    SessionEnded,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether the caller may retry the same action unchanged
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkTimeout(_))
    }

    /// Whether the error is a no-op signal that should not be surfaced
    #[must_use]
    pub const fn is_silent(&self) -> bool {
        matches!(self, Self::DuplicateRequest(_))
    }

    /// Whether the error comes from audio hardware or permissions
    #[must_use]
    pub const fn is_hardware(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied(_) | Self::DeviceUnavailable(_) | Self::Audio(_)
        )
    }
}
