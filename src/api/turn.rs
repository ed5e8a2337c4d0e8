//! Voice turn endpoint
//!
//! `POST /api/voice/turn` takes a multipart form with `audio_file`,
//! `character_id` and `is_unhinged`, and answers with the transcript, the
//! reply text and the reply audio as base64. A submission matching one
//! already seen inside the dedup window, or arriving while the same user and
//! persona have a turn in flight, is answered with 202 and
//! `status: "duplicate_detected"` without doing any work.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Multipart, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ApiState, MAX_UPLOAD_BYTES};
use crate::Error;
use crate::dedup::Fingerprint;
use crate::persona::PersonaMode;
use crate::turn::{EMPTY_TRANSCRIPT_MESSAGE, TurnOutcome, TurnRequest};

/// Header carrying the caller's identity, set by an upstream proxy
pub const USER_ID_HEADER: &str = "x-user-id";

/// User id when no identity header is present
pub const DEFAULT_USER_ID: &str = "local";

/// Build voice router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/turn", post(submit_turn))
        .route("/capabilities", get(capabilities))
        .with_state(state)
}

/// Successful turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub status: String,
    pub user_text: String,
    pub ai_text: String,

    /// Base64 reply audio; `null` when synthesis failed
    pub audio_data: Option<String>,
    pub has_audio: bool,

    pub conversation_id: String,
    pub user_message_id: String,
    pub ai_message_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl TurnResponse {
    /// Decode the inline reply audio
    #[must_use]
    pub fn audio_bytes(&self) -> Option<Vec<u8>> {
        let encoded = self.audio_data.as_deref()?;
        match base64::engine::general_purpose::STANDARD.decode(encoded) {
            Ok(audio) if !audio.is_empty() => Some(audio),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, "reply audio is not valid base64");
                None
            }
        }
    }
}

impl From<TurnOutcome> for TurnResponse {
    fn from(outcome: TurnOutcome) -> Self {
        let audio_data = outcome
            .audio
            .as_deref()
            .map(|audio| base64::engine::general_purpose::STANDARD.encode(audio));

        Self {
            status: "success".to_string(),
            user_text: outcome.user_text,
            ai_text: outcome.ai_text,
            has_audio: audio_data.is_some(),
            audio_data,
            conversation_id: outcome.conversation_id,
            user_message_id: outcome.user_message_id,
            ai_message_id: outcome.ai_message_id,
            updated_at: outcome.updated_at,
        }
    }
}

/// Rejected duplicate submission (HTTP 202)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateResponse {
    pub status: String,
    pub message: String,
}

/// Error body shared by every failing voice route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Parsed multipart form
struct TurnForm {
    audio: Vec<u8>,
    persona_id: String,
    mode: PersonaMode,
}

async fn read_form(mut multipart: Multipart) -> Result<TurnForm, ApiError> {
    let mut audio = None;
    let mut persona_id = None;
    let mut mode = PersonaMode::Standard;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("audio_file") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                audio = Some(bytes.to_vec());
            }
            Some("character_id") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                persona_id = Some(text.trim().to_string());
            }
            Some("is_unhinged") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                mode = PersonaMode::from_flag(&text);
            }
            other => tracing::debug!(field = ?other, "ignoring multipart field"),
        }
    }

    let audio = audio
        .filter(|a| !a.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing audio_file".to_string()))?;
    let persona_id = persona_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing character_id".to_string()))?;

    Ok(TurnForm {
        audio,
        persona_id,
        mode,
    })
}

fn user_id(headers: &HeaderMap) -> String {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_USER_ID)
        .to_string()
}

/// Process one spoken turn
async fn submit_turn(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let form = read_form(multipart).await?;
    let user_id = user_id(&headers);

    let now = Utc::now();
    let window = state.ledger.window();
    let fingerprint = Fingerprint::compute(&form.persona_id, &form.audio, now, window);
    // A retry just past a bucket boundary still matches the first attempt
    let previous = Fingerprint::compute_previous(&form.persona_id, &form.audio, now, window);
    let session_key = format!("{user_id}:{}", form.persona_id);

    // Held until the turn finishes; dropping clears the in-flight mark
    let admission = match state
        .ledger
        .try_admit_with(fingerprint, &[previous], &session_key)
    {
        Ok(admission) => admission,
        Err(rejection) => {
            tracing::info!(
                user_id = %user_id,
                persona_id = %form.persona_id,
                reason = %rejection,
                "duplicate turn rejected"
            );
            let body = DuplicateResponse {
                status: "duplicate_detected".to_string(),
                message: rejection.message().to_string(),
            };
            return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
        }
    };

    tracing::info!(
        user_id = %user_id,
        persona_id = %form.persona_id,
        bytes = form.audio.len(),
        mode = form.mode.as_flag(),
        fingerprint = %admission.fingerprint(),
        "turn submitted"
    );

    let request = TurnRequest {
        user_id,
        persona_id: form.persona_id,
        mode: form.mode,
        audio: form.audio,
    };

    // Detached: once the user message is stored the turn runs to its
    // assistant message even if the client goes away
    let processor = Arc::clone(&state.processor);
    let turn = tokio::spawn(async move {
        let outcome = processor.process(request).await;
        drop(admission);
        outcome
    });

    let outcome = turn
        .await
        .map_err(|e| ApiError::Internal(Error::TurnAborted(e.to_string())))??;

    Ok(Json(TurnResponse::from(outcome)).into_response())
}

/// Providers, personas and limits of this server
#[derive(Debug, Serialize)]
pub struct VoiceCapabilities {
    pub stt_provider: &'static str,
    pub tts_provider: &'static str,
    pub dedup_window_ms: u64,
    pub max_upload_bytes: usize,
    pub personas: Vec<PersonaSummary>,
}

#[derive(Debug, Serialize)]
pub struct PersonaSummary {
    pub id: String,
    pub name: String,
}

async fn capabilities(State(state): State<Arc<ApiState>>) -> Json<VoiceCapabilities> {
    let personas = state
        .processor
        .personas()
        .iter()
        .map(|p| PersonaSummary {
            id: p.id.clone(),
            name: p.name.clone(),
        })
        .collect();

    Json(VoiceCapabilities {
        stt_provider: state.stt_backend.as_str(),
        tts_provider: state.tts_backend.as_str(),
        dedup_window_ms: u64::try_from(state.ledger.window().as_millis()).unwrap_or(u64::MAX),
        max_upload_bytes: MAX_UPLOAD_BYTES,
        personas,
    })
}

/// Voice API errors
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    /// Quota spent; carries the wait until the next free slot
    RateLimited(Duration),
    EmptyTranscript,
    NotFound(String),
    Internal(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::EmptyTranscript => Self::EmptyTranscript,
            Error::NotFound(what) => Self::NotFound(what),
            Error::Unauthorized => Self::Unauthorized,
            other => Self::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Whole seconds, rounded up
        let retry_after = match &self {
            Self::RateLimited(wait) => {
                Some((wait.as_secs() + u64::from(wait.subsec_nanos() > 0)).max(1))
            }
            _ => None,
        };

        let (status, code, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing or invalid API key".to_string(),
            ),
            Self::RateLimited(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "too many requests".to_string(),
            ),
            Self::EmptyTranscript => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "empty_transcript",
                EMPTY_TRANSCRIPT_MESSAGE.to_string(),
            ),
            Self::NotFound(what) => (StatusCode::NOT_FOUND, "not_found", format!("{what} not found")),
            Self::Internal(err) => {
                tracing::error!(error = %err, "turn failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "failed to process turn".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            status: "error".to_string(),
            error: ErrorBody {
                code: code.to_string(),
                message,
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
