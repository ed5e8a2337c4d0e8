//! Turn submission client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};

use crate::api::turn::{DuplicateResponse, ErrorResponse, TurnResponse, USER_ID_HEADER};
use crate::persona::PersonaMode;
use crate::{Error, Result};

/// One finished capture bound for the turn endpoint
#[derive(Debug, Clone)]
pub struct TurnSubmission {
    pub persona_id: String,
    pub mode: PersonaMode,
    pub audio: Vec<u8>,
    pub mime: &'static str,
}

/// How the endpoint answered a submission
#[derive(Debug, Clone)]
pub enum TurnReply {
    Completed(Box<TurnResponse>),
    /// The server already has this capture; nothing was processed
    Duplicate(String),
}

/// Sends captures to the turn endpoint
#[async_trait]
pub trait TurnClient: Send + Sync {
    /// Submit one capture
    ///
    /// # Errors
    ///
    /// `NetworkTimeout` when the request doesn't complete in time, otherwise
    /// the error the endpoint reported
    async fn submit(&self, submission: TurnSubmission) -> Result<TurnReply>;
}

/// [`TurnClient`] for the HTTP endpoint
pub struct HttpTurnClient {
    client: reqwest::Client,
    base_url: String,
    user_id: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpTurnClient {
    #[must_use]
    pub fn new(base_url: &str, user_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            user_id: user_id.into(),
            api_key: None,
            timeout,
        }
    }

    /// Send a bearer token with every submission
    #[must_use]
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    fn turn_url(&self) -> String {
        format!("{}/api/voice/turn", self.base_url)
    }
}

#[async_trait]
impl TurnClient for HttpTurnClient {
    async fn submit(&self, submission: TurnSubmission) -> Result<TurnReply> {
        let bytes = submission.audio.len();
        let audio = Part::bytes(submission.audio)
            .file_name("capture.wav")
            .mime_str(submission.mime)?;

        let form = Form::new()
            .part("audio_file", audio)
            .text("character_id", submission.persona_id)
            .text("is_unhinged", submission.mode.as_flag());

        let mut request = self
            .client
            .post(self.turn_url())
            .header(USER_ID_HEADER, &self.user_id)
            .timeout(self.timeout)
            .multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        tracing::debug!(bytes, url = %self.turn_url(), "submitting turn");

        let response = request.send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_send_error(e))?;

        parse_reply(status, &body)
    }
}

impl HttpTurnClient {
    fn map_send_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::NetworkTimeout(self.timeout)
        } else {
            Error::Http(err)
        }
    }
}

/// Interpret an endpoint response
fn parse_reply(status: StatusCode, body: &str) -> Result<TurnReply> {
    if status == StatusCode::ACCEPTED {
        let duplicate: DuplicateResponse = serde_json::from_str(body)?;
        return Ok(TurnReply::Duplicate(duplicate.message));
    }

    if status.is_success() {
        let response: TurnResponse = serde_json::from_str(body)?;
        return Ok(TurnReply::Completed(Box::new(response)));
    }

    let message = serde_json::from_str::<ErrorResponse>(body)
        .map_or_else(|_| body.trim().to_string(), |e| e.error.message);

    Err(match status {
        StatusCode::UNAUTHORIZED => Error::Unauthorized,
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::UNPROCESSABLE_ENTITY => Error::EmptyTranscript,
        _ => Error::Server {
            status: status.as_u16(),
            message,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_success() {
        let body = r#"{
            "status": "success",
            "user_text": "hello",
            "ai_text": "hi!",
            "audio_data": "AQID",
            "has_audio": true,
            "conversation_id": "c1",
            "user_message_id": "m1",
            "ai_message_id": "m2"
        }"#;

        let TurnReply::Completed(response) = parse_reply(StatusCode::OK, body).unwrap() else {
            panic!("expected completed turn");
        };
        assert_eq!(response.ai_text, "hi!");
        assert_eq!(response.audio_bytes(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_parse_duplicate() {
        let body = r#"{"status":"duplicate_detected","message":"already processing"}"#;
        let reply = parse_reply(StatusCode::ACCEPTED, body).unwrap();
        assert!(matches!(reply, TurnReply::Duplicate(m) if m == "already processing"));
    }

    #[test]
    fn test_parse_errors() {
        let body = r#"{"status":"error","error":{"code":"empty_transcript","message":"Sorry"}}"#;
        assert!(matches!(
            parse_reply(StatusCode::UNPROCESSABLE_ENTITY, body),
            Err(Error::EmptyTranscript)
        ));

        let body = r#"{"status":"error","error":{"code":"internal_error","message":"failed to process turn"}}"#;
        let err = parse_reply(StatusCode::INTERNAL_SERVER_ERROR, body).unwrap_err();
        assert!(
            matches!(err, Error::Server { status: 500, ref message } if message == "failed to process turn")
        );
        assert!(!err.is_retryable());

        assert!(matches!(
            parse_reply(StatusCode::BAD_GATEWAY, "upstream down"),
            Err(Error::Server { status: 502, .. })
        ));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = HttpTurnClient::new("http://localhost:18790/", "u1", Duration::from_secs(30));
        assert_eq!(client.turn_url(), "http://localhost:18790/api/voice/turn");
    }
}
