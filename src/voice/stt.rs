//! Speech-to-text (STT) processing

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::{SttBackend, VoiceConfig, copy_key, provider_client};
use crate::{Error, Result};

/// Turns recorded audio into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe `audio` (WAV bytes) with a language hint
    ///
    /// # Errors
    ///
    /// Returns `EmptyTranscript` when no speech was recognised, or the
    /// provider's error
    async fn transcribe(&self, audio: &[u8], language: &str) -> Result<String>;
}

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Transcribes speech to text over HTTP
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    provider: SttBackend,
}

impl SpeechToText {
    /// Create a new STT instance using `OpenAI` Whisper
    #[must_use]
    pub fn new_whisper(api_key: SecretString, model: String, timeout: Duration) -> Self {
        Self {
            client: provider_client(timeout),
            api_key,
            model,
            provider: SttBackend::Whisper,
        }
    }

    /// Create a new STT instance using Deepgram
    #[must_use]
    pub fn new_deepgram(api_key: SecretString, model: String, timeout: Duration) -> Self {
        Self {
            client: provider_client(timeout),
            api_key,
            model,
            provider: SttBackend::Deepgram,
        }
    }

    /// Create the configured backend
    ///
    /// # Errors
    ///
    /// Returns error if the selected provider's API key is missing
    pub fn from_config(
        voice: &VoiceConfig,
        keys: &crate::config::ApiKeys,
        timeout: Duration,
    ) -> Result<Self> {
        match voice.stt_backend {
            SttBackend::Whisper => {
                let key = copy_key(keys.openai.as_ref()).ok_or_else(|| {
                    Error::Config("OpenAI API key required for Whisper".to_string())
                })?;
                Ok(Self::new_whisper(key, voice.stt_model.clone(), timeout))
            }
            SttBackend::Deepgram => {
                let key = copy_key(keys.deepgram.as_ref())
                    .ok_or_else(|| Error::Config("Deepgram API key required".to_string()))?;
                Ok(Self::new_deepgram(key, voice.stt_model.clone(), timeout))
            }
        }
    }

    /// Transcribe using OpenAI Whisper
    async fn transcribe_whisper(&self, audio: &[u8], language: &str) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("language", language.to_string());

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Whisper request failed");
                e
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse response");
            e
        })?;

        Ok(result.text)
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, audio: &[u8], language: &str) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), "starting Deepgram transcription");

        let response = self
            .client
            .post("https://api.deepgram.com/v1/listen")
            .query(&[
                ("model", self.model.as_str()),
                ("language", language),
                ("punctuate", "true"),
            ])
            .header(
                "Authorization",
                format!("Token {}", self.api_key.expose_secret()),
            )
            .header("Content-Type", "audio/wav")
            .body(audio.to_vec())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Deepgram request failed");
                e
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse Deepgram response");
            e
        })?;

        Ok(first_alternative(result))
    }
}

fn first_alternative(response: DeepgramResponse) -> String {
    response
        .results
        .channels
        .into_iter()
        .next()
        .and_then(|c| c.alternatives.into_iter().next())
        .map(|a| a.transcript)
        .unwrap_or_default()
}

/// Trim a provider transcript, rejecting blank results
///
/// # Errors
///
/// Returns `EmptyTranscript` when nothing but whitespace remains
pub fn normalize_transcript(raw: &str) -> Result<String> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(Error::EmptyTranscript);
    }
    Ok(text.to_string())
}

#[async_trait]
impl Transcriber for SpeechToText {
    async fn transcribe(&self, audio: &[u8], language: &str) -> Result<String> {
        let raw = match self.provider {
            SttBackend::Whisper => self.transcribe_whisper(audio, language).await?,
            SttBackend::Deepgram => self.transcribe_deepgram(audio, language).await?,
        };

        let transcript = normalize_transcript(&raw)?;
        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_transcript_is_empty() {
        assert!(matches!(
            normalize_transcript("  \n\t"),
            Err(Error::EmptyTranscript)
        ));
        assert_eq!(normalize_transcript(" hello ").unwrap(), "hello");
    }

    #[test]
    fn test_deepgram_response_parsing() {
        let body = r#"{"results":{"channels":[{"alternatives":[{"transcript":"hi there"}]}]}}"#;
        let parsed: DeepgramResponse = serde_json::from_str(body).unwrap();
        assert_eq!(first_alternative(parsed), "hi there");

        let empty: DeepgramResponse =
            serde_json::from_str(r#"{"results":{"channels":[]}}"#).unwrap();
        assert_eq!(first_alternative(empty), "");
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let voice = VoiceConfig {
            stt_backend: SttBackend::Deepgram,
            stt_model: "nova-2".to_string(),
            language: "en".to_string(),
            tts_backend: crate::config::TtsBackend::OpenAI,
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            tts_speed: 1.0,
        };
        let keys = crate::config::ApiKeys {
            openai: Some(SecretString::from("sk-test")),
            ..Default::default()
        };

        assert!(matches!(
            SpeechToText::from_config(&voice, &keys, Duration::from_secs(20)),
            Err(Error::Config(_))
        ));
    }
}
