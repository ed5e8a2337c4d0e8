//! Text-to-speech (TTS) processing

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::config::{ApiKeys, TtsBackend, VoiceConfig, copy_key, provider_client};
use crate::{Error, Result};

/// Turns reply text into audio
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text` with the given voice identifier
    ///
    /// Returns audio bytes (MP3 format)
    ///
    /// # Errors
    ///
    /// Returns error if synthesis fails
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>>;
}

/// Synthesizes speech from text over HTTP
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: SecretString,
    speed: f32,
    model: String,
    provider: TtsBackend,
}

impl TextToSpeech {
    /// Create a new TTS instance using `OpenAI`
    #[must_use]
    pub fn new_openai(api_key: SecretString, model: String, speed: f32, timeout: Duration) -> Self {
        Self {
            client: provider_client(timeout),
            api_key,
            speed,
            model,
            provider: TtsBackend::OpenAI,
        }
    }

    /// Create a new TTS instance using ElevenLabs
    #[must_use]
    pub fn new_elevenlabs(api_key: SecretString, model: String, timeout: Duration) -> Self {
        Self {
            client: provider_client(timeout),
            api_key,
            // ElevenLabs doesn't use speed in the same way
            speed: 1.0,
            model,
            provider: TtsBackend::ElevenLabs,
        }
    }

    /// Create the configured backend
    ///
    /// # Errors
    ///
    /// Returns error if the selected provider's API key is missing
    pub fn from_config(voice: &VoiceConfig, keys: &ApiKeys, timeout: Duration) -> Result<Self> {
        match voice.tts_backend {
            TtsBackend::OpenAI => {
                let key = copy_key(keys.openai.as_ref())
                    .ok_or_else(|| Error::Config("OpenAI API key required for TTS".to_string()))?;
                Ok(Self::new_openai(
                    key,
                    voice.tts_model.clone(),
                    voice.tts_speed,
                    timeout,
                ))
            }
            TtsBackend::ElevenLabs => {
                let key = copy_key(keys.elevenlabs.as_ref()).ok_or_else(|| {
                    Error::Config("ElevenLabs API key required for TTS".to_string())
                })?;
                Ok(Self::new_elevenlabs(key, voice.tts_model.clone(), timeout))
            }
        }
    }

    /// Synthesize using OpenAI TTS
    async fn synthesize_openai(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice,
            speed: self.speed,
        };

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }

    /// Synthesize using ElevenLabs TTS
    async fn synthesize_elevenlabs(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!("https://api.elevenlabs.io/v1/text-to-speech/{voice}");

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl Synthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<u8>> {
        if text.trim().is_empty() {
            return Err(Error::Tts("nothing to synthesize".to_string()));
        }

        let audio = match self.provider {
            TtsBackend::OpenAI => self.synthesize_openai(text, voice).await?,
            TtsBackend::ElevenLabs => self.synthesize_elevenlabs(text, voice).await?,
        };

        if audio.is_empty() {
            return Err(Error::Tts("provider returned no audio".to_string()));
        }

        tracing::debug!(voice, bytes = audio.len(), "synthesis complete");
        Ok(audio)
    }
}
