//! Turn processing: transcribe, persist, generate, synthesize
//!
//! [`TurnProcessor`] is independent of HTTP so the same orchestration can be
//! driven by the API handler and by tests. Once the user message is
//! persisted, a turn always ends with an assistant message: a failed or
//! empty generation is replaced by [`APOLOGY_TEXT`], and a failed synthesis
//! degrades to a text-only outcome.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::Result;
use crate::config::{Config, LlmConfig, VoiceConfig};
use crate::db::{ConversationStore, MessageRole};
use crate::llm::{ChatMessage, GenerationRequest, ReplyGenerator};
use crate::persona::{PersonaCatalog, PersonaMode};
use crate::voice::{Synthesizer, Transcriber, normalize_transcript};

/// Assistant text persisted when generation fails or returns nothing
pub const APOLOGY_TEXT: &str =
    "I'm sorry, I'm having trouble responding right now. Could you say that again?";

/// User-facing message for an utterance that produced no transcript
pub const EMPTY_TRANSCRIPT_MESSAGE: &str = "Sorry, I couldn't understand that. Please try again.";

/// One submitted utterance
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub user_id: String,
    pub persona_id: String,
    pub mode: PersonaMode,
    pub audio: Vec<u8>,
}

/// Result of a processed turn
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub user_text: String,
    pub ai_text: String,

    /// Synthesized reply; `None` when synthesis failed
    pub audio: Option<Vec<u8>>,

    pub conversation_id: String,
    pub user_message_id: String,
    pub ai_message_id: String,

    /// The assistant text is the apology substitute
    pub generation_recovered: bool,

    /// New last-activity time, if the conversation could be touched
    pub updated_at: Option<DateTime<Utc>>,
}

impl TurnOutcome {
    #[must_use]
    pub const fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}

/// Generation and synthesis settings for turns
#[derive(Debug, Clone)]
pub struct TurnSettings {
    /// Transcription language when the persona has none
    pub language: String,

    /// Synthesis voice when the persona has none
    pub default_voice: String,

    pub max_tokens: u32,
    pub temperature: f32,
    pub heightened_temperature: f32,

    /// Trailing turns (user + assistant pairs) sent as history
    pub history_turns: usize,
}

impl TurnSettings {
    #[must_use]
    pub fn from_config(voice: &VoiceConfig, llm: &LlmConfig) -> Self {
        Self {
            language: voice.language.clone(),
            default_voice: voice.tts_voice.clone(),
            max_tokens: llm.max_tokens,
            temperature: llm.temperature,
            heightened_temperature: llm.heightened_temperature,
            history_turns: llm.history_turns,
        }
    }

    const fn temperature_for(&self, mode: PersonaMode) -> f32 {
        match mode {
            PersonaMode::Standard => self.temperature,
            PersonaMode::Heightened => self.heightened_temperature,
        }
    }
}

impl From<&Config> for TurnSettings {
    fn from(config: &Config) -> Self {
        Self::from_config(&config.voice, &config.llm)
    }
}

/// Orchestrates one voice turn against the external services and the store
pub struct TurnProcessor {
    transcriber: Arc<dyn Transcriber>,
    generator: Arc<dyn ReplyGenerator>,
    synthesizer: Arc<dyn Synthesizer>,
    store: Arc<dyn ConversationStore>,
    personas: Arc<PersonaCatalog>,
    settings: TurnSettings,
}

impl TurnProcessor {
    #[must_use]
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        generator: Arc<dyn ReplyGenerator>,
        synthesizer: Arc<dyn Synthesizer>,
        store: Arc<dyn ConversationStore>,
        personas: Arc<PersonaCatalog>,
        settings: TurnSettings,
    ) -> Self {
        Self {
            transcriber,
            generator,
            synthesizer,
            store,
            personas,
            settings,
        }
    }

    #[must_use]
    pub fn personas(&self) -> &PersonaCatalog {
        &self.personas
    }

    /// Process one turn
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown persona (nothing persisted)
    /// - `EmptyTranscript` or `Stt` when transcription fails (nothing persisted)
    /// - store errors before the user message is written
    ///
    /// Generation and synthesis failures are recovered and never returned.
    pub async fn process(&self, request: TurnRequest) -> Result<TurnOutcome> {
        let persona = self.personas.get(&request.persona_id)?;

        let raw = self
            .transcriber
            .transcribe(&request.audio, persona.language_or(&self.settings.language))
            .await?;
        let user_text = normalize_transcript(&raw)?;

        tracing::debug!(
            persona_id = %persona.id,
            chars = user_text.len(),
            "transcribed utterance"
        );

        let conversation = self
            .store
            .find_or_create_conversation(&request.user_id, &persona.id)?;
        let user_message =
            self.store
                .append_message(&conversation.id, MessageRole::User, &user_text)?;

        let messages = self.build_context(
            &request,
            persona.instructions_for(request.mode),
            &conversation.id,
            &user_message.id,
            &user_text,
        );

        let generation = GenerationRequest {
            messages,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature_for(request.mode),
        };

        let (ai_text, generation_recovered) = match self.generator.generate(&generation).await {
            Ok(text) if !text.trim().is_empty() => (text, false),
            Ok(_) => {
                tracing::warn!(conversation_id = %conversation.id, "generation returned no text");
                (APOLOGY_TEXT.to_string(), true)
            }
            Err(e) => {
                tracing::warn!(conversation_id = %conversation.id, error = %e, "generation failed");
                (APOLOGY_TEXT.to_string(), true)
            }
        };

        let ai_message =
            self.store
                .append_message(&conversation.id, MessageRole::Assistant, &ai_text)?;

        let voice = persona.voice_or(&self.settings.default_voice);
        let audio = match self.synthesizer.synthesize(&ai_text, voice).await {
            Ok(audio) => Some(audio),
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation.id,
                    voice,
                    error = %e,
                    "synthesis failed, returning text only"
                );
                None
            }
        };

        let updated_at = match self.store.touch_conversation(&conversation.id) {
            Ok(at) => Some(at),
            Err(e) => {
                tracing::warn!(conversation_id = %conversation.id, error = %e, "failed to touch conversation");
                None
            }
        };

        tracing::info!(
            conversation_id = %conversation.id,
            persona_id = %persona.id,
            mode = request.mode.as_flag(),
            has_audio = audio.is_some(),
            generation_recovered,
            "turn processed"
        );

        Ok(TurnOutcome {
            user_text,
            ai_text,
            audio,
            conversation_id: conversation.id,
            user_message_id: user_message.id,
            ai_message_id: ai_message.id,
            generation_recovered,
            updated_at,
        })
    }

    /// Instructions, memory, trailing history, then the new user text
    fn build_context(
        &self,
        request: &TurnRequest,
        instructions: String,
        conversation_id: &str,
        user_message_id: &str,
        user_text: &str,
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(instructions)];

        match self.store.load_memory(&request.user_id, &request.persona_id) {
            Ok(notes) if !notes.is_empty() => {
                let mut memory = String::from("What you remember about the user:");
                for note in &notes {
                    memory.push_str("\n- ");
                    memory.push_str(note);
                }
                messages.push(ChatMessage::system(memory));
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to load memory"),
        }

        // One extra row covers the user message appended for this turn
        let limit = self.settings.history_turns * 2 + 1;
        match self.store.load_recent_messages(conversation_id, limit) {
            Ok(history) => {
                let history: Vec<_> = history
                    .into_iter()
                    .filter(|m| m.id != user_message_id)
                    .collect();
                let skip = history.len().saturating_sub(self.settings.history_turns * 2);
                for message in history.into_iter().skip(skip) {
                    messages.push(match message.role {
                        MessageRole::User => ChatMessage::user(message.content),
                        MessageRole::Assistant => ChatMessage::assistant(message.content),
                    });
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to load history"),
        }

        messages.push(ChatMessage::user(user_text));
        messages
    }
}
