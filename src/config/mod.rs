//! Configuration management for persona calls
//!
//! Every value resolves as env > TOML file > default.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use self::file::ConfigFile;

/// Persona call configuration
#[derive(Debug)]
pub struct Config {
    /// HTTP API server configuration
    pub server: ServerConfig,

    /// Voice configuration
    pub voice: VoiceConfig,

    /// Reply generation configuration
    pub llm: LlmConfig,

    /// API keys
    pub api_keys: ApiKeys,

    /// Dedup windows, debounce and hardware timeouts
    pub timing: TimingConfig,

    /// Call client configuration
    pub client: ClientConfig,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Bearer token for the turn endpoint (from `PERSONA_CALL_API_KEY` env)
    pub api_key: Option<String>,

    /// Requests per minute before answering 429; `None` disables limiting
    pub rate_limit_per_minute: Option<u32>,

    /// `SQLite` database file
    pub database_path: PathBuf,

    /// Directory holding `<persona>.json` files
    pub personas_dir: Option<PathBuf>,
}

/// Transcription provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttBackend {
    Whisper,
    Deepgram,
}

impl SttBackend {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Whisper => "whisper",
            Self::Deepgram => "deepgram",
        }
    }
}

/// Synthesis provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsBackend {
    OpenAI,
    ElevenLabs,
}

impl TtsBackend {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::ElevenLabs => "elevenlabs",
        }
    }
}

/// Voice processing configuration
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// STT provider
    pub stt_backend: SttBackend,

    /// STT model (e.g. "whisper-1", "nova-2")
    pub stt_model: String,

    /// Language hint (ISO 639-1)
    pub language: String,

    /// TTS provider
    pub tts_backend: TtsBackend,

    /// TTS model (e.g. "tts-1", "eleven_monolingual_v1")
    pub tts_model: String,

    /// TTS voice used when the persona doesn't name one
    pub tts_voice: String,

    /// TTS speed multiplier (0.25 to 4.0)
    pub tts_speed: f32,
}

/// Reply generation configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible API base URL
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// Max tokens per reply
    pub max_tokens: u32,

    /// Temperature for the standard persona mode
    pub temperature: f32,

    /// Temperature for the heightened persona mode
    pub heightened_temperature: f32,

    /// Trailing turns included as history
    pub history_turns: usize,
}

/// API keys for external services
#[derive(Debug, Default)]
pub struct ApiKeys {
    /// `OpenAI` API key (Whisper, TTS and chat completions)
    pub openai: Option<SecretString>,

    /// `Deepgram` API key (optional STT)
    pub deepgram: Option<SecretString>,

    /// `ElevenLabs` API key (optional TTS)
    pub elevenlabs: Option<SecretString>,
}

/// Tunable timing constants for the turn pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    /// Client-side window during which an identical capture is ignored
    pub client_dedup_window: Duration,

    /// Server-side window during which an identical submission is rejected
    pub server_dedup_window: Duration,

    /// How often the server ledger evicts expired entries
    pub ledger_sweep_interval: Duration,

    /// Second stop/interrupt within this span is ignored
    pub stop_debounce: Duration,

    /// Delay before auto-listen re-opens the microphone after playback
    pub auto_listen_grace: Duration,

    /// Interval at which the input device flushes audio chunks
    pub chunk_interval: Duration,

    /// How long to wait for the device's stop acknowledgement
    pub stop_ack_timeout: Duration,

    /// Turn submission timeout
    pub request_timeout: Duration,

    /// Longest recording before it is stopped automatically
    pub max_recording: Duration,

    /// Limit on each transcription, generation and synthesis request
    pub provider_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            client_dedup_window: Duration::from_secs(3),
            server_dedup_window: Duration::from_secs(3),
            ledger_sweep_interval: Duration::from_secs(10),
            stop_debounce: Duration::from_secs(1),
            auto_listen_grace: Duration::from_secs(1),
            chunk_interval: Duration::from_millis(100),
            stop_ack_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            max_recording: Duration::from_secs(60),
            provider_timeout: Duration::from_secs(20),
        }
    }
}

/// Call client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the turn server
    pub server_url: String,

    /// Re-open the microphone after each reply while a call is active
    pub auto_listen: bool,

    /// User identity sent in `x-user-id`
    pub user_id: String,
}

impl Config {
    /// Load configuration from the environment and the standard config file
    #[must_use]
    pub fn load() -> Self {
        let fc = file::load_config_file();
        Self::resolve(fc, &|key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an env lookup
    ///
    /// Split out from [`Config::load`] so layering can be exercised without
    /// touching the process environment.
    #[must_use]
    pub fn resolve(fc: ConfigFile, env: &dyn Fn(&str) -> Option<String>) -> Self {
        let env_parse_u64 = |key: &str| env(key).and_then(|s| s.parse::<u64>().ok());

        // Server (env > toml > default)
        let server = ServerConfig {
            port: env("PERSONA_CALL_PORT")
                .or_else(|| env("PORT"))
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(18790),
            api_key: env("PERSONA_CALL_API_KEY").or(fc.server.api_key),
            rate_limit_per_minute: env("PERSONA_CALL_RATE_LIMIT")
                .and_then(|s| s.parse().ok())
                .or(fc.server.rate_limit_per_minute),
            database_path: env("PERSONA_CALL_DB")
                .or(fc.server.database_path)
                .map_or_else(default_database_path, PathBuf::from),
            personas_dir: env("PERSONA_CALL_PERSONAS_DIR")
                .or(fc.server.personas_dir)
                .map(PathBuf::from),
        };

        // Voice (env > toml > default)
        let stt_backend = match env("PERSONA_CALL_STT_PROVIDER")
            .or(fc.voice.stt_provider)
            .as_deref()
        {
            Some("deepgram") => SttBackend::Deepgram,
            _ => SttBackend::Whisper,
        };
        let tts_backend = match env("PERSONA_CALL_TTS_PROVIDER")
            .or(fc.voice.tts_provider)
            .as_deref()
        {
            Some("elevenlabs") => TtsBackend::ElevenLabs,
            _ => TtsBackend::OpenAI,
        };
        let voice = VoiceConfig {
            stt_backend,
            stt_model: env("PERSONA_CALL_STT_MODEL")
                .or(fc.voice.stt_model)
                .unwrap_or_else(|| match stt_backend {
                    SttBackend::Whisper => "whisper-1".to_string(),
                    SttBackend::Deepgram => "nova-2".to_string(),
                }),
            language: env("PERSONA_CALL_LANGUAGE")
                .or(fc.voice.language)
                .unwrap_or_else(|| "en".to_string()),
            tts_backend,
            tts_model: env("PERSONA_CALL_TTS_MODEL")
                .or(fc.voice.tts_model)
                .unwrap_or_else(|| match tts_backend {
                    TtsBackend::OpenAI => "tts-1".to_string(),
                    TtsBackend::ElevenLabs => "eleven_monolingual_v1".to_string(),
                }),
            tts_voice: fc.voice.tts_voice.unwrap_or_else(|| "alloy".to_string()),
            tts_speed: fc.voice.tts_speed.unwrap_or(1.0).clamp(0.25, 4.0),
        };

        // Generation (env > toml > default)
        let llm = LlmConfig {
            base_url: env("PERSONA_CALL_LLM_BASE_URL")
                .or(fc.llm.base_url)
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: env("PERSONA_CALL_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            max_tokens: fc.llm.max_tokens.unwrap_or(150),
            temperature: fc.llm.temperature.unwrap_or(0.8),
            heightened_temperature: fc.llm.heightened_temperature.unwrap_or(0.95),
            history_turns: fc.llm.history_turns.unwrap_or(5),
        };

        // API keys (env > toml > None)
        let api_keys = ApiKeys {
            openai: env("OPENAI_API_KEY")
                .or(fc.api_keys.openai)
                .map(SecretString::from),
            deepgram: env("DEEPGRAM_API_KEY")
                .or(fc.api_keys.deepgram)
                .map(SecretString::from),
            elevenlabs: env("ELEVENLABS_API_KEY")
                .or(fc.api_keys.elevenlabs)
                .map(SecretString::from),
        };

        // Timing (env > toml > default)
        let defaults = TimingConfig::default();
        let ms = |env_key: &str, file_value: Option<u64>, default: Duration| {
            env_parse_u64(env_key)
                .or(file_value)
                .map_or(default, Duration::from_millis)
        };
        let t = &fc.timing;
        let timing = TimingConfig {
            client_dedup_window: ms(
                "PERSONA_CALL_CLIENT_DEDUP_MS",
                t.client_dedup_window_ms,
                defaults.client_dedup_window,
            ),
            server_dedup_window: ms(
                "PERSONA_CALL_SERVER_DEDUP_MS",
                t.server_dedup_window_ms,
                defaults.server_dedup_window,
            ),
            ledger_sweep_interval: ms(
                "PERSONA_CALL_SWEEP_MS",
                t.ledger_sweep_interval_ms,
                defaults.ledger_sweep_interval,
            ),
            stop_debounce: ms(
                "PERSONA_CALL_STOP_DEBOUNCE_MS",
                t.stop_debounce_ms,
                defaults.stop_debounce,
            ),
            auto_listen_grace: ms(
                "PERSONA_CALL_AUTO_LISTEN_GRACE_MS",
                t.auto_listen_grace_ms,
                defaults.auto_listen_grace,
            ),
            chunk_interval: ms(
                "PERSONA_CALL_CHUNK_MS",
                t.chunk_interval_ms,
                defaults.chunk_interval,
            ),
            stop_ack_timeout: ms(
                "PERSONA_CALL_STOP_ACK_MS",
                t.stop_ack_timeout_ms,
                defaults.stop_ack_timeout,
            ),
            request_timeout: ms(
                "PERSONA_CALL_REQUEST_TIMEOUT_MS",
                t.request_timeout_ms,
                defaults.request_timeout,
            ),
            max_recording: ms(
                "PERSONA_CALL_MAX_RECORDING_MS",
                t.max_recording_ms,
                defaults.max_recording,
            ),
            provider_timeout: ms(
                "PERSONA_CALL_PROVIDER_TIMEOUT_MS",
                t.provider_timeout_ms,
                defaults.provider_timeout,
            ),
        };

        // Client (env > toml > default)
        let client = ClientConfig {
            server_url: env("PERSONA_CALL_SERVER_URL")
                .or(fc.client.server_url)
                .unwrap_or_else(|| format!("http://localhost:{}", server.port)),
            auto_listen: env("PERSONA_CALL_AUTO_LISTEN")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .or(fc.client.auto_listen)
                .unwrap_or(true),
            user_id: env("PERSONA_CALL_USER")
                .or(fc.client.user_id)
                .unwrap_or_else(|| "local".to_string()),
        };

        Self {
            server,
            voice,
            llm,
            api_keys,
            timing,
            client,
        }
    }
}

/// Copy a configured key for a provider client
pub(crate) fn copy_key(key: Option<&SecretString>) -> Option<SecretString> {
    key.map(|k| SecretString::from(k.expose_secret().to_owned()))
}

/// HTTP client for an external provider with a per-request limit
pub(crate) fn provider_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to build provider client, using defaults");
            reqwest::Client::new()
        })
}

/// Default database location: `~/.local/share/persona-call/persona-call.db`
fn default_database_path() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("persona-call.db"),
        |d| d.data_dir().join("persona-call").join("persona-call.db"),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::resolve(ConfigFile::default(), &env_from(&[]));

        assert_eq!(config.server.port, 18790);
        assert!(config.server.api_key.is_none());
        assert_eq!(config.voice.stt_backend, SttBackend::Whisper);
        assert_eq!(config.voice.stt_model, "whisper-1");
        assert_eq!(config.llm.history_turns, 5);
        assert_eq!(config.timing, TimingConfig::default());
        assert_eq!(config.timing.stop_debounce, Duration::from_secs(1));
        assert_eq!(config.timing.provider_timeout, Duration::from_secs(20));
        assert!(config.client.auto_listen);
        assert_eq!(config.client.server_url, "http://localhost:18790");
    }

    #[test]
    fn test_env_overrides_file() {
        let fc: ConfigFile = toml::from_str(
            r#"
            [server]
            port = 9000

            [timing]
            server_dedup_window_ms = 5000
            stop_debounce_ms = 250
            provider_timeout_ms = 8000
            "#,
        )
        .unwrap();

        let config = Config::resolve(
            fc,
            &env_from(&[
                ("PERSONA_CALL_PORT", "9100"),
                ("PERSONA_CALL_STOP_DEBOUNCE_MS", "750"),
                ("OPENAI_API_KEY", "sk-test"),
            ]),
        );

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.timing.server_dedup_window, Duration::from_secs(5));
        assert_eq!(config.timing.stop_debounce, Duration::from_millis(750));
        assert_eq!(config.timing.provider_timeout, Duration::from_secs(8));
        assert_eq!(
            config.api_keys.openai.as_ref().map(|k| k.expose_secret().to_string()),
            Some("sk-test".to_string())
        );
    }

    #[test]
    fn test_provider_selection_changes_model_defaults() {
        let config = Config::resolve(
            ConfigFile::default(),
            &env_from(&[
                ("PERSONA_CALL_STT_PROVIDER", "deepgram"),
                ("PERSONA_CALL_TTS_PROVIDER", "elevenlabs"),
            ]),
        );

        assert_eq!(config.voice.stt_backend, SttBackend::Deepgram);
        assert_eq!(config.voice.stt_model, "nova-2");
        assert_eq!(config.voice.tts_backend, TtsBackend::ElevenLabs);
        assert_eq!(config.voice.tts_model, "eleven_monolingual_v1");
    }

    #[test]
    fn test_auto_listen_env_parsing() {
        let config = Config::resolve(
            ConfigFile::default(),
            &env_from(&[("PERSONA_CALL_AUTO_LISTEN", "false")]),
        );
        assert!(!config.client.auto_listen);
    }
}
