//! TOML configuration file loading
//!
//! Supports `~/.config/persona-call/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Voice/audio configuration
    #[serde(default)]
    pub voice: VoiceFileConfig,

    /// Reply generation configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Dedup windows, debounce and hardware timeouts
    #[serde(default)]
    pub timing: TimingFileConfig,

    /// Call client configuration
    #[serde(default)]
    pub client: ClientFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// API server port
    pub port: Option<u16>,

    /// Bearer token required on the turn endpoint
    pub api_key: Option<String>,

    /// Requests per minute before the server answers 429
    pub rate_limit_per_minute: Option<u32>,

    /// `SQLite` database file
    pub database_path: Option<String>,

    /// Directory holding `<persona>.json` files
    pub personas_dir: Option<String>,
}

/// Voice processing configuration
#[derive(Debug, Default, Deserialize)]
pub struct VoiceFileConfig {
    /// STT provider ("whisper" or "deepgram")
    pub stt_provider: Option<String>,

    /// STT model (e.g. "whisper-1")
    pub stt_model: Option<String>,

    /// Language hint passed to transcription
    pub language: Option<String>,

    /// TTS provider ("openai" or "elevenlabs")
    pub tts_provider: Option<String>,

    /// TTS model (e.g. "tts-1")
    pub tts_model: Option<String>,

    /// Fallback TTS voice identifier (e.g. "alloy")
    pub tts_voice: Option<String>,

    /// TTS speed multiplier
    pub tts_speed: Option<f32>,
}

/// Reply generation configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// OpenAI-compatible API base URL
    pub base_url: Option<String>,

    /// Model identifier
    pub model: Option<String>,

    /// Max tokens per reply
    pub max_tokens: Option<u32>,

    /// Sampling temperature for the standard persona mode
    pub temperature: Option<f32>,

    /// Sampling temperature for the heightened persona mode
    pub heightened_temperature: Option<f32>,

    /// Number of trailing turns sent as history
    pub history_turns: Option<usize>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Timing configuration, all values in milliseconds
#[derive(Debug, Default, Deserialize)]
pub struct TimingFileConfig {
    pub client_dedup_window_ms: Option<u64>,
    pub server_dedup_window_ms: Option<u64>,
    pub ledger_sweep_interval_ms: Option<u64>,
    pub stop_debounce_ms: Option<u64>,
    pub auto_listen_grace_ms: Option<u64>,
    pub chunk_interval_ms: Option<u64>,
    pub stop_ack_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub max_recording_ms: Option<u64>,
    pub provider_timeout_ms: Option<u64>,
}

/// Call client configuration
#[derive(Debug, Default, Deserialize)]
pub struct ClientFileConfig {
    /// Base URL of the turn server
    pub server_url: Option<String>,

    /// Re-open the microphone after each reply
    pub auto_listen: Option<bool>,

    /// User identity sent with each turn
    pub user_id: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ConfigFile {
    let Some(path) = config_file_path() else {
        return ConfigFile::default();
    };

    load_config_file_from(&path)
}

/// Load a TOML config file from an explicit path
///
/// Returns `ConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file_from(path: &Path) -> ConfigFile {
    if !path.exists() {
        return ConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ConfigFile::default()
        }
    }
}

/// Return the config file path
///
/// `PERSONA_CALL_CONFIG` wins; otherwise `~/.config/persona-call/config.toml`.
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("PERSONA_CALL_CONFIG") {
        return Some(PathBuf::from(path));
    }

    directories::BaseDirs::new().map(|d| d.config_dir().join("persona-call").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_file() {
        let toml = r#"
            [server]
            port = 9000

            [timing]
            stop_debounce_ms = 500

            [client]
            auto_listen = false
        "#;

        let fc: ConfigFile = toml::from_str(toml).unwrap();
        assert_eq!(fc.server.port, Some(9000));
        assert_eq!(fc.timing.stop_debounce_ms, Some(500));
        assert_eq!(fc.client.auto_listen, Some(false));
        assert!(fc.llm.model.is_none());
    }

    #[test]
    fn test_missing_file_is_default() {
        let fc = load_config_file_from(Path::new("/nonexistent/persona-call.toml"));
        assert!(fc.server.port.is_none());
    }

    #[test]
    fn test_unparsable_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();

        let fc = load_config_file_from(&path);
        assert!(fc.server.port.is_none());
    }
}
