//! TOML configuration file loading
//!
//! Supports `~/.config/haven/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{SttProvider, TtsProvider};
use crate::store::PlanTier;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct HavenConfigFile {
    /// Turn-taking timing
    #[serde(default)]
    pub turn: TurnFileConfig,

    /// Speech recognition
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Reply generation
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Speech synthesis
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Subscription plan
    #[serde(default)]
    pub plan: PlanFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,

    /// Data directory override
    pub data_dir: Option<String>,
}

/// Turn-taking configuration
#[derive(Debug, Default, Deserialize)]
pub struct TurnFileConfig {
    pub silence_interval_ms: Option<u64>,
    pub silence_threshold: Option<f32>,
    pub silence_ticks: Option<u32>,
    pub max_recording_ms: Option<u64>,
    pub min_recording_bytes: Option<usize>,
    pub empty_recording_delay_ms: Option<u64>,
    pub empty_transcript_delay_ms: Option<u64>,
    pub error_retry_delay_ms: Option<u64>,
    pub post_speech_delay_ms: Option<u64>,
    pub local_speech_delay_ms: Option<u64>,
    pub history_window: Option<usize>,
    pub greeting: Option<String>,
}

/// Speech recognition configuration
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// "google" or "whisper"
    pub provider: Option<SttProvider>,
    /// Locale hint (e.g. "en-US")
    pub language: Option<String>,
    /// Provider model override
    pub model: Option<String>,
    pub timeout_ms: Option<u64>,
    /// Domain phrases biased during recognition
    pub phrase_hints: Option<Vec<String>>,
    pub phrase_boost: Option<f32>,
}

/// Reply generation configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// Model identifier (e.g. "gemini-2.0-flash")
    pub model: Option<String>,
    pub timeout_ms: Option<u64>,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
    /// Hidden instructions; empty string disables them
    pub system_instructions: Option<String>,
}

/// Speech synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// "google" or "openai"
    pub provider: Option<TtsProvider>,
    /// Voice identifier
    pub voice: Option<String>,
    pub language: Option<String>,
    pub speaking_rate: Option<f32>,
    pub pitch: Option<f32>,
    pub timeout_ms: Option<u64>,
    /// Fall back to on-device speech
    pub local_voice: Option<bool>,
}

/// Plan configuration
#[derive(Debug, Default, Deserialize)]
pub struct PlanFileConfig {
    /// "free", "plus" or "pro"
    pub tier: Option<PlanTier>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub google_cloud: Option<String>,
    pub google_ai_studio: Option<String>,
    pub openai: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `HavenConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> HavenConfigFile {
    config_file_path().map_or_else(HavenConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from `path`
///
/// Returns `HavenConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_from(path: &Path) -> HavenConfigFile {
    if !path.exists() {
        return HavenConfigFile::default();
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
                HavenConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            HavenConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/haven/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("haven").join("config.toml"))
}
