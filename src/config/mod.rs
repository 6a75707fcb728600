//! Configuration management for Haven
//!
//! Values resolve as env > TOML file > built-in default.

pub mod file;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::store::PlanTier;
use crate::voice::llm::DEFAULT_INSTRUCTIONS;
use crate::voice::silence::DEFAULT_SILENCE_THRESHOLD;
use crate::voice::stt::{DEFAULT_PHRASE_BOOST, DEFAULT_PHRASE_HINTS};
use crate::{Error, Result};

/// Greeting spoken at session start
pub const DEFAULT_GREETING: &str = "Hello! I'm your AI therapist. How can I help you today?";

/// Haven configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to data directory (database)
    pub data_dir: PathBuf,

    /// Turn-taking timing
    pub turn: TurnConfig,

    /// Speech recognition
    pub stt: SttConfig,

    /// Reply generation
    pub llm: LlmConfig,

    /// Speech synthesis
    pub tts: TtsConfig,

    /// Plan seeded into subscription limits
    pub plan: PlanTier,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Capture thresholds, restart delays and greeting
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Energy sampling interval
    pub silence_interval: Duration,
    /// RMS level below which a sample is quiet
    pub silence_threshold: f32,
    /// Quiet samples tolerated before the utterance ends
    pub silence_ticks: u32,
    /// Hard cap on one utterance
    pub max_recording: Duration,
    /// Recordings at or below this size are discarded
    pub min_recording_bytes: usize,
    /// Resume delay after an empty recording
    pub empty_recording_delay: Duration,
    /// Resume delay after an empty transcript
    pub empty_transcript_delay: Duration,
    /// Resume delay after a transcription timeout or service error
    pub error_retry_delay: Duration,
    /// Resume delay after service audio ends
    pub post_speech_delay: Duration,
    /// Resume delay after on-device or text-only replies
    pub local_speech_delay: Duration,
    /// Prior turns forwarded to generation
    pub history_window: usize,
    /// Spoken at session start
    pub greeting: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            silence_interval: Duration::from_millis(80),
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            silence_ticks: 7,
            max_recording: Duration::from_secs(7),
            min_recording_bytes: 2000,
            empty_recording_delay: Duration::from_millis(200),
            empty_transcript_delay: Duration::from_millis(300),
            error_retry_delay: Duration::from_millis(1000),
            post_speech_delay: Duration::from_millis(800),
            local_speech_delay: Duration::from_millis(500),
            history_window: 6,
            greeting: DEFAULT_GREETING.to_string(),
        }
    }
}

impl TurnConfig {
    fn restart_delays(&self) -> [Duration; 5] {
        [
            self.empty_recording_delay,
            self.empty_transcript_delay,
            self.error_retry_delay,
            self.post_speech_delay,
            self.local_speech_delay,
        ]
    }
}

/// Speech recognition provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SttProvider {
    /// Google Cloud Speech-to-Text
    #[default]
    Google,
    /// `OpenAI` Whisper
    Whisper,
}

impl FromStr for SttProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "whisper" | "openai" => Ok(Self::Whisper),
            other => Err(Error::Config(format!("unknown STT provider: {other}"))),
        }
    }
}

/// Speech synthesis provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    /// Google Cloud Text-to-Speech
    #[default]
    Google,
    /// `OpenAI` speech
    #[serde(rename = "openai")]
    OpenAi,
}

impl FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "openai" => Ok(Self::OpenAi),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Speech recognition configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub provider: SttProvider,
    /// Locale hint
    pub language: String,
    /// Model override; provider default when unset
    pub model: Option<String>,
    pub timeout: Duration,
    pub phrase_hints: Vec<String>,
    pub phrase_boost: f32,
}

/// Reply generation configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub model: String,
    pub timeout: Duration,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Hidden instructions wrapped around user messages
    pub system_instructions: Option<String>,
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub provider: TtsProvider,
    /// Voice override; provider default when unset
    pub voice: Option<String>,
    pub language: String,
    pub speaking_rate: f32,
    pub pitch: f32,
    pub timeout: Duration,
    /// Fall back to on-device speech
    pub local_voice: bool,
}

/// API keys for external services
#[derive(Clone, Default)]
pub struct ApiKeys {
    /// Google Cloud key (speech recognition and synthesis)
    pub google_cloud: Option<String>,

    /// Google AI Studio key (Gemini)
    pub google_ai_studio: Option<String>,

    /// `OpenAI` key (Whisper and TTS)
    pub openai: Option<String>,
}

impl fmt::Debug for ApiKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeys")
            .field("google_cloud", &self.google_cloud.as_ref().map(|_| "<redacted>"))
            .field("google_ai_studio", &self.google_ai_studio.as_ref().map(|_| "<redacted>"))
            .field("openai", &self.openai.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Config {
    /// Load configuration from the environment and config file
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load() -> Result<Self> {
        let config = Self::resolve(file::load_config_file(), |key| std::env::var(key).ok());
        config.validate()?;

        // Ensure data dir exists
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }

    /// Merge a config file and an environment lookup over defaults
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn resolve(fc: file::HavenConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let ms = |value: Option<u64>, default: Duration| value.map_or(default, Duration::from_millis);

        // Load API keys (env > toml > None)
        let api_keys = ApiKeys {
            google_cloud: env("GOOGLE_CLOUD_API_KEY").or(fc.api_keys.google_cloud),
            google_ai_studio: env("GOOGLE_AI_STUDIO_API_KEY").or(fc.api_keys.google_ai_studio),
            openai: env("OPENAI_API_KEY").or(fc.api_keys.openai),
        };

        let defaults = TurnConfig::default();
        let t = fc.turn;
        let turn = TurnConfig {
            silence_interval: ms(t.silence_interval_ms, defaults.silence_interval),
            silence_threshold: t.silence_threshold.unwrap_or(defaults.silence_threshold),
            silence_ticks: t.silence_ticks.unwrap_or(defaults.silence_ticks),
            max_recording: ms(t.max_recording_ms, defaults.max_recording),
            min_recording_bytes: t.min_recording_bytes.unwrap_or(defaults.min_recording_bytes),
            empty_recording_delay: ms(t.empty_recording_delay_ms, defaults.empty_recording_delay),
            empty_transcript_delay: ms(t.empty_transcript_delay_ms, defaults.empty_transcript_delay),
            error_retry_delay: ms(t.error_retry_delay_ms, defaults.error_retry_delay),
            post_speech_delay: ms(t.post_speech_delay_ms, defaults.post_speech_delay),
            local_speech_delay: ms(t.local_speech_delay_ms, defaults.local_speech_delay),
            history_window: t.history_window.unwrap_or(defaults.history_window),
            greeting: t.greeting.unwrap_or(defaults.greeting),
        };

        // STT (env > toml > default)
        let stt = SttConfig {
            provider: parse_env(&env, "HAVEN_STT_PROVIDER")
                .or(fc.stt.provider)
                .unwrap_or_default(),
            language: env("HAVEN_LANGUAGE")
                .or(fc.stt.language)
                .unwrap_or_else(|| "en-US".to_string()),
            model: env("HAVEN_STT_MODEL").or(fc.stt.model),
            timeout: ms(fc.stt.timeout_ms, Duration::from_secs(7)),
            phrase_hints: fc.stt.phrase_hints.unwrap_or_else(|| {
                DEFAULT_PHRASE_HINTS.iter().map(ToString::to_string).collect()
            }),
            phrase_boost: fc.stt.phrase_boost.unwrap_or(DEFAULT_PHRASE_BOOST),
        };

        // LLM (env > toml > default)
        let llm = LlmConfig {
            model: env("HAVEN_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| "gemini-2.0-flash".to_string()),
            timeout: ms(fc.llm.timeout_ms, Duration::from_secs(8)),
            temperature: fc.llm.temperature.unwrap_or(0.7),
            max_output_tokens: fc.llm.max_output_tokens.unwrap_or(150),
            system_instructions: match fc.llm.system_instructions {
                Some(text) if text.trim().is_empty() => None,
                Some(text) => Some(text),
                None => Some(DEFAULT_INSTRUCTIONS.to_string()),
            },
        };

        // TTS (env > toml > default)
        let tts = TtsConfig {
            provider: parse_env(&env, "HAVEN_TTS_PROVIDER")
                .or(fc.tts.provider)
                .unwrap_or_default(),
            voice: env("HAVEN_TTS_VOICE").or(fc.tts.voice),
            language: fc.tts.language.unwrap_or_else(|| stt.language.clone()),
            speaking_rate: fc.tts.speaking_rate.unwrap_or(1.0),
            pitch: fc.tts.pitch.unwrap_or(0.0),
            timeout: ms(fc.tts.timeout_ms, Duration::from_secs(5)),
            local_voice: fc.tts.local_voice.unwrap_or(true),
        };

        let plan = parse_env(&env, "HAVEN_PLAN")
            .or(fc.plan.tier)
            .unwrap_or_default();

        // Determine data directory (~/.local/share/haven on Linux)
        let data_dir = env("HAVEN_DATA_DIR")
            .or(fc.data_dir)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                directories::BaseDirs::new()
                    .map_or_else(|| PathBuf::from("."), |d| d.data_dir().join("haven"))
            });

        Self {
            data_dir,
            turn,
            stt,
            llm,
            tts,
            plan,
            api_keys,
        }
    }

    /// Path of the `SQLite` database
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("haven.db")
    }

    /// Check thresholds and timing relationships
    ///
    /// # Errors
    ///
    /// Returns error if a value is zero or the timing constraints the
    /// controller relies on do not hold
    pub fn validate(&self) -> Result<()> {
        let turn = &self.turn;

        let nonzero = [
            ("turn.silence_interval_ms", turn.silence_interval),
            ("turn.max_recording_ms", turn.max_recording),
            ("stt.timeout_ms", self.stt.timeout),
            ("llm.timeout_ms", self.llm.timeout),
            ("tts.timeout_ms", self.tts.timeout),
        ];
        for (name, value) in nonzero {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }

        if turn.silence_threshold <= 0.0 {
            return Err(Error::Config("turn.silence_threshold must be positive".to_string()));
        }
        if turn.silence_ticks == 0 {
            return Err(Error::Config("turn.silence_ticks must be greater than zero".to_string()));
        }
        if turn.history_window == 0 {
            return Err(Error::Config("turn.history_window must be greater than zero".to_string()));
        }

        let longest_delay = turn.restart_delays().into_iter().max().unwrap_or_default();
        let bounded = [
            ("turn.max_recording_ms", turn.max_recording),
            ("stt.timeout_ms", self.stt.timeout),
            ("llm.timeout_ms", self.llm.timeout),
            ("tts.timeout_ms", self.tts.timeout),
        ];
        for (name, value) in bounded {
            if value <= longest_delay {
                return Err(Error::Config(format!(
                    "{name} ({}ms) must exceed the longest restart delay ({}ms)",
                    value.as_millis(),
                    longest_delay.as_millis()
                )));
            }
        }

        if self.llm.timeout <= self.tts.timeout {
            return Err(Error::Config(format!(
                "llm.timeout_ms ({}ms) must exceed tts.timeout_ms ({}ms)",
                self.llm.timeout.as_millis(),
                self.tts.timeout.as_millis()
            )));
        }

        let ordered = turn.max_recording > self.llm.timeout
            && self.llm.timeout > self.tts.timeout
            && self.tts.timeout > self.stt.timeout;
        if !ordered {
            tracing::warn!(
                max_recording_ms = turn.max_recording.as_millis(),
                llm_timeout_ms = self.llm.timeout.as_millis(),
                tts_timeout_ms = self.tts.timeout.as_millis(),
                stt_timeout_ms = self.stt.timeout.as_millis(),
                "timing does not follow capture cap > generation > synthesis > transcription"
            );
        }

        Ok(())
    }
}

/// Parse an environment value; invalid values are logged and ignored
fn parse_env<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let value = env(key)?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!(key, value = %value, error = %e, "ignoring invalid environment value");
            None
        }
    }
}
