//! Response generation
//!
//! [`ResponseGenerator`] never fails outward: timeouts and service errors are
//! absorbed by a deterministic fallback table keyed on the user's text.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::Config;
use crate::conversation::{Role, Turn};
use crate::{Error, Result};

const GEMINI_URL_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Hidden guidance prepended to every user message
pub const DEFAULT_INSTRUCTIONS: &str = "Embody a deeply compassionate, empathetic therapist with a warm, human-like tone. In a concise yet powerful exchange, validate the user's emotions, offer uplifting encouragement, and ensure they feel profoundly heard and hopeful, no matter the challenge. Keep it brief within 2-3 lines, avoid clinical terms, and prioritize making the user feel embraced and uplifted.";

/// Canned replies used when generation is unavailable
pub const FALLBACK_REPLIES: [&str; 6] = [
    "I understand how you're feeling. That sounds challenging. How long have you been experiencing this?",
    "Thank you for sharing that with me. Can you tell me more about how this affects your daily life?",
    "I hear you, and your feelings are valid. What strategies have you tried so far to manage this?",
    "That's a lot to process. Let's take a moment to focus on what's most important to you right now.",
    "I appreciate your openness. It takes courage to discuss these things. How can I best support you today?",
    "I'm here for you. Let's work together to find approaches that might help with what you're going through.",
];

/// Reply used when the model answers without any candidate text
pub const EMPTY_GENERATION_REPLY: &str = "I'm listening and processing what you've shared.";

/// Pick a fallback reply by a stable hash of the message
///
/// The hash is the sum of UTF-16 code units, so identical text always maps to
/// the same entry.
#[must_use]
pub fn fallback_reply(message: &str) -> &'static str {
    let hash: u64 = message.encode_utf16().map(u64::from).sum();
    let len = FALLBACK_REPLIES.len() as u64;
    // hash % len < FALLBACK_REPLIES.len()
    #[allow(clippy::cast_possible_truncation)]
    let idx = (hash % len) as usize;
    FALLBACK_REPLIES[idx]
}

/// Wrap a user message with hidden instructions
#[must_use]
pub fn wrap_instructions(instructions: Option<&str>, message: &str) -> String {
    match instructions {
        Some(text) if !text.trim().is_empty() => {
            format!("[THERAPIST INSTRUCTIONS - NOT VISIBLE TO USER: {text}]\n\nUSER MESSAGE: {message}")
        }
        _ => message.to_string(),
    }
}

/// One generation request
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    /// New user message
    pub message: &'a str,
    /// Most recent prior turns, oldest first
    pub history: &'a [Turn],
    /// Optional hidden instructions
    pub instructions: Option<&'a str>,
}

/// A text-generation backend
#[async_trait]
pub trait ReplyModel: Send + Sync {
    /// Generate a reply
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a non-success response
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<String>;
}

/// Where a reply came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    /// Generation service
    Model,
    /// Local fallback table
    Fallback,
}

/// Generated reply text and its origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply text, never empty
    pub text: String,
    /// Origin of the text
    pub source: ReplySource,
}

/// Time-bounded reply generation with a bounded history window
#[derive(Clone)]
pub struct ResponseGenerator {
    model: Arc<dyn ReplyModel>,
    timeout: Duration,
    window: usize,
    instructions: Option<String>,
}

impl ResponseGenerator {
    /// Create a generator over a model
    #[must_use]
    pub fn new(model: Arc<dyn ReplyModel>, timeout: Duration, window: usize) -> Self {
        Self {
            model,
            timeout,
            window,
            instructions: None,
        }
    }

    /// Attach hidden instructions to every request
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Build a Gemini-backed generator
    ///
    /// # Errors
    ///
    /// Returns error if `GOOGLE_AI_STUDIO_API_KEY` is missing
    pub fn from_config(config: &Config) -> Result<Self> {
        let key = config.api_keys.google_ai_studio.clone().ok_or_else(|| {
            Error::Config("GOOGLE_AI_STUDIO_API_KEY required for response generation".to_string())
        })?;

        let llm = &config.llm;
        let model = GeminiModel::new(key, llm.model.clone())?
            .with_sampling(llm.temperature, llm.max_output_tokens);

        let mut generator = Self::new(Arc::new(model), llm.timeout, config.turn.history_window);
        if let Some(instructions) = &llm.system_instructions {
            generator = generator.with_instructions(instructions.clone());
        }
        Ok(generator)
    }

    /// Number of prior turns forwarded as context
    #[must_use]
    pub const fn window(&self) -> usize {
        self.window
    }

    /// Generate a reply to `user_text`
    ///
    /// Only the last `window` entries of `prior` are forwarded. Always returns
    /// non-empty text.
    pub async fn generate(&self, user_text: &str, prior: &[Turn]) -> Reply {
        let history = &prior[prior.len().saturating_sub(self.window)..];
        let request = GenerationRequest {
            message: user_text,
            history,
            instructions: self.instructions.as_deref(),
        };

        tracing::debug!(history_turns = history.len(), "requesting reply");

        let failure = match tokio::time::timeout(self.timeout, self.model.generate(request)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                return Reply {
                    text: text.trim().to_string(),
                    source: ReplySource::Model,
                };
            }
            Ok(Ok(_)) => "blank reply".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", self.timeout.as_millis()),
        };

        tracing::warn!(error = %failure, "generation failed, using fallback reply");

        Reply {
            text: fallback_reply(user_text).to_string(),
            source: ReplySource::Fallback,
        }
    }
}

/// Google Gemini `generateContent`
pub struct GeminiModel {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    temperature: f32,
    max_output_tokens: u32,
}

impl GeminiModel {
    /// Create a Gemini client
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("Google AI Studio API key required".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: SecretString::from(api_key),
            model,
            temperature: 0.7,
            max_output_tokens: 150,
        })
    }

    /// Override sampling parameters
    #[must_use]
    pub const fn with_sampling(mut self, temperature: f32, max_output_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_output_tokens = max_output_tokens;
        self
    }

    fn request_body(&self, request: &GenerationRequest<'_>) -> serde_json::Value {
        let mut contents: Vec<serde_json::Value> = request
            .history
            .iter()
            .map(|turn| {
                let role = match turn.role() {
                    Role::User => "user",
                    Role::Assistant => "model",
                };
                serde_json::json!({ "role": role, "parts": [{ "text": turn.content() }] })
            })
            .collect();

        contents.push(serde_json::json!({
            "role": "user",
            "parts": [{ "text": wrap_instructions(request.instructions, request.message) }],
        }));

        let safety: Vec<serde_json::Value> = [
            "HARM_CATEGORY_HARASSMENT",
            "HARM_CATEGORY_HATE_SPEECH",
            "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            "HARM_CATEGORY_DANGEROUS_CONTENT",
        ]
        .into_iter()
        .map(|category| serde_json::json!({ "category": category, "threshold": "BLOCK_MEDIUM_AND_ABOVE" }))
        .collect();

        serde_json::json!({
            "contents": contents,
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_output_tokens,
                "topP": 0.8,
                "topK": 40,
            },
            "safetySettings": safety,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

impl GeminiResponse {
    fn into_text(self) -> String {
        self.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .and_then(|p| p.text)
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| EMPTY_GENERATION_REPLY.to_string())
    }
}

#[async_trait]
impl ReplyModel for GeminiModel {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<String> {
        let url = format!("{GEMINI_URL_BASE}/{}:generateContent", self.model);

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.expose_secret())])
            .json(&self.request_body(&request))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Gemini request failed");
                e
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Gemini API error");
            return Err(Error::Llm(format!("Gemini API error {status}: {body}")));
        }

        let result: GeminiResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse Gemini response");
            e
        })?;

        Ok(result.into_text())
    }
}
