//! Speech-to-text (STT) processing
//!
//! [`TranscriptionClient`] bounds every request with a timeout and normalizes
//! results into [`TranscriptionError`]. Vendor adapters implement
//! [`SpeechRecognizer`] and are swappable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;

use super::capture::AudioBlob;
use crate::config::{Config, SttProvider};
use crate::{Error, Result};

const GOOGLE_SPEECH_URL: &str = "https://speech.googleapis.com/v1/speech:recognize";
const WHISPER_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

/// Domain vocabulary biased during recognition
pub const DEFAULT_PHRASE_HINTS: &[&str] = &[
    "therapy",
    "feel",
    "feeling",
    "emotion",
    "emotions",
    "anxious",
    "anxiety",
    "depressed",
    "depression",
    "stress",
    "worried",
    "fear",
    "sad",
    "happy",
    "angry",
    "frustrated",
    "overwhelmed",
    "coping",
    "strategies",
    "mindfulness",
    "meditation",
    "breathing",
    "exercise",
    "sleep",
    "eating",
    "relationship",
    "work",
    "family",
];

/// Default phrase-hint boost
pub const DEFAULT_PHRASE_BOOST: f32 = 10.0;

/// One transcription request
#[derive(Debug, Clone, Copy)]
pub struct TranscriptionRequest<'a> {
    /// Encoded audio bytes
    pub audio: &'a [u8],
    /// Opaque MIME content type from capture
    pub content_type: &'a str,
    /// Locale hint (e.g. "en-US")
    pub language: &'a str,
}

/// Raw service result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    /// Recognized text, possibly empty
    pub text: String,
    /// Confidence of the top alternative, when reported
    pub confidence: Option<f32>,
}

/// A transcription backend
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Recognize speech in one recording
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a non-success response
    async fn recognize(&self, request: TranscriptionRequest<'_>) -> Result<Transcript>;
}

/// Normalized transcription failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranscriptionError {
    /// Request exceeded its time bound and was canceled
    #[error("transcription timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Service or transport error
    #[error("transcription service error: {0}")]
    ServiceError(String),

    /// Service succeeded but heard nothing
    #[error("empty transcript")]
    EmptyTranscript,
}

impl TranscriptionError {
    /// Short label for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::ServiceError(_) => "service_error",
            Self::EmptyTranscript => "empty_transcript",
        }
    }
}

impl From<TranscriptionError> for Error {
    fn from(err: TranscriptionError) -> Self {
        Self::Stt(err.to_string())
    }
}

/// Time-bounded transcription of finalized recordings
#[derive(Clone)]
pub struct TranscriptionClient {
    recognizer: Arc<dyn SpeechRecognizer>,
    timeout: Duration,
    language: String,
}

impl TranscriptionClient {
    /// Create a client over a recognizer
    #[must_use]
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        timeout: Duration,
        language: impl Into<String>,
    ) -> Self {
        Self {
            recognizer,
            timeout,
            language: language.into(),
        }
    }

    /// Build the configured provider
    ///
    /// # Errors
    ///
    /// Returns error if the provider's API key is missing
    pub fn from_config(config: &Config) -> Result<Self> {
        let stt = &config.stt;
        let recognizer: Arc<dyn SpeechRecognizer> = match stt.provider {
            SttProvider::Google => {
                let key = config.api_keys.google_cloud.clone().ok_or_else(|| {
                    Error::Config("GOOGLE_CLOUD_API_KEY required for speech recognition".to_string())
                })?;
                let model = stt.model.clone().unwrap_or_else(|| "latest_long".to_string());
                Arc::new(
                    GoogleSpeech::new(key, model)?
                        .with_phrase_hints(stt.phrase_hints.clone(), stt.phrase_boost),
                )
            }
            SttProvider::Whisper => {
                let key = config.api_keys.openai.clone().ok_or_else(|| {
                    Error::Config("OPENAI_API_KEY required for Whisper".to_string())
                })?;
                let model = stt.model.clone().unwrap_or_else(|| "whisper-1".to_string());
                Arc::new(Whisper::new(key, model)?)
            }
        };

        tracing::debug!(provider = ?stt.provider, timeout_ms = stt.timeout.as_millis(), "transcription client ready");

        Ok(Self::new(recognizer, stt.timeout, stt.language.clone()))
    }

    /// Request timeout
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Transcribe one recording; no retries
    ///
    /// # Errors
    ///
    /// Returns [`TranscriptionError::Timeout`] when the bound elapses,
    /// [`TranscriptionError::ServiceError`] on failure, and
    /// [`TranscriptionError::EmptyTranscript`] for blank text
    pub async fn transcribe(&self, blob: &AudioBlob) -> std::result::Result<String, TranscriptionError> {
        let request = TranscriptionRequest {
            audio: blob.data(),
            content_type: blob.content_type(),
            language: &self.language,
        };

        tracing::debug!(
            audio_bytes = blob.len(),
            content_type = blob.content_type(),
            "starting transcription"
        );

        let transcript = match tokio::time::timeout(self.timeout, self.recognizer.recognize(request)).await {
            Err(_) => return Err(TranscriptionError::Timeout(self.timeout)),
            Ok(Err(e)) => return Err(TranscriptionError::ServiceError(e.to_string())),
            Ok(Ok(transcript)) => transcript,
        };

        let text = transcript.text.trim();
        if text.is_empty() {
            return Err(TranscriptionError::EmptyTranscript);
        }

        tracing::info!(transcript = %text, confidence = ?transcript.confidence, "transcription complete");
        Ok(text.to_string())
    }
}

/// Google Cloud Speech-to-Text
pub struct GoogleSpeech {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    phrase_hints: Vec<String>,
    phrase_boost: f32,
}

impl GoogleSpeech {
    /// Create a Google Cloud Speech recognizer
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "Google Cloud API key required for speech recognition".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: SecretString::from(api_key),
            model,
            phrase_hints: DEFAULT_PHRASE_HINTS.iter().map(ToString::to_string).collect(),
            phrase_boost: DEFAULT_PHRASE_BOOST,
        })
    }

    /// Replace the phrase hints
    #[must_use]
    pub fn with_phrase_hints(mut self, hints: Vec<String>, boost: f32) -> Self {
        self.phrase_hints = hints;
        self.phrase_boost = boost;
        self
    }

    fn request_body(&self, request: &TranscriptionRequest<'_>) -> serde_json::Value {
        let (encoding, sample_rate) = google_encoding(request.content_type);

        let mut config = serde_json::json!({
            "encoding": encoding,
            "languageCode": request.language,
            "model": self.model,
            "useEnhanced": true,
            "enableAutomaticPunctuation": true,
            "maxAlternatives": 1,
        });
        if let Some(rate) = sample_rate {
            config["sampleRateHertz"] = rate.into();
        }
        if !self.phrase_hints.is_empty() {
            config["speechContexts"] = serde_json::json!([{
                "phrases": self.phrase_hints,
                "boost": self.phrase_boost,
            }]);
        }

        serde_json::json!({
            "config": config,
            "audio": { "content": BASE64.encode(request.audio) },
        })
    }
}

#[async_trait]
impl SpeechRecognizer for GoogleSpeech {
    async fn recognize(&self, request: TranscriptionRequest<'_>) -> Result<Transcript> {
        tracing::debug!(audio_bytes = request.audio.len(), "starting Google transcription");

        let response = self
            .client
            .post(GOOGLE_SPEECH_URL)
            .query(&[("key", self.api_key.expose_secret())])
            .json(&self.request_body(&request))
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Google speech request failed");
                e
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Google speech API error");
            return Err(Error::Stt(format!("Google speech API error {status}: {body}")));
        }

        let result: GoogleRecognizeResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse Google speech response");
            e
        })?;

        Ok(result.into_transcript())
    }
}

/// Map an opaque content type onto Google's encoding enum
///
/// WAV carries its own header so the sample rate is omitted
fn google_encoding(content_type: &str) -> (&'static str, Option<u32>) {
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("wav") {
        ("LINEAR16", None)
    } else if ct.contains("mp4") || ct.contains("aac") {
        ("MP3", Some(48000))
    } else {
        ("WEBM_OPUS", Some(48000))
    }
}

#[derive(Debug, Default, Deserialize)]
struct GoogleRecognizeResponse {
    #[serde(default)]
    results: Vec<GoogleResult>,
}

#[derive(Debug, Deserialize)]
struct GoogleResult {
    #[serde(default)]
    alternatives: Vec<GoogleAlternative>,
}

#[derive(Debug, Deserialize)]
struct GoogleAlternative {
    #[serde(default)]
    transcript: String,
    confidence: Option<f32>,
}

impl GoogleRecognizeResponse {
    fn into_transcript(self) -> Transcript {
        let confidence = self
            .results
            .first()
            .and_then(|r| r.alternatives.first())
            .and_then(|a| a.confidence);

        let text = self
            .results
            .into_iter()
            .filter_map(|r| r.alternatives.into_iter().next())
            .map(|a| a.transcript)
            .collect::<Vec<_>>()
            .join(" ");

        Transcript { text, confidence }
    }
}

/// Response from OpenAI Whisper transcription API
#[derive(Deserialize)]
struct WhisperResponse {
    text: String,
}

/// `OpenAI` Whisper
pub struct Whisper {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl Whisper {
    /// Create a Whisper recognizer
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config(
                "OpenAI API key required for Whisper".to_string(),
            ));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: SecretString::from(api_key),
            model,
        })
    }
}

#[async_trait]
impl SpeechRecognizer for Whisper {
    async fn recognize(&self, request: TranscriptionRequest<'_>) -> Result<Transcript> {
        tracing::debug!(audio_bytes = request.audio.len(), "starting Whisper transcription");

        // Whisper only accepts the bare MIME type
        let mime = request.content_type.split(';').next().unwrap_or("audio/wav");
        let extension = mime.rsplit('/').next().unwrap_or("wav");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(request.audio.to_vec())
                    .file_name(format!("audio.{extension}"))
                    .mime_str(mime)
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("language", request.language.split('-').next().unwrap_or("en").to_string());

        let response = self
            .client
            .post(WHISPER_URL)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
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

        Ok(Transcript {
            text: result.text,
            confidence: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned {
        delay: Duration,
        result: std::result::Result<&'static str, &'static str>,
    }

    #[async_trait]
    impl SpeechRecognizer for Canned {
        async fn recognize(&self, _request: TranscriptionRequest<'_>) -> Result<Transcript> {
            tokio::time::sleep(self.delay).await;
            match self.result {
                Ok(text) => Ok(Transcript {
                    text: text.to_string(),
                    confidence: Some(0.9),
                }),
                Err(msg) => Err(Error::Stt(msg.to_string())),
            }
        }
    }

    fn client(delay_ms: u64, result: std::result::Result<&'static str, &'static str>) -> TranscriptionClient {
        TranscriptionClient::new(
            Arc::new(Canned {
                delay: Duration::from_millis(delay_ms),
                result,
            }),
            Duration::from_secs(7),
            "en-US",
        )
    }

    fn blob() -> AudioBlob {
        AudioBlob::new(vec![1; 4096], "audio/webm;codecs=opus", Duration::from_secs(2))
    }

    #[tokio::test(start_paused = true)]
    async fn test_trims_transcript() {
        let text = client(1200, Ok("  I feel anxious today \n")).transcribe(&blob()).await;
        assert_eq!(text.unwrap(), "I feel anxious today");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let err = client(8000, Ok("late")).transcribe(&blob()).await.unwrap_err();
        assert_eq!(err, TranscriptionError::Timeout(Duration::from_secs(7)));
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_is_empty_transcript() {
        let err = client(10, Ok("   ")).transcribe(&blob()).await.unwrap_err();
        assert_eq!(err, TranscriptionError::EmptyTranscript);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_error() {
        let err = client(10, Err("HTTP 500")).transcribe(&blob()).await.unwrap_err();
        assert!(matches!(err, TranscriptionError::ServiceError(ref m) if m.contains("HTTP 500")));
    }

    #[test]
    fn test_google_encoding() {
        assert_eq!(google_encoding("audio/webm;codecs=opus"), ("WEBM_OPUS", Some(48000)));
        assert_eq!(google_encoding("audio/mp4"), ("MP3", Some(48000)));
        assert_eq!(google_encoding("audio/wav"), ("LINEAR16", None));
        assert_eq!(google_encoding("application/octet-stream"), ("WEBM_OPUS", Some(48000)));
    }

    #[test]
    fn test_google_request_body() {
        let speech = GoogleSpeech::new("key".to_string(), "latest_long".to_string()).unwrap();
        let body = speech.request_body(&TranscriptionRequest {
            audio: &[1, 2, 3],
            content_type: "audio/webm",
            language: "en-US",
        });

        assert_eq!(body["config"]["encoding"], "WEBM_OPUS");
        assert_eq!(body["config"]["sampleRateHertz"], 48000);
        assert_eq!(body["config"]["languageCode"], "en-US");
        assert_eq!(body["config"]["speechContexts"][0]["boost"], 10.0);
        assert_eq!(body["audio"]["content"], "AQID");
    }

    #[test]
    fn test_google_response_joins_results() {
        let response: GoogleRecognizeResponse = serde_json::from_str(
            r#"{"results":[
                {"alternatives":[{"transcript":"I lost","confidence":0.82}]},
                {"alternatives":[{"transcript":"my job"}]}
            ]}"#,
        )
        .unwrap();

        let transcript = response.into_transcript();
        assert_eq!(transcript.text, "I lost my job");
        assert_eq!(transcript.confidence, Some(0.82));
    }

    #[test]
    fn test_google_response_without_results() {
        let response: GoogleRecognizeResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(response.into_transcript(), Transcript::default());
    }

    #[test]
    fn test_requires_api_key() {
        assert!(Whisper::new(String::new(), "whisper-1".to_string()).is_err());
        assert!(GoogleSpeech::new(String::new(), "latest_long".to_string()).is_err());
    }
}
