//! Text-to-speech (TTS) processing
//!
//! [`SpeechSynthesizer`] tries the primary service first and falls back to
//! on-device speech, then to text only. It never returns an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::local::{LocalVoice, SystemVoice};
use super::playback::{AudioSink, PlaybackHandle};
use crate::config::{Config, TtsProvider};
use crate::{Error, Result};

const GOOGLE_TTS_URL: &str = "https://texttospeech.googleapis.com/v1/text:synthesize";
const OPENAI_TTS_URL: &str = "https://api.openai.com/v1/audio/speech";

/// Default Google voice
pub const DEFAULT_GOOGLE_VOICE: &str = "en-US-Chirp3-HD-Achernar";

/// Default `OpenAI` voice
pub const DEFAULT_OPENAI_VOICE: &str = "alloy";

/// Encoded audio returned by a synthesis service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    /// Encoded bytes
    pub data: Vec<u8>,
    /// MIME type of `data`
    pub content_type: String,
}

/// A speech synthesis backend
#[async_trait]
pub trait SpeechService: Send + Sync {
    /// Synthesize `text` to encoded audio
    ///
    /// # Errors
    ///
    /// Returns error on transport failure, a non-success response, or a
    /// malformed body
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio>;
}

/// Which path produced the speech
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechOutcome {
    /// Service audio played through the sink
    Audio,
    /// On-device synthesis
    Local,
    /// Nothing spoken; reply shown as text
    TextOnly,
}

/// How a spoken reply ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEnd {
    /// Played to the end or stopped
    Completed,
    /// Playback failed partway
    Failed(String),
    /// There was no audio to wait for
    TextOnly,
}

/// A reply being spoken
#[derive(Debug)]
pub enum Speech {
    /// Service audio playing through the sink
    Audio(PlaybackHandle),
    /// On-device synthesis in progress
    Local(PlaybackHandle),
    /// No speech; display only
    TextOnly,
}

impl Speech {
    /// Which path is speaking
    #[must_use]
    pub const fn outcome(&self) -> SpeechOutcome {
        match self {
            Self::Audio(_) => SpeechOutcome::Audio,
            Self::Local(_) => SpeechOutcome::Local,
            Self::TextOnly => SpeechOutcome::TextOnly,
        }
    }

    /// Wait for speech to end
    pub async fn finished(&mut self) -> SpeechEnd {
        match self {
            Self::Audio(handle) | Self::Local(handle) => match handle.wait().await {
                Ok(()) => SpeechEnd::Completed,
                Err(e) => SpeechEnd::Failed(e),
            },
            Self::TextOnly => SpeechEnd::TextOnly,
        }
    }

    /// Stop speaking
    pub fn stop(&self) {
        if let Self::Audio(handle) | Self::Local(handle) = self {
            handle.stop();
        }
    }
}

/// Primary/fallback speech selection that owns the playback resource
pub struct SpeechSynthesizer {
    service: Option<Arc<dyn SpeechService>>,
    local: Option<Box<dyn LocalVoice>>,
    sink: Box<dyn AudioSink>,
    timeout: Duration,
    current: Option<CancellationToken>,
    muted: bool,
}

impl SpeechSynthesizer {
    /// Create a synthesizer
    #[must_use]
    pub fn new(
        service: Option<Arc<dyn SpeechService>>,
        local: Option<Box<dyn LocalVoice>>,
        sink: Box<dyn AudioSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            service,
            local,
            sink,
            timeout,
            current: None,
            muted: false,
        }
    }

    /// Build the configured primary service and on-device fallback
    ///
    /// A missing API key disables the primary service instead of failing.
    #[must_use]
    pub fn from_config(config: &Config, sink: Box<dyn AudioSink>) -> Self {
        let tts = &config.tts;
        let service = primary_service(config);

        if service.is_none() {
            tracing::warn!(provider = ?tts.provider, "no API key for speech synthesis, using on-device voice");
        }

        let local = if tts.local_voice {
            SystemVoice::detect().map(|v| Box::new(v) as Box<dyn LocalVoice>)
        } else {
            None
        };

        Self::new(service, local, sink, tts.timeout)
    }

    /// Show replies as text only while muted
    pub const fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// Whether output is muted
    #[must_use]
    pub const fn is_muted(&self) -> bool {
        self.muted
    }

    /// Stop any playback started by this synthesizer
    pub fn stop(&mut self) {
        if let Some(token) = self.current.take() {
            token.cancel();
            tracing::debug!("previous playback stopped");
        }
    }

    /// Speak `text`, falling back as needed; never fails
    pub async fn speak(&mut self, text: &str) -> Speech {
        self.stop();

        if self.muted {
            tracing::debug!("muted, reply shown as text only");
            return Speech::TextOnly;
        }

        if let Some(service) = self.service.clone() {
            match tokio::time::timeout(self.timeout, service.synthesize(text)).await {
                Ok(Ok(audio)) if !audio.data.is_empty() => match self.sink.play(&audio) {
                    Ok(handle) => {
                        tracing::debug!(audio_bytes = audio.data.len(), "playing synthesized speech");
                        self.current = Some(handle.stop_token());
                        return Speech::Audio(handle);
                    }
                    Err(e) => tracing::warn!(kind = "playback", error = %e, "synthesized audio could not be played"),
                },
                Ok(Ok(_)) => tracing::warn!(kind = "malformed", "synthesis returned no audio"),
                Ok(Err(e)) => tracing::warn!(kind = "service_error", error = %e, "synthesis failed"),
                Err(_) => tracing::warn!(
                    kind = "timeout",
                    timeout_ms = self.timeout.as_millis(),
                    "synthesis timed out"
                ),
            }
        }

        self.speak_locally(text)
    }

    fn speak_locally(&mut self, text: &str) -> Speech {
        let Some(local) = self.local.as_mut() else {
            tracing::debug!("no on-device voice, reply shown as text only");
            return Speech::TextOnly;
        };

        match local.speak(text) {
            Ok(handle) => {
                self.current = Some(handle.stop_token());
                Speech::Local(handle)
            }
            Err(e) => {
                tracing::warn!(kind = "local_voice", error = %e, "on-device speech failed");
                Speech::TextOnly
            }
        }
    }
}

fn primary_service(config: &Config) -> Option<Arc<dyn SpeechService>> {
    let tts = &config.tts;
    match tts.provider {
        TtsProvider::Google => {
            let key = config.api_keys.google_cloud.clone()?;
            let voice = tts
                .voice
                .clone()
                .unwrap_or_else(|| DEFAULT_GOOGLE_VOICE.to_string());
            let service = GoogleTts::new(key, voice)
                .ok()?
                .with_language(tts.language.clone())
                .with_prosody(tts.speaking_rate, tts.pitch);
            Some(Arc::new(service))
        }
        TtsProvider::OpenAi => {
            let key = config.api_keys.openai.clone()?;
            let voice = tts
                .voice
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_VOICE.to_string());
            let service = OpenAiTts::new(key, voice, tts.speaking_rate).ok()?;
            Some(Arc::new(service))
        }
    }
}

/// Google Cloud Text-to-Speech
pub struct GoogleTts {
    client: reqwest::Client,
    api_key: SecretString,
    voice: String,
    language: String,
    speaking_rate: f32,
    pitch: f32,
}

impl GoogleTts {
    /// Create a Google TTS client
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: String, voice: String) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("Google Cloud API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: SecretString::from(api_key),
            voice,
            language: "en-US".to_string(),
            speaking_rate: 1.0,
            pitch: 0.0,
        })
    }

    /// Set the voice language code
    #[must_use]
    pub fn with_language(mut self, language: String) -> Self {
        self.language = language;
        self
    }

    /// Set speaking rate and pitch
    #[must_use]
    pub const fn with_prosody(mut self, speaking_rate: f32, pitch: f32) -> Self {
        self.speaking_rate = speaking_rate;
        self.pitch = pitch;
        self
    }

    fn request_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "input": { "text": text },
            "voice": {
                "languageCode": self.language,
                "name": self.voice,
                "ssmlGender": "FEMALE",
            },
            "audioConfig": {
                "audioEncoding": "MP3",
                "effectsProfileId": ["small-bluetooth-speaker-class-device"],
                "pitch": self.pitch,
                "speakingRate": self.speaking_rate,
            },
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleTtsResponse {
    audio_content: Option<String>,
}

impl GoogleTtsResponse {
    fn into_audio(self) -> Result<SynthesizedAudio> {
        let encoded = self
            .audio_content
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::Tts("no audio content received".to_string()))?;

        let data = BASE64
            .decode(encoded)
            .map_err(|e| Error::Tts(format!("invalid audio content: {e}")))?;

        Ok(SynthesizedAudio {
            data,
            content_type: "audio/mpeg".to_string(),
        })
    }
}

#[async_trait]
impl SpeechService for GoogleTts {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        let response = self
            .client
            .post(GOOGLE_TTS_URL)
            .query(&[("key", self.api_key.expose_secret())])
            .json(&self.request_body(text))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("Google TTS error {status}: {body}")));
        }

        let result: GoogleTtsResponse = response.json().await?;
        result.into_audio()
    }
}

/// `OpenAI` speech synthesis
pub struct OpenAiTts {
    client: reqwest::Client,
    api_key: SecretString,
    voice: String,
    speed: f32,
    model: String,
}

impl OpenAiTts {
    /// Create an `OpenAI` TTS client
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: String, voice: String, speed: f32) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key: SecretString::from(api_key),
            voice,
            speed,
            model: "tts-1".to_string(),
        })
    }
}

#[async_trait]
impl SpeechService for OpenAiTts {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
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
            voice: &self.voice,
            speed: self.speed,
        };

        let response = self
            .client
            .post(OPENAI_TTS_URL)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        let audio = response.bytes().await?;
        Ok(SynthesizedAudio {
            data: audio.to_vec(),
            content_type: "audio/mpeg".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::voice::playback::PlaybackControl;

    struct Service {
        delay: Duration,
        audio: Option<Vec<u8>>,
    }

    #[async_trait]
    impl SpeechService for Service {
        async fn synthesize(&self, _text: &str) -> Result<SynthesizedAudio> {
            tokio::time::sleep(self.delay).await;
            self.audio
                .clone()
                .map(|data| SynthesizedAudio {
                    data,
                    content_type: "audio/mpeg".to_string(),
                })
                .ok_or_else(|| Error::Tts("HTTP 500".to_string()))
        }
    }

    #[derive(Default)]
    struct Sink {
        controls: Arc<Mutex<Vec<PlaybackControl>>>,
    }

    impl AudioSink for Sink {
        fn play(&mut self, _audio: &SynthesizedAudio) -> Result<PlaybackHandle> {
            let (handle, control) = PlaybackHandle::channel();
            self.controls.lock().unwrap().push(control);
            Ok(handle)
        }
    }

    struct Voice {
        spoken: Arc<AtomicUsize>,
    }

    impl LocalVoice for Voice {
        fn speak(&mut self, _text: &str) -> Result<PlaybackHandle> {
            self.spoken.fetch_add(1, Ordering::SeqCst);
            let (handle, control) = PlaybackHandle::channel();
            control.finish(Ok(()));
            Ok(handle)
        }
    }

    fn synthesizer(service: Option<Service>, local: bool) -> (SpeechSynthesizer, Arc<Mutex<Vec<PlaybackControl>>>, Arc<AtomicUsize>) {
        let sink = Sink::default();
        let controls = Arc::clone(&sink.controls);
        let spoken = Arc::new(AtomicUsize::new(0));
        let local: Option<Box<dyn LocalVoice>> = local.then(|| {
            Box::new(Voice {
                spoken: Arc::clone(&spoken),
            }) as Box<dyn LocalVoice>
        });
        let synth = SpeechSynthesizer::new(
            service.map(|s| Arc::new(s) as Arc<dyn SpeechService>),
            local,
            Box::new(sink),
            Duration::from_secs(5),
        );
        (synth, controls, spoken)
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_audio() {
        let (mut synth, controls, spoken) = synthesizer(
            Some(Service {
                delay: Duration::from_millis(300),
                audio: Some(vec![1, 2, 3]),
            }),
            true,
        );

        let speech = synth.speak("hello").await;
        assert_eq!(speech.outcome(), SpeechOutcome::Audio);
        assert_eq!(controls.lock().unwrap().len(), 1);
        assert_eq!(spoken.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_error_falls_back_to_local() {
        let (mut synth, _, spoken) = synthesizer(
            Some(Service {
                delay: Duration::ZERO,
                audio: None,
            }),
            true,
        );

        let mut speech = synth.speak("hello").await;
        assert_eq!(speech.outcome(), SpeechOutcome::Local);
        assert_eq!(speech.finished().await, SpeechEnd::Completed);
        assert_eq!(spoken.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_local_is_text_only() {
        let (mut synth, _, _) = synthesizer(
            Some(Service {
                delay: Duration::from_secs(6),
                audio: Some(vec![1]),
            }),
            false,
        );

        let mut speech = synth.speak("hello").await;
        assert_eq!(speech.outcome(), SpeechOutcome::TextOnly);
        assert_eq!(speech.finished().await, SpeechEnd::TextOnly);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_audio_is_failure() {
        let (mut synth, controls, spoken) = synthesizer(
            Some(Service {
                delay: Duration::ZERO,
                audio: Some(Vec::new()),
            }),
            true,
        );

        let speech = synth.speak("hello").await;
        assert_eq!(speech.outcome(), SpeechOutcome::Local);
        assert!(controls.lock().unwrap().is_empty());
        assert_eq!(spoken.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_speech_stops_previous() {
        let (mut synth, controls, _) = synthesizer(
            Some(Service {
                delay: Duration::ZERO,
                audio: Some(vec![1]),
            }),
            false,
        );

        let _first = synth.speak("one").await;
        let _second = synth.speak("two").await;

        let controls = controls.lock().unwrap();
        assert!(controls[0].is_stopped());
        assert!(!controls[1].is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_muted_is_text_only() {
        let (mut synth, controls, _) = synthesizer(
            Some(Service {
                delay: Duration::ZERO,
                audio: Some(vec![1]),
            }),
            true,
        );
        synth.set_muted(true);

        let speech = synth.speak("hello").await;
        assert_eq!(speech.outcome(), SpeechOutcome::TextOnly);
        assert!(controls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_google_response() {
        let ok = GoogleTtsResponse {
            audio_content: Some("AQID".to_string()),
        };
        assert_eq!(ok.into_audio().unwrap().data, vec![1, 2, 3]);

        let missing = GoogleTtsResponse { audio_content: None };
        assert!(missing.into_audio().is_err());
    }

    #[test]
    fn test_google_request_body() {
        let tts = GoogleTts::new("key".to_string(), DEFAULT_GOOGLE_VOICE.to_string()).unwrap();
        let body = tts.request_body("Hello");

        assert_eq!(body["input"]["text"], "Hello");
        assert_eq!(body["voice"]["name"], DEFAULT_GOOGLE_VOICE);
        assert_eq!(body["audioConfig"]["audioEncoding"], "MP3");
    }
}
