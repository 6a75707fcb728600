//! Audio capture unit
//!
//! Acquires the microphone for exactly one utterance, buffers encoded chunks,
//! and stops on silence or a hard duration cap. The device handle lives in
//! the [`Recording`] and is released when the recording is stopped or
//! dropped, so no exit path can leak an open microphone.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};

use super::encoding::Encoding;
use super::silence::{DEFAULT_SILENCE_THRESHOLD, SilenceDetector, rms};
use crate::config::TurnConfig;

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Capture failures surfaced to the controller
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Microphone access denied or no input device; fatal to the session
    #[error("microphone unavailable: {0}")]
    MicUnavailable(String),

    /// Recording too small to contain speech
    #[error("recording too short ({bytes} bytes)")]
    EmptyRecording {
        /// Size of the finalized blob
        bytes: usize,
    },

    /// Device failed mid-recording
    #[error("capture device error: {0}")]
    Device(String),
}

impl From<CaptureError> for crate::Error {
    fn from(err: CaptureError) -> Self {
        Self::Audio(err.to_string())
    }
}

/// Processing requested from the input device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    /// Cancel speaker echo
    pub echo_cancellation: bool,
    /// Suppress background noise
    pub noise_suppression: bool,
    /// Automatic gain control
    pub auto_gain: bool,
    /// Requested sample rate in Hz
    pub sample_rate: u32,
    /// Requested channel count
    pub channels: u16,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain: true,
            sample_rate: SAMPLE_RATE,
            channels: 1,
        }
    }
}

/// Source of microphone streams
pub trait Microphone {
    /// Whether the device can record in `encoding`
    fn supports(&self, encoding: Encoding) -> bool;

    /// Encoding used when no preferred encoding is supported
    fn platform_encoding(&self) -> Encoding;

    /// Acquire the device and start recording
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::MicUnavailable`] if access is denied or no
    /// input device exists
    fn open(
        &mut self,
        constraints: &CaptureConstraints,
        encoding: Encoding,
    ) -> Result<Box<dyn InputStream>, CaptureError>;
}

/// An open microphone stream; dropping it releases the device
pub trait InputStream {
    /// Instantaneous audio energy (RMS, 0.0 to 1.0)
    fn level(&self) -> f32;

    /// Encoded bytes captured since the previous call
    fn read_chunk(&mut self) -> Option<Vec<u8>>;

    /// Wrap the concatenated chunks into a playable container
    ///
    /// # Errors
    ///
    /// Returns error if the container cannot be written
    fn seal(&mut self, body: Vec<u8>) -> Result<Vec<u8>, CaptureError> {
        Ok(body)
    }
}

/// Timing and size thresholds for one recording
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Energy sampling interval
    pub poll_interval: Duration,
    /// RMS level below which a sample counts as silence
    pub silence_threshold: f32,
    /// Consecutive quiet samples that end the utterance
    pub silence_ticks: u32,
    /// Hard cap on utterance length
    pub max_duration: Duration,
    /// Blobs at or below this size are discarded as empty
    pub min_bytes: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(80),
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            silence_ticks: 7,
            max_duration: Duration::from_secs(7),
            min_bytes: 2000,
        }
    }
}

impl From<&TurnConfig> for CaptureSettings {
    fn from(config: &TurnConfig) -> Self {
        Self {
            poll_interval: config.silence_interval,
            silence_threshold: config.silence_threshold,
            silence_ticks: config.silence_ticks,
            max_duration: config.max_recording,
            min_bytes: config.min_recording_bytes,
        }
    }
}

/// Why a recording ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Sustained low energy after the utterance
    Silence,
    /// Maximum duration reached
    HardCap,
    /// Stopped by the user
    Manual,
}

/// Append-only chunk buffer owned by one recording
#[derive(Debug, Default)]
pub struct RecordingBuffer {
    chunks: Vec<Vec<u8>>,
    bytes: usize,
}

impl RecordingBuffer {
    /// Append a chunk; empty chunks are ignored
    pub fn push(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.bytes += chunk.len();
        self.chunks.push(chunk);
    }

    /// Total bytes buffered
    #[must_use]
    pub const fn len_bytes(&self) -> usize {
        self.bytes
    }

    /// Number of chunks buffered
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Concatenate chunks in arrival order
    #[must_use]
    pub fn freeze(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes);
        for chunk in self.chunks {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

/// A finalized, immutable recording
#[derive(Debug, Clone)]
pub struct AudioBlob {
    data: Vec<u8>,
    content_type: String,
    duration: Duration,
}

impl AudioBlob {
    /// Create a blob from encoded bytes
    #[must_use]
    pub fn new(data: Vec<u8>, content_type: impl Into<String>, duration: Duration) -> Self {
        Self {
            data,
            content_type: content_type.into(),
            duration,
        }
    }

    /// Encoded audio bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Opaque MIME content type
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Wall-clock length of the recording
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    /// Size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the blob has no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Starts recordings on a microphone
pub struct CaptureUnit<M> {
    mic: M,
    constraints: CaptureConstraints,
    settings: CaptureSettings,
}

impl<M: Microphone> CaptureUnit<M> {
    /// Create a capture unit with default device constraints
    #[must_use]
    pub fn new(mic: M, settings: CaptureSettings) -> Self {
        Self {
            mic,
            constraints: CaptureConstraints::default(),
            settings,
        }
    }

    /// Encoding that will be used for the next recording
    #[must_use]
    pub fn encoding(&self) -> Encoding {
        Encoding::negotiate(|e| self.mic.supports(e), self.mic.platform_encoding())
    }

    /// Capture settings
    #[must_use]
    pub const fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Underlying microphone
    #[must_use]
    pub const fn microphone(&self) -> &M {
        &self.mic
    }

    /// Acquire the microphone and begin a recording
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::MicUnavailable`] if the device cannot be opened
    pub fn start(&mut self) -> Result<Recording, CaptureError> {
        let encoding = self.encoding();
        let stream = self.mic.open(&self.constraints, encoding)?;

        tracing::debug!(content_type = encoding.content_type(), "recording started");

        Ok(Recording {
            stream,
            buffer: RecordingBuffer::default(),
            detector: SilenceDetector::new(
                self.settings.silence_threshold,
                self.settings.silence_ticks,
            ),
            encoding,
            started: Instant::now(),
            settings: self.settings.clone(),
        })
    }
}

/// One in-progress utterance holding the open device
pub struct Recording {
    stream: Box<dyn InputStream>,
    buffer: RecordingBuffer,
    detector: SilenceDetector,
    encoding: Encoding,
    started: Instant,
    settings: CaptureSettings,
}

impl Recording {
    /// Sample energy until silence is detected or the hard cap fires
    ///
    /// Cancel-safe: dropping the future keeps buffered audio and the
    /// silence counter, so it can be awaited again.
    pub async fn wait_for_end(&mut self) -> StopReason {
        let deadline = self.started + self.settings.max_duration;
        let period = self.settings.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    self.pump();
                    tracing::debug!(
                        elapsed_ms = self.elapsed().as_millis(),
                        "recording reached hard cap"
                    );
                    return StopReason::HardCap;
                }
                _ = ticker.tick() => {
                    self.pump();
                    if self.detector.observe(self.stream.level()) {
                        tracing::debug!(
                            elapsed_ms = self.elapsed().as_millis(),
                            heard_speech = self.detector.heard_speech(),
                            "silence detected"
                        );
                        return StopReason::Silence;
                    }
                }
            }
        }
    }

    /// Current input energy
    #[must_use]
    pub fn level(&self) -> f32 {
        self.stream.level()
    }

    /// Time since the device was opened
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Bytes buffered so far
    #[must_use]
    pub const fn bytes_captured(&self) -> usize {
        self.buffer.len_bytes()
    }

    /// Encoding of this recording
    #[must_use]
    pub const fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Stop recording, release the device, and finalize the blob
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::EmptyRecording`] if no sample rose above the
    /// silence threshold or the blob is at or below the minimum size, or
    /// [`CaptureError::Device`] if sealing fails
    pub fn stop(mut self) -> Result<AudioBlob, CaptureError> {
        self.pump();
        let duration = self.elapsed();

        let Self {
            mut stream,
            buffer,
            detector,
            encoding,
            settings,
            ..
        } = self;

        let chunks = buffer.chunk_count();
        let sealed = stream.seal(buffer.freeze());
        drop(stream);
        let data = sealed?;

        tracing::debug!(
            bytes = data.len(),
            chunks,
            duration_ms = duration.as_millis(),
            heard_speech = detector.heard_speech(),
            "recording stopped"
        );

        // Uncompressed PCM of pure silence easily exceeds the byte minimum
        if !detector.heard_speech() || data.len() <= settings.min_bytes {
            return Err(CaptureError::EmptyRecording { bytes: data.len() });
        }

        Ok(AudioBlob::new(data, encoding.content_type(), duration))
    }

    fn pump(&mut self) {
        while let Some(chunk) = self.stream.read_chunk() {
            self.buffer.push(chunk);
        }
    }
}

/// Default input device via cpal, recording 16-bit PCM WAV
#[derive(Debug, Default)]
pub struct CpalMicrophone;

impl CpalMicrophone {
    /// Create a microphone backed by the default input device
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Microphone for CpalMicrophone {
    fn supports(&self, encoding: Encoding) -> bool {
        encoding == Encoding::Wav
    }

    fn platform_encoding(&self) -> Encoding {
        Encoding::Wav
    }

    fn open(
        &mut self,
        constraints: &CaptureConstraints,
        encoding: Encoding,
    ) -> Result<Box<dyn InputStream>, CaptureError> {
        if encoding != Encoding::Wav {
            return Err(CaptureError::Device(format!("unsupported encoding {encoding}")));
        }

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| CaptureError::MicUnavailable("no input device available".to_string()))?;

        let rate = SampleRate(constraints.sample_rate);
        let supported_config = device
            .supported_input_configs()
            .map_err(|e| CaptureError::MicUnavailable(e.to_string()))?
            .find(|c| {
                c.channels() == constraints.channels
                    && c.min_sample_rate() <= rate
                    && c.max_sample_rate() >= rate
            })
            .ok_or_else(|| {
                CaptureError::MicUnavailable("no suitable audio config found".to_string())
            })?;

        let config = supported_config.with_sample_rate(rate).config();

        // cpal exposes no DSP toggles; the flags are recorded for diagnostics
        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = constraints.sample_rate,
            channels = config.channels,
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain = constraints.auto_gain,
            "microphone opened"
        );

        let pcm = Arc::new(Mutex::new(Vec::new()));
        let level = Arc::new(AtomicU32::new(0));

        let stream = {
            let pcm = Arc::clone(&pcm);
            let level = Arc::clone(&level);
            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        level.store(rms(data).to_bits(), Ordering::Relaxed);
                        if let Ok(mut buf) = pcm.lock() {
                            buf.extend_from_slice(&samples_to_pcm16(data));
                        }
                    },
                    |err| {
                        tracing::error!(error = %err, "audio capture error");
                    },
                    None,
                )
                .map_err(|e| CaptureError::MicUnavailable(e.to_string()))?
        };

        stream
            .play()
            .map_err(|e| CaptureError::MicUnavailable(e.to_string()))?;

        Ok(Box::new(CpalStream {
            stream,
            pcm,
            level,
            sample_rate: constraints.sample_rate,
        }))
    }
}

struct CpalStream {
    stream: Stream,
    pcm: Arc<Mutex<Vec<u8>>>,
    level: Arc<AtomicU32>,
    sample_rate: u32,
}

impl InputStream for CpalStream {
    fn level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    fn read_chunk(&mut self) -> Option<Vec<u8>> {
        let chunk = self
            .pcm
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default();
        (!chunk.is_empty()).then_some(chunk)
    }

    fn seal(&mut self, body: Vec<u8>) -> Result<Vec<u8>, CaptureError> {
        pcm16_to_wav(&body, self.sample_rate).map_err(|e| CaptureError::Device(e.to_string()))
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        if let Err(e) = self.stream.pause() {
            tracing::trace!(error = %e, "pause on release failed");
        }
        tracing::debug!("microphone released");
    }
}

/// Convert f32 samples to little-endian 16-bit PCM bytes
#[must_use]
pub fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Convert f32 [-1.0, 1.0] to i16
        #[allow(clippy::cast_possible_truncation)]
        let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&sample_i16.to_le_bytes());
    }
    out
}

/// Wrap little-endian 16-bit mono PCM in a WAV container
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm16_to_wav(pcm: &[u8], sample_rate: u32) -> crate::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| crate::Error::Audio(e.to_string()))?;

        for pair in pcm.chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| crate::Error::Audio(e.to_string()))?;
        }

        writer
            .finalize()
            .map_err(|e| crate::Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
