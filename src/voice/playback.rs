//! Audio playback to speakers
//!
//! Every playback is represented by a [`PlaybackHandle`]. Dropping or
//! stopping the handle signals the player to release the output device.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleRate;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::tts::SynthesizedAudio;
use crate::{Error, Result};

/// Sample rate assumed when the source does not carry one
const DEFAULT_PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Poll interval while waiting for the device to drain
const DRAIN_POLL: Duration = Duration::from_millis(50);

type Completion = std::result::Result<(), String>;

/// Waitable, stoppable handle to one playback
#[derive(Debug)]
pub struct PlaybackHandle {
    done: oneshot::Receiver<Completion>,
    outcome: Option<Completion>,
    stop: CancellationToken,
}

/// Player-side half of a [`PlaybackHandle`]
#[derive(Debug)]
pub struct PlaybackControl {
    done: oneshot::Sender<Completion>,
    stop: CancellationToken,
}

impl PlaybackHandle {
    /// Create a connected handle/control pair
    #[must_use]
    pub fn channel() -> (Self, PlaybackControl) {
        let (tx, rx) = oneshot::channel();
        let stop = CancellationToken::new();
        (
            Self {
                done: rx,
                outcome: None,
                stop: stop.clone(),
            },
            PlaybackControl { done: tx, stop },
        )
    }

    /// Ask the player to stop and release the device
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Token that stops this playback when cancelled
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Wait until playback ends, is stopped, or fails
    ///
    /// # Errors
    ///
    /// Returns the player's error message, or an abandonment error if the
    /// player went away without reporting
    pub async fn wait(&mut self) -> Completion {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = (&mut self.done)
            .await
            .unwrap_or_else(|_| Err("playback abandoned".to_string()));
        self.outcome = Some(outcome.clone());
        outcome
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl PlaybackControl {
    /// Whether a stop was requested
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once a stop is requested
    pub async fn stopped(&self) {
        self.stop.cancelled().await;
    }

    /// Report completion to the handle
    pub fn finish(self, result: Completion) {
        // The handle may already be gone
        let _ = self.done.send(result);
    }
}

/// Destination for synthesized audio
pub trait AudioSink {
    /// Start playing `audio`; returns once playback has begun
    ///
    /// # Errors
    ///
    /// Returns error if the audio cannot be decoded or no device is available
    fn play(&mut self, audio: &SynthesizedAudio) -> Result<PlaybackHandle>;
}

/// Decoded mono samples
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// f32 samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

/// Plays audio to the default output device on a dedicated thread
#[derive(Debug, Default)]
pub struct CpalSpeaker;

impl CpalSpeaker {
    /// Create a speaker backed by the default output device
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Play decoded samples
    ///
    /// # Errors
    ///
    /// Returns error if there is nothing to play or the thread cannot start
    pub fn play_samples(&mut self, audio: DecodedAudio) -> Result<PlaybackHandle> {
        if audio.samples.is_empty() {
            return Err(Error::Playback("no audio samples".to_string()));
        }

        let (handle, control) = PlaybackHandle::channel();
        std::thread::Builder::new()
            .name("haven-playback".to_string())
            .spawn(move || {
                let result = play_blocking(&audio, &control).map_err(|e| e.to_string());
                control.finish(result);
            })?;

        Ok(handle)
    }
}

impl AudioSink for CpalSpeaker {
    fn play(&mut self, audio: &SynthesizedAudio) -> Result<PlaybackHandle> {
        let decoded = decode(audio)?;
        self.play_samples(decoded)
    }
}

/// Decode synthesized audio by content type
///
/// # Errors
///
/// Returns error if the container is unsupported or corrupt
pub fn decode(audio: &SynthesizedAudio) -> Result<DecodedAudio> {
    if audio.content_type.contains("wav") {
        decode_wav(&audio.data)
    } else {
        decode_mp3(&audio.data)
    }
}

fn play_blocking(audio: &DecodedAudio, control: &PlaybackControl) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Playback("no output device available".to_string()))?;

    let rate = SampleRate(audio.sample_rate);
    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Playback(e.to_string()))?
        .find(|c| c.channels() == 1 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2 && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
            })
        })
        .ok_or_else(|| Error::Playback("no suitable output config found".to_string()))?;

    let config = supported_config.with_sample_rate(rate).config();
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = audio.sample_rate,
        channels,
        "audio playback started"
    );

    let samples = Arc::new(audio.samples.clone());
    let position = Arc::new(AtomicUsize::new(0));
    let drained = Arc::new(AtomicBool::new(false));

    let stream = {
        let samples = Arc::clone(&samples);
        let position = Arc::clone(&position);
        let drained = Arc::clone(&drained);
        device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut pos = position.load(Ordering::Relaxed);
                    for frame in data.chunks_mut(channels) {
                        let sample = samples.get(pos).copied().unwrap_or_else(|| {
                            drained.store(true, Ordering::Relaxed);
                            0.0
                        });
                        frame.fill(sample);
                        if pos < samples.len() {
                            pos += 1;
                        }
                    }
                    position.store(pos, Ordering::Relaxed);
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Playback(e.to_string()))?
    };

    stream.play().map_err(|e| Error::Playback(e.to_string()))?;

    let sample_count = samples.len() as u64;
    let limit = Duration::from_millis(sample_count * 1000 / u64::from(audio.sample_rate) + 500);
    let start = std::time::Instant::now();

    while !drained.load(Ordering::Relaxed) && !control.is_stopped() {
        if start.elapsed() > limit {
            tracing::warn!(limit_ms = limit.as_millis(), "playback overran expected length");
            break;
        }
        std::thread::sleep(DRAIN_POLL);
    }

    drop(stream);
    tracing::debug!(
        samples = sample_count,
        stopped = control.is_stopped(),
        "playback released"
    );

    Ok(())
}

/// Decode MP3 bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if a frame cannot be decoded
pub fn decode_mp3(mp3_data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = DEFAULT_PLAYBACK_SAMPLE_RATE;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if let Ok(rate) = u32::try_from(frame.sample_rate) {
                    sample_rate = rate;
                }
                if frame.channels == 2 {
                    // Stereo: average channels
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Playback(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Decode 16-bit PCM WAV bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if the WAV header or samples are invalid
pub fn decode_wav(wav_data: &[u8]) -> Result<DecodedAudio> {
    let mut reader =
        hound::WavReader::new(Cursor::new(wav_data)).map_err(|e| Error::Playback(e.to_string()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved = reader
        .samples::<i16>()
        .map(|s| s.map(|v| f32::from(v) / 32768.0))
        .collect::<std::result::Result<Vec<f32>, _>>()
        .map_err(|e| Error::Playback(e.to_string()))?;

    #[allow(clippy::cast_precision_loss)]
    let samples = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok(DecodedAudio {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Generate a sine tone for speaker checks
#[must_use]
pub fn sine_tone(frequency: f32, duration: Duration, sample_rate: u32) -> DecodedAudio {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let count = (duration.as_secs_f32() * sample_rate as f32) as usize;

    #[allow(clippy::cast_precision_loss)]
    let samples = (0..count)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (t * frequency * std::f32::consts::TAU).sin() * 0.3
        })
        .collect();

    DecodedAudio {
        samples,
        sample_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::capture::{pcm16_to_wav, samples_to_pcm16};

    #[tokio::test]
    async fn test_finish_resolves_wait() {
        let (mut handle, control) = PlaybackHandle::channel();
        control.finish(Ok(()));

        assert_eq!(handle.wait().await, Ok(()));
        // Cached after the first wait
        assert_eq!(handle.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_abandoned_control_is_error() {
        let (mut handle, control) = PlaybackHandle::channel();
        drop(control);

        assert!(handle.wait().await.is_err());
    }

    #[test]
    fn test_stop_and_drop_signal_player() {
        let (handle, control) = PlaybackHandle::channel();
        assert!(!control.is_stopped());
        handle.stop();
        assert!(control.is_stopped());

        let (handle, control) = PlaybackHandle::channel();
        drop(handle);
        assert!(control.is_stopped());
    }

    #[test]
    fn test_decode_wav() {
        let pcm = samples_to_pcm16(&[0.0, 0.5, -0.5, 0.25]);
        let wav = pcm16_to_wav(&pcm, 16000).unwrap();

        let decoded = decode(&SynthesizedAudio {
            data: wav,
            content_type: "audio/wav".to_string(),
        })
        .unwrap();

        assert_eq!(decoded.sample_rate, 16000);
        assert_eq!(decoded.samples.len(), 4);
        assert!((decoded.samples[1] - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_decode_garbage_mp3_is_empty_or_error() {
        // minimp3 skips non-frame bytes until EOF
        let decoded = decode_mp3(&[0u8; 64]);
        assert!(decoded.map(|d| d.samples.is_empty()).unwrap_or(true));
    }

    #[test]
    fn test_sine_tone_length() {
        let tone = sine_tone(440.0, Duration::from_millis(500), 24000);
        assert_eq!(tone.samples.len(), 12000);
        assert!(tone.samples.iter().all(|s| s.abs() <= 0.3));
    }

    #[test]
    fn test_empty_samples_rejected() {
        let mut speaker = CpalSpeaker::new();
        let result = speaker.play_samples(DecodedAudio {
            samples: Vec::new(),
            sample_rate: 24000,
        });
        assert!(result.is_err());
    }
}
