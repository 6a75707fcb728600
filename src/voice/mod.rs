//! Voice processing module
//!
//! Capture with silence detection, transcription, reply generation, speech
//! synthesis and playback. Each network-facing unit sits behind a trait so
//! vendor adapters can be swapped.

pub mod capture;
pub mod encoding;
pub mod llm;
pub mod local;
pub mod playback;
pub mod silence;
pub mod stt;
pub mod tts;

pub use capture::{
    AudioBlob, CaptureConstraints, CaptureError, CaptureSettings, CaptureUnit, CpalMicrophone,
    InputStream, Microphone, Recording, RecordingBuffer, SAMPLE_RATE, StopReason,
};
pub use encoding::Encoding;
pub use llm::{
    FALLBACK_REPLIES, GeminiModel, GenerationRequest, Reply, ReplyModel, ReplySource,
    ResponseGenerator, fallback_reply,
};
pub use local::{LocalVoice, SystemVoice};
pub use playback::{AudioSink, CpalSpeaker, PlaybackControl, PlaybackHandle};
pub use silence::SilenceDetector;
pub use stt::{
    GoogleSpeech, SpeechRecognizer, Transcript, TranscriptionClient, TranscriptionError,
    TranscriptionRequest, Whisper,
};
pub use tts::{
    GoogleTts, OpenAiTts, Speech, SpeechEnd, SpeechOutcome, SpeechService, SpeechSynthesizer,
    SynthesizedAudio,
};
