//! Recording container negotiation
//!
//! Downstream components only ever see [`Encoding::content_type`]; the enum
//! exists so capture can pick the best format a microphone supports.

use std::fmt;

/// Container/codec a recording can be produced in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// Opus in a `WebM` container
    WebmOpus,
    /// `WebM` with the platform's default codec
    Webm,
    /// MPEG-4 audio
    Mp4,
    /// 16-bit PCM in a RIFF/WAVE container
    Wav,
}

impl Encoding {
    /// Ordered preference list, best first
    pub const PREFERENCE: [Self; 3] = [Self::WebmOpus, Self::Webm, Self::Mp4];

    /// MIME content type handed to transcription
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::WebmOpus => "audio/webm;codecs=opus",
            Self::Webm => "audio/webm",
            Self::Mp4 => "audio/mp4",
            Self::Wav => "audio/wav",
        }
    }

    /// Pick the first preferred encoding the device supports, falling back
    /// to the platform default when none match
    #[must_use]
    pub fn negotiate(supports: impl Fn(Self) -> bool, platform_default: Self) -> Self {
        Self::PREFERENCE
            .into_iter()
            .find(|&encoding| supports(encoding))
            .unwrap_or(platform_default)
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.content_type())
    }
}
