//! End-of-utterance detection
//!
//! Energy is sampled at a fixed interval while recording. Each sample below
//! the threshold bumps a consecutive-quiet counter; any louder sample resets
//! it. Once the counter passes the configured tick count the utterance is
//! considered finished.

/// Default RMS level below which a sample counts as silence
pub const DEFAULT_SILENCE_THRESHOLD: f32 = 0.02;

/// Consecutive-low-energy counter
#[derive(Debug, Clone)]
pub struct SilenceDetector {
    threshold: f32,
    max_quiet_ticks: u32,
    quiet_ticks: u32,
    heard_speech: bool,
}

impl SilenceDetector {
    /// Create a detector that fires after more than `max_quiet_ticks`
    /// consecutive samples below `threshold`
    #[must_use]
    pub const fn new(threshold: f32, max_quiet_ticks: u32) -> Self {
        Self {
            threshold,
            max_quiet_ticks,
            quiet_ticks: 0,
            heard_speech: false,
        }
    }

    /// Feed one energy sample
    ///
    /// Returns true once the end of the utterance has been reached
    pub fn observe(&mut self, level: f32) -> bool {
        if level < self.threshold {
            self.quiet_ticks = self.quiet_ticks.saturating_add(1);
        } else {
            self.quiet_ticks = 0;
            self.heard_speech = true;
        }

        tracing::trace!(level, quiet_ticks = self.quiet_ticks, "silence check");

        self.quiet_ticks > self.max_quiet_ticks
    }

    /// Number of consecutive quiet samples seen so far
    #[must_use]
    pub const fn quiet_ticks(&self) -> u32 {
        self.quiet_ticks
    }

    /// Whether any sample has crossed the threshold
    #[must_use]
    pub const fn heard_speech(&self) -> bool {
        self.heard_speech
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_calculation() {
        let silence = vec![0.0f32; 100];
        assert!(rms(&silence) < 0.001);

        let loud = vec![0.5f32; 100];
        assert!(rms(&loud) > 0.4);

        assert!(rms(&[]) < f32::EPSILON);
    }

    #[test]
    fn test_fires_after_threshold_exceeded() {
        let mut detector = SilenceDetector::new(0.02, 7);

        for _ in 0..7 {
            assert!(!detector.observe(0.0));
        }
        assert!(detector.observe(0.0));
    }

    #[test]
    fn test_speech_resets_counter() {
        let mut detector = SilenceDetector::new(0.02, 3);

        detector.observe(0.0);
        detector.observe(0.0);
        detector.observe(0.0);
        assert_eq!(detector.quiet_ticks(), 3);

        assert!(!detector.observe(0.3));
        assert_eq!(detector.quiet_ticks(), 0);
        assert!(detector.heard_speech());

        for _ in 0..3 {
            assert!(!detector.observe(0.001));
        }
        assert!(detector.observe(0.001));
    }
}
