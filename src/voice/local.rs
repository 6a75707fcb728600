//! On-device speech synthesis
//!
//! Speaks text directly through a system TTS binary without producing a
//! transportable audio asset.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use super::playback::PlaybackHandle;
use crate::Result;

/// System TTS binaries, in preference order
const CANDIDATES: [&str; 3] = ["say", "espeak-ng", "espeak"];

/// Speaks text on the local device
pub trait LocalVoice {
    /// Start speaking `text`
    ///
    /// # Errors
    ///
    /// Returns error if the synthesizer cannot be started
    fn speak(&mut self, text: &str) -> Result<PlaybackHandle>;
}

/// A system TTS binary found on `PATH`
#[derive(Debug, Clone)]
pub struct SystemVoice {
    program: PathBuf,
}

impl SystemVoice {
    /// Find the first available system synthesizer
    #[must_use]
    pub fn detect() -> Option<Self> {
        let found = CANDIDATES
            .iter()
            .find_map(|name| which::which(name).ok())
            .map(|program| Self { program });

        match &found {
            Some(voice) => tracing::debug!(program = %voice.program.display(), "on-device voice found"),
            None => tracing::debug!("no on-device voice available"),
        }

        found
    }

    /// Use a specific synthesizer binary
    #[must_use]
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Path of the synthesizer binary
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl LocalVoice for SystemVoice {
    fn speak(&mut self, text: &str) -> Result<PlaybackHandle> {
        // Text starting with '-' must not be read as an option
        let mut child = tokio::process::Command::new(&self.program)
            .arg("--")
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        tracing::debug!(program = %self.program.display(), chars = text.len(), "on-device speech started");

        let (handle, control) = PlaybackHandle::channel();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => Some(status),
                () = control.stopped() => None,
            };

            let result = match status {
                None => {
                    if let Err(e) = child.kill().await {
                        tracing::debug!(error = %e, "on-device speech already exited");
                    }
                    Ok(())
                }
                Some(Ok(status)) if status.success() => Ok(()),
                Some(Ok(status)) => Err(format!("on-device speech exited with {status}")),
                Some(Err(e)) => Err(e.to_string()),
            };

            control.finish(result);
        });

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_program_fails_to_start() {
        let mut voice = SystemVoice::with_program("/nonexistent/haven-voice");
        assert!(voice.speak("hello").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_process() {
        // `sleep` takes the text as a duration
        let mut voice = SystemVoice::with_program("sleep");
        let mut handle = voice.speak("30").unwrap();
        handle.stop();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle.wait()).await;
        assert_eq!(result.ok(), Some(Ok(())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_text_passed_after_option_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("args");
        let script = dir.path().join("voice.sh");
        std::fs::write(
            &script,
            format!("#!/bin/sh\nprintf '%s|' \"$@\" > {}\n", out.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::os::unix::fs::PermissionsExt::from_mode(0o755))
            .unwrap();

        let mut voice = SystemVoice::with_program(&script);
        let mut handle = voice.speak("-v is not a flag").unwrap();
        assert_eq!(handle.wait().await, Ok(()));

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "--|-v is not a flag|");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_completion_reported() {
        let mut voice = SystemVoice::with_program("true");
        let mut handle = voice.speak("ignored").unwrap();
        assert_eq!(handle.wait().await, Ok(()));
    }
}
