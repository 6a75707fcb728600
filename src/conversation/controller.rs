//! Turn-taking controller
//!
//! A single task drives the session through
//! `Idle → Listening → Processing → Speaking → Listening … → Idle`.
//! Every await is raced against session cancellation and the plan's duration
//! deadline, so ending the session drops whatever capture, request or
//! playback is in flight. The controller is the only writer of
//! [`ControllerState`] and the only caller of [`CaptureUnit::start`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::history::{Role, SessionHistory};
use super::state::{ControllerState, EndReason, SessionEvent};
use crate::config::TurnConfig;
use crate::store::{LimitsProvider, PlanTier, SessionRecord, SessionStore, SubscriptionLimits};
use crate::voice::{
    AudioBlob, CaptureError, CaptureUnit, Microphone, ResponseGenerator, SpeechEnd,
    SpeechOutcome, SpeechSynthesizer, StopReason, TranscriptionClient, TranscriptionError,
};

/// Shown when the microphone cannot be opened
pub const MIC_REQUIRED_MESSAGE: &str =
    "Microphone access is required for speech input. Please allow microphone access and try again.";

const EVENT_CAPACITY: usize = 256;

/// Period of [`SessionEvent::Remaining`] updates
const COUNTDOWN_PERIOD: Duration = Duration::from_secs(1);

/// Notices sent when the remaining time crosses each mark
const TIME_WARNINGS: [(Duration, &str); 2] = [
    (Duration::from_secs(60), "1 minute of session time remaining"),
    (Duration::from_secs(30), "30 seconds of session time remaining"),
];

/// Units the controller sequences
pub struct Collaborators<M> {
    pub capture: CaptureUnit<M>,
    pub transcriber: TranscriptionClient,
    pub generator: ResponseGenerator,
    pub synthesizer: SpeechSynthesizer,
    pub store: Arc<dyn SessionStore>,
    pub limits: Arc<dyn LimitsProvider>,
}

/// Result of [`TurnController::run`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The session ran and ended
    Completed {
        reason: EndReason,
        /// Persisted record identifier, if saved
        session_id: Option<String>,
        turns: usize,
    },
    /// Usage limit reached; carries the user-facing message
    Blocked(String),
}

/// Commands and observation for a running session
#[derive(Clone)]
pub struct SessionHandle {
    cancel: CancellationToken,
    stop_listening: Arc<Notify>,
    mute: Arc<watch::Sender<bool>>,
    state: watch::Receiver<ControllerState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    /// End the session; safe to call more than once
    pub fn end(&self) {
        self.cancel.cancel();
    }

    /// End the current utterance now
    pub fn stop_listening(&self) {
        self.stop_listening.notify_waiters();
    }

    /// Flip mute; returns the new value
    pub fn toggle_mute(&self) -> bool {
        let mut muted = false;
        self.mute.send_modify(|m| {
            *m = !*m;
            muted = *m;
        });
        muted
    }

    /// Whether replies are muted
    #[must_use]
    pub fn is_muted(&self) -> bool {
        *self.mute.borrow()
    }

    /// Current controller state
    #[must_use]
    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// Next action of the loop
enum Step {
    Greet,
    Listen,
    Resume(Duration),
    End(EndReason),
}

/// Races work against session end
#[derive(Clone)]
struct Guard {
    cancel: CancellationToken,
    deadline: Instant,
}

impl Guard {
    async fn run<T>(&self, fut: impl Future<Output = T>) -> Result<T, EndReason> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(EndReason::Ended),
            () = tokio::time::sleep_until(self.deadline) => Err(EndReason::DurationLimit),
            out = fut => Ok(out),
        }
    }
}

/// Turn-taking state machine for one session
pub struct TurnController<M> {
    turn: TurnConfig,
    capture: CaptureUnit<M>,
    transcriber: TranscriptionClient,
    generator: ResponseGenerator,
    synthesizer: SpeechSynthesizer,
    store: Arc<dyn SessionStore>,
    limits: Arc<dyn LimitsProvider>,
    state: ControllerState,
    history: SessionHistory,
    state_tx: watch::Sender<ControllerState>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    stop_listening: Arc<Notify>,
    mute_tx: Arc<watch::Sender<bool>>,
    mute_rx: watch::Receiver<bool>,
    started_at: DateTime<Utc>,
    deadline: Instant,
}

impl<M: Microphone> TurnController<M> {
    /// Create a controller in the `Idle` state
    #[must_use]
    pub fn new(turn: TurnConfig, parts: Collaborators<M>) -> Self {
        let (state_tx, _) = watch::channel(ControllerState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (mute_tx, mute_rx) = watch::channel(false);

        Self {
            turn,
            capture: parts.capture,
            transcriber: parts.transcriber,
            generator: parts.generator,
            synthesizer: parts.synthesizer,
            store: parts.store,
            limits: parts.limits,
            state: ControllerState::Idle,
            history: SessionHistory::new(),
            state_tx,
            events,
            cancel: CancellationToken::new(),
            stop_listening: Arc::new(Notify::new()),
            mute_tx: Arc::new(mute_tx),
            mute_rx,
            started_at: Utc::now(),
            deadline: Instant::now(),
        }
    }

    /// Handle for commands and events
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            cancel: self.cancel.clone(),
            stop_listening: Arc::clone(&self.stop_listening),
            mute: Arc::clone(&self.mute_tx),
            state: self.state_tx.subscribe(),
            events: self.events.clone(),
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ControllerState {
        self.state
    }

    /// Run the session until it ends
    ///
    /// Reads limits once; refuses to start when usage is exhausted.
    pub async fn run(mut self) -> SessionOutcome {
        let limits = match self.limits.limits().await {
            Ok(limits) => limits,
            Err(e) => {
                tracing::warn!(error = %e, "subscription limits unavailable, applying free plan duration");
                SubscriptionLimits::for_tier(PlanTier::Free, 0)
            }
        };

        if limits.exhausted() {
            let message = limits.blocking_message();
            tracing::info!(
                tier = %limits.tier,
                sessions_used = limits.sessions_used,
                "session refused, usage limit reached"
            );
            self.emit(SessionEvent::Notice(message.clone()));
            return SessionOutcome::Blocked(message);
        }

        let now = Instant::now();
        self.started_at = Utc::now();
        self.deadline = now + limits.session_duration_limit;

        tracing::info!(
            tier = %limits.tier,
            sessions_remaining = limits.sessions_remaining(),
            duration_limit_secs = limits.session_duration_limit.as_secs(),
            "session started"
        );

        tokio::spawn(countdown(
            self.events.clone(),
            now,
            self.deadline,
            self.cancel.clone(),
        ));

        let reason = self.drive().await;
        self.finish(reason).await
    }

    async fn drive(&mut self) -> EndReason {
        let mut step = Step::Greet;
        loop {
            step = match step {
                Step::Greet => self.greet().await,
                Step::Listen => self.listen().await,
                Step::Resume(delay) => self.resume(delay).await,
                Step::End(reason) => return reason,
            };
        }
    }

    fn guard(&self) -> Guard {
        Guard {
            cancel: self.cancel.clone(),
            deadline: self.deadline,
        }
    }

    async fn greet(&mut self) -> Step {
        let greeting = self.turn.greeting.clone();

        let turn = self.history.append(Role::Assistant, greeting.as_str()).clone();
        self.emit(SessionEvent::Greeting(turn));

        // The greeting plays while still Idle; the first transition is Idle → Listening
        self.say(&greeting, false).await
    }

    async fn listen(&mut self) -> Step {
        let guard = self.guard();

        let mut recording = match self.capture.start() {
            Ok(recording) => recording,
            Err(e) => {
                tracing::warn!(kind = "mic_unavailable", error = %e, "microphone could not be opened");
                return Step::End(EndReason::MicUnavailable(e.to_string()));
            }
        };

        self.transition(ControllerState::Listening);

        let stop = Arc::clone(&self.stop_listening);
        let ended = guard
            .run(async {
                tokio::select! {
                    reason = recording.wait_for_end() => reason,
                    () = stop.notified() => StopReason::Manual,
                }
            })
            .await;

        let stop_reason = match ended {
            Ok(reason) => reason,
            Err(end) => {
                drop(recording);
                return Step::End(end);
            }
        };
        tracing::debug!(reason = ?stop_reason, "utterance ended");

        match recording.stop() {
            Ok(blob) => self.process(blob).await,
            Err(CaptureError::EmptyRecording { bytes }) => {
                tracing::debug!(bytes, "nothing said, resuming listening");
                Step::Resume(self.turn.empty_recording_delay)
            }
            Err(e) => {
                tracing::warn!(kind = "capture", error = %e, "recording failed, resuming listening");
                Step::Resume(self.turn.error_retry_delay)
            }
        }
    }

    async fn process(&mut self, blob: AudioBlob) -> Step {
        let guard = self.guard();
        self.transition(ControllerState::Processing);

        let transcribed = match guard.run(self.transcriber.transcribe(&blob)).await {
            Ok(result) => result,
            Err(reason) => return Step::End(reason),
        };
        drop(blob);

        let text = match transcribed {
            Ok(text) => text,
            Err(e) => {
                let delay = match e {
                    TranscriptionError::EmptyTranscript => self.turn.empty_transcript_delay,
                    TranscriptionError::Timeout(_) | TranscriptionError::ServiceError(_) => {
                        self.turn.error_retry_delay
                    }
                };
                tracing::warn!(kind = e.kind(), error = %e, "transcription failed, resuming listening");
                return Step::Resume(delay);
            }
        };

        let prior = self.history.len();
        let turn = self.history.append(Role::User, text.as_str()).clone();
        self.emit(SessionEvent::UserTurn(turn));

        let reply = match guard
            .run(self.generator.generate(&text, &self.history.turns()[..prior]))
            .await
        {
            Ok(reply) => reply,
            Err(reason) => return Step::End(reason),
        };

        let turn = self.history.append(Role::Assistant, reply.text.as_str()).clone();
        self.emit(SessionEvent::Reply {
            turn,
            source: reply.source,
        });

        self.say(&reply.text, true).await
    }

    async fn say(&mut self, text: &str, enter_speaking: bool) -> Step {
        let guard = self.guard();

        self.synthesizer.set_muted(*self.mute_rx.borrow_and_update());
        let mut speech = match guard.run(self.synthesizer.speak(text)).await {
            Ok(speech) => speech,
            Err(reason) => return Step::End(reason),
        };

        // Flip to Speaking in the same step playback starts
        if enter_speaking {
            self.transition(ControllerState::Speaking);
        }
        let outcome = speech.outcome();

        let mute = &mut self.mute_rx;
        let ended = guard
            .run(async {
                loop {
                    tokio::select! {
                        end = speech.finished() => break (end, false),
                        changed = mute.changed() => {
                            if changed.is_err() {
                                break (speech.finished().await, false);
                            }
                            if *mute.borrow_and_update() {
                                speech.stop();
                                break (SpeechEnd::Completed, true);
                            }
                        }
                    }
                }
            })
            .await;

        let (end, muted) = match ended {
            Ok(ended) => ended,
            Err(reason) => {
                speech.stop();
                return Step::End(reason);
            }
        };

        if muted {
            tracing::debug!("muted during reply, speech stopped");
            return Step::Resume(self.turn.post_speech_delay);
        }

        Step::Resume(self.delay_after(outcome, &end))
    }

    async fn resume(&mut self, delay: Duration) -> Step {
        match self.guard().run(tokio::time::sleep(delay)).await {
            Ok(()) => Step::Listen,
            Err(reason) => Step::End(reason),
        }
    }

    fn delay_after(&self, outcome: SpeechOutcome, end: &SpeechEnd) -> Duration {
        if let SpeechEnd::Failed(e) = end {
            tracing::warn!(kind = "playback", error = %e, "playback failed, resuming listening");
        }

        match outcome {
            SpeechOutcome::Audio => self.turn.post_speech_delay,
            SpeechOutcome::Local | SpeechOutcome::TextOnly => self.turn.local_speech_delay,
        }
    }

    async fn finish(mut self, reason: EndReason) -> SessionOutcome {
        self.cancel.cancel();
        self.synthesizer.stop();
        self.transition(ControllerState::Idle);

        if let EndReason::MicUnavailable(detail) = &reason {
            tracing::warn!(error = %detail, "session ended, microphone unavailable");
            self.emit(SessionEvent::Error(MIC_REQUIRED_MESSAGE.to_string()));
        }

        let record = SessionRecord {
            started_at: self.started_at,
            ended_at: Utc::now(),
            turns: self.history.take(),
        };
        let turns = record.turns.len();

        let session_id = if record.turns.is_empty() {
            None
        } else {
            self.flush(&record).await
        };

        tracing::info!(reason = ?reason, turns, session_id = ?session_id, "session ended");

        self.emit(SessionEvent::Ended {
            reason: reason.clone(),
            session_id: session_id.clone(),
            turns,
        });

        SessionOutcome::Completed {
            reason,
            session_id,
            turns,
        }
    }

    async fn flush(&self, record: &SessionRecord) -> Option<String> {
        let id = match self.store.save(record).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "failed to save session");
                return None;
            }
        };

        if let Err(e) = self.limits.record_session().await {
            tracing::warn!(error = %e, "failed to record session usage");
        }

        Some(id)
    }

    fn transition(&mut self, to: ControllerState) {
        let from = self.state;
        if from == to {
            return;
        }

        self.state = to;
        self.state_tx.send_replace(to);
        tracing::debug!(from = %from, to = %to, "state transition");

        self.emit(SessionEvent::Status {
            state: to,
            remaining: self.remaining(),
        });
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Publish the remaining session time every second and warn near the end
///
/// Runs beside the controller until the session is cancelled or the
/// deadline passes.
async fn countdown(
    events: broadcast::Sender<SessionEvent>,
    started: Instant,
    deadline: Instant,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(started + COUNTDOWN_PERIOD, COUNTDOWN_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut previous = deadline.saturating_duration_since(started);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let _ = events.send(SessionEvent::Remaining(remaining));

        for (mark, message) in TIME_WARNINGS {
            if previous > mark && remaining <= mark {
                tracing::info!(remaining_secs = remaining.as_secs(), "session time running out");
                let _ = events.send(SessionEvent::Notice(message.to_string()));
            }
        }

        if remaining.is_zero() {
            return;
        }
        previous = remaining;
    }
}
