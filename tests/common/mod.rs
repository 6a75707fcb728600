//! Shared test utilities
//!
//! Scripted stand-ins for the microphone, speech services, speaker and
//! persistence so the turn controller can run without hardware or network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use haven::config::TurnConfig;
use haven::conversation::{Collaborators, ControllerState, SessionEvent, SessionHandle, TurnController};
use haven::store::{self, LimitsProvider, PlanTier, SessionRecord, SessionStore, SubscriptionLimits};
use haven::voice::capture::CaptureConstraints;
use haven::voice::llm::GenerationRequest;
use haven::voice::{
    AudioSink, CaptureError, CaptureSettings, CaptureUnit, Encoding, InputStream, LocalVoice,
    Microphone, PlaybackHandle, ReplyModel, ResponseGenerator, SpeechRecognizer, SpeechService,
    SpeechSynthesizer, SynthesizedAudio, Transcript, TranscriptionClient, TranscriptionRequest,
};
use haven::{DbPool, Error, Result};

/// Encoded bytes a fake stream produces per millisecond of speech
pub const BYTES_PER_MS: usize = 4;

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    store::init_memory().expect("failed to init test db")
}

/// What the fake microphone does on its next `open`
#[derive(Debug, Clone, Copy)]
pub enum Utterance {
    /// Loud input for the given time, then silence
    Speech(Duration),
    /// Silence from the start
    Silence,
    /// Device refuses to open
    Denied,
}

/// Device open/release counters
#[derive(Debug, Clone, Default)]
pub struct MicStats {
    pub opened: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
}

impl MicStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

/// Microphone that plays back a script of utterances
#[derive(Debug, Default)]
pub struct FakeMicrophone {
    script: VecDeque<Utterance>,
    stats: MicStats,
}

impl FakeMicrophone {
    pub fn new(script: impl IntoIterator<Item = Utterance>) -> Self {
        Self {
            script: script.into_iter().collect(),
            stats: MicStats::default(),
        }
    }

    pub fn stats(&self) -> MicStats {
        self.stats.clone()
    }
}

impl Microphone for FakeMicrophone {
    fn supports(&self, encoding: Encoding) -> bool {
        encoding == Encoding::WebmOpus
    }

    fn platform_encoding(&self) -> Encoding {
        Encoding::Mp4
    }

    fn open(
        &mut self,
        _constraints: &CaptureConstraints,
        _encoding: Encoding,
    ) -> std::result::Result<Box<dyn InputStream>, CaptureError> {
        let speech = match self.script.pop_front().unwrap_or(Utterance::Silence) {
            Utterance::Speech(length) => length,
            Utterance::Silence => Duration::ZERO,
            Utterance::Denied => {
                return Err(CaptureError::MicUnavailable("permission denied".to_string()));
            }
        };

        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeStream {
            opened_at: Instant::now(),
            speech,
            delivered: Duration::ZERO,
            released: Arc::clone(&self.stats.released),
        }))
    }
}

struct FakeStream {
    opened_at: Instant,
    speech: Duration,
    delivered: Duration,
    released: Arc<AtomicUsize>,
}

impl InputStream for FakeStream {
    fn level(&self) -> f32 {
        if self.opened_at.elapsed() < self.speech {
            0.3
        } else {
            0.0
        }
    }

    fn read_chunk(&mut self) -> Option<Vec<u8>> {
        let spoken = self.opened_at.elapsed().min(self.speech);
        let fresh = spoken.saturating_sub(self.delivered);
        if fresh.is_zero() {
            return None;
        }
        self.delivered = spoken;
        let bytes = usize::try_from(fresh.as_millis()).unwrap_or(usize::MAX) * BYTES_PER_MS;
        Some(vec![0x5a; bytes])
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Recognizer answering from a queue of `(delay, result)` pairs
#[derive(Default)]
pub struct FakeRecognizer {
    responses: Mutex<VecDeque<(Duration, std::result::Result<String, String>)>>,
    calls: AtomicUsize,
}

impl FakeRecognizer {
    pub fn push(&self, delay: Duration, result: std::result::Result<&str, &str>) {
        self.responses
            .lock()
            .unwrap()
            .push_back((delay, result.map(str::to_string).map_err(str::to_string)));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechRecognizer for FakeRecognizer {
    async fn recognize(&self, _request: TranscriptionRequest<'_>) -> Result<Transcript> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().unwrap().pop_front();
        let (delay, result) = next.unwrap_or((Duration::ZERO, Err("no scripted transcript".to_string())));

        tokio::time::sleep(delay).await;
        match result {
            Ok(text) => Ok(Transcript {
                text,
                confidence: Some(0.92),
            }),
            Err(e) => Err(Error::Stt(e)),
        }
    }
}

/// Reply model with a fixed answer that records what it was sent
pub struct FakeModel {
    reply: Mutex<std::result::Result<String, String>>,
    delay: Duration,
    messages: Mutex<Vec<String>>,
    history_lens: Mutex<Vec<usize>>,
}

impl FakeModel {
    pub fn replying(text: &str) -> Self {
        Self::with_result(Ok(text.to_string()), Duration::from_millis(300))
    }

    pub fn failing(error: &str) -> Self {
        Self::with_result(Err(error.to_string()), Duration::from_millis(300))
    }

    pub fn with_result(reply: std::result::Result<String, String>, delay: Duration) -> Self {
        Self {
            reply: Mutex::new(reply),
            delay,
            messages: Mutex::new(Vec::new()),
            history_lens: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn history_lens(&self) -> Vec<usize> {
        self.history_lens.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplyModel for FakeModel {
    async fn generate(&self, request: GenerationRequest<'_>) -> Result<String> {
        self.messages.lock().unwrap().push(request.message.to_string());
        self.history_lens.lock().unwrap().push(request.history.len());

        tokio::time::sleep(self.delay).await;
        self.reply.lock().unwrap().clone().map_err(Error::Llm)
    }
}

/// Synthesis service that succeeds with a small MP3-typed payload or fails
pub struct FakeService {
    fail: Option<String>,
    calls: AtomicUsize,
}

impl FakeService {
    pub const fn working() -> Self {
        Self {
            fail: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            fail: Some(error.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechService for FakeService {
    async fn synthesize(&self, _text: &str) -> Result<SynthesizedAudio> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        match &self.fail {
            Some(e) => Err(Error::Tts(e.clone())),
            None => Ok(SynthesizedAudio {
                data: vec![0xff; 64],
                content_type: "audio/mpeg".to_string(),
            }),
        }
    }
}

/// Playback counters shared by the fake sink and voice
#[derive(Debug, Clone, Default)]
pub struct PlayStats {
    pub started: Arc<AtomicUsize>,
    pub stopped: Arc<AtomicUsize>,
    pub active: Arc<AtomicUsize>,
}

impl PlayStats {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// A handle that finishes after `length` unless stopped first
    ///
    /// With `fail_after` set below `length`, playback reports a device
    /// error at that point instead.
    fn start(&self, length: Duration, fail_after: Option<Duration>) -> PlaybackHandle {
        let (handle, control) = PlaybackHandle::channel();
        self.started.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);

        let (play_for, result) = match fail_after {
            Some(at) if at < length => (at, Err("output device disconnected".to_string())),
            _ => (length, Ok(())),
        };

        let stats = self.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                () = tokio::time::sleep(play_for) => result,
                () = control.stopped() => {
                    stats.stopped.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            };
            stats.active.fetch_sub(1, Ordering::SeqCst);
            control.finish(result);
        });

        handle
    }
}

/// Speaker that "plays" for a fixed time
pub struct FakeSink {
    pub length: Duration,
    /// Fail playback this far in
    pub fail_after: Option<Duration>,
    pub stats: PlayStats,
}

impl AudioSink for FakeSink {
    fn play(&mut self, _audio: &SynthesizedAudio) -> Result<PlaybackHandle> {
        Ok(self.stats.start(self.length, self.fail_after))
    }
}

/// On-device voice that "speaks" for a fixed time
pub struct FakeVoice {
    pub length: Duration,
    pub stats: PlayStats,
}

impl LocalVoice for FakeVoice {
    fn speak(&mut self, _text: &str) -> Result<PlaybackHandle> {
        Ok(self.stats.start(self.length, None))
    }
}

/// Session store keeping records in memory
#[derive(Default)]
pub struct MemoryStore {
    pub fail: bool,
    records: Mutex<Vec<SessionRecord>>,
}

impl MemoryStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<SessionRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn saves(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save(&self, record: &SessionRecord) -> Result<String> {
        if self.fail {
            return Err(Error::Database("disk full".to_string()));
        }
        let mut records = self.records.lock().unwrap();
        records.push(record.clone());
        Ok(format!("session-{}", records.len()))
    }
}

/// Limits with a settable session length
pub struct FakeLimits {
    limits: Option<SubscriptionLimits>,
    recorded: AtomicUsize,
}

impl FakeLimits {
    pub const fn new(limits: SubscriptionLimits) -> Self {
        Self {
            limits: Some(limits),
            recorded: AtomicUsize::new(0),
        }
    }

    /// Limits that cannot be read
    pub const fn unavailable() -> Self {
        Self {
            limits: None,
            recorded: AtomicUsize::new(0),
        }
    }

    pub fn recorded(&self) -> usize {
        self.recorded.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LimitsProvider for FakeLimits {
    async fn limits(&self) -> Result<SubscriptionLimits> {
        self.limits
            .clone()
            .ok_or_else(|| Error::Database("subscription table locked".to_string()))
    }

    async fn record_session(&self) -> Result<()> {
        self.recorded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Builder wiring fakes into a controller
pub struct Harness {
    pub turn: TurnConfig,
    pub script: Vec<Utterance>,
    pub stt_timeout: Duration,
    pub llm_timeout: Duration,
    pub tts_timeout: Duration,
    pub recognizer: Arc<FakeRecognizer>,
    pub model: Arc<FakeModel>,
    pub service: Option<Arc<FakeService>>,
    pub local_voice: bool,
    pub playback_length: Duration,
    /// Speaker fails this far into each playback
    pub playback_failure: Option<Duration>,
    pub store: Arc<MemoryStore>,
    pub limits: Arc<FakeLimits>,
    /// Replaces `store` and `limits` when set
    pub backend: Option<(Arc<dyn SessionStore>, Arc<dyn LimitsProvider>)>,
    pub mic: MicStats,
    pub sink: PlayStats,
    pub voice: PlayStats,
}

impl Harness {
    /// Working services, free plan, no on-device voice
    pub fn new() -> Self {
        Self {
            turn: TurnConfig::default(),
            script: Vec::new(),
            stt_timeout: Duration::from_secs(7),
            llm_timeout: Duration::from_secs(8),
            tts_timeout: Duration::from_secs(5),
            recognizer: Arc::new(FakeRecognizer::default()),
            model: Arc::new(FakeModel::replying("That sounds really hard. I'm here with you.")),
            service: Some(Arc::new(FakeService::working())),
            local_voice: false,
            playback_length: Duration::from_secs(1),
            playback_failure: None,
            store: Arc::new(MemoryStore::default()),
            limits: Arc::new(FakeLimits::new(SubscriptionLimits::for_tier(PlanTier::Free, 0))),
            backend: None,
            mic: MicStats::default(),
            sink: PlayStats::default(),
            voice: PlayStats::default(),
        }
    }

    pub fn controller(&mut self) -> TurnController<FakeMicrophone> {
        let mic = FakeMicrophone::new(self.script.drain(..));
        self.mic = mic.stats();

        let service = self
            .service
            .clone()
            .map(|s| s as Arc<dyn SpeechService>);
        let local = self.local_voice.then(|| {
            Box::new(FakeVoice {
                length: self.playback_length,
                stats: self.voice.clone(),
            }) as Box<dyn LocalVoice>
        });
        let sink = Box::new(FakeSink {
            length: self.playback_length,
            fail_after: self.playback_failure,
            stats: self.sink.clone(),
        });

        let (store, limits) = self.backend.clone().unwrap_or_else(|| {
            (
                Arc::clone(&self.store) as Arc<dyn SessionStore>,
                Arc::clone(&self.limits) as Arc<dyn LimitsProvider>,
            )
        });

        let parts = Collaborators {
            capture: CaptureUnit::new(mic, CaptureSettings::from(&self.turn)),
            transcriber: TranscriptionClient::new(
                Arc::clone(&self.recognizer) as Arc<dyn SpeechRecognizer>,
                self.stt_timeout,
                "en-US",
            ),
            generator: ResponseGenerator::new(
                Arc::clone(&self.model) as Arc<dyn ReplyModel>,
                self.llm_timeout,
                self.turn.history_window,
            ),
            synthesizer: SpeechSynthesizer::new(service, local, sink, self.tts_timeout),
            store,
            limits,
        };

        TurnController::new(self.turn.clone(), parts)
    }
}

/// Record events until the session ends
///
/// `on_event` sees each event as it arrives; returning true ends the
/// session. Events are stamped with the (paused) clock.
pub async fn drive(
    handle: &SessionHandle,
    events: &mut broadcast::Receiver<SessionEvent>,
    mut on_event: impl FnMut(&SessionEvent, &SessionHandle) -> bool,
) -> Vec<(Instant, SessionEvent)> {
    let mut seen = Vec::new();
    while let Ok(event) = events.recv().await {
        let ended = matches!(event, SessionEvent::Ended { .. });
        if !ended && on_event(&event, handle) {
            handle.end();
        }
        seen.push((Instant::now(), event));
        if ended {
            break;
        }
    }
    seen
}

/// End the session once the controller enters `Listening` for the `n`th time
pub fn end_on_listening(n: usize) -> impl FnMut(&SessionEvent, &SessionHandle) -> bool {
    let mut count = 0;
    move |event, _| {
        if matches!(
            event,
            SessionEvent::Status {
                state: ControllerState::Listening,
                ..
            }
        ) {
            count += 1;
        }
        count >= n
    }
}

/// State sequence reported through status events
pub fn states(events: &[(Instant, SessionEvent)]) -> Vec<ControllerState> {
    events
        .iter()
        .filter_map(|(_, event)| match event {
            SessionEvent::Status { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

/// Time of the first status event entering `state` after `from`
pub fn entered(events: &[(Instant, SessionEvent)], state: ControllerState, from: usize) -> Option<(usize, Instant)> {
    events
        .iter()
        .enumerate()
        .skip(from)
        .find_map(|(i, (at, event))| match event {
            SessionEvent::Status { state: s, .. } if *s == state => Some((i, *at)),
            _ => None,
        })
}
