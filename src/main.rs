use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use haven::config::Config;
use haven::conversation::{Collaborators, EndReason, SessionEvent, SessionHandle};
use haven::store::{self, PlanTier, SqliteLimits, SqliteSessionStore};
use haven::voice::capture::CaptureSettings;
use haven::voice::playback::sine_tone;
use haven::voice::{
    CaptureUnit, CpalMicrophone, CpalSpeaker, ReplySource, ResponseGenerator, SpeechSynthesizer,
    TranscriptionClient,
};
use haven::{SessionOutcome, TurnController};

/// Haven - Voice-driven conversational companion
#[derive(Parser)]
#[command(name = "haven", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Start a spoken session (default)
    Talk,
    /// List past sessions or show one transcript
    History {
        /// Number of sessions to list
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Session ID to show in full
        #[arg(long)]
        show: Option<String>,
    },
    /// Show plan usage, or switch plan
    Plan {
        /// New plan tier ("free", "plus" or "pro")
        #[arg(long)]
        set: Option<PlanTier>,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity; RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info,haven=info",
        1 => "info,haven=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command.unwrap_or(Command::Talk) {
        Command::Talk => talk().await,
        Command::History { limit, show } => history(limit, show.as_deref()),
        Command::Plan { set } => plan(set),
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::TestTts { text } => test_tts(&text).await,
    }
}

/// Run one spoken session in the terminal
#[allow(clippy::future_not_send)]
async fn talk() -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    let pool = store::init(config.db_path())?;

    let parts = Collaborators {
        capture: CaptureUnit::new(CpalMicrophone::new(), CaptureSettings::from(&config.turn)),
        transcriber: TranscriptionClient::from_config(&config)?,
        generator: ResponseGenerator::from_config(&config)?,
        synthesizer: SpeechSynthesizer::from_config(&config, Box::new(CpalSpeaker::new())),
        store: Arc::new(SqliteSessionStore::new(pool.clone())),
        limits: Arc::new(SqliteLimits::new(pool, config.plan)),
    };

    let controller = TurnController::new(config.turn.clone(), parts);
    let handle = controller.handle();
    let mut events = handle.subscribe();

    let interrupt = tokio::spawn(end_on_ctrl_c(handle.clone()));
    let commands = tokio::spawn(read_commands(handle.clone()));

    println!("Commands: [s]top listening, [m]ute, [q]uit\n");

    let session = controller.run();
    tokio::pin!(session);

    let outcome = loop {
        tokio::select! {
            outcome = &mut session => break outcome,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event display fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
        }
    };

    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }

    interrupt.abort();
    commands.abort();

    match outcome {
        SessionOutcome::Blocked(message) => Err(haven::Error::Limit(message).into()),
        SessionOutcome::Completed { reason, .. } => match reason {
            EndReason::MicUnavailable(detail) => {
                anyhow::bail!("microphone unavailable: {detail}")
            }
            EndReason::Ended | EndReason::DurationLimit => Ok(()),
        },
    }
}

async fn end_on_ctrl_c(handle: SessionHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("interrupt received, ending session");
        handle.end();
    }
}

/// Map terminal lines to session commands
async fn read_commands(handle: SessionHandle) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read command");
                break;
            }
        };

        match line.trim().to_lowercase().as_str() {
            "s" | "stop" => handle.stop_listening(),
            "m" | "mute" => {
                let muted = handle.toggle_mute();
                println!("{}", if muted { "Muted" } else { "Unmuted" });
            }
            "q" | "quit" | "end" => {
                handle.end();
                break;
            }
            "" => {}
            other => println!("Unknown command: {other}"),
        }
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Status { state, remaining } => {
            let secs = remaining.as_secs();
            println!("  · {} ({}:{:02} left)", state.status_text(), secs / 60, secs % 60);
        }
        SessionEvent::Greeting(turn) => println!("Haven: {}", turn.content()),
        SessionEvent::UserTurn(turn) => println!("You:   {}", turn.content()),
        SessionEvent::Reply { turn, source } => match source {
            ReplySource::Model => println!("Haven: {}", turn.content()),
            ReplySource::Fallback => println!("Haven: {} (offline reply)", turn.content()),
        },
        // The status line already shows the remaining time
        SessionEvent::Remaining(_) => {}
        SessionEvent::Notice(message) => println!("{message}"),
        SessionEvent::Error(message) => eprintln!("{message}"),
        SessionEvent::Ended {
            reason,
            session_id,
            turns,
        } => {
            let why = match reason {
                EndReason::Ended => "ended",
                EndReason::DurationLimit => "reached the plan's time limit",
                EndReason::MicUnavailable(_) => "stopped, microphone unavailable",
            };
            println!("\nSession {why} after {turns} turns.");
            if let Some(id) = session_id {
                println!("Saved as {id}");
            }
        }
    }
}

/// List sessions or print one transcript
fn history(limit: usize, show: Option<&str>) -> anyhow::Result<()> {
    let config = Config::load()?;
    let sessions = SqliteSessionStore::new(store::init(config.db_path())?);

    if let Some(id) = show {
        for turn in sessions.turns(id)? {
            println!(
                "[{}] {:>9}: {}",
                turn.timestamp().format("%H:%M:%S"),
                turn.role(),
                turn.content()
            );
        }
        return Ok(());
    }

    let stored = sessions.list(limit)?;
    if stored.is_empty() {
        println!("No sessions yet.");
        return Ok(());
    }

    for session in stored {
        println!(
            "{}  {}  {:>3} min  {:>3} turns  {}",
            session.id,
            session.started_at.format("%Y-%m-%d %H:%M"),
            session.duration_minutes,
            session.turn_count,
            session.summary
        );
    }

    Ok(())
}

/// Show or change the subscription plan
fn plan(set: Option<PlanTier>) -> anyhow::Result<()> {
    let config = Config::load()?;
    let limits = SqliteLimits::new(store::init(config.db_path())?, config.plan);

    let current = match set {
        Some(tier) => limits.set_tier(tier)?,
        None => limits.current(Utc::now())?,
    };

    println!("Plan: {}", current.tier);
    println!(
        "Sessions this month: {}/{} ({} remaining)",
        current.sessions_used,
        current.sessions_limit,
        current.sessions_remaining()
    );
    println!(
        "Session length: {} minutes",
        current.session_duration_limit.as_secs() / 60
    );

    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let settings = CaptureSettings {
        max_duration: Duration::from_secs(duration),
        ..CaptureSettings::default()
    };
    let mut capture = CaptureUnit::new(CpalMicrophone::new(), settings);
    println!("Encoding: {}", capture.encoding());
    println!("---");

    let mut recording = capture.start()?;
    let mut ticker = tokio::time::interval(Duration::from_millis(250));

    while recording.elapsed() < Duration::from_secs(duration) {
        ticker.tick().await;
        let level = recording.level();

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (level * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:4.1}s] RMS: {:.4} | [{}]",
            recording.elapsed().as_secs_f32(),
            level,
            meter
        );
    }

    match recording.stop() {
        Ok(blob) => println!("\nCaptured {} bytes ({})", blob.len(), blob.content_type()),
        Err(e) => println!("\n{e}"),
    }

    println!("---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let tone = sine_tone(440.0, Duration::from_secs(2), 24000);
    println!(
        "Playing {} samples at {} Hz...",
        tone.samples.len(),
        tone.sample_rate
    );

    let mut handle = CpalSpeaker::new().play_samples(tone)?;
    handle.wait().await.map_err(anyhow::Error::msg)?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Test TTS output with the configured provider and fallbacks
#[allow(clippy::future_not_send)]
async fn test_tts(text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let config = Config::load()?;
    let mut synthesizer = SpeechSynthesizer::from_config(&config, Box::new(CpalSpeaker::new()));

    println!("Synthesizing speech...");
    let mut speech = synthesizer.speak(text).await;
    println!("Path: {:?}", speech.outcome());

    let end = speech.finished().await;
    println!("Result: {end:?}");

    Ok(())
}
