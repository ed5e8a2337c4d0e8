use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use persona_call::Config;
use persona_call::api::ApiServerBuilder;
use persona_call::call::{CallHandle, CallOptions, CallSession, HttpTurnClient, TurnState};
use persona_call::db::{self, SqliteStore};
use persona_call::llm::ChatCompletions;
use persona_call::persona::{PersonaCatalog, PersonaMode};
use persona_call::turn::{TurnProcessor, TurnSettings};
use persona_call::voice::{
    AudioOutput, CaptureBuffer, CaptureConstraints, CpalInput, CpalOutput, SpeechToText,
    TextToSpeech, decode_audio, pcm_to_wav,
};

/// Persona Call - hands-free spoken conversations with AI personas
#[derive(Parser)]
#[command(name = "persona-call", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the turn server (default)
    Serve {
        /// Port to listen on
        #[arg(long, env = "PERSONA_CALL_PORT")]
        port: Option<u16>,
    },
    /// Talk to a persona through a running server
    Call {
        /// Persona id
        #[arg(short, long)]
        persona: String,

        /// Use the heightened persona mode
        #[arg(long)]
        heightened: bool,

        /// Don't re-open the microphone after each reply
        #[arg(long)]
        no_auto_listen: bool,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "info,persona_call=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load();
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => serve(config, port).await,
        Command::Call {
            persona,
            heightened,
            no_auto_listen,
        } => {
            let mode = if heightened {
                PersonaMode::Heightened
            } else {
                PersonaMode::Standard
            };
            call(config, persona, mode, !no_auto_listen).await
        }
        Command::TestMic { duration } => test_mic(&config, duration).await,
        Command::TestSpeaker => test_speaker().await,
    }
}

/// Run the turn server until interrupted
async fn serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let pool = db::init(&config.server.database_path)?;
    let personas = PersonaCatalog::load(config.server.personas_dir.as_deref())?;

    let provider_timeout = config.timing.provider_timeout;
    let transcriber =
        SpeechToText::from_config(&config.voice, &config.api_keys, provider_timeout)?;
    let synthesizer =
        TextToSpeech::from_config(&config.voice, &config.api_keys, provider_timeout)?;
    let generator = ChatCompletions::from_config(&config.llm, &config.api_keys, provider_timeout);

    let processor = TurnProcessor::new(
        Arc::new(transcriber),
        Arc::new(generator),
        Arc::new(synthesizer),
        Arc::new(SqliteStore::new(pool.clone())),
        Arc::new(personas),
        TurnSettings::from(&config),
    );

    let server = ApiServerBuilder::new(Arc::new(processor), pool)
        .port(port.unwrap_or(config.server.port))
        .api_key(config.server.api_key.clone())
        .rate_limit(config.server.rate_limit_per_minute)
        .timing(&config.timing)
        .voice(&config.voice)
        .build();

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }

    Ok(())
}

/// Interactive call in the terminal
async fn call(
    config: Config,
    persona_id: String,
    mode: PersonaMode,
    auto_listen: bool,
) -> anyhow::Result<()> {
    let client = HttpTurnClient::new(
        &config.client.server_url,
        config.client.user_id.clone(),
        config.timing.request_timeout,
    )
    .with_api_key(config.server.api_key.clone());

    let options = CallOptions {
        persona_id,
        mode,
        call_active: true,
        auto_listen: auto_listen && config.client.auto_listen,
        timing: config.timing,
    };

    let (handle, task) = CallSession::spawn(
        options,
        Arc::new(CpalInput),
        Arc::new(CpalOutput),
        Arc::new(client),
    );

    println!("Connected to {}", config.client.server_url);
    println!("  [Enter] record / stop   i: interrupt   m: mute   a: auto-listen   q: end call\n");

    let printer = tokio::spawn(print_updates(handle.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let snapshot = handle.snapshot();
        let sent = match line.trim() {
            "" if snapshot.state == TurnState::Recording => handle.stop_recording(),
            "" => handle.start_recording(),
            "i" => handle.interrupt(),
            "m" => handle.set_muted(!snapshot.flags.muted),
            "a" => handle.set_auto_listen(!snapshot.flags.auto_listen),
            "q" => {
                handle.end_call()?;
                break;
            }
            other => {
                println!("unknown key: {other}");
                Ok(())
            }
        };
        if sent.is_err() {
            break;
        }
    }

    let _ = handle.end_call();
    task.await?;
    printer.abort();
    Ok(())
}

async fn print_updates(handle: CallHandle) {
    let mut rx = handle.subscribe();
    let mut last = rx.borrow().clone();

    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();

        if snapshot.state != last.state {
            println!("[{}]", snapshot.state);
        }
        if snapshot.flags != last.flags {
            println!(
                "  muted: {}  auto-listen: {}",
                snapshot.flags.muted, snapshot.flags.auto_listen
            );
        }
        if snapshot.last_turn != last.last_turn
            && let Some(turn) = &snapshot.last_turn
        {
            println!("  you: {}", turn.user_text);
            println!("  ai:  {}", turn.ai_text);
            if !turn.has_audio {
                println!("  (no audio)");
            }
        }
        if snapshot.last_error != last.last_error
            && let Some(error) = &snapshot.last_error
        {
            let hint = if snapshot.retryable { " (press Enter to retry)" } else { "" };
            println!("  error: {error}{hint}");
        }
        if snapshot.notice != last.notice
            && let Some(notice) = &snapshot.notice
        {
            println!("  {notice}");
        }

        last = snapshot;
    }
}

/// Record from the default microphone and report the level
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let constraints = CaptureConstraints::speech(config.timing.chunk_interval);
    let capture = CaptureBuffer::start(&CpalInput, constraints).await?;
    tokio::time::sleep(Duration::from_secs(duration)).await;
    let audio = capture.stop(config.timing.stop_ack_timeout).await?;

    let decoded = decode_audio(&audio.bytes)?;
    let rms = calculate_rms(&decoded.samples);
    let peak = decoded.samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

    println!(
        "Captured {} bytes ({:.1}s)",
        audio.bytes.len(),
        audio.duration.as_secs_f32()
    );
    println!("RMS: {rms:.4} | Peak: {peak:.4}");

    println!("\n---");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Play a 440Hz tone
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    let samples: Vec<i16> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            // 30% volume
            ((2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 * f32::from(i16::MAX)) as i16
        })
        .collect();

    let wav = pcm_to_wav(&samples, sample_rate)?;
    let opened = CpalOutput.open(wav).await?;
    let _device = opened.device;
    let _ = opened.finished.await;

    println!("\n---");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
