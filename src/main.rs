use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use voicespark::voice::{
    self, AudioOutput, AudioSource, CpalMicrophone, CpalOutput, DecodedAudio, Speaker,
};
use voicespark::{
    ApiServer, ApiState, Config, Conversation, RejectReason, Role, SessionEvent, TurnOutcome,
};

/// VoiceSpark - voice conversation assistant for dementia caregivers
#[derive(Parser)]
#[command(name = "voicespark", version, about)]
struct Cli {
    /// Persona to use (e.g., "beatriz")
    #[arg(short, long, env = "VOICESPARK_PERSONA", global = true)]
    persona: Option<String>,

    /// Path to a TOML config file (default: ~/.config/voicespark/config.toml)
    #[arg(short, long, env = "VOICESPARK_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Port for the HTTP API, overrides the config file
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Disable the local microphone and speaker
    #[arg(long, env = "VOICESPARK_DISABLE_VOICE", global = true)]
    disable_voice: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Talk to the assistant in the terminal
    Chat,
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

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,voicespark=info",
        1 => "info,voicespark=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
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

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load_with_options(
        cli.persona.as_deref(),
        cli.config.as_deref(),
        cli.disable_voice,
    )?;
    tracing::debug!(persona = config.persona.id(), "loaded configuration");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, cli.port).await,
        Command::Chat => chat(config).await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::TestTts { text } => test_tts(&config, &text).await,
    }
}

/// Run the HTTP API until interrupted
async fn serve(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or(config.api_server.port);
    let state = Arc::new(ApiState::from_config(&config)?);

    tracing::info!(
        persona = config.persona.id(),
        port,
        "starting voicespark API"
    );

    ApiServer::new(state, port)
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
            }
        })
        .await?;

    Ok(())
}

/// Interactive terminal conversation
async fn chat(config: Config) -> anyhow::Result<()> {
    let generator = voicespark::agent::from_config(&config);
    let synthesizer = voice::synthesizer_from_config(&config)?;
    let mut builder = Conversation::builder(config.session.clone(), generator);

    if config.voice.enabled {
        let output: Arc<dyn AudioOutput> = Arc::new(CpalOutput::new());
        let speaker = Speaker::new(
            synthesizer,
            Some(output),
            &config.voice.tts,
            config.voice.playback,
        );
        let transcriber = voice::transcriber_from_config(&config)?;
        builder = builder
            .speaker(Arc::new(speaker))
            .capture(
                Arc::new(CpalMicrophone::new()),
                voice::capture_backend(&config, transcriber),
            );
    } else {
        let speaker = Speaker::new(synthesizer, None, &config.voice.tts, config.voice.playback);
        builder = builder.speaker(Arc::new(speaker));
    }

    let conversation = builder.build();
    let name = config.persona.name().to_string();
    let snapshot = conversation.snapshot();

    println!("Talking to {name}. Commands: /mic /stop /reset /quit");
    if snapshot.capture_available {
        println!("Use /mic to speak and /stop when you are done.");
    }
    println!("---");
    for message in &snapshot.messages {
        println!("{name}: {}", message.content());
    }

    let printer = tokio::spawn(print_events(conversation.subscribe(), name));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => {}
            "/quit" => break,
            "/mic" => match conversation.request_speech_capture().await {
                Ok(true) => {}
                Ok(false) => println!("(not listening: already recording or conversation over)"),
                Err(e) => println!("(microphone unavailable: {e})"),
            },
            "/stop" => conversation.cancel_speech_capture().await,
            "/reset" => conversation.reset().await,
            text => match conversation.submit_user_turn(text).await {
                Ok(TurnOutcome::Replied(_)) => {
                    let remaining = conversation.snapshot().turns_remaining();
                    println!("({remaining} messages left in this demo)");
                }
                Ok(TurnOutcome::Rejected(reason)) => println!("({})", describe_rejection(reason)),
                Ok(TurnOutcome::Discarded) => {}
                Err(e) => tracing::debug!(error = %e, "turn failed"),
            },
        }
    }

    conversation.shutdown().await;
    printer.abort();
    Ok(())
}

/// Print assistant output and status changes as they happen
async fn print_events(
    mut events: tokio::sync::broadcast::Receiver<SessionEvent>,
    name: String,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        };

        match event {
            SessionEvent::MessageAppended(message) if message.role() == Role::Assistant => {
                println!("{name}: {}", message.content());
            }
            SessionEvent::ListeningChanged(true) => println!("[listening]"),
            SessionEvent::ListeningChanged(false) => println!("[stopped listening]"),
            SessionEvent::TranscriptPreview(text) => println!("  ... {text}"),
            SessionEvent::PendingInputChanged(text) if !text.is_empty() => {
                println!("You (spoken): {text}");
            }
            SessionEvent::Notice(notice) => println!("! {notice}"),
            SessionEvent::Ended => println!("[demo conversation over, /reset to start again]"),
            SessionEvent::Reset => println!("--- new conversation ---"),
            _ => {}
        }
    }
}

const fn describe_rejection(reason: RejectReason) -> &'static str {
    match reason {
        RejectReason::Blank => "nothing to send",
        RejectReason::AwaitingReply => "still waiting for a reply",
        RejectReason::Ended | RejectReason::LimitReached => {
            "the demo conversation is over, /reset to start again"
        }
    }
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut input = CpalMicrophone::new().open().await?;
    println!("Sample rate: {} Hz", input.sample_rate());
    println!("---");

    for i in 0..duration {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut samples = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, input.next_frame()).await {
            samples.extend(frame?);
        }

        let energy = calculate_rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    drop(input);

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
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

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);

    CpalOutput::new()
        .play(
            DecodedAudio {
                samples,
                sample_rate,
            },
            CancellationToken::new(),
        )
        .await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Test TTS output through the configured synthesizer
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let Some(synthesizer) = voice::synthesizer_from_config(config)? else {
        anyhow::bail!("no TTS credential configured for {:?}", config.voice.tts.provider);
    };

    println!("Synthesizing speech with {}...", synthesizer.name());
    let mp3_data = voice::synthesize_all(
        synthesizer.as_ref(),
        text,
        &config.voice.tts.settings,
        config.voice.tts.chunk_chars,
    )
    .await?;
    println!("Got {} bytes of audio data", mp3_data.len());

    let audio = voice::decode_mp3(&mp3_data)?;
    println!(
        "Playing {:.1}s of audio at {} Hz...",
        audio.duration().as_secs_f32(),
        audio.sample_rate
    );
    CpalOutput::new().play(audio, CancellationToken::new()).await?;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}
