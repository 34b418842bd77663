use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use voice_channel::voice::{
    AudioSource, CaptureFormat, MicrophoneSource, SpeechOutput, SynthesizedSpeech, TextToSpeech, rms,
};
use voice_channel::{Backend, Config, Coordinator, EventBus, SessionState, VoiceEvent};

/// Voice Channel - hands-free listening and speech on one microphone
#[derive(Parser)]
#[command(name = "voicechan", version, about)]
struct Cli {
    /// Config file; defaults to ~/.config/voice-channel/config.toml
    #[arg(short, long, env = "VOICECHAN_CONFIG")]
    config: Option<PathBuf>,

    /// Recognition backend (local or remote)
    #[arg(long)]
    backend: Option<String>,

    /// Remote streaming endpoint (ws:// or wss://)
    #[arg(long)]
    url: Option<String>,

    /// Recognition and speech language (e.g. ko-KR)
    #[arg(long)]
    language: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the voice channel, driven by stdin commands
    Listen {
        /// Print bus events as JSON lines
        #[arg(long)]
        json: bool,

        /// Stop listening after every final transcript
        #[arg(long)]
        auto_stop: bool,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Speak text through speech output
    Say {
        /// Text to speak
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voice_channel=info",
        1 => "info,voice_channel=debug",
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
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(backend) = cli.backend.as_deref() {
        config.backend =
            Backend::parse(backend).ok_or_else(|| anyhow::anyhow!("unknown backend: {backend}"))?;
    }
    if let Some(url) = cli.url {
        config.remote.url = Some(url);
    }
    if let Some(language) = cli.language {
        config.language = language;
    }

    match cli.command.unwrap_or(Command::Listen {
        json: false,
        auto_stop: false,
    }) {
        Command::Listen { json, auto_stop } => {
            config.transcript.auto_stop_after_final |= auto_stop;
            config.validate()?;
            listen(&config, json).await
        }
        Command::TestMic { duration } => test_mic(&config, duration).await,
        Command::Say { text } => say(&config, &text).await,
    }
}

/// Run the coordinator until `q` or end of input
async fn listen(config: &Config, json: bool) -> anyhow::Result<()> {
    tracing::debug!(?config, "loaded configuration");

    let bus = EventBus::new();
    let coordinator = Coordinator::from_config(config, bus.clone())?;
    let printer = tokio::spawn(print_events(bus.subscribe(), json));

    println!("Enter: toggle listening | s: stop | say <text>: speak | q: quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" | "t" => {
                if coordinator.state().await == SessionState::Listening {
                    coordinator.request_stop().await;
                } else if let Err(e) = coordinator.request_start().await {
                    tracing::warn!(error = %e, "could not start listening");
                }
            }
            "s" => {
                coordinator.request_stop().await;
                coordinator.stop_speaking().await;
            }
            "q" => break,
            _ => {
                if let Some(text) = line.strip_prefix("say ") {
                    let outcome = coordinator.speak(vec![text.to_string()]).await;
                    tracing::debug!(?outcome, "speak requested");
                } else {
                    println!("unknown command: {line}");
                }
            }
        }
    }

    coordinator.request_stop().await;
    coordinator.stop_speaking().await;
    printer.abort();

    let diagnostics = coordinator.diagnostics().await;
    tracing::info!(
        sessions = diagnostics.sessions_started,
        terminals = diagnostics.terminals_observed,
        "voice channel finished"
    );
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<VoiceEvent>, json: bool) {
    loop {
        match events.recv().await {
            Ok(event) if json => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "failed to encode event"),
            },
            Ok(VoiceEvent::MicMode { active }) => {
                println!("[mic] {}", if active { "listening" } else { "idle" });
            }
            Ok(VoiceEvent::Transcript { text, is_final, .. }) => {
                let tag = if is_final { "final" } else { "interim" };
                println!("[{tag}] {text}");
            }
            Ok(VoiceEvent::Error { code, message }) => println!("[error] {code}: {message}"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Test microphone input
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let source = MicrophoneSource::with_device(config.audio.input_device.clone());
    let format = CaptureFormat {
        sample_rate: config.audio.sample_rate,
        frame_samples: config.audio.frame_samples,
    };
    let mut stream = tokio::task::spawn_blocking(move || source.open(format)).await??;

    println!("Sample rate: {} Hz, frame: {} samples", format.sample_rate, format.frame_samples);
    println!("---");

    for i in 0..duration {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut samples = Vec::new();
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, stream.next_frame()).await {
            samples.extend(frame);
        }

        let energy = rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]", i + 1);

        if !stream.is_running() {
            println!("capture stream ended");
            break;
        }
    }

    stream.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: arecord -l (to list devices)");
    println!("  3. Set audio.input_device in the config file");

    Ok(())
}

/// Speak text through speech output
async fn say(config: &Config, text: &str) -> anyhow::Result<()> {
    let key = config
        .api_keys
        .openai
        .clone()
        .ok_or_else(|| anyhow::anyhow!("OPENAI_API_KEY is required for speech output"))?;

    let tts = TextToSpeech::new(key, config.speech.voice.clone(), config.speech.model.clone())?;
    let speech = SynthesizedSpeech::new(tts);

    println!("Speaking: \"{text}\"");
    speech.speak(&[text.to_string()], &config.speech_options()).await?;
    Ok(())
}
