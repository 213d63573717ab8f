use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docent::stream::{SynthesisEvent, SynthesisStreamClient};
use docent::voice::{
    AudioCaptureBuffer, AudioFrame, CpalCapture, CpalOutput, PlaybackQueue, f32_to_i16,
    i16_to_f32, samples_to_wav,
};
use docent::{Config, Daemon};

/// Docent - conversational kiosk front-end
#[derive(Parser)]
#[command(name = "docent", version, about)]
struct Cli {
    /// Persona to use (e.g., "woman_demo")
    #[arg(short, long, env = "DOCENT_PERSONA")]
    persona: Option<String>,

    /// Config file (defaults to ~/.config/docent/config.toml)
    #[arg(short, long, env = "DOCENT_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Write the captured audio to this WAV file
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Test speaker output
    TestSpeaker,
    /// Stream text through the synthesis service and play it
    TestTts {
        /// Text to speak
        #[arg(default_value = "你好，欢迎参观。")]
        text: String,
    },
    /// Run a single text turn through reasoning and synthesis
    Say {
        /// What the visitor says
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,docent=info",
        1 => "info,docent=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
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
    if let Some(persona) = cli.persona.filter(|p| !p.trim().is_empty()) {
        config.persona_id = persona;
    }
    tracing::debug!(?config, "loaded configuration");

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration, save } => {
                test_mic(&config, duration, save.as_deref()).await
            }
            Command::TestSpeaker => test_speaker(&config).await,
            Command::TestTts { text } => test_tts(&config, &text).await,
            Command::Say { text } => Ok(Daemon::new(config).say(&text).await?),
        };
    }

    tracing::info!(
        persona = %config.persona_id,
        recognition = %config.endpoints.recognition_url,
        synthesis = %config.endpoints.synthesis_url,
        reasoning = %config.endpoints.reasoning_url,
        "starting docent"
    );

    Daemon::new(config).run().await?;
    Ok(())
}

/// Test microphone input
async fn test_mic(
    config: &Config,
    duration: u64,
    save: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    println!("Capturing from the kiosk microphone for {duration}s - say something.\n");

    let sample_rate = config.audio.capture_sample_rate;
    let capture = AudioCaptureBuffer::new(Box::new(CpalCapture::new()), sample_rate);
    capture.start()?;

    println!("capture rate {sample_rate} Hz");

    let mut recorded = Vec::new();
    for second in 1..=duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.pull(capture.available());
        let level = rms(&samples);
        let peak = samples
            .iter()
            .map(|&s| i16_to_f32(s).abs())
            .fold(0.0f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bars = (level * 100.0).min(40.0) as usize;
        println!(
            "{second:>3}s  {} samples  rms {level:.4}  peak {peak:.4}  |{:<40}|",
            samples.len(),
            "#".repeat(bars)
        );

        if save.is_some() {
            recorded.extend(samples);
        }
    }

    capture.stop();

    if let Some(path) = save {
        let wav = samples_to_wav(&recorded, sample_rate)?;
        std::fs::write(path, wav)?;
        println!("\nSaved {} samples to {}", recorded.len(), path.display());
    }

    println!("\nA flat meter means no input reached the kiosk; check the default");
    println!("capture device (`pactl info`, `arecord -l`).");

    Ok(())
}

/// Root-mean-square level in `[0, 1]`
#[allow(clippy::cast_precision_loss)]
fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let power = samples
        .iter()
        .map(|&s| i16_to_f32(s).powi(2))
        .sum::<f32>()
        / samples.len() as f32;
    power.sqrt()
}

/// Play a two-second chime through the playback queue
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    const CHIME_HZ: f32 = 660.0;

    let sample_rate = config.audio.playback_sample_rate;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<i16> = (0..sample_rate * 2)
        .map(|n| {
            let phase = std::f32::consts::TAU * CHIME_HZ * n as f32 / sample_rate as f32;
            f32_to_i16(phase.sin() * 0.25)
        })
        .collect();

    println!("Playing a {CHIME_HZ} Hz chime at {sample_rate} Hz...");

    let output = CpalOutput::open(sample_rate)?;
    let (queue, mut finished) = PlaybackQueue::new(Arc::new(output));
    queue.enqueue(AudioFrame::new(samples)?);
    finished.recv().await;

    println!("Done. Silence means the default output device is wrong or muted");
    println!("(`pactl list sinks short`).");

    Ok(())
}

/// Test the synthesis stream end to end
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    let client = SynthesisStreamClient::from_config(config);
    let output = CpalOutput::open(config.audio.playback_sample_rate)?;
    let (queue, mut finished) = PlaybackQueue::new(Arc::new(output));

    println!("Synthesizing \"{text}\" via {}", client.url());
    let (_handle, mut events) = client.stream(text, config.voice.voice_type.as_deref());

    let mut frames = 0usize;
    let mut bytes = 0usize;
    while let Some(event) = events.recv().await {
        match event {
            SynthesisEvent::Meta(meta) => println!(
                "Meta: {} at {} Hz, {} channel(s)",
                meta.format, meta.sample_rate, meta.channels
            ),
            SynthesisEvent::Audio(frame) => {
                frames += 1;
                bytes += frame.len() * 2;
                queue.enqueue(frame);
            }
            SynthesisEvent::End => break,
            SynthesisEvent::Error(e) => anyhow::bail!("TTS stream failed: {e}"),
        }
    }
    println!("received {frames} frames, {bytes} bytes");

    if frames > 0 && (queue.is_playing() || queue.pending_len() > 0) {
        finished.recv().await;
    }

    Ok(())
}
