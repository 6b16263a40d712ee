use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use beacon_live::session::{BridgeEvent, SessionState, VoiceBridge, WsTransport};
use beacon_live::voice::{
    AudioOutput, CapturePath, CpalCapture, CpalOutput, PlaybackBuffer, PlaybackScheduler,
    decode_pcm16, peak_amplitude,
};
use beacon_live::{Config, GenerateRequest, InferenceClient, ThrottleQueue, default_wake_lock};

/// Beacon Live - Real-time voice bridge for conversational AI services
#[derive(Parser)]
#[command(name = "beacon-live", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Open a live voice session (default)
    Bridge {
        /// Start with the microphone muted
        #[arg(long, env = "BEACON_LIVE_MUTED")]
        muted: bool,
    },
    /// Send one prompt through the call queue and print the response
    Ask {
        /// Prompt text
        prompt: String,
    },
    /// Test microphone input and voice activity detection
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output with back-to-back scheduled tones
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_live=info",
        1 => "info,beacon_live=debug",
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
    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Bridge { muted: false }) {
        Command::Bridge { muted } => run_bridge(config, muted).await,
        Command::Ask { prompt } => ask(config, prompt).await,
        Command::TestMic { duration } => test_mic(&config, duration).await,
        Command::TestSpeaker => test_speaker(&config).await,
    }
}

/// Run a live session until Ctrl-C or the session closes on its own
async fn run_bridge(config: Config, muted: bool) -> anyhow::Result<()> {
    let transport = WsTransport::from_config(&config.service)
        .with_input_rate(config.audio.input_rate)
        .with_default_rate(config.audio.output_rate);
    let output = CpalOutput::open(config.audio.output_rate)?;

    let bridge = VoiceBridge::builder()
        .transport(Arc::new(transport))
        .capture(Box::new(CpalCapture::new(config.audio.input_rate)))
        .output(Arc::new(output))
        .wake_lock(default_wake_lock())
        .setup(config.setup)
        .reconnect_policy(config.reconnect)
        .audio(config.audio)
        .muted(muted)
        .build()?;

    let mut events = bridge.subscribe();
    bridge.open().await?;
    tracing::info!(session = %bridge.id(), muted, "voice bridge ready, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, closing session");
                break;
            }
            event = events.recv() => match event {
                Ok(BridgeEvent::State(SessionState::Closed)) => {
                    tracing::warn!("session closed");
                    break;
                }
                Ok(BridgeEvent::Speaking(speaking)) => tracing::info!(speaking, "voice activity"),
                Ok(BridgeEvent::Error(message)) => tracing::error!(%message, "session error"),
                Ok(event) => tracing::debug!(?event, "bridge event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    bridge.close().await;
    Ok(())
}

/// Send one prompt through the process-wide queue
async fn ask(config: Config, prompt: String) -> anyhow::Result<()> {
    let queue = ThrottleQueue::init_shared(config.queue.clone());
    let client = InferenceClient::new(&config.service, queue.clone());

    let response = client.generate_queued(GenerateRequest::text(prompt)).await?;
    println!("{}", String::from_utf8_lossy(&response));

    Ok(())
}

/// Test microphone input
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = CapturePath::new(
        Box::new(CpalCapture::new(config.audio.input_rate)),
        &config.audio,
        Arc::new(AtomicBool::new(false)),
    );
    let (frames_tx, mut frames_rx) = mpsc::channel(64);
    capture.attach(frames_tx)?;

    println!(
        "Frame size: {} samples at {} Hz",
        config.audio.frame_size, config.audio.input_rate
    );
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut frames = 0usize;
        let mut peak = 0.0f32;
        while let Ok(pcm) = frames_rx.try_recv() {
            frames += 1;
            peak = peak.max(peak_amplitude(&decode_pcm16(&pcm)?));
        }

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (peak * 50.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] frames: {frames:2} | Peak: {peak:.4} | speaking: {:5} | [{meter}]",
            i + 1,
            capture.vad().is_speaking(),
        );
    }

    capture.detach();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If the peak stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Sine tone at `frequency` for `duration` at `sample_rate`
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn tone(frequency: f32, duration: Duration, sample_rate: u32) -> PlaybackBuffer {
    let num_samples = (duration.as_secs_f64() * f64::from(sample_rate)) as usize;
    let samples = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();
    PlaybackBuffer::new(samples, sample_rate)
}

/// Test speaker output through the playback scheduler
async fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear three rising tones with no gaps between them\n");

    let output: Arc<dyn AudioOutput> = Arc::new(CpalOutput::open(config.audio.output_rate)?);
    let scheduler = PlaybackScheduler::new(output);

    let step = Duration::from_millis(500);
    for frequency in [440.0, 554.37, 659.25] {
        let window = scheduler.schedule(tone(frequency, step, config.audio.output_rate))?;
        println!(
            "Scheduled {frequency} Hz at {:?} .. {:?}",
            window.start, window.end
        );
    }

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while scheduler.active_count() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        println!("Playback did not finish; the output clock may not be advancing");
    }
    scheduler.shutdown();

    println!("\n---");
    println!("If you heard the tones, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
