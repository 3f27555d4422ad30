use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use presence_gateway::api::{self, ApiState};
use presence_gateway::audio::MicrophoneSource;
use presence_gateway::session::{PipelineFactory, SessionRegistry};
use presence_gateway::{Config, RemotePipeline, SessionClient, SpeechPipeline};

/// Presence - Turn-based conversational session gateway
#[derive(Parser)]
#[command(name = "presence", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "PRESENCE_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Join a session on a running gateway as an interactive client
    Connect {
        /// Session identifier to create and join
        #[arg(short, long, default_value = "local")]
        session: String,

        /// Skip audio devices (no microphone or speaker)
        #[arg(long)]
        headless: bool,
    },
    /// Print the effective configuration
    Config,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,presence_gateway=info",
        1 => "info,presence_gateway=debug",
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

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::from_env()?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Connect { session, headless } => connect(&config, &session, headless).await,
            Command::Config => {
                println!("{config:#?}");
                Ok(())
            }
            Command::TestMic { duration } => test_mic(&config, duration).await,
        };
    }

    tracing::info!(
        port = config.server.port,
        pipeline = %config.pipeline.base_url,
        avatar = %config.avatar.base_url,
        "starting presence gateway"
    );

    let pipeline_url = config.pipeline.base_url.clone();
    let sample_rate = config.audio.sample_rate;
    let factory: PipelineFactory = Arc::new(move |voice_id| {
        Arc::new(RemotePipeline::new(&pipeline_url, voice_id, sample_rate))
            as Arc<dyn SpeechPipeline>
    });

    let registry = Arc::new(SessionRegistry::new(
        factory,
        &config.pipeline.default_voice,
        &config.pipeline.default_avatar,
        config.server.require_credential,
        config.avatar.default_credential.clone(),
    ));

    api::serve(Arc::new(ApiState { registry }), config.server.port).await?;
    Ok(())
}

/// Join a session and stream the microphone until interrupted
#[allow(clippy::future_not_send)]
async fn connect(config: &Config, session_id: &str, headless: bool) -> anyhow::Result<()> {
    let mut client = SessionClient::start(config, session_id, headless).await?;

    if headless {
        println!("Connected to session {session_id} (headless)");
    } else {
        client.start_capture()?;
        println!("Connected to session {session_id}; streaming microphone. Ctrl-C to leave.");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notice = client.notices.recv() => {
                match notice {
                    Some(notice) => println!("! {notice}"),
                    None => break,
                }
            }
            () = tokio::time::sleep(Duration::from_millis(250)) => {
                client.poll_capture_commands();
                if !client.is_connected() {
                    println!("Session transport closed");
                    break;
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

/// Test microphone input
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let mut mic = MicrophoneSource::new(config.audio.sample_rate, Arc::clone(&buffer))?;
    mic.start()?;

    println!("Sample rate: {} Hz", config.audio.sample_rate);
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples: Vec<f32> = {
            let mut buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *buf)
        };
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

    mic.stop();

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
