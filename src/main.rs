//! Synthetic host for exercising the recorder end to end.
//!
//! Renders a moving gradient on the main thread and runs a sine-wave "mixer"
//! on its own thread, delivering 1024-sample batches the way a real audio
//! engine would.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::f32::consts::TAU;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lockstep_recorder::capture::{MixerTap, SourceImage, TickDecision};
use lockstep_recorder::config::BackendKind;
use lockstep_recorder::{init_logging, RecorderConfig, RecordingManager, StartRequest, TickOutcome};

/// Samples per channel in each mixer callback
const MIXER_BATCH: usize = 1024;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Null,
    Pipe,
    Embedded,
}

impl From<Backend> for BackendKind {
    fn from(b: Backend) -> Self {
        match b {
            Backend::Null => BackendKind::Null,
            Backend::Pipe => BackendKind::ExternalProcess,
            Backend::Embedded => BackendKind::Embedded,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Encoder backend, overriding the config file
    #[arg(short, long, value_enum)]
    backend: Option<Backend>,

    /// Host ticks to run
    #[arg(short, long, default_value_t = 600)]
    ticks: u64,

    /// Output directory, overriding the config file
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output file name
    #[arg(short, long)]
    name: Option<String>,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RecorderConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => RecorderConfig::default(),
    };
    if let Some(backend) = args.backend {
        config.output.backend = backend.into();
    }
    if let Some(out) = args.out {
        config.output.directory = out;
    }

    tracing::info!("Starting lockstep-recorder v{}", env!("CARGO_PKG_VERSION"));

    let (width, height) = (config.video.width, config.video.height);
    let sample_rate = config.audio.sample_rate;
    let manager = RecordingManager::new(config);
    let session = manager
        .start(StartRequest {
            frame_limit: None,
            file_name: args.name,
        })
        .context("Failed to start recording")?;

    let tap = session
        .take_mixer_tap()
        .context("Mixer tap already taken")?;
    let running = Arc::new(AtomicBool::new(true));
    let mixer = spawn_mixer(tap, sample_rate, running.clone())?;

    let mut pixels = vec![0u8; width as usize * height as usize * 4];
    for tick in 0..args.ticks {
        match session.begin_tick() {
            TickDecision::Capture => {
                render_gradient(&mut pixels, width, height, tick);
                if let Err(e) = session.capture_frame(&SourceImage::rgba(&pixels, width, height)) {
                    tracing::warn!("Tick {}: {}", tick, e);
                }
                if session.end_tick() != TickOutcome::Continue {
                    break;
                }
            }
            TickDecision::Skip => {}
            TickDecision::Halted => {
                tracing::warn!("Session halted at tick {}", tick);
                break;
            }
        }
    }

    let result = manager.stop();
    running.store(false, Ordering::Release);
    if mixer.join().is_err() {
        tracing::error!("Mixer thread panicked");
    }

    match result.context("Failed to finalize recording")? {
        Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
        None => tracing::warn!("No session was active"),
    }
    Ok(())
}

/// Paint a diagonal gradient that scrolls one pixel per tick
fn render_gradient(pixels: &mut [u8], width: u32, height: u32, tick: u64) {
    let w = width as usize;
    for (i, px) in pixels.chunks_exact_mut(4).enumerate() {
        let (x, y) = (i % w, i / w);
        let phase = (x + y + tick as usize) as u32;
        px[0] = (phase % 256) as u8;
        px[1] = ((y as u32 * 255) / height.max(1)) as u8;
        px[2] = 255 - (phase % 256) as u8;
        px[3] = 255;
    }
}

/// Run a 440 Hz tone through the tap at the pace of a real audio device
fn spawn_mixer(
    mut tap: MixerTap,
    sample_rate: u32,
    running: Arc<AtomicBool>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("synthetic-mixer".into())
        .spawn(move || {
            let channels = tap.channels();
            let period = Duration::from_secs_f64(MIXER_BATCH as f64 / sample_rate as f64);
            let mut batch = vec![0.0f32; MIXER_BATCH * channels];
            let mut phase = 0.0f32;
            let step = TAU * 440.0 / sample_rate as f32;

            while running.load(Ordering::Acquire) {
                for frame in batch.chunks_exact_mut(channels) {
                    frame.fill(phase.sin() * 0.25);
                    phase = (phase + step) % TAU;
                }
                tap.process(&batch);
                std::thread::sleep(period);
            }
        })
}
