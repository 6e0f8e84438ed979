//! pcmix-play - command-line player
//!
//! Plays a WAV file (or a generated sine tone) through a pcmix context,
//! optionally looped with an intro and panned, and drives the host tick
//! until playback ends, the time limit passes or Ctrl-C is pressed.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use pcmix::{
    BytesSource, Context, ContextConfig, InfiniteLoop, ManualHost, SampleFormat, Source,
    StereoPan, StreamFormat,
};
use pcmix::backend::CpalDevice;
use pcmix_common::config::{BackendSetting, TomlConfig};
use pcmix_common::timing::duration_to_bytes;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Host tick period (~60 Hz)
const TICK: Duration = Duration::from_millis(16);

/// Command-line arguments for pcmix-play
#[derive(Parser, Debug)]
#[command(name = "pcmix-play")]
#[command(about = "Play PCM audio through the pcmix mixer")]
#[command(version)]
struct Args {
    /// WAV file to play; a sine tone is played when omitted
    input: Option<PathBuf>,

    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Context sample rate for the tone (WAV files use their own rate)
    #[arg(long, env = "PCMIX_SAMPLE_RATE")]
    sample_rate: Option<u32>,

    /// Backend dialect: auto, blocking, ring, callback, native
    #[arg(short, long, env = "PCMIX_BACKEND")]
    backend: Option<BackendSetting>,

    /// Output device: "default", "null", or a device name
    #[arg(short, long, env = "PCMIX_DEVICE")]
    device: Option<String>,

    /// Player volume in [0, 1]
    #[arg(long, default_value_t = 1.0)]
    volume: f64,

    /// Stereo pan in [-1, 1]
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    pan: f64,

    /// Loop the input forever
    #[arg(long = "loop")]
    looping: bool,

    /// Non-repeating intro before the loop body, in milliseconds
    #[arg(long, default_value_t = 0)]
    intro_ms: u64,

    /// Stop after this many seconds
    #[arg(long)]
    seconds: Option<f64>,

    /// Tone frequency when no input file is given
    #[arg(long, default_value_t = 440.0)]
    tone_hz: f64,

    /// List output devices and exit
    #[arg(long)]
    list_devices: bool,
}

/// Decoded interleaved stereo PCM
struct Decoded {
    bytes: Vec<u8>,
    format: StreamFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = TomlConfig::load_or_default(args.config.as_deref())
        .context("Failed to load configuration")?;
    init_tracing(&config)?;

    if args.list_devices {
        for name in CpalDevice::list_devices().context("Failed to list devices")? {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut audio = config.audio.clone();
    if let Some(rate) = args.sample_rate {
        audio.sample_rate = rate;
    }
    if let Some(backend) = args.backend {
        audio.backend = backend;
    }
    if let Some(device) = &args.device {
        audio.device = device.clone();
    }

    let decoded = match &args.input {
        Some(path) => read_wav(path)?,
        None => sine_tone(args.tone_hz, StreamFormat::new(audio.sample_rate, audio.sample_format)),
    };
    if decoded.format.sample_rate != audio.sample_rate {
        info!(
            "Using the input's sample rate {} Hz instead of {} Hz",
            decoded.format.sample_rate, audio.sample_rate
        );
    }
    audio.sample_rate = decoded.format.sample_rate;
    audio.sample_format = decoded.format.sample_format;

    let host = ManualHost::new();
    let context = Context::new(ContextConfig::from(&audio), host.clone())
        .context("Failed to create audio context")?;
    info!("Audio context: {:?}", context);

    let looping = args.looping || args.input.is_none();
    let source = build_source(decoded, looping, args.intro_ms, args.pan)?;
    let player = context
        .new_player(source)
        .context("Failed to create player")?;
    player
        .set_volume(args.volume)
        .context("Invalid --volume")?;
    player.play().context("Failed to start playback")?;

    let deadline = args
        .seconds
        .map(|s| Instant::now() + Duration::from_secs_f64(s.max(0.0)));
    let mut ticker = tokio::time::interval(TICK);
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut last_report = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = host.update() {
                    warn!("Host update reported: {}", e);
                }
                if let Some(err) = context.err() {
                    return Err(err).context("Audio backend failed");
                }
                if !player.is_playing() {
                    info!("Playback finished");
                    break;
                }
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    info!("Time limit reached");
                    break;
                }
                if last_report.elapsed() >= Duration::from_secs(1) {
                    debug!("Position: {:?}", player.position());
                    last_report = Instant::now();
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    player.close().context("Player reported an error")?;
    context.close().context("Failed to close audio context")?;
    Ok(())
}

fn init_tracing(config: &TomlConfig) -> Result<()> {
    let level = &config.logging.level;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("pcmix={level},pcmix_common={level},pcmix_play={level}").into());

    let file_layer = match &config.logging.file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };
    let stderr_layer = config
        .logging
        .file
        .is_none()
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
    Ok(())
}

/// Decode a 1- or 2-channel WAV file to interleaved stereo.
///
/// Integer files of any depth become int16; float files stay float32.
fn read_wav(path: &Path) -> Result<Decoded> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels == 0 || spec.channels > 2 {
        bail!("{}: unsupported channel count {}", path.display(), spec.channels);
    }
    let copies = if spec.channels == 1 { 2 } else { 1 };
    info!(
        "Decoding {}: {} Hz, {} ch, {} bit {:?}",
        path.display(),
        spec.sample_rate,
        spec.channels,
        spec.bits_per_sample,
        spec.sample_format
    );

    let mut bytes = Vec::new();
    let sample_format = match spec.sample_format {
        hound::SampleFormat::Int => {
            let shift = spec.bits_per_sample as i32 - 16;
            for sample in reader.samples::<i32>() {
                let sample = sample.context("Corrupt WAV data")?;
                let scaled = if shift >= 0 {
                    sample >> shift
                } else {
                    sample << -shift
                };
                for _ in 0..copies {
                    bytes.extend_from_slice(&(scaled as i16).to_le_bytes());
                }
            }
            SampleFormat::Int16
        }
        hound::SampleFormat::Float => {
            for sample in reader.samples::<f32>() {
                let sample = sample.context("Corrupt WAV data")?;
                for _ in 0..copies {
                    bytes.extend_from_slice(&sample.to_le_bytes());
                }
            }
            SampleFormat::Float32
        }
    };

    Ok(Decoded {
        bytes,
        format: StreamFormat::new(spec.sample_rate, sample_format),
    })
}

/// One second of a sine tone at half scale.
fn sine_tone(hz: f64, format: StreamFormat) -> Decoded {
    let rate = format.sample_rate as f64;
    let mut bytes = Vec::with_capacity(format.bytes_per_second());
    for i in 0..format.sample_rate {
        let v = (2.0 * std::f64::consts::PI * hz * i as f64 / rate).sin() * 0.5;
        for _ in 0..format.channels {
            match format.sample_format {
                SampleFormat::Int16 => {
                    bytes.extend_from_slice(&((v * i16::MAX as f64) as i16).to_le_bytes())
                }
                SampleFormat::Float32 => bytes.extend_from_slice(&(v as f32).to_le_bytes()),
            }
        }
    }
    Decoded { bytes, format }
}

fn build_source(decoded: Decoded, looping: bool, intro_ms: u64, pan: f64) -> Result<Box<dyn Source>> {
    let format = decoded.format;
    let total = decoded.bytes.len() as u64;
    let bytes = BytesSource::new(decoded.bytes).with_format(format);

    let source: Box<dyn Source> = if looping {
        let intro = duration_to_bytes(Duration::from_millis(intro_ms), &format);
        if intro >= total {
            bail!("--intro-ms must be shorter than the input");
        }
        Box::new(
            InfiniteLoop::with_intro(bytes, intro, total - intro, format.sample_format)
                .context("Failed to build loop")?,
        )
    } else {
        Box::new(bytes)
    };

    let panned = StereoPan::new(source, format.sample_format);
    panned.set_pan(pan);
    Ok(Box::new(panned))
}
