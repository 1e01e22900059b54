use std::{
    io::BufRead,
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tonebridge_core::{
    engine::{Orchestra, Score},
    AppConfig, AudioSink, BridgeError, ControlEvent, EngineSession, NullSink, RecordingSettings,
    SessionFault, SessionState, StreamFormat, ToneEngine, WavSink,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod device;
mod panel;

use panel::{ControlPanel, PanelCommand};

fn main() -> tonebridge_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::live_defaults(),
    };

    match cli.command {
        Commands::Play { seconds } => run_play(config, seconds),
        Commands::Render {
            output,
            seconds,
            notes,
            pcm16,
        } => run_render(config, output, seconds, &notes, pcm16),
        Commands::Check => run_check(&config),
    }
}

fn build_session(config: &AppConfig, sink: impl AudioSink + 'static) -> EngineSession {
    match config.queue_capacity {
        Some(capacity) => EngineSession::with_queue_capacity(ToneEngine::new(), sink, capacity),
        None => EngineSession::new(ToneEngine::new(), sink),
    }
}

fn run_play(config: AppConfig, seconds: Option<f32>) -> tonebridge_core::Result<()> {
    let (output, sink) = device::open_default(config.session.format())?;
    let mut session = build_session(&config, sink);
    session.configure(config.session.clone())?;
    let faults = session.faults();
    let mut panel = ControlPanel::new(config.panel.clone(), session.bridge());
    session.start()?;

    info!(device = output.device_name(), seconds, "control panel ready");
    println!("commands: note | slider <0-127> | i ... | c ... | status | quit");

    let lines = spawn_console_reader();
    let deadline = seconds
        .map(|seconds| {
            Duration::try_from_secs_f32(seconds)
                .map_err(|_| BridgeError::config(format!("bad play length {seconds}")))
        })
        .transpose()?
        .map(|length| Instant::now() + length);
    let mut console_open = true;

    while panel.is_live() && !deadline.is_some_and(|deadline| Instant::now() >= deadline) {
        if !console_open {
            thread::sleep(Duration::from_millis(50));
            continue;
        }

        let line = match lines.recv_timeout(Duration::from_millis(50)) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                console_open = false;
                if deadline.is_none() {
                    break;
                }
                continue;
            }
        };

        match PanelCommand::parse(&line) {
            Ok(None) => {}
            Ok(Some(PanelCommand::Status)) => print_status(&session)?,
            Ok(Some(command)) => match panel.handle(command) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => warn!(error = %err, "event rejected"),
            },
            Err(err) => warn!(error = %err, "could not read command"),
        }
    }

    session.stop();
    drop(output);
    report_faults(&faults)
}

fn run_render(
    config: AppConfig,
    output: PathBuf,
    seconds: f32,
    notes: &[f32],
    pcm16: bool,
) -> tonebridge_core::Result<()> {
    if !(seconds > 0.0) {
        return Err(BridgeError::config(format!(
            "render length must be positive, got {seconds}"
        )));
    }

    let format = config.session.format();
    let frames = format.frames(seconds);
    let settings = RecordingSettings {
        output_path: output,
        float: !pcm16,
    };
    let recording = WavSink::create(settings, format)?;
    info!(path = %recording.path().display(), seconds, "rendering offline");

    let mut session = build_session(&config, FrameLimit::new(recording, frames));
    session.configure(config.session.clone())?;

    let bridge = session.bridge();
    for pitch in notes {
        bridge.send(ControlEvent::note_on(
            config.panel.instrument,
            config.panel.duration,
            *pitch,
            config.panel.velocity,
        ))?;
    }

    let faults = session.faults();
    session.start()?;
    let blocks = frames.div_ceil(format.block_size as u64);
    while !session.wait_for_blocks(blocks, Duration::from_secs(1)) {
        if session.state() == SessionState::Stopped {
            break;
        }
    }
    session.stop();

    let status = session.status()?;
    info!(blocks = status.blocks_rendered, "render finished");
    report_faults(&faults)
}

fn run_check(config: &AppConfig) -> tonebridge_core::Result<()> {
    let mut session = build_session(config, NullSink::free_running());
    session.configure(config.session.clone())?;

    let orchestra = Orchestra::parse(&config.session.orchestra)?;
    let score = Score::parse(&config.session.score)?;
    let format = config.session.format();

    println!(
        "stream: {} Hz, {} channel(s), {} frames per block ({:.1} ms)",
        format.sample_rate,
        format.channels,
        format.block_size,
        format.block_duration().as_secs_f64() * 1000.0
    );
    for instrument in &orchestra.instruments {
        println!(
            "instr {}: table {}, {:?} envelope, {:?} amplitude, pitch from {:?}",
            instrument.id, instrument.table, instrument.envelope, instrument.amplitude, instrument.pitch
        );
    }
    println!(
        "score: {} table(s), {} note(s), length {}",
        score.tables.len(),
        score.notes.len(),
        score
            .length
            .map(|seconds| format!("{seconds} s"))
            .unwrap_or_else(|| "unbounded".to_string())
    );
    for binding in &config.session.controls {
        println!(
            "slider {} -> {} [{}, {}]",
            binding.slider, binding.name, binding.min, binding.max
        );
    }

    session.stop();
    Ok(())
}

fn print_status(session: &EngineSession) -> tonebridge_core::Result<()> {
    let status = session.status()?;
    println!("{} {}", session.state(), serde_json::to_string(&status)?);
    Ok(())
}

/// Logs every fault and returns the first one as the command's error.
fn report_faults(faults: &Receiver<SessionFault>) -> tonebridge_core::Result<()> {
    let mut first = None;
    for fault in faults.try_iter() {
        error!(block = fault.block, error = %fault.error, "session faulted");
        first.get_or_insert(fault.error);
    }
    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Reads stdin on its own thread so the panel loop can keep watching the
/// session while waiting for input.
fn spawn_console_reader() -> Receiver<String> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let spawned = thread::Builder::new()
        .name("tonebridge-console".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "console input unavailable");
    }
    rx
}

/// Passes through the first `remaining` frames and drops the rest, so an
/// offline render has exactly the requested length.
struct FrameLimit<S> {
    inner: S,
    remaining: u64,
}

impl<S: AudioSink> FrameLimit<S> {
    fn new(inner: S, frames: u64) -> Self {
        Self {
            inner,
            remaining: frames,
        }
    }
}

impl<S: AudioSink> AudioSink for FrameLimit<S> {
    fn write_block(&mut self, block: &[f32], format: &StreamFormat) -> tonebridge_core::Result<()> {
        if self.remaining == 0 {
            return Ok(());
        }
        let channels = format.channels.max(1) as usize;
        let frames = (block.len() / channels) as u64;
        let take = frames.min(self.remaining);
        self.remaining -= take;
        self.inner.write_block(&block[..take as usize * channels], format)
    }

    fn finish(&mut self) -> tonebridge_core::Result<()> {
        self.inner.finish()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Real-time control bridge for a block-based synthesizer", long_about = None)]
struct Cli {
    /// JSON configuration file. Built-in defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play through the default output device with a console control panel.
    Play {
        /// Stop after this many seconds instead of waiting for `quit`.
        #[arg(short, long)]
        seconds: Option<f32>,
    },
    /// Render the performance to a WAV file as fast as possible.
    Render {
        /// Path of the WAV file to write.
        #[arg(short, long)]
        output: PathBuf,
        /// Length of the recording.
        #[arg(short, long, default_value_t = 10.0)]
        seconds: f32,
        /// Play a note at this pitch from the first block. Repeatable.
        #[arg(short = 'n', long = "note")]
        notes: Vec<f32>,
        /// Write 16-bit PCM instead of 32-bit float.
        #[arg(long)]
        pcm16: bool,
    },
    /// Validate and compile the configuration, then print a summary.
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_limit_truncates_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.wav");
        let format = StreamFormat {
            sample_rate: 8_000,
            block_size: 100,
            channels: 2,
        };
        let wav = WavSink::create(RecordingSettings::new(&path), format).unwrap();
        let mut sink = FrameLimit::new(wav, 250);

        let block = vec![0.25; format.block_len()];
        for _ in 0..4 {
            sink.write_block(&block, &format).unwrap();
        }
        sink.finish().unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.len(), 500);
    }

    #[test]
    fn cli_parses_render_notes() {
        let cli = Cli::parse_from([
            "tonebridge", "render", "-o", "out.wav", "--seconds", "2", "-n", "60", "-n", "67",
        ]);
        match cli.command {
            Commands::Render { notes, seconds, .. } => {
                assert_eq!(notes, vec![60.0, 67.0]);
                assert_eq!(seconds, 2.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
