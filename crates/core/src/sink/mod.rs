//! Destinations for rendered blocks.
//!
//! The render loop hands every block to an [`AudioSink`]. A sink that blocks
//! until the output has room is what paces the loop; the loop itself never
//! sleeps.

use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::info;

use crate::{BridgeError, Result, StreamFormat};

/// Consumer of rendered audio. Lives on the render thread.
pub trait AudioSink: Send {
    /// Takes one interleaved block. An error here is fatal to the session.
    fn write_block(&mut self, block: &[f32], format: &StreamFormat) -> Result<()>;

    /// Called once when the render loop exits, whatever the reason.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: AudioSink + ?Sized> AudioSink for Box<S> {
    fn write_block(&mut self, block: &[f32], format: &StreamFormat) -> Result<()> {
        (**self).write_block(block, format)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Discards audio. Either returns immediately or sleeps so blocks leave at
/// the rate a real device would consume them.
#[derive(Debug, Default)]
pub struct NullSink {
    pacer: Option<Pacer>,
    frames: u64,
}

impl NullSink {
    pub fn free_running() -> Self {
        Self::default()
    }

    pub fn paced() -> Self {
        Self {
            pacer: Some(Pacer::default()),
            frames: 0,
        }
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }
}

impl AudioSink for NullSink {
    fn write_block(&mut self, block: &[f32], format: &StreamFormat) -> Result<()> {
        self.frames += (block.len() / format.channels.max(1) as usize) as u64;
        if let Some(pacer) = &mut self.pacer {
            pacer.wait_for(self.frames, format.sample_rate);
        }
        Ok(())
    }
}

/// Sleeps until wall-clock time catches up with the audio written so far.
#[derive(Debug, Default)]
struct Pacer {
    origin: Option<Instant>,
}

impl Pacer {
    fn wait_for(&mut self, frames: u64, sample_rate: u32) {
        let origin = *self.origin.get_or_insert_with(Instant::now);
        let due = origin + Duration::from_secs_f64(frames as f64 / sample_rate.max(1) as f64);
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
    }
}

/// Where and how a performance is recorded.
#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub output_path: PathBuf,
    /// 32-bit float when true, 16-bit PCM otherwise.
    pub float: bool,
}

impl RecordingSettings {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            float: true,
        }
    }
}

/// Records the performance to a WAV file. The header is finalised when the
/// render loop exits.
pub struct WavSink {
    settings: RecordingSettings,
    format: StreamFormat,
    writer: Option<WavWriter<BufWriter<File>>>,
    frames: u64,
}

impl WavSink {
    pub fn create(settings: RecordingSettings, format: StreamFormat) -> Result<Self> {
        let spec = if settings.float {
            WavSpec {
                channels: format.channels,
                sample_rate: format.sample_rate,
                bits_per_sample: 32,
                sample_format: SampleFormat::Float,
            }
        } else {
            WavSpec {
                channels: format.channels,
                sample_rate: format.sample_rate,
                bits_per_sample: 16,
                sample_format: SampleFormat::Int,
            }
        };
        let writer = WavWriter::create(&settings.output_path, spec)?;

        Ok(Self {
            settings,
            format,
            writer: Some(writer),
            frames: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.settings.output_path
    }

    pub fn is_recording(&self) -> bool {
        self.writer.is_some()
    }
}

impl AudioSink for WavSink {
    fn write_block(&mut self, block: &[f32], format: &StreamFormat) -> Result<()> {
        if *format != self.format {
            return Err(BridgeError::fault(format!(
                "recording was opened for {:?} but received {:?}",
                self.format, format
            )));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| BridgeError::fault("recording already finished"))?;

        for sample in block {
            if self.settings.float {
                writer.write_sample(*sample)?;
            } else {
                let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                writer.write_sample(value)?;
            }
        }
        self.frames += (block.len() / format.channels.max(1) as usize) as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
            info!(
                path = %self.settings.output_path.display(),
                frames = self.frames,
                "recording finalised"
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for WavSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavSink")
            .field("settings", &self.settings)
            .field("format", &self.format)
            .field("frames", &self.frames)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> StreamFormat {
        StreamFormat {
            sample_rate: 8_000,
            block_size: 80,
            channels: 2,
        }
    }

    #[test]
    fn paced_sink_keeps_real_time() {
        let mut sink = NullSink::paced();
        let block = vec![0.0; format().block_len()];
        let started = Instant::now();
        // 5 blocks of 10 ms each.
        for _ in 0..5 {
            sink.write_block(&block, &format()).unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert_eq!(sink.frames_written(), 400);
    }

    #[test]
    fn free_running_sink_counts_frames() {
        let mut sink = NullSink::free_running();
        sink.write_block(&vec![0.0; 160], &format()).unwrap();
        assert_eq!(sink.frames_written(), 80);
    }

    #[test]
    fn wav_sink_writes_a_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.wav");
        let mut sink = WavSink::create(RecordingSettings::new(&path), format()).unwrap();

        let block: Vec<f32> = (0..format().block_len()).map(|n| n as f32 / 1000.0).collect();
        sink.write_block(&block, &format()).unwrap();
        sink.write_block(&block, &format()).unwrap();
        sink.finish().unwrap();
        assert!(!sink.is_recording());
        assert!(sink.write_block(&block, &format()).is_err());

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 8_000);
        assert_eq!(reader.len(), 320);
    }

    #[test]
    fn wav_sink_rejects_foreign_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink =
            WavSink::create(RecordingSettings::new(dir.path().join("x.wav")), format()).unwrap();
        let other = StreamFormat {
            channels: 1,
            ..format()
        };
        assert!(sink.write_block(&[0.0; 80], &other).is_err());
    }
}
