//! Synthesis engine boundary.
//!
//! The render session only talks to an engine through [`SynthEngine`]: compile
//! the instrument and score definitions once, then alternate between applying
//! control events and rendering one block at a time. [`ToneEngine`] is the
//! built-in implementation; anything else offering the same capability set can
//! be handed to [`EngineSession`](crate::EngineSession) instead.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{NoteOn, Result};

pub mod orchestra;
pub mod score;
pub mod tone;

pub use orchestra::{AmplitudeMode, Envelope, InstrumentDef, Orchestra, PitchSource};
pub use score::{FunctionTable, Score, TimedNote};
pub use tone::ToneEngine;

/// Shape of the audio stream an engine renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    /// Frames per block.
    pub block_size: usize,
    pub channels: u16,
}

impl StreamFormat {
    /// Number of interleaved samples in one block.
    pub fn block_len(&self) -> usize {
        self.block_size * self.channels as usize
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate.max(1) as f64)
    }

    /// Converts seconds to a whole number of frames, rounding to nearest.
    pub fn frames(&self, seconds: f32) -> u64 {
        (f64::from(seconds.max(0.0)) * f64::from(self.sample_rate)).round() as u64
    }
}

/// Outcome of rendering one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// The engine will keep producing blocks.
    Running,
    /// The performance is over. The block just rendered is the last one.
    Finished,
}

/// Capability set the render session needs from a synthesis engine.
pub trait SynthEngine: Send {
    /// Prepares instrument and score definitions for `format`. Replaces any
    /// previously compiled performance and resets render time to zero.
    fn compile(&mut self, format: StreamFormat, orchestra: &str, score: &str) -> Result<()>;

    /// Starts a voice at the current render time.
    fn schedule_note(&mut self, note: &NoteOn) -> Result<()>;

    /// Writes a named control value read by running and future voices.
    fn set_control_value(&mut self, name: &str, value: f32);

    fn control_value(&self, name: &str) -> Option<f32>;

    /// Snapshot of every control value written so far.
    fn controls(&self) -> BTreeMap<String, f32>;

    /// Renders exactly one block of interleaved samples into `out`, whose
    /// length is [`StreamFormat::block_len`].
    fn render_block(&mut self, out: &mut [f32]) -> Result<BlockStatus>;

    fn active_voices(&self) -> usize;
}

impl<E: SynthEngine + ?Sized> SynthEngine for Box<E> {
    fn compile(&mut self, format: StreamFormat, orchestra: &str, score: &str) -> Result<()> {
        (**self).compile(format, orchestra, score)
    }

    fn schedule_note(&mut self, note: &NoteOn) -> Result<()> {
        (**self).schedule_note(note)
    }

    fn set_control_value(&mut self, name: &str, value: f32) {
        (**self).set_control_value(name, value)
    }

    fn control_value(&self, name: &str) -> Option<f32> {
        (**self).control_value(name)
    }

    fn controls(&self) -> BTreeMap<String, f32> {
        (**self).controls()
    }

    fn render_block(&mut self, out: &mut [f32]) -> Result<BlockStatus> {
        (**self).render_block(out)
    }

    fn active_voices(&self) -> usize {
        (**self).active_voices()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_geometry() {
        let format = StreamFormat {
            sample_rate: 44_100,
            block_size: 400,
            channels: 2,
        };
        assert_eq!(format.block_len(), 800);
        assert_eq!(format.frames(1.0), 44_100);
        assert_eq!(format.frames(-1.0), 0);
        let millis = format.block_duration().as_secs_f64() * 1000.0;
        assert!((millis - 9.07).abs() < 0.01);
    }
}
