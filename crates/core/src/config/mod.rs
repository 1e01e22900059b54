use std::{collections::HashSet, fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{BridgeError, Result, StreamFormat};

/// Instrument definitions used when no configuration file is supplied: one
/// sine-table voice whose amplitude rises over the first half of the note and
/// falls over the second.
pub const DEFAULT_ORCHESTRA: &str = "\
sr = 44100
ksmps = 400
nchnls = 2

; p4 is a MIDI key number, p5 an amplitude in dB.
instr 1 table=1 env=triangle amp=db
";

/// Score used when no configuration file is supplied.
pub const DEFAULT_SCORE: &str = "\
f 1 0 8192 10 1
f 0 600
e
";

const MAX_CHANNELS: u16 = 8;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub panel: PanelConfig,
    /// Bound on pending control events. `None` keeps the queue unbounded.
    pub queue_capacity: Option<usize>,
}

impl AppConfig {
    /// Reads a JSON configuration file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn live_defaults() -> Self {
        Self::default()
    }
}

/// Everything the render session needs before it can start. Frozen once the
/// session enters `Rendering`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub sample_rate: u32,
    /// Samples per channel rendered by one loop iteration.
    pub block_size: usize,
    pub channels: u16,
    pub orchestra: String,
    pub score: String,
    pub controls: Vec<ControlBinding>,
    /// Publish a [`MeterReading`](crate::MeterReading) for every block.
    pub metering: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            block_size: 400,
            channels: 2,
            orchestra: DEFAULT_ORCHESTRA.to_string(),
            score: DEFAULT_SCORE.to_string(),
            controls: vec![ControlBinding::pitch_slider(1)],
            metering: true,
        }
    }
}

impl SessionConfig {
    /// Checks the structural invariants that do not require the engine.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(BridgeError::config("sample rate must be positive"));
        }
        if self.block_size == 0 {
            return Err(BridgeError::config("block size must be positive"));
        }
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(BridgeError::config(format!(
                "channel count must be between 1 and {MAX_CHANNELS}, got {}",
                self.channels
            )));
        }

        let mut sliders = HashSet::new();
        for binding in &self.controls {
            binding.validate()?;
            if !sliders.insert(binding.slider) {
                return Err(BridgeError::config(format!(
                    "slider {} is bound more than once",
                    binding.slider
                )));
            }
        }

        Ok(())
    }

    pub fn format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: self.sample_rate,
            block_size: self.block_size,
            channels: self.channels,
        }
    }

    /// Looks up the control a slider writes to.
    pub fn binding(&self, slider: u32) -> Option<&ControlBinding> {
        self.controls.iter().find(|binding| binding.slider == slider)
    }

    /// Wall-clock length of one block at the configured sample rate.
    pub fn block_duration(&self) -> Duration {
        self.format().block_duration()
    }
}

/// Routes a UI slider to a named engine control value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlBinding {
    pub slider: u32,
    pub name: String,
    pub min: f32,
    pub max: f32,
}

impl ControlBinding {
    /// Binding for a MIDI-key pitch slider spanning 0..=127.
    pub fn pitch_slider(slider: u32) -> Self {
        Self {
            slider,
            name: "pitch".to_string(),
            min: 0.0,
            max: 127.0,
        }
    }

    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.min, self.max)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BridgeError::config(format!(
                "slider {} is bound to an empty control name",
                self.slider
            )));
        }
        if !(self.min.is_finite() && self.max.is_finite() && self.min < self.max) {
            return Err(BridgeError::config(format!(
                "slider {} has an empty range {}..{}",
                self.slider, self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Behaviour of the control panel host: which note the button sends and which
/// slider moves the pitch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub instrument: u32,
    /// Note length in seconds.
    pub duration: f32,
    /// Note amplitude in dB.
    pub velocity: f32,
    pub default_pitch: f32,
    pub pitch_slider: u32,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            instrument: 1,
            duration: 8.0,
            velocity: 70.0,
            default_pitch: 60.0,
            pitch_slider: 1,
        }
    }
}
