//! Core library for tonebridge.
//!
//! An [`EngineSession`] owns one synthesis engine and runs its render loop
//! on a dedicated thread. UI code never touches the engine directly: it sends
//! [`ControlEvent`]s through a [`ControlBridge`], and the loop applies them at
//! the next block boundary. Rendered blocks go to an [`AudioSink`].

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod meter;
pub mod session;
pub mod sink;

pub use bridge::ControlBridge;
pub use config::{AppConfig, ControlBinding, PanelConfig, SessionConfig};
pub use engine::{BlockStatus, StreamFormat, SynthEngine, ToneEngine};
pub use error::{BridgeError, Result};
pub use event::{ControlEvent, NoteOn, ParameterChange};
pub use meter::{BlockMeter, MeterReading};
pub use session::{EngineSession, SessionFault, SessionState, SessionStatus};
pub use sink::{AudioSink, NullSink, RecordingSettings, WavSink};
