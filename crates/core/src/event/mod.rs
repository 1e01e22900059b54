use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{BridgeError, Result};

/// Highest MIDI key a note or pitch control may carry.
pub const MAX_KEY: f32 = 127.0;
/// Loudest velocity accepted, in dB on the 32768 full scale (about +54 dBFS).
pub const MAX_VELOCITY: f32 = 144.0;

/// Request to start one voice at the current render time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoteOn {
    pub instrument: u32,
    /// Seconds.
    pub duration: f32,
    /// MIDI key number, 0..=127. Fractional keys are allowed.
    pub pitch: f32,
    /// Amplitude in dB.
    pub velocity: f32,
}

/// A slider moved to a new value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterChange {
    pub slider: u32,
    pub value: f32,
}

/// Discrete control event travelling from the UI context to the render loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ControlEvent {
    NoteOn(NoteOn),
    ParameterChange(ParameterChange),
}

impl ControlEvent {
    pub fn note_on(instrument: u32, duration: f32, pitch: f32, velocity: f32) -> Self {
        Self::NoteOn(NoteOn {
            instrument,
            duration,
            pitch,
            velocity,
        })
    }

    pub fn parameter(slider: u32, value: f32) -> Self {
        Self::ParameterChange(ParameterChange { slider, value })
    }

    /// Parses a line event.
    ///
    /// `i <instr> <start> <dur> <pitch> <velocity>` becomes a [`NoteOn`]. Line
    /// events always play at the current render time, so `start` must be 0.
    /// `c <slider> <value>` becomes a [`ParameterChange`].
    pub fn parse_line(line: &str) -> Result<Self> {
        let mut fields = line.split_whitespace();
        let opcode = fields
            .next()
            .ok_or_else(|| BridgeError::InvalidEvent("empty line event".into()))?;
        let args = fields
            .map(|field| {
                field.parse::<f32>().map_err(|_| {
                    BridgeError::InvalidEvent(format!("`{field}` is not a number"))
                })
            })
            .collect::<Result<Vec<f32>>>()?;

        match (opcode, args.as_slice()) {
            ("i", [instr, start, duration, pitch, velocity]) => {
                if *start != 0.0 {
                    return Err(BridgeError::InvalidEvent(
                        "line events start at the current render time; p2 must be 0".into(),
                    ));
                }
                let event = NoteOn {
                    instrument: parse_id(*instr, "instrument")?,
                    duration: *duration,
                    pitch: *pitch,
                    velocity: *velocity,
                };
                event.validate()?;
                Ok(Self::NoteOn(event))
            }
            ("i", _) => Err(BridgeError::InvalidEvent(format!(
                "`i` takes 5 fields (instr start dur pitch velocity), got {}",
                args.len()
            ))),
            ("c", [slider, value]) => {
                let change = ParameterChange {
                    slider: parse_id(*slider, "slider")?,
                    value: *value,
                };
                change.validate()?;
                Ok(Self::ParameterChange(change))
            }
            ("c", _) => Err(BridgeError::InvalidEvent(format!(
                "`c` takes 2 fields (slider value), got {}",
                args.len()
            ))),
            (other, _) => Err(BridgeError::InvalidEvent(format!(
                "unknown line event opcode `{other}`"
            ))),
        }
    }
}

impl NoteOn {
    pub fn validate(&self) -> Result<()> {
        if !(self.duration.is_finite() && self.duration > 0.0) {
            return Err(BridgeError::InvalidEvent(format!(
                "note duration must be positive, got {}",
                self.duration
            )));
        }
        if !(0.0..=MAX_KEY).contains(&self.pitch) {
            return Err(BridgeError::InvalidEvent(format!(
                "note pitch must be a key between 0 and {MAX_KEY}, got {}",
                self.pitch
            )));
        }
        if !(self.velocity.is_finite() && self.velocity <= MAX_VELOCITY) {
            return Err(BridgeError::InvalidEvent(format!(
                "note velocity must be finite and at most {MAX_VELOCITY}, got {}",
                self.velocity
            )));
        }
        Ok(())
    }
}

impl ParameterChange {
    pub fn validate(&self) -> Result<()> {
        if !self.value.is_finite() {
            return Err(BridgeError::InvalidEvent(format!(
                "slider {} value must be finite, got {}",
                self.slider, self.value
            )));
        }
        Ok(())
    }
}

impl ControlEvent {
    /// Checks the event's values before it is queued.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::NoteOn(note) => note.validate(),
            Self::ParameterChange(change) => change.validate(),
        }
    }
}

impl FromStr for ControlEvent {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_line(s)
    }
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoteOn(note) => write!(
                f,
                "i {} 0 {} {} {}",
                note.instrument, note.duration, note.pitch, note.velocity
            ),
            Self::ParameterChange(change) => write!(f, "c {} {}", change.slider, change.value),
        }
    }
}

fn parse_id(value: f32, what: &str) -> Result<u32> {
    if value.fract() != 0.0 || value < 0.0 || value >= u32::MAX as f32 {
        return Err(BridgeError::InvalidEvent(format!(
            "{what} id must be a non-negative integer, got {value}"
        )));
    }
    Ok(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_note_line_event() {
        let event: ControlEvent = "i 1 0 8 60 70".parse().unwrap();
        assert_eq!(event, ControlEvent::note_on(1, 8.0, 60.0, 70.0));
    }

    #[test]
    fn parses_slider_line_event() {
        let event = ControlEvent::parse_line("c 1 72").unwrap();
        assert_eq!(event, ControlEvent::parameter(1, 72.0));
    }

    #[test]
    fn rejects_delayed_and_malformed_events() {
        assert!(ControlEvent::parse_line("i 1 2 8 60 70").is_err());
        assert!(ControlEvent::parse_line("i 1 0 8 60").is_err());
        assert!(ControlEvent::parse_line("i 1.5 0 8 60 70").is_err());
        assert!(ControlEvent::parse_line("i 1 0 0 60 70").is_err());
        assert!(ControlEvent::parse_line("x 1").is_err());
        assert!(ControlEvent::parse_line("c one 2").is_err());
        assert!(ControlEvent::parse_line("   ").is_err());
    }

    #[test]
    fn rejects_values_that_cannot_be_rendered() {
        assert!(ControlEvent::parse_line("i 1 0 8 3000 70").is_err());
        assert!(ControlEvent::parse_line("i 1 0 8 -1 70").is_err());
        assert!(ControlEvent::parse_line("i 1 0 8 127 70").is_ok());
        assert!(ControlEvent::parse_line("i 1 0 8 60 1e30").is_err());
        assert!(ControlEvent::parse_line("i 1 0 8 NaN 70").is_err());
        assert!(ControlEvent::parse_line("c 1 NaN").is_err());
        assert!(ControlEvent::parse_line("c 1 inf").is_err());
        assert!(ControlEvent::parameter(1, f32::NAN).validate().is_err());
        assert!(ControlEvent::parameter(1, -3.0).validate().is_ok());
    }

    #[test]
    fn ids_beyond_u32_are_rejected() {
        assert!(ControlEvent::parse_line("c 4294967296 1").is_err());
        assert!(ControlEvent::parse_line("i 4294967296 0 8 60 70").is_err());
    }

    #[test]
    fn display_matches_line_syntax() {
        let event = ControlEvent::note_on(1, 8.0, 64.0, 70.0);
        assert_eq!(event.to_string(), "i 1 0 8 64 70");
        assert_eq!(event.to_string().parse::<ControlEvent>().unwrap(), event);
    }
}
