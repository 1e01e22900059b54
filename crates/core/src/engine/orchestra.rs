//! Instrument definitions.
//!
//! One statement per line, `;` or `#` starts a comment:
//!
//! ```text
//! sr = 44100
//! ksmps = 400
//! nchnls = 2
//! instr 1 table=1 env=triangle amp=db pitch=note gain=0
//! ```
//!
//! The header assignments are optional. When present they must agree with the
//! stream format the session renders at.

use std::collections::HashSet;

use crate::{BridgeError, Result, StreamFormat};

/// Amplitude contour applied over the duration of a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope {
    /// Linear rise over the first half of the note, linear fall over the second.
    Triangle,
    /// Full level with a short fade at both ends.
    Flat,
}

/// How p5 (the note velocity) is turned into a gain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmplitudeMode {
    /// Velocity is in dB with 0 dBFS at 32768.
    Decibels,
    /// Velocity is used as a linear gain.
    Linear,
}

/// Where a voice takes its MIDI key number from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PitchSource {
    /// The key carried by the note (p4), fixed for the voice's lifetime.
    Note,
    /// A named control value, re-read at every block once it has been set.
    Control(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentDef {
    pub id: u32,
    /// Function table the oscillator reads.
    pub table: u32,
    pub envelope: Envelope,
    pub amplitude: AmplitudeMode,
    pub pitch: PitchSource,
    /// Extra gain in dB applied on top of the velocity.
    pub gain_db: f32,
    /// Source line, kept for error reporting.
    pub line: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Orchestra {
    pub sample_rate: Option<u32>,
    pub block_size: Option<usize>,
    pub channels: Option<u16>,
    pub instruments: Vec<InstrumentDef>,
}

impl Orchestra {
    pub fn parse(text: &str) -> Result<Self> {
        let mut orchestra = Orchestra::default();
        let mut ids = HashSet::new();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let statement = strip_comment(raw);
            if statement.is_empty() {
                continue;
            }

            if let Some((name, value)) = statement.split_once('=') {
                if !statement.starts_with("instr") {
                    orchestra.parse_header(line, name.trim(), value.trim())?;
                    continue;
                }
            }

            let instrument = parse_instrument(line, statement)?;
            if !ids.insert(instrument.id) {
                return Err(BridgeError::compile(
                    line,
                    format!("instrument {} is defined twice", instrument.id),
                ));
            }
            orchestra.instruments.push(instrument);
        }

        if orchestra.instruments.is_empty() {
            return Err(BridgeError::compile(0, "orchestra defines no instruments"));
        }

        Ok(orchestra)
    }

    pub fn instrument(&self, id: u32) -> Option<&InstrumentDef> {
        self.instruments.iter().find(|instrument| instrument.id == id)
    }

    /// Rejects header values that contradict the session's stream format.
    pub fn check_format(&self, format: &StreamFormat) -> Result<()> {
        let mismatch = |name: &str, declared: String, actual: String| {
            BridgeError::compile(
                0,
                format!("orchestra declares {name} = {declared} but the session runs at {actual}"),
            )
        };

        if let Some(sr) = self.sample_rate.filter(|sr| *sr != format.sample_rate) {
            return Err(mismatch("sr", sr.to_string(), format.sample_rate.to_string()));
        }
        if let Some(ksmps) = self.block_size.filter(|k| *k != format.block_size) {
            return Err(mismatch("ksmps", ksmps.to_string(), format.block_size.to_string()));
        }
        if let Some(nchnls) = self.channels.filter(|n| *n != format.channels) {
            return Err(mismatch("nchnls", nchnls.to_string(), format.channels.to_string()));
        }
        Ok(())
    }

    fn parse_header(&mut self, line: usize, name: &str, value: &str) -> Result<()> {
        match name {
            "sr" => self.sample_rate = Some(header_value(line, name, value)?),
            "ksmps" => self.block_size = Some(header_value(line, name, value)?),
            "nchnls" => self.channels = Some(header_value(line, name, value)?),
            other => {
                return Err(BridgeError::compile(
                    line,
                    format!("unknown header variable `{other}`"),
                ))
            }
        }
        Ok(())
    }
}

fn parse_instrument(line: usize, statement: &str) -> Result<InstrumentDef> {
    let mut tokens = statement.split_whitespace();
    match tokens.next() {
        Some("instr") => {}
        Some(other) => {
            return Err(BridgeError::compile(
                line,
                format!("expected `instr`, found `{other}`"),
            ))
        }
        None => return Err(BridgeError::compile(line, "empty statement")),
    }

    let id = tokens
        .next()
        .ok_or_else(|| BridgeError::compile(line, "`instr` needs an instrument number"))?;
    let id = id
        .parse::<u32>()
        .map_err(|_| BridgeError::compile(line, format!("bad instrument number `{id}`")))?;

    let mut instrument = InstrumentDef {
        id,
        table: 1,
        envelope: Envelope::Triangle,
        amplitude: AmplitudeMode::Decibels,
        pitch: PitchSource::Note,
        gain_db: 0.0,
        line,
    };

    for option in tokens {
        let (key, value) = option.split_once('=').ok_or_else(|| {
            BridgeError::compile(line, format!("expected key=value, found `{option}`"))
        })?;
        match key {
            "table" => {
                instrument.table = value.parse().map_err(|_| {
                    BridgeError::compile(line, format!("bad table number `{value}`"))
                })?;
            }
            "env" => {
                instrument.envelope = match value {
                    "triangle" => Envelope::Triangle,
                    "flat" => Envelope::Flat,
                    _ => {
                        return Err(BridgeError::compile(
                            line,
                            format!("unknown envelope `{value}`"),
                        ))
                    }
                };
            }
            "amp" => {
                instrument.amplitude = match value {
                    "db" => AmplitudeMode::Decibels,
                    "linear" => AmplitudeMode::Linear,
                    _ => {
                        return Err(BridgeError::compile(
                            line,
                            format!("unknown amplitude mode `{value}`"),
                        ))
                    }
                };
            }
            "pitch" => {
                instrument.pitch = match value {
                    "note" => PitchSource::Note,
                    "" => return Err(BridgeError::compile(line, "empty pitch control name")),
                    name => PitchSource::Control(name.to_string()),
                };
            }
            "gain" => {
                instrument.gain_db = value
                    .parse::<f32>()
                    .ok()
                    .filter(|gain| gain.is_finite())
                    .ok_or_else(|| BridgeError::compile(line, format!("bad gain `{value}`")))?;
            }
            other => {
                return Err(BridgeError::compile(
                    line,
                    format!("unknown instrument option `{other}`"),
                ))
            }
        }
    }

    Ok(instrument)
}

/// Drops a trailing `;` or `#` comment and surrounding whitespace.
fn header_value<T>(line: usize, name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr + PartialEq + Default,
{
    value
        .parse::<T>()
        .ok()
        .filter(|number| *number != T::default())
        .ok_or_else(|| {
            BridgeError::compile(line, format!("{name} must be a positive integer, got `{value}`"))
        })
}

pub(crate) fn strip_comment(line: &str) -> &str {
    let end = line.find([';', '#']).unwrap_or(line.len());
    line[..end].trim()
}
