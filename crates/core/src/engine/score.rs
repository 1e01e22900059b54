//! Score definitions: function tables, performance length and timed notes.
//!
//! ```text
//! f 1 0 8192 10 1      ; table 1, 8192 points, GEN10 with one harmonic
//! f 0 600              ; keep the performance going for 600 seconds
//! i 1 0.5 2 64 70      ; instr 1 at 0.5 s for 2 s, key 64, 70 dB
//! e                    ; end of score
//! ```
//!
//! The opcode may be glued to its first field (`f1 0 8192 10 1`).

use std::{f32::consts::PI, sync::Arc};

use super::orchestra::strip_comment;
use crate::{BridgeError, NoteOn, Result};

/// Largest function table accepted, in points.
pub const MAX_TABLE_SIZE: usize = 1 << 24;

/// Sampled single-cycle waveform read by the oscillators.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionTable {
    pub id: u32,
    pub samples: Arc<[f32]>,
}

impl FunctionTable {
    /// GEN10: a sum of harmonically related sines, `strengths[k]` weighting
    /// harmonic `k + 1`, normalised to a peak of 1.0.
    pub fn harmonics(id: u32, size: usize, strengths: &[f32]) -> Option<Self> {
        let mut samples = vec![0.0f32; size];
        for (k, strength) in strengths.iter().enumerate() {
            if *strength == 0.0 {
                continue;
            }
            let harmonic = (k + 1) as f32;
            for (n, sample) in samples.iter_mut().enumerate() {
                *sample += strength * (2.0 * PI * harmonic * n as f32 / size as f32).sin();
            }
        }

        let peak = samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
        if peak <= f32::EPSILON {
            return None;
        }
        for sample in &mut samples {
            *sample /= peak;
        }

        Some(Self {
            id,
            samples: samples.into(),
        })
    }
}

/// A note the score starts at a fixed time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedNote {
    /// Seconds from the start of the performance.
    pub start: f32,
    pub note: NoteOn,
    pub line: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Score {
    pub tables: Vec<FunctionTable>,
    /// Performance length in seconds set by `f 0`. `None` runs until stopped.
    pub length: Option<f32>,
    /// Sorted by start time; equal starts keep score order.
    pub notes: Vec<TimedNote>,
}

impl Score {
    pub fn parse(text: &str) -> Result<Self> {
        let mut score = Score::default();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let statement = strip_comment(raw);
            if statement.is_empty() {
                continue;
            }

            let (opcode, fields) = split_statement(line, statement)?;
            match opcode {
                'e' => break,
                'f' => score.parse_table(line, &fields)?,
                'i' => score.parse_note(line, &fields)?,
                other => {
                    return Err(BridgeError::compile(
                        line,
                        format!("unsupported score statement `{other}`"),
                    ))
                }
            }
        }

        score
            .notes
            .sort_by(|a, b| a.start.total_cmp(&b.start));
        Ok(score)
    }

    pub fn table(&self, id: u32) -> Option<&FunctionTable> {
        self.tables.iter().find(|table| table.id == id)
    }

    fn parse_table(&mut self, line: usize, fields: &[f32]) -> Result<()> {
        let id = match fields.first() {
            Some(id) => whole(line, *id, "table number")?,
            None => return Err(BridgeError::compile(line, "`f` needs a table number")),
        };

        if id == 0 {
            let length = match fields {
                [_, length] => *length,
                _ => return Err(BridgeError::compile(line, "`f 0` takes exactly one duration")),
            };
            if !(length.is_finite() && length > 0.0) {
                return Err(BridgeError::compile(
                    line,
                    format!("performance length must be positive, got {length}"),
                ));
            }
            self.length = Some(length);
            return Ok(());
        }

        let [_, start, size, routine, strengths @ ..] = fields else {
            return Err(BridgeError::compile(
                line,
                "`f` takes a number, start, size, GEN routine and its arguments",
            ));
        };
        if *start != 0.0 {
            return Err(BridgeError::compile(
                line,
                "function tables must be created at time 0",
            ));
        }
        let size = whole(line, *size, "table size")? as usize;
        if !(2..=MAX_TABLE_SIZE).contains(&size) {
            return Err(BridgeError::compile(
                line,
                format!("table size must be between 2 and {MAX_TABLE_SIZE}, got {size}"),
            ));
        }
        if *routine != 10.0 {
            return Err(BridgeError::compile(
                line,
                format!("GEN{routine} is not supported; only GEN10 tables are"),
            ));
        }
        if self.table(id).is_some() {
            return Err(BridgeError::compile(line, format!("table {id} is defined twice")));
        }

        let table = FunctionTable::harmonics(id, size, strengths).ok_or_else(|| {
            BridgeError::compile(line, format!("table {id} has no non-zero harmonics"))
        })?;
        self.tables.push(table);
        Ok(())
    }

    fn parse_note(&mut self, line: usize, fields: &[f32]) -> Result<()> {
        let [instr, start, duration, pitch, velocity] = fields else {
            return Err(BridgeError::compile(
                line,
                format!(
                    "`i` takes 5 fields (instr start dur pitch velocity), got {}",
                    fields.len()
                ),
            ));
        };
        if *start < 0.0 {
            return Err(BridgeError::compile(line, "note start must not be negative"));
        }

        let note = NoteOn {
            instrument: whole(line, *instr, "instrument number")?,
            duration: *duration,
            pitch: *pitch,
            velocity: *velocity,
        };
        note.validate()
            .map_err(|err| BridgeError::compile(line, err.to_string()))?;

        self.notes.push(TimedNote {
            start: *start,
            note,
            line,
        });
        Ok(())
    }
}

fn split_statement(line: usize, statement: &str) -> Result<(char, Vec<f32>)> {
    let mut chars = statement.chars();
    let opcode = chars
        .next()
        .filter(char::is_ascii_alphabetic)
        .ok_or_else(|| BridgeError::compile(line, format!("expected an opcode in `{statement}`")))?;

    let fields = chars
        .as_str()
        .split_whitespace()
        .map(|field| {
            field.parse::<f32>().map_err(|_| {
                BridgeError::compile(line, format!("`{field}` is not a number"))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok((opcode, fields))
}

fn whole(line: usize, value: f32, what: &str) -> Result<u32> {
    if value.fract() != 0.0 || value < 0.0 || value >= u32::MAX as f32 {
        return Err(BridgeError::compile(
            line,
            format!("{what} must be a non-negative integer, got {value}"),
        ));
    }
    Ok(value as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SCORE;

    #[test]
    fn parses_default_score() {
        let score = Score::parse(DEFAULT_SCORE).unwrap();
        assert_eq!(score.length, Some(600.0));
        let table = score.table(1).unwrap();
        assert_eq!(table.samples.len(), 8192);
        // Quarter of the way through a sine cycle is the positive peak.
        assert!((table.samples[2048] - 1.0).abs() < 1e-4);
        assert!(table.samples[0].abs() < 1e-6);
    }

    #[test]
    fn accepts_glued_opcodes_and_sorts_notes() {
        let score = Score::parse("f1 0 16 10 1 0.5\ni1 2 1 60 70\ni 1 0.5 1 62 70\ne\ni 1 0 1 0 0 0")
            .unwrap();
        assert!(score.table(1).is_some());
        let starts: Vec<f32> = score.notes.iter().map(|n| n.start).collect();
        assert_eq!(starts, vec![0.5, 2.0]);
        assert_eq!(score.notes[1].line, 2);
    }

    #[test]
    fn normalises_multi_harmonic_tables() {
        let table = FunctionTable::harmonics(2, 512, &[1.0, 1.0, 1.0]).unwrap();
        let peak = table.samples.iter().fold(0.0f32, |p, s| p.max(s.abs()));
        assert!((peak - 1.0).abs() < 1e-6);
        assert!(FunctionTable::harmonics(3, 512, &[0.0]).is_none());
    }

    #[test]
    fn rejects_unsupported_statements() {
        for text in [
            "f 1 0 8192 9 1",
            "f 1 0 8192 10 0",
            "f 1 2 8192 10 1",
            "f 0 -5",
            "f 1 0 16 10 1\nf 1 0 16 10 1",
            "i 1 0 8 60",
            "i 1 -1 8 60 70",
            "t 0 120",
            "f 1 0 sixteen 10 1",
            "f 1 0 4000000000 10 1",
            "f 4294967296 0 16 10 1",
            "i 1 0 8 3000 70",
        ] {
            assert!(
                matches!(Score::parse(text), Err(BridgeError::Compilation { .. })),
                "`{text}` should not compile"
            );
        }
    }

    #[test]
    fn rejects_oversized_tables() {
        let text = format!("f 1 0 {} 10 1", MAX_TABLE_SIZE * 2);
        assert!(matches!(
            Score::parse(&text),
            Err(BridgeError::Compilation { line: 1, .. })
        ));
    }
}
