//! Built-in table-lookup synthesizer.
//!
//! Each voice reads a function table with an interpolating oscillator, shapes
//! it with the instrument's envelope and writes the same signal to every
//! output channel. Notes from the score start at the first block boundary at
//! or after their start time; notes scheduled through
//! [`SynthEngine::schedule_note`] start at the next rendered block.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
};

use tracing::debug;

use super::{
    AmplitudeMode, BlockStatus, Envelope, InstrumentDef, Orchestra, PitchSource, Score,
    StreamFormat, SynthEngine,
};
use crate::{event::MAX_KEY, BridgeError, NoteOn, Result};

/// Amplitude that corresponds to 0 dBFS for `amp=db` instruments.
const ZERO_DBFS: f32 = 32_768.0;
/// Fade length used at both ends of a `flat` envelope.
const FLAT_FADE_SECONDS: f32 = 0.005;

/// MIDI key to Hz, via octave point decimal: key / 12 + 3 octaves, with
/// octave 8.75 at 440 Hz.
pub fn key_to_hz(key: f32) -> f32 {
    let octave = key / 12.0 + 3.0;
    440.0 * 2f32.powf(octave - 8.75)
}

/// Decibels to linear amplitude on a 32768 full scale.
pub fn db_to_amplitude(db: f32) -> f32 {
    10f32.powf(db / 20.0) / ZERO_DBFS
}

/// Control value read as a key, kept within the playable range.
fn control_key(controls: &BTreeMap<String, f32>, name: &str) -> Option<f32> {
    controls
        .get(name)
        .copied()
        .filter(|key| key.is_finite())
        .map(|key| key.clamp(0.0, MAX_KEY))
}

#[derive(Debug)]
struct Compiled {
    format: StreamFormat,
    instruments: HashMap<u32, InstrumentDef>,
    tables: HashMap<u32, Arc<[f32]>>,
    length_frames: Option<u64>,
}

#[derive(Debug)]
struct PendingNote {
    start_frame: u64,
    note: NoteOn,
}

#[derive(Debug)]
struct Voice {
    instrument: u32,
    table: Arc<[f32]>,
    /// Read position in table points.
    phase: f32,
    /// Table points advanced per frame.
    increment: f32,
    key: f32,
    amplitude: f32,
    envelope: Envelope,
    pitch: PitchSource,
    total_frames: u64,
    elapsed: u64,
    fade_frames: u64,
}

impl Voice {
    fn retune(&mut self, key: f32, sample_rate: u32) {
        self.key = key;
        self.increment = key_to_hz(key) * self.table.len() as f32 / sample_rate as f32;
    }

    fn is_finished(&self) -> bool {
        self.elapsed >= self.total_frames
    }

    fn envelope_level(&self) -> f32 {
        let total = self.total_frames as f32;
        let t = self.elapsed as f32;
        match self.envelope {
            Envelope::Triangle => {
                let half = total * 0.5;
                if t < half {
                    t / half
                } else {
                    ((total - t) / half).max(0.0)
                }
            }
            Envelope::Flat => {
                let fade = self.fade_frames as f32;
                if fade <= 0.0 {
                    1.0
                } else if t < fade {
                    t / fade
                } else if t > total - fade {
                    ((total - t) / fade).max(0.0)
                } else {
                    1.0
                }
            }
        }
    }

    fn read_table(&self) -> f32 {
        let len = self.table.len();
        let index = self.phase as usize % len;
        let next = (index + 1) % len;
        let frac = self.phase.fract();
        self.table[index] + (self.table[next] - self.table[index]) * frac
    }

    /// Mixes this voice into `mix` until the block ends or the note does.
    fn render_into(&mut self, mix: &mut [f32]) {
        let len = self.table.len() as f32;
        for sample in mix.iter_mut() {
            if self.is_finished() {
                break;
            }
            *sample += self.read_table() * self.envelope_level() * self.amplitude;
            self.phase += self.increment;
            if self.phase >= len {
                self.phase %= len;
            }
            self.elapsed += 1;
        }
    }
}

/// Table oscillator engine compiled from the text orchestra and score formats.
#[derive(Debug, Default)]
pub struct ToneEngine {
    compiled: Option<Compiled>,
    pending: VecDeque<PendingNote>,
    voices: Vec<Voice>,
    controls: BTreeMap<String, f32>,
    /// Frames rendered since the performance started.
    frame: u64,
    mix: Vec<f32>,
}

impl ToneEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// MIDI keys of the running voices, in start order.
    pub fn voice_keys(&self) -> Vec<f32> {
        self.voices.iter().map(|voice| voice.key).collect()
    }

    fn compiled(&self) -> Result<&Compiled> {
        self.compiled
            .as_ref()
            .ok_or_else(|| BridgeError::config("engine has not been compiled"))
    }

    fn start_voice(&mut self, note: &NoteOn) -> Result<()> {
        note.validate()?;
        let compiled = self.compiled()?;
        let instrument = compiled.instruments.get(&note.instrument).ok_or_else(|| {
            BridgeError::InvalidEvent(format!("instrument {} is not defined", note.instrument))
        })?;
        // Table references are checked at compile time.
        let table = compiled
            .tables
            .get(&instrument.table)
            .cloned()
            .ok_or_else(|| BridgeError::fault(format!("table {} vanished", instrument.table)))?;

        let sample_rate = compiled.format.sample_rate;
        let total_frames = compiled.format.frames(note.duration).max(1);
        let fade_frames = compiled
            .format
            .frames(FLAT_FADE_SECONDS)
            .min(total_frames / 2);
        let amplitude = match instrument.amplitude {
            AmplitudeMode::Decibels => db_to_amplitude(note.velocity + instrument.gain_db),
            AmplitudeMode::Linear => note.velocity * 10f32.powf(instrument.gain_db / 20.0),
        };
        let key = match &instrument.pitch {
            PitchSource::Note => note.pitch,
            PitchSource::Control(name) => control_key(&self.controls, name).unwrap_or(note.pitch),
        };

        let mut voice = Voice {
            instrument: instrument.id,
            table,
            phase: 0.0,
            increment: 0.0,
            key,
            amplitude,
            envelope: instrument.envelope,
            pitch: instrument.pitch.clone(),
            total_frames,
            elapsed: 0,
            fade_frames,
        };
        voice.retune(key, sample_rate);

        debug!(
            instrument = voice.instrument,
            key,
            frames = total_frames,
            at = self.frame,
            "voice started"
        );
        self.voices.push(voice);
        Ok(())
    }
}

impl SynthEngine for ToneEngine {
    fn compile(&mut self, format: StreamFormat, orchestra: &str, score: &str) -> Result<()> {
        let orchestra = Orchestra::parse(orchestra)?;
        orchestra.check_format(&format)?;
        let score = Score::parse(score)?;

        for instrument in &orchestra.instruments {
            if score.table(instrument.table).is_none() {
                return Err(BridgeError::compile(
                    instrument.line,
                    format!(
                        "instrument {} reads table {} which the score does not define",
                        instrument.id, instrument.table
                    ),
                ));
            }
        }
        for timed in &score.notes {
            if orchestra.instrument(timed.note.instrument).is_none() {
                return Err(BridgeError::compile(
                    timed.line,
                    format!("score plays undefined instrument {}", timed.note.instrument),
                ));
            }
        }

        self.compiled = Some(Compiled {
            format,
            instruments: orchestra
                .instruments
                .into_iter()
                .map(|instrument| (instrument.id, instrument))
                .collect(),
            tables: score
                .tables
                .into_iter()
                .map(|table| (table.id, table.samples))
                .collect(),
            length_frames: score.length.map(|seconds| format.frames(seconds)),
        });
        self.pending = score
            .notes
            .into_iter()
            .map(|timed| PendingNote {
                start_frame: format.frames(timed.start),
                note: timed.note,
            })
            .collect();
        self.voices.clear();
        self.controls.clear();
        self.frame = 0;
        self.mix = vec![0.0; format.block_size];
        Ok(())
    }

    fn schedule_note(&mut self, note: &NoteOn) -> Result<()> {
        self.start_voice(note)
    }

    fn set_control_value(&mut self, name: &str, value: f32) {
        self.controls.insert(name.to_string(), value);
    }

    fn control_value(&self, name: &str) -> Option<f32> {
        self.controls.get(name).copied()
    }

    fn controls(&self) -> BTreeMap<String, f32> {
        self.controls.clone()
    }

    fn render_block(&mut self, out: &mut [f32]) -> Result<BlockStatus> {
        let compiled = self.compiled()?;
        let format = compiled.format;
        let length_frames = compiled.length_frames;
        if out.len() != format.block_len() {
            return Err(BridgeError::fault(format!(
                "render buffer holds {} samples, a block needs {}",
                out.len(),
                format.block_len()
            )));
        }

        while let Some(pending) = self.pending.front() {
            if pending.start_frame > self.frame {
                break;
            }
            let note = pending.note;
            self.pending.pop_front();
            self.start_voice(&note)?;
        }

        for voice in &mut self.voices {
            if let PitchSource::Control(name) = &voice.pitch {
                if let Some(key) = control_key(&self.controls, name) {
                    if key != voice.key {
                        voice.retune(key, format.sample_rate);
                    }
                }
            }
        }

        self.mix.fill(0.0);
        for voice in &mut self.voices {
            voice.render_into(&mut self.mix);
        }
        self.voices.retain(|voice| !voice.is_finished());

        let channels = format.channels as usize;
        for (frame, value) in out.chunks_exact_mut(channels).zip(&self.mix) {
            frame.fill(*value);
        }

        self.frame += format.block_size as u64;
        match length_frames {
            Some(length) if self.frame >= length => Ok(BlockStatus::Finished),
            _ => Ok(BlockStatus::Running),
        }
    }

    fn active_voices(&self) -> usize {
        self.voices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_ORCHESTRA, DEFAULT_SCORE};

    fn format() -> StreamFormat {
        StreamFormat {
            sample_rate: 44_100,
            block_size: 400,
            channels: 2,
        }
    }

    fn compiled(orchestra: &str, score: &str) -> ToneEngine {
        let mut engine = ToneEngine::new();
        engine.compile(format(), orchestra, score).unwrap();
        engine
    }

    #[test]
    fn middle_c_and_concert_a() {
        assert!((key_to_hz(60.0) - 261.626).abs() < 0.01);
        assert!((key_to_hz(69.0) - 440.0).abs() < 0.01);
        assert!((db_to_amplitude(70.0) - 0.0965).abs() < 0.001);
    }

    #[test]
    fn note_renders_into_every_channel() {
        let mut engine = compiled(DEFAULT_ORCHESTRA, DEFAULT_SCORE);
        engine
            .schedule_note(&NoteOn {
                instrument: 1,
                duration: 8.0,
                pitch: 60.0,
                velocity: 70.0,
            })
            .unwrap();

        let mut block = vec![0.0; format().block_len()];
        assert_eq!(engine.render_block(&mut block).unwrap(), BlockStatus::Running);
        assert_eq!(engine.active_voices(), 1);
        assert!(block.iter().any(|s| *s != 0.0));
        for frame in block.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
        }
        // Triangle envelope: the first block of an 8 s note is still quiet.
        let peak = block.iter().fold(0.0f32, |p, s| p.max(s.abs()));
        assert!(peak < 0.01);
    }

    #[test]
    fn voices_end_with_their_duration() {
        let mut engine = compiled(DEFAULT_ORCHESTRA, DEFAULT_SCORE);
        // 0.02 s = 882 frames, just over two blocks.
        engine
            .schedule_note(&NoteOn {
                instrument: 1,
                duration: 0.02,
                pitch: 60.0,
                velocity: 70.0,
            })
            .unwrap();

        let mut block = vec![0.0; format().block_len()];
        engine.render_block(&mut block).unwrap();
        engine.render_block(&mut block).unwrap();
        assert_eq!(engine.active_voices(), 1);
        engine.render_block(&mut block).unwrap();
        assert_eq!(engine.active_voices(), 0);
        engine.render_block(&mut block).unwrap();
        assert!(block.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn control_bound_voices_follow_the_control() {
        let mut engine = compiled(
            "instr 2 pitch=pitch env=flat",
            "f 1 0 1024 10 1",
        );
        engine
            .schedule_note(&NoteOn {
                instrument: 2,
                duration: 4.0,
                pitch: 60.0,
                velocity: 80.0,
            })
            .unwrap();
        let mut block = vec![0.0; format().block_len()];
        engine.render_block(&mut block).unwrap();
        assert_eq!(engine.voice_keys(), vec![60.0]);

        engine.set_control_value("pitch", 72.0);
        engine.render_block(&mut block).unwrap();
        assert_eq!(engine.voice_keys(), vec![72.0]);
        assert_eq!(engine.control_value("pitch"), Some(72.0));
    }

    #[test]
    fn out_of_range_pitches_never_reach_the_output() {
        let mut engine = compiled(
            "instr 1 env=flat\ninstr 2 pitch=pitch env=flat",
            "f 1 0 1024 10 1",
        );
        let err = engine
            .schedule_note(&NoteOn {
                instrument: 1,
                duration: 8.0,
                pitch: 3000.0,
                velocity: 70.0,
            })
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidEvent(_)));

        engine
            .schedule_note(&NoteOn {
                instrument: 2,
                duration: 8.0,
                pitch: 60.0,
                velocity: 70.0,
            })
            .unwrap();
        engine.set_control_value("pitch", 3000.0);
        let mut block = vec![0.0; format().block_len()];
        for _ in 0..50 {
            engine.render_block(&mut block).unwrap();
            assert!(block.iter().all(|s| s.is_finite()));
        }
        assert_eq!(engine.voice_keys(), vec![127.0]);

        engine.set_control_value("pitch", f32::NAN);
        engine.render_block(&mut block).unwrap();
        assert!(block.iter().all(|s| s.is_finite()));
        assert_eq!(engine.voice_keys(), vec![127.0]);
    }

    #[test]
    fn score_notes_start_at_block_boundaries() {
        // 0.01 s = 441 frames, so the note waits for the block starting at 800.
        let mut engine = compiled(DEFAULT_ORCHESTRA, "f 1 0 256 10 1\ni 1 0.01 1 60 70");
        let mut block = vec![0.0; format().block_len()];
        engine.render_block(&mut block).unwrap();
        assert_eq!(engine.active_voices(), 0);
        engine.render_block(&mut block).unwrap();
        assert_eq!(engine.active_voices(), 0);
        engine.render_block(&mut block).unwrap();
        assert_eq!(engine.active_voices(), 1);
    }

    #[test]
    fn performance_length_finishes_the_engine() {
        // 0.02 s = 882 frames, reached during the third block.
        let mut engine = compiled(DEFAULT_ORCHESTRA, "f 1 0 256 10 1\nf 0 0.02");
        let mut block = vec![0.0; format().block_len()];
        assert_eq!(engine.render_block(&mut block).unwrap(), BlockStatus::Running);
        assert_eq!(engine.render_block(&mut block).unwrap(), BlockStatus::Running);
        assert_eq!(engine.render_block(&mut block).unwrap(), BlockStatus::Finished);
    }

    #[test]
    fn rejects_dangling_references_and_unknown_instruments() {
        let mut engine = ToneEngine::new();
        let err = engine
            .compile(format(), "instr 1 table=7", "f 1 0 256 10 1")
            .unwrap_err();
        assert!(matches!(err, BridgeError::Compilation { line: 1, .. }));

        let err = engine
            .compile(format(), "instr 1", "f 1 0 256 10 1\ni 9 0 1 60 70")
            .unwrap_err();
        assert!(matches!(err, BridgeError::Compilation { line: 2, .. }));

        let mut engine = compiled(DEFAULT_ORCHESTRA, DEFAULT_SCORE);
        let err = engine
            .schedule_note(&NoteOn {
                instrument: 5,
                duration: 1.0,
                pitch: 60.0,
                velocity: 70.0,
            })
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidEvent(_)));
    }

    #[test]
    fn rendering_before_compile_is_an_error() {
        let mut engine = ToneEngine::new();
        let mut block = vec![0.0; 800];
        assert!(engine.render_block(&mut block).is_err());
    }
}
