use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{BridgeError, Result, StreamFormat};

/// Level and pitch features of one rendered block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterReading {
    /// Index of the block this reading belongs to, counted from 1.
    pub block: u64,
    pub rms: f32,
    pub peak: f32,
    /// Centre frequency of the strongest FFT bin, 0.0 for silence.
    pub dominant_hz: f32,
}

/// Measures blocks coming out of the render loop. The FFT plan is built once
/// per block size and reused.
pub struct BlockMeter {
    sample_rate: u32,
    channels: usize,
    blocks: u64,
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl BlockMeter {
    pub fn new(format: &StreamFormat) -> Self {
        Self {
            sample_rate: format.sample_rate,
            channels: (format.channels as usize).max(1),
            blocks: 0,
            fft_planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    /// Measures one interleaved block.
    pub fn measure(&mut self, block: &[f32]) -> Result<MeterReading> {
        let frames = block.len() / self.channels;
        if frames < 2 {
            return Err(BridgeError::fault(
                "metering requires blocks with at least two frames",
            ));
        }

        let channels = self.channels;
        let fft = self.prepare_fft(frames);
        let mut sum_squares = 0.0;
        let mut peak = 0.0f32;
        for (index, frame) in block.chunks_exact(channels).enumerate() {
            let mono = frame.iter().sum::<f32>() / channels as f32;
            sum_squares += mono * mono;
            peak = frame.iter().fold(peak, |peak, s| peak.max(s.abs()));
            fft.input[index] = mono * hann_value(index, frames);
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
            .map_err(|err| BridgeError::fault(format!("block FFT failed: {err}")))?;

        let strongest = fft
            .spectrum
            .iter()
            .enumerate()
            .skip(1)
            .map(|(bin, value)| (bin, value.norm()))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .filter(|(_, magnitude)| *magnitude > f32::EPSILON);
        let bin_hz = self.sample_rate as f32 / frames as f32;

        self.blocks += 1;
        Ok(MeterReading {
            block: self.blocks,
            rms: (sum_squares / frames as f32).sqrt(),
            peak,
            dominant_hz: strongest.map(|(bin, _)| bin as f32 * bin_hz).unwrap_or(0.0),
        })
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        if self.fft.as_ref().map_or(false, |fft| fft.size != size) {
            self.fft = None;
        }

        let planner = &mut self.fft_planner;
        self.fft
            .get_or_insert_with(|| FftResources::plan(planner, size))
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn plan(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let plan = planner.plan_fft_forward(size);
        Self {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    }
}

impl fmt::Debug for BlockMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockMeter")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("blocks", &self.blocks)
            .field("fft_size", &self.fft.as_ref().map(|fft| fft.size))
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meter(sample_rate: u32, block_size: usize, channels: u16) -> BlockMeter {
        BlockMeter::new(&StreamFormat {
            sample_rate,
            block_size,
            channels,
        })
    }

    #[test]
    fn silence_reads_zero() {
        let mut meter = meter(48_000, 1024, 1);
        let reading = meter.measure(&vec![0.0; 1024]).unwrap();
        assert_eq!(reading.block, 1);
        assert_eq!(reading.rms, 0.0);
        assert_eq!(reading.peak, 0.0);
        assert_eq!(reading.dominant_hz, 0.0);
    }

    #[test]
    fn finds_dominant_frequency_of_stereo_sine() {
        // 1000 Hz at 16 kHz with 1024-point blocks puts the tone on bin 64.
        let mut meter = meter(16_000, 1024, 2);
        let block: Vec<f32> = (0..1024)
            .flat_map(|n| {
                let s = 0.5 * (2.0 * PI * 1000.0 * n as f32 / 16_000.0).sin();
                [s, s]
            })
            .collect();

        let reading = meter.measure(&block).unwrap();
        assert!((reading.dominant_hz - 1000.0).abs() < 16.0);
        assert!((reading.peak - 0.5).abs() < 1e-3);
        assert!((reading.rms - 0.5 / 2f32.sqrt()).abs() < 1e-2);
    }

    #[test]
    fn counts_blocks_and_rejects_tiny_ones() {
        let mut meter = meter(100, 10, 1);
        meter.measure(&[0.1; 10]).unwrap();
        let reading = meter.measure(&[0.1; 10]).unwrap();
        assert_eq!(reading.block, 2);
        assert!(meter.measure(&[0.1]).is_err());
    }
}
