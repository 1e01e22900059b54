//! Default output device through cpal.
//!
//! The render thread pushes blocks into a ring buffer and the cpal callback
//! pops from it. A full ring is what paces the render loop.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    BufferSize, SampleRate, Stream, StreamConfig,
};
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapProd, HeapRb,
};
use tonebridge_core::{AudioSink, BridgeError, Result, StreamFormat};
use tracing::{error, info};

/// Blocks of audio the ring holds ahead of the device.
const RING_BLOCKS: usize = 4;
/// How long a write may wait for the device to take audio before giving up.
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

type DeviceError = Arc<Mutex<Option<String>>>;

/// Keeps the cpal stream alive. cpal streams are not `Send` on every
/// platform, so this stays on the thread that opened it.
pub struct DeviceOutput {
    _stream: Stream,
    device_name: String,
}

impl DeviceOutput {
    pub fn device_name(&self) -> &str {
        &self.device_name
    }
}

/// Render-thread half of the device output.
pub struct DeviceSink {
    producer: HeapProd<f32>,
    format: StreamFormat,
    failure: DeviceError,
    poll: Duration,
}

/// Opens the default output device at `format` and starts playback.
pub fn open_default(format: StreamFormat) -> Result<(DeviceOutput, DeviceSink)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| BridgeError::config("no default audio output device found"))?;
    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let config = StreamConfig {
        channels: format.channels,
        sample_rate: SampleRate(format.sample_rate),
        buffer_size: BufferSize::Default,
    };

    let ring = HeapRb::<f32>::new(format.block_len() * RING_BLOCKS);
    let (producer, mut consumer) = ring.split();
    let failure: DeviceError = Arc::new(Mutex::new(None));

    let callback_failure = failure.clone();
    let stream = device
        .build_output_stream(
            &config,
            move |output: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let filled = consumer.pop_slice(output);
                output[filled..].fill(0.0);
            },
            move |err| {
                error!(error = %err, "output stream error");
                if let Ok(mut failure) = callback_failure.lock() {
                    failure.get_or_insert_with(|| err.to_string());
                }
            },
            None,
        )
        .map_err(|err| BridgeError::config(format!("cannot open output stream: {err}")))?;
    stream
        .play()
        .map_err(|err| BridgeError::config(format!("cannot start output stream: {err}")))?;

    info!(
        device = %device_name,
        sample_rate = format.sample_rate,
        channels = format.channels,
        "output device opened"
    );

    let poll = (format.block_duration() / 4).max(Duration::from_millis(1));
    Ok((
        DeviceOutput {
            _stream: stream,
            device_name,
        },
        DeviceSink {
            producer,
            format,
            failure,
            poll,
        },
    ))
}

impl DeviceSink {
    fn check_device(&self) -> Result<()> {
        let failure = self
            .failure
            .lock()
            .map_err(|_| BridgeError::fault("device error slot has been poisoned"))?;
        match failure.as_deref() {
            Some(message) => Err(BridgeError::fault(format!("output device failed: {message}"))),
            None => Ok(()),
        }
    }
}

impl AudioSink for DeviceSink {
    fn write_block(&mut self, block: &[f32], format: &StreamFormat) -> Result<()> {
        if *format != self.format {
            return Err(BridgeError::fault(format!(
                "device was opened for {:?} but received {:?}",
                self.format, format
            )));
        }

        let mut remaining = block;
        let mut last_progress = Instant::now();
        while !remaining.is_empty() {
            self.check_device()?;
            let pushed = self.producer.push_slice(remaining);
            remaining = &remaining[pushed..];
            if remaining.is_empty() {
                break;
            }

            if pushed > 0 {
                last_progress = Instant::now();
            } else if last_progress.elapsed() > STALL_TIMEOUT {
                return Err(BridgeError::fault("output device stopped taking audio"));
            }
            thread::sleep(self.poll);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        // Let the device play out what is already queued.
        let deadline = Instant::now() + self.format.block_duration() * RING_BLOCKS as u32;
        while !self.producer.is_empty() && Instant::now() < deadline {
            thread::sleep(self.poll);
        }
        Ok(())
    }
}
