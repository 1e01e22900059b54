//! Lifecycle of one engine instance and its render loop.
//!
//! ```text
//! Created --configure--> Configured --start--> Rendering --stop/fault/finish--> Stopped
//! ```
//!
//! The render loop runs on its own thread and owns the engine and the sink
//! while it runs. The event queue, the state cell, the stop flag and the
//! per-block status snapshot are the only things shared with other threads.

use std::{
    collections::BTreeMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    bridge::{self, EventQueue},
    AudioSink, BlockMeter, BlockStatus, BridgeError, ControlBridge, ControlEvent, MeterReading,
    Result, SessionConfig, SynthEngine,
};

const RENDER_THREAD_NAME: &str = "tonebridge-render";

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Configured = 1,
    Rendering = 2,
    Stopped = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Configured,
            2 => Self::Rendering,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Configured => "configured",
            Self::Rendering => "rendering",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Atomic holder for [`SessionState`], shared with bridges and the render
/// thread.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: SessionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// What the render loop reported after its most recent block.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStatus {
    pub blocks_rendered: u64,
    pub frames_rendered: u64,
    pub active_voices: usize,
    pub controls: BTreeMap<String, f32>,
    pub meter: Option<MeterReading>,
}

/// A fatal render-loop error, delivered once on the fault channel.
#[derive(Debug)]
pub struct SessionFault {
    /// Index of the block that failed, counted from 1.
    pub block: u64,
    /// Always [`BridgeError::EngineFault`].
    pub error: BridgeError,
}

impl fmt::Display for SessionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {}: {}", self.block, self.error)
    }
}

#[derive(Debug)]
struct Shared {
    state: Arc<StateCell>,
    stop: AtomicBool,
    status: Mutex<SessionStatus>,
}

impl Shared {
    fn lock_status(&self) -> Result<MutexGuard<'_, SessionStatus>> {
        self.status
            .lock()
            .map_err(|_| BridgeError::fault("session status has been poisoned"))
    }
}

/// One audio engine instance with an explicit lifecycle.
pub struct EngineSession {
    shared: Arc<Shared>,
    config: Option<SessionConfig>,
    engine: Option<Box<dyn SynthEngine>>,
    sink: Option<Box<dyn AudioSink>>,
    queue: Option<EventQueue>,
    bridge: ControlBridge,
    zero_capacity: bool,
    fault_tx: Sender<SessionFault>,
    fault_rx: Receiver<SessionFault>,
    render_thread: Option<JoinHandle<()>>,
}

impl EngineSession {
    /// Creates a session with an unbounded control queue.
    pub fn new(engine: impl SynthEngine + 'static, sink: impl AudioSink + 'static) -> Self {
        Self::build(Box::new(engine), Box::new(sink), None)
    }

    /// Creates a session whose control queue holds at most `capacity` events.
    /// Senders get [`BridgeError::QueueOverflow`] when it is full.
    pub fn with_queue_capacity(
        engine: impl SynthEngine + 'static,
        sink: impl AudioSink + 'static,
        capacity: usize,
    ) -> Self {
        Self::build(Box::new(engine), Box::new(sink), Some(capacity))
    }

    fn build(
        engine: Box<dyn SynthEngine>,
        sink: Box<dyn AudioSink>,
        capacity: Option<usize>,
    ) -> Self {
        // A zero-capacity crossbeam channel is a rendezvous channel; keep one
        // slot so `configure` can report the mistake instead.
        let queue = EventQueue::new(capacity.map(|capacity| capacity.max(1)));
        let state = Arc::new(StateCell::new(SessionState::Created));
        let bridge = queue.bridge(state.clone());
        let (fault_tx, fault_rx) = crossbeam_channel::unbounded();

        Self {
            shared: Arc::new(Shared {
                state,
                stop: AtomicBool::new(false),
                status: Mutex::new(SessionStatus::default()),
            }),
            config: None,
            engine: Some(engine),
            sink: Some(sink),
            queue: Some(queue),
            bridge,
            zero_capacity: capacity == Some(0),
            fault_tx,
            fault_rx,
            render_thread: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.get()
    }

    /// Configuration accepted by the last successful [`configure`](Self::configure).
    pub fn config(&self) -> Option<&SessionConfig> {
        self.config.as_ref()
    }

    /// A new producer handle onto this session's control queue.
    pub fn bridge(&self) -> ControlBridge {
        self.bridge.clone()
    }

    /// Receiver for render-loop faults. Every clone sees each fault once
    /// between them.
    pub fn faults(&self) -> Receiver<SessionFault> {
        self.fault_rx.clone()
    }

    /// Latest snapshot published by the render loop.
    pub fn status(&self) -> Result<SessionStatus> {
        Ok(self.shared.lock_status()?.clone())
    }

    /// Validates `config` and compiles its orchestra and score.
    ///
    /// Allowed until the session starts rendering. A failed attempt leaves the
    /// session unconfigured, so [`start`](Self::start) stays unreachable until
    /// a later call succeeds.
    pub fn configure(&mut self, config: SessionConfig) -> Result<()> {
        match self.state() {
            SessionState::Created | SessionState::Configured => {}
            state => {
                return Err(BridgeError::config(format!(
                    "cannot configure a session that is {state}"
                )))
            }
        }

        self.config = None;
        self.shared.state.set(SessionState::Created);

        if self.zero_capacity {
            return Err(BridgeError::config("control queue capacity must be positive"));
        }
        config.validate()?;

        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| BridgeError::config("session has no engine"))?;
        engine.compile(config.format(), &config.orchestra, &config.score)?;

        info!(
            sample_rate = config.sample_rate,
            block_size = config.block_size,
            channels = config.channels,
            "session configured"
        );
        self.config = Some(config);
        self.shared.state.set(SessionState::Configured);
        Ok(())
    }

    /// Starts the render loop on a dedicated thread.
    pub fn start(&mut self) -> Result<()> {
        let state = self.state();
        if state != SessionState::Configured {
            return Err(BridgeError::config(format!(
                "cannot start a session that is {state}"
            )));
        }

        let config = self
            .config
            .clone()
            .ok_or_else(|| BridgeError::config("session is not configured"))?;
        let (engine, sink, queue) = match (self.engine.take(), self.sink.take(), self.queue.take())
        {
            (Some(engine), Some(sink), Some(queue)) => (engine, sink, queue),
            _ => return Err(BridgeError::config("session resources already handed out")),
        };

        let meter = (config.metering && config.block_size >= 2)
            .then(|| BlockMeter::new(&config.format()));
        let render = RenderLoop {
            block: vec![0.0; config.format().block_len()],
            engine,
            sink,
            events: queue.into_receiver(),
            config,
            meter,
            shared: self.shared.clone(),
            faults: self.fault_tx.clone(),
            blocks: 0,
            current: 1,
        };

        self.shared.state.set(SessionState::Rendering);
        let spawned = thread::Builder::new()
            .name(RENDER_THREAD_NAME.to_string())
            .spawn(move || render.run());
        match spawned {
            Ok(handle) => {
                self.render_thread = Some(handle);
                info!("render loop started");
                Ok(())
            }
            Err(err) => {
                self.shared.state.set(SessionState::Stopped);
                Err(err.into())
            }
        }
    }

    /// Asks the render loop to exit after its current block and waits for the
    /// thread to finish. Safe to call any number of times.
    pub fn stop(&mut self) {
        if self.render_thread.is_none() {
            if self.state() != SessionState::Stopped {
                self.shared.state.set(SessionState::Stopped);
                info!("session stopped before rendering");
            }
            self.queue = None;
            return;
        }

        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.render_thread.take() {
            // Panics inside the loop are reported by the render thread itself;
            // this only catches one escaping the fault report.
            if handle.join().is_err() {
                let block = self
                    .status()
                    .map(|status| status.blocks_rendered + 1)
                    .unwrap_or_default();
                error!(block, "render thread panicked");
                let _ = self.fault_tx.send(SessionFault {
                    block,
                    error: BridgeError::fault("render thread panicked"),
                });
            }
        }
        self.shared.state.set(SessionState::Stopped);
        info!("session stopped");
    }

    /// Polls until at least `blocks` blocks have been rendered, the session
    /// stops, or `timeout` passes. Returns whether the block count was reached.
    pub fn wait_for_blocks(&self, blocks: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let rendered = self
                .status()
                .map(|status| status.blocks_rendered)
                .unwrap_or_default();
            if rendered >= blocks {
                return true;
            }
            if self.state() == SessionState::Stopped || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSession")
            .field("state", &self.state())
            .field("config", &self.config)
            .field("rendering", &self.render_thread.is_some())
            .finish()
    }
}

enum Exit {
    StopRequested,
    Finished,
}

/// Everything the render thread owns.
struct RenderLoop {
    engine: Box<dyn SynthEngine>,
    sink: Box<dyn AudioSink>,
    events: Receiver<ControlEvent>,
    config: SessionConfig,
    meter: Option<BlockMeter>,
    block: Vec<f32>,
    shared: Arc<Shared>,
    faults: Sender<SessionFault>,
    /// Blocks fully rendered.
    blocks: u64,
    /// Block being processed, counted from 1.
    current: u64,
}

impl RenderLoop {
    fn run(mut self) {
        // Marks the session stopped even if the loop unwinds.
        let _stopped = StopOnExit(self.shared.clone());

        let mut outcome = catch_panic(|| self.perform());
        if let Err(err) = catch_panic(|| self.sink.finish()) {
            match outcome {
                Ok(_) => outcome = Err(err),
                Err(_) => warn!(error = %err, "sink failed to finish after a fault"),
            }
        }

        match outcome {
            Ok(Exit::StopRequested) => info!(blocks = self.blocks, "render loop stopped"),
            Ok(Exit::Finished) => info!(blocks = self.blocks, "performance finished"),
            Err(err) => {
                let fault = SessionFault {
                    block: self.current,
                    error: into_fault(err),
                };
                error!(block = fault.block, error = %fault.error, "render loop failed");
                let _ = self.faults.send(fault);
            }
        }
    }

    fn perform(&mut self) -> Result<Exit> {
        let format = self.config.format();
        loop {
            if self.shared.stop.load(Ordering::Acquire) {
                return Ok(Exit::StopRequested);
            }

            self.current = self.blocks + 1;
            self.apply_pending()?;
            let status = self.engine.render_block(&mut self.block)?;
            self.blocks += 1;
            self.publish()?;
            self.sink.write_block(&self.block, &format)?;

            if status == BlockStatus::Finished {
                return Ok(Exit::Finished);
            }
        }
    }

    fn apply_pending(&mut self) -> Result<()> {
        for event in bridge::drain(&self.events) {
            match event {
                ControlEvent::NoteOn(note) => match self.engine.schedule_note(&note) {
                    Ok(()) => debug!(%event, block = self.blocks + 1, "note scheduled"),
                    Err(err) if err.is_fault() => return Err(err),
                    Err(err) => warn!(%event, error = %err, "note skipped"),
                },
                ControlEvent::ParameterChange(change) => {
                    let Some(binding) = self.config.binding(change.slider) else {
                        warn!(slider = change.slider, "no control bound to slider, event skipped");
                        continue;
                    };
                    let value = binding.clamp(change.value);
                    self.engine.set_control_value(&binding.name, value);
                    debug!(control = %binding.name, value, "control updated");
                }
            }
        }
        Ok(())
    }

    fn publish(&mut self) -> Result<()> {
        let meter = match &mut self.meter {
            Some(meter) => Some(meter.measure(&self.block)?),
            None => None,
        };

        let mut status = self.shared.lock_status()?;
        status.blocks_rendered = self.blocks;
        status.frames_rendered = self.blocks * self.config.block_size as u64;
        status.active_voices = self.engine.active_voices();
        status.controls = self.engine.controls();
        status.meter = meter;
        Ok(())
    }
}

struct StopOnExit(Arc<Shared>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.0.state.set(SessionState::Stopped);
    }
}

/// Runs `f`, turning a panic into an engine fault carrying its message.
fn catch_panic<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Err(BridgeError::fault(format!("render thread panicked: {message}")))
    })
}

fn into_fault(err: BridgeError) -> BridgeError {
    if err.is_fault() {
        err
    } else {
        BridgeError::fault(err.to_string())
    }
}
