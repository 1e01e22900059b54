//! The only way for UI code to influence a running session.
//!
//! [`ControlBridge`] is a cheap, cloneable producer over the session's event
//! queue. Sending never waits for the render loop; the loop drains whatever
//! is queued at the start of each block.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::debug;

use crate::{session::StateCell, BridgeError, ControlEvent, Result, SessionState};

/// FIFO of control events between any number of producers and the render
/// loop. Unbounded unless built with a capacity.
#[derive(Debug)]
pub(crate) struct EventQueue {
    sender: Sender<ControlEvent>,
    receiver: Receiver<ControlEvent>,
    capacity: Option<usize>,
}

impl EventQueue {
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        let (sender, receiver) = match capacity {
            Some(capacity) => crossbeam_channel::bounded(capacity),
            None => crossbeam_channel::unbounded(),
        };
        Self {
            sender,
            receiver,
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub(crate) fn bridge(&self, state: Arc<StateCell>) -> ControlBridge {
        ControlBridge {
            sender: self.sender.clone(),
            state,
            capacity: self.capacity,
        }
    }

    pub(crate) fn into_receiver(self) -> Receiver<ControlEvent> {
        self.receiver
    }
}

/// Takes every event queued when the call starts, in submission order. Events
/// that arrive while draining wait for the next block.
pub(crate) fn drain(receiver: &Receiver<ControlEvent>) -> impl Iterator<Item = ControlEvent> + '_ {
    let pending = receiver.len();
    receiver.try_iter().take(pending)
}

/// Producer handle given to UI event handlers.
#[derive(Debug, Clone)]
pub struct ControlBridge {
    sender: Sender<ControlEvent>,
    state: Arc<StateCell>,
    capacity: Option<usize>,
}

impl ControlBridge {
    /// Enqueues `event` without waiting for it to be applied.
    ///
    /// Sending to a stopped session is a no-op. A full bounded queue returns
    /// [`BridgeError::QueueOverflow`] and leaves the queue untouched.
    pub fn send(&self, event: ControlEvent) -> Result<()> {
        event.validate()?;

        if self.state.get() == SessionState::Stopped {
            debug!(%event, "session stopped, event discarded");
            return Ok(());
        }

        match self.sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(BridgeError::QueueOverflow {
                capacity: self.capacity.unwrap_or_default(),
            }),
            Err(TrySendError::Disconnected(event)) => {
                debug!(%event, "render loop gone, event discarded");
                Ok(())
            }
        }
    }

    /// Parses a line event (`i 1 0 8 60 70`, `c 1 72`) and sends it.
    pub fn send_line(&self, line: &str) -> Result<()> {
        self.send(ControlEvent::parse_line(line)?)
    }

    /// False once the session has stopped, whether by request or by fault.
    pub fn is_live(&self) -> bool {
        self.state.get() != SessionState::Stopped
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Events queued but not yet drained by the render loop.
    pub fn pending(&self) -> usize {
        self.sender.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge(capacity: Option<usize>) -> (EventQueue, ControlBridge, Arc<StateCell>) {
        let queue = EventQueue::new(capacity);
        let state = Arc::new(StateCell::new(SessionState::Created));
        let bridge = queue.bridge(state.clone());
        (queue, bridge, state)
    }

    #[test]
    fn preserves_submission_order() {
        let (queue, bridge, _) = bridge(None);
        for value in 0..5 {
            bridge.send(ControlEvent::parameter(1, value as f32)).unwrap();
        }
        let receiver = queue.into_receiver();
        let values: Vec<f32> = drain(&receiver)
            .map(|event| match event {
                ControlEvent::ParameterChange(change) => change.value,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(drain(&receiver).count(), 0);
    }

    #[test]
    fn drain_stops_at_the_snapshot() {
        let (queue, bridge, _) = bridge(None);
        bridge.send(ControlEvent::parameter(1, 1.0)).unwrap();
        bridge.send(ControlEvent::parameter(1, 2.0)).unwrap();
        let receiver = queue.into_receiver();

        let mut drained = drain(&receiver);
        assert!(drained.next().is_some());
        bridge.send(ControlEvent::parameter(1, 3.0)).unwrap();
        assert!(drained.next().is_some());
        assert!(drained.next().is_none());
        drop(drained);

        assert_eq!(drain(&receiver).count(), 1);
    }

    #[test]
    fn full_queue_reports_backpressure() {
        let (queue, bridge, _) = bridge(Some(2));
        assert_eq!(queue.capacity(), Some(2));
        bridge.send(ControlEvent::parameter(1, 1.0)).unwrap();
        bridge.send(ControlEvent::parameter(1, 2.0)).unwrap();
        let err = bridge.send(ControlEvent::parameter(1, 3.0)).unwrap_err();
        assert!(matches!(err, BridgeError::QueueOverflow { capacity: 2 }));
        assert_eq!(bridge.pending(), 2);
    }

    #[test]
    fn stopped_session_discards_events() {
        let (queue, bridge, state) = bridge(None);
        state.set(SessionState::Stopped);
        assert!(!bridge.is_live());
        bridge.send(ControlEvent::note_on(1, 8.0, 60.0, 70.0)).unwrap();
        assert_eq!(drain(&queue.into_receiver()).count(), 0);
    }

    #[test]
    fn disconnected_queue_is_not_an_error() {
        let (queue, bridge, _) = bridge(None);
        drop(queue);
        bridge.send(ControlEvent::parameter(1, 1.0)).unwrap();
    }

    #[test]
    fn rejects_malformed_notes_synchronously() {
        let (_queue, bridge, _) = bridge(None);
        let err = bridge
            .send(ControlEvent::note_on(1, -1.0, 60.0, 70.0))
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidEvent(_)));
        assert!(bridge.send_line("i 1 0 8 60 70").is_ok());
        assert!(bridge.send_line("q").is_err());
        assert!(bridge.send(ControlEvent::parameter(1, f32::NAN)).is_err());
        assert!(bridge.send(ControlEvent::note_on(1, 8.0, 3000.0, 70.0)).is_err());
        assert_eq!(bridge.pending(), 1);
    }
}
