//! Async channel bridge between the scan thread and the Tokio runtime
//!
//! The registry runs on a plain OS thread and publishes connection changes
//! through an [`EventSink`]; the foreground awaits them on an [`EventStream`].

use crate::usb_types::{DeviceIdentity, DeviceKey};
use async_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::warn;

/// Capacity of the event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection changes reported by the device registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A new board took an empty slot
    Connected {
        slot: usize,
        identity: DeviceIdentity,
    },

    /// A known board came back and replaced its previous session
    Reconnected {
        slot: usize,
        identity: DeviceIdentity,
    },

    /// The session in `slot` lost its link
    Disconnected { slot: usize, serial_number: u64 },

    /// A board was found but could not be given a slot
    Rejected { key: DeviceKey, reason: String },
}

/// Publishing half, owned by the registry (blocking side)
#[derive(Debug, Clone)]
pub struct EventSink {
    event_tx: Sender<RegistryEvent>,
}

impl EventSink {
    /// Publish an event without blocking
    ///
    /// The scan thread must never stall on a slow consumer, so a full channel
    /// drops the event with a warning.
    pub fn publish(&self, event: RegistryEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("Event channel full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Publish an event, waiting for room (blocking)
    pub fn send_blocking(&self, event: RegistryEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Receiving half for the Tokio runtime (async)
#[derive(Debug, Clone)]
pub struct EventStream {
    event_rx: Receiver<RegistryEvent>,
}

impl EventStream {
    /// Receive the next event
    pub async fn recv(&self) -> crate::Result<RegistryEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without waiting
    pub fn try_recv(&self) -> Option<RegistryEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Drain every event currently queued
    pub fn drain(&self) -> Vec<RegistryEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Create the event channel
///
/// Returns (EventSink for the registry, EventStream for the foreground)
pub fn create_event_channel() -> (EventSink, EventStream) {
    let (event_tx, event_rx) = bounded(EVENT_CHANNEL_CAPACITY);
    (EventSink { event_tx }, EventStream { event_rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disconnected(slot: usize) -> RegistryEvent {
        RegistryEvent::Disconnected {
            slot,
            serial_number: 42,
        }
    }

    #[tokio::test]
    async fn test_event_crosses_threads() {
        let (sink, stream) = create_event_channel();

        let handle = std::thread::spawn(move || {
            sink.send_blocking(disconnected(1)).unwrap();
        });

        assert_eq!(stream.recv().await.unwrap(), disconnected(1));
        handle.join().unwrap();
    }

    #[test]
    fn test_publish_drops_when_full() {
        let (sink, stream) = create_event_channel();
        for slot in 0..EVENT_CHANNEL_CAPACITY + 10 {
            sink.publish(disconnected(slot));
        }
        let events = stream.drain();
        assert_eq!(events.len(), EVENT_CHANNEL_CAPACITY);
        assert_eq!(events[0], disconnected(0));
    }

    #[test]
    fn test_publish_after_close_is_silent() {
        let (sink, stream) = create_event_channel();
        drop(stream);
        sink.publish(disconnected(0));
        assert!(sink.send_blocking(disconnected(0)).is_err());
    }
}
