//! Pipeline state notifications
//!
//! The pipeline never calls into consumer code from its own threads.
//! Instead it publishes [`PipelineEvent`]s on crossbeam channels; each
//! subscriber drains its receiver on a thread it owns.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::{Mutex, PoisonError};

/// State transitions published by the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Control session established and capture binner running
    Started,
    /// Acquisition began
    CaptureStarted,
    /// Acquisition paused; the session stays up
    CaptureStopped,
    /// Session torn down by request
    Stopped,
    /// Session torn down after an error
    Failed(String),
}

impl PipelineEvent {
    /// Whether capture is running after this event
    pub fn capture_running(&self) -> bool {
        matches!(self, PipelineEvent::CaptureStarted)
    }
}

/// Fan-out of events to any number of subscribers
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<PipelineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> Receiver<PipelineEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, forgetting dropped ones
    pub fn publish(&self, event: PipelineEvent) {
        tracing::debug!("Pipeline event: {:?}", event);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_and_pruning() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(PipelineEvent::CaptureStarted);
        assert_eq!(a.try_recv().unwrap(), PipelineEvent::CaptureStarted);
        assert_eq!(b.try_recv().unwrap(), PipelineEvent::CaptureStarted);

        drop(b);
        bus.publish(PipelineEvent::Stopped);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(a.try_recv().unwrap(), PipelineEvent::Stopped);
    }

    #[test]
    fn test_capture_running() {
        assert!(PipelineEvent::CaptureStarted.capture_running());
        assert!(!PipelineEvent::Failed("x".into()).capture_running());
        assert!(!PipelineEvent::Started.capture_running());
    }
}
