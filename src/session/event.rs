use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

use crate::engine::{EngineError, LogLevel, RequestId};

/// Notification produced by a session and consumed by its supervisor
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connect { error: Option<EngineError> },
    Disconnect { error: Option<EngineError> },
    SubscribeAck { request_id: RequestId, accepted: bool },
    UnsubscribeAck { request_id: RequestId },
    PublishAck { request_id: RequestId },
    Message {
        request_id: RequestId,
        topic: String,
        payload: Vec<u8>,
    },
    Log { level: LogLevel, text: String },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Connect { error: None } => write!(f, "connect"),
            Event::Connect { error: Some(e) } => write!(f, "connect failed ({})", e),
            Event::Disconnect { error: None } => write!(f, "disconnect"),
            Event::Disconnect { error: Some(e) } => write!(f, "disconnect ({})", e),
            Event::SubscribeAck {
                request_id,
                accepted,
            } => write!(f, "subscribe ack {} (accepted: {})", request_id, accepted),
            Event::UnsubscribeAck { request_id } => write!(f, "unsubscribe ack {}", request_id),
            Event::PublishAck { request_id } => write!(f, "publish ack {}", request_id),
            Event::Message { topic, payload, .. } => {
                write!(f, "message on {:?} ({} bytes)", topic, payload.len())
            }
            Event::Log { level, text } => write!(f, "log {:?}: {}", level, text),
        }
    }
}

/// Bounded, non-blocking producer side of the event queue
///
/// Pushing never blocks the engine's processing thread. When the queue is full the
/// newest event is dropped and counted.
#[derive(Clone)]
pub struct EventSink {
    sender: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    /// Creates a sink and the receiver that drains it
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }

    /// Returns false when the event was dropped
    pub fn push(&self, event: Event) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Event queue full, dropped {} ({} dropped so far)", event, total);
                false
            }
            Err(TrySendError::Closed(event)) => {
                trace!("Event queue closed, discarding {}", event);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("capacity", &self.sender.max_capacity())
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_drops_newest() {
        let (sink, mut receiver) = EventSink::channel(2);
        for id in 1..=3 {
            sink.push(Event::PublishAck {
                request_id: RequestId(id),
            });
        }

        assert_eq!(sink.dropped(), 1);
        assert_eq!(
            receiver.try_recv().unwrap(),
            Event::PublishAck {
                request_id: RequestId(1)
            }
        );
        assert_eq!(
            receiver.try_recv().unwrap(),
            Event::PublishAck {
                request_id: RequestId(2)
            }
        );
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn closed_queue_is_not_counted_as_overflow() {
        let (sink, receiver) = EventSink::channel(4);
        drop(receiver);
        assert!(!sink.push(Event::Connect { error: None }));
        assert_eq!(sink.dropped(), 0);
    }
}
