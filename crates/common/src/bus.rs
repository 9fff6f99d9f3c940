use {
    tokio::sync::mpsc,
    tracing::{debug, trace},
};

use crate::events::HookEvent;

pub type EventReceiver = mpsc::UnboundedReceiver<HookEvent>;

/// Publishing half of the gateway event bus.
///
/// Cloned into every component that produces domain events. Publishing never
/// blocks and never fails the caller; once the consumer is gone events are
/// dropped.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<HookEvent>,
}

impl EventPublisher {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A publisher with no consumer, for components used standalone.
    pub fn detached() -> Self {
        Self::channel().0
    }

    pub fn publish(&self, event: HookEvent) {
        trace!(event = event.name(), "publish");
        if let Err(e) = self.tx.send(event) {
            debug!(event = e.0.name(), "event bus closed, dropping event");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
