//! Lifecycle event bus.
//!
//! Connection state changes and circuit-breaker trips are published on a
//! single broadcast channel of typed [`ClientEvent`] values; subscribers
//! filter for the kinds they care about. Closing the client drops the
//! sender, so every receiver observes end of stream.

use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Buffered events per subscriber before lagging kicks in.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A lifecycle event emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A connection attempt started.
    Connecting,
    /// The transport reached readiness.
    Connected,
    /// The connection was lost or the client closed.
    Disconnected,
    /// A connection attempt failed.
    Error {
        /// Numeric wire status, when the failure carried one.
        code: Option<i32>,
        /// Error description.
        message: String,
    },
    /// The embedding application reported a circuit-breaker trip.
    CircuitBreakerTrip {
        /// Service the circuit belongs to.
        service: String,
    },
}

impl ClientEvent {
    /// Stable event name, matching the subscription surface.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error { .. } => "error",
            Self::CircuitBreakerTrip { .. } => "circuitBreakerTrip",
        }
    }
}

/// Publish side of the event channel.
///
/// Emission after [`close`](Self::close) is a no-op; subscription after
/// close yields an already-ended receiver.
#[derive(Debug)]
pub(crate) struct EventBus {
    sender: RwLock<Option<broadcast::Sender<ClientEvent>>>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender: RwLock::new(Some(sender)) }
    }

    /// Registers a new subscriber.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        if let Some(sender) = self.sender.read().as_ref() {
            return sender.subscribe();
        }
        // Closed: hand out a receiver whose sender is already gone.
        let (sender, receiver) = broadcast::channel(1);
        drop(sender);
        receiver
    }

    /// Publishes an event to all current subscribers.
    pub(crate) fn emit(&self, event: ClientEvent) {
        if let Some(sender) = self.sender.read().as_ref() {
            // A send error only means nobody is listening right now.
            let _ = sender.send(event);
        }
    }

    /// Detaches all subscribers.
    pub(crate) fn close(&self) {
        self.sender.write().take();
    }
}
