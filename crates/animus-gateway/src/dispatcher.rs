use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use animus_types::events::GatewayEvent;

/// An event fanned out to every connected client. `origin` is the connection
/// that caused it, so the originator (which already got a direct reply) can
/// skip the copy.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub origin: Uuid,
    pub event: GatewayEvent,
}

/// Fans public persona changes out to all connections so "Discover Public"
/// views stay live without polling.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner { broadcast_tx }),
        }
    }

    /// Subscribe to gateway broadcasts. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients.
    pub fn broadcast(&self, origin: Uuid, event: GatewayEvent) {
        let _ = self.inner.broadcast_tx.send(BroadcastMessage { origin, event });
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
