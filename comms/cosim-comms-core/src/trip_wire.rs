use std::sync::Arc;
use tokio::sync::watch;

/// A process-wide shutdown detector.
///
/// Every comms instance holds one. Once tripped, blocked connects,
/// disconnects, and handshakes give up immediately and mark both directions
/// terminated. You can create multiple connected trip wires by cloning.
#[derive(Debug, Clone)]
pub struct TripWire {
    /// Holds `true` once the wire has been tripped
    tripped: Arc<watch::Sender<bool>>,
}

impl TripWire {
    /// Creates a new untripped wire.
    pub fn new() -> Self {
        let (tripped, _) = watch::channel(false);
        Self {
            tripped: Arc::new(tripped),
        }
    }

    /// Trips this wire and every wire cloned from it.
    pub fn trip(&self) {
        if !self.tripped.send_replace(true) {
            tracing::info!("Trip wire tripped, shutting down comms");
        }
    }

    pub fn is_tripped(&self) -> bool {
        *self.tripped.borrow()
    }

    /// Waits until the wire is tripped. Returns at once if it already was.
    pub async fn wait_for_trip(&self) {
        let mut receiver = self.tripped.subscribe();
        // The sender lives in self, so the channel cannot close under us
        let _ = receiver.wait_for(|tripped| *tripped).await;
    }
}

impl Default for TripWire {
    fn default() -> Self {
        Self::new()
    }
}
