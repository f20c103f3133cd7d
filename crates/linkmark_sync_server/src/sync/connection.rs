use std::sync::Arc;

use linkmark_core::storage::StoredOperation;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::hub::{AccountHub, Delivery};

/// What the fan-out stream yielded for this connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// An operation from another device to forward.
    Deliver(Arc<StoredOperation>),
    /// The connection's queue overflowed; drop to notify-only and re-run
    /// incremental catch-up from the persisted cursor instead of buffering.
    CatchupRequired,
    /// The hub is gone.
    Closed,
}

/// Represents one connected device
pub struct DeviceConnection {
    pub account_id: String,
    pub device_id: String,
    hub: Arc<AccountHub>,
    broadcast_rx: broadcast::Receiver<Delivery>,
}

impl DeviceConnection {
    /// Create a new device connection
    pub fn new(account_id: String, device_id: String, hub: Arc<AccountHub>) -> Self {
        let broadcast_rx = hub.subscribe();

        Self {
            account_id,
            device_id,
            hub,
            broadcast_rx,
        }
    }

    /// Receive the next fan-out event for this device.
    ///
    /// Skips the device's own submissions (it received an ack for those).
    pub async fn recv(&mut self) -> ConnectionEvent {
        loop {
            match self.broadcast_rx.recv().await {
                Ok(delivery) if delivery.source_device == self.device_id => continue,
                Ok(delivery) => return ConnectionEvent::Deliver(delivery.stored),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        "device {} lagged {} operations, degrading to catch-up",
                        self.device_id, n
                    );
                    return ConnectionEvent::CatchupRequired;
                }
                Err(broadcast::error::RecvError::Closed) => return ConnectionEvent::Closed,
            }
        }
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        self.hub.unsubscribe();
        debug!(
            "Device disconnected: device={}, account={}",
            self.device_id, self.account_id
        );
    }
}
