//! Per-account sync hubs and device connections.

mod connection;
mod hub;

pub use connection::{ConnectionEvent, DeviceConnection};
pub use hub::{AccountHub, Delivery, HubRegistry, SyncStats};
