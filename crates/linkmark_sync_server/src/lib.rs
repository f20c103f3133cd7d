//! Linkmark Sync Server
//!
//! A multi-device sync server for Linkmark bookmark collections.
//!
//! ## Features
//!
//! - **Operation-log sync**: devices exchange content-addressed operations
//!   over a WebSocket; duplicates resolve idempotently, sequence gaps force
//!   an explicit resync
//! - **Per-account serialization**: appends and merges for one account are
//!   strictly sequential, accounts proceed in parallel
//! - **Incremental catch-up**: reconnecting devices resume from their
//!   cursor; long-offline devices bootstrap from the nearest snapshot
//! - **Realtime fan-out**: accepted operations propagate to the account's
//!   other live devices, degrading to catch-up on backpressure
//! - **Persistent storage**: SQLite-backed operation log, snapshots and
//!   sync cursors via linkmark_core
//!
//! Identity is external: connections are admitted through the
//! [`identity::SessionVerifier`] interface.

pub mod config;
pub mod handlers;
pub mod identity;
pub mod sync;

pub use config::Config;
