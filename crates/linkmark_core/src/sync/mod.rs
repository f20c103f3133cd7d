//! Client/server sync protocol: wire messages, the per-device session
//! state machine, and the reconnect retry policy.

mod messages;
mod retry;
mod session;

#[cfg(feature = "native-sync")]
mod client;

pub use messages::{ClientMessage, ServerMessage};
pub use retry::{RetryPolicy, RetryState};
pub use session::{SessionContext, SessionState, SyncSession};

#[cfg(feature = "native-sync")]
pub use client::SyncClient;
