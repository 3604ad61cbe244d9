//! Multi-context relay
//!
//! Several contexts (browser tabs running a `tabsnap` relay client) connect
//! over WebSocket and report their snapshots and visibility. The relay keeps
//! one shared agent session pointed at whichever context is in control,
//! forwards the agent's tool calls to it and waits for the results.

pub mod api;
pub mod config;
pub mod errors;
pub mod logging;
pub mod pending;
pub mod registry;
pub mod relay;
pub mod websocket;

pub use config::{LogLevel, RelayArgs};
pub use errors::RelayError;
pub use pending::PendingInvocations;
pub use registry::{ConnectionHandle, ContextEntry, ContextRegistry};
pub use relay::{Health, Relay, RelayOptions};
