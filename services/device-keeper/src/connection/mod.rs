//! Connection module
//!
//! Everything between a resolved agent URL and a live, self-healing socket:
//! the per-key connection state machine, the registry that deduplicates
//! connections, the shared scheduler, and the WebSocket transport.

pub mod backoff;
pub mod device;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod target;
pub mod transport;
pub mod websocket;
