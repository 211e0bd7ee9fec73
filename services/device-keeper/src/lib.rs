//! Device Keeper Library
//!
//! Keeps a long-lived WebSocket open from the control plane to every online
//! device-hosting agent, one per device and channel, recovers from agent
//! restarts and network blips, and feeds the forwarding address each agent
//! reports back into the device directory and the downstream device pool.

pub mod cli;
pub mod connection;
pub mod directory;
pub mod keeper;
pub mod sync;

// Re-exports for convenience
pub use cli::config::Config;
pub use connection::device::{ConnectionSettings, DeviceConnection, StopReason};
pub use connection::registry::ConnectionRegistry;
pub use connection::scheduler::Scheduler;
pub use connection::state::ConnectionState;
pub use connection::target::{Channel, ConnectionKey};
pub use connection::websocket::WsDialer;
pub use directory::adapter::{ConnectionTarget, DeviceAddress, DeviceAddressSink, TargetSource};
pub use keeper::{ConnectionKeeper, ConnectionKeeperBuilder, TickSummary};
pub use sync::pool::DevicePoolClient;
pub use sync::DeviceSync;
