//! Live connection hub.
//!
//! Tracks every WebSocket connection per user and fans events out to them.
//! All registry mutation happens on one coordinator task; callers talk to it
//! through the cloneable [`Hub`] handle.

pub mod connection;
pub mod hub;
pub mod protocol;
pub mod pumps;
pub mod registry;
pub mod ws_server;

pub use connection::{Connection, ConnectionState, EnqueueError};
pub use hub::{Hub, HubStats};
pub use protocol::{ControlMessage, InboundEnvelope, OutboundEnvelope};
pub use pumps::{Frame, PumpConfig, PumpExit};
pub use registry::{Delivery, Registry};
pub use ws_server::{run_connection, serve_socket, upgrade};
