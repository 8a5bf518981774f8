//! Push channel: one supervised real-time connection per client

pub mod manager;
pub mod protocol;
pub mod state;
pub mod transport;

pub use manager::{ChannelConfig, HeartbeatConfig, PushChannel};
pub use state::{reconnect_delay, ChannelState, ChannelStatus};
pub use transport::{Connection, Connector, WsConnection, WsConnector};
