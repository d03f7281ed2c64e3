//! mqtt-notify - bridge MQTT broker subscriptions into notifications
//!
//! Keeps one session per configured broker, subscribes to its topics and
//! turns every received payload into a [`NormalizedMessage`] for a
//! [`DeliverySink`]. The broker set can be replaced at runtime and the
//! whole bridge enabled or disabled through [`Bridge`].

pub mod codec;
pub mod config;
pub mod lifecycle;
pub mod manager;
pub mod notify;
pub mod protocol;
pub mod session;
pub mod topic;

pub use config::{BridgeConfig, BrokerConfig, Config, ValidationError};
pub use lifecycle::Bridge;
pub use manager::{BridgeError, ConnectionManager, ManagerState};
pub use notify::{normalize, ChannelSink, DeliverySink, NormalizedMessage};
pub use protocol::{ProtocolVersion, QoS};
pub use session::{BrokerSession, ConnectError, SessionStatus};
