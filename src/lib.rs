//! RelayMQ - clustered MQTT v3.1/v3.1.1 broker
//!
//! A broker whose nodes share session and publish events over a pluggable
//! cluster transport, with persistent sessions kept in a pluggable store.

pub mod acl;
pub mod auth;
pub mod broker;
pub mod codec;
pub mod config;
pub mod events;
pub mod message;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod stats;
pub mod storage;
pub mod topic;

pub use auth::{AllowAll, Authenticator, StaticAuthenticator};
pub use broker::{Broker, BrokerError, Collaborators};
pub use config::Config;
pub use events::{ClusterTransport, EventBus, MemoryTransport, TcpTransport};
pub use message::Message;
pub use protocol::{ProtocolVersion, QoS};
pub use stats::Stats;
pub use storage::{FjallStore, MemoryStore, SessionStore};
