//! LumenMQ - MQTT v3.1.1 / v5.0 broker
//!
//! Protocol engine for both protocol levels: wire codec, per-connection
//! state machine, persistent sessions with QoS 1/2 in-flight tracking,
//! retained messages, and a subscription index with wildcard and shared
//! subscription matching.

pub mod auth;
pub mod broker;
pub mod codec;
pub mod config;
pub mod hooks;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod topic;

pub use auth::{EnhancedAuthRegistry, PasswordAuthProvider};
pub use broker::{Broker, BrokerConfig};
pub use config::Config;
pub use hooks::{AuthOutcome, CompositeHooks, DefaultHooks, EnhancedAuthProvider, Hooks};
pub use persistence::{MemoryBackend, StorageBackend};
pub use protocol::{ProtocolVersion, QoS, ReasonCode};
