//! MQTT client sessions on top of a pluggable protocol engine, with a supervisor that
//! keeps a broker connection alive, maintains subscriptions and stores every inbound
//! message in SQLite for a bounded retention window.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod topics;

pub use config::SupervisorConfig;
pub use engine::rumqtt::RumqttFactory;
pub use engine::{ConnectOptions, EngineFactory, QoS, RequestId};
pub use error::{Error, Result};
pub use session::{Event, EventSink, Session, SessionState};
pub use store::{MessageStore, MessageView, Query};
pub use supervisor::{Supervisor, SupervisorHandle};
pub use topics::TopicTracker;
