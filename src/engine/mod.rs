//! # Protocol Engine Contract
//!
//! The wire protocol (framing, QoS handshakes, TLS) lives behind the [`Engine`] trait.
//! An engine exposes imperative operations that return synchronously and reports
//! their outcomes later through callbacks fired from its processing step.
//!
//! ```text
//! Session ──connect/subscribe/publish──► Engine
//!    ▲                                     │ process(timeout)
//!    │                                     ▼
//!    └──── CallbackSet ◄── Registry ◄── Dispatcher(handle)
//! ```
//!
//! Engines never hold a reference to the session that owns them. They only carry a
//! [`Dispatcher`], which resolves their [`Handle`] through the process-wide
//! [`CallbackRegistry`] on every callback. A handle whose callbacks have been removed
//! is silently ignored, so a late callback racing with teardown is harmless.

pub mod library;
pub mod registry;
pub mod rumqtt;

#[cfg(test)]
pub(crate) mod simulated;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use library::Library;
pub use registry::{CallbackRegistry, CallbackSet};

/// Default broker port without TLS
pub const DEFAULT_PORT: u16 = 1883;
/// Default broker port with TLS
pub const DEFAULT_SECURE_PORT: u16 = 8883;
/// Largest packet the MQTT 3.1.1 remaining-length encoding can express
pub const MAX_PACKET_SIZE: usize = 268_435_455;

/// Short-lived id returned by an engine operation and echoed in its acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of one engine instance, used as the registry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Handle(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Requested delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn level(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// Severity of an engine log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Notice,
    Info,
    Debug,
}

/// Errors reported by an engine, either from a call or inside a callback
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("not connected")]
    NotConnected,

    #[error("request rejected: {0}")]
    Request(String),

    #[error("TLS configuration: {0}")]
    Tls(String),

    #[error("library not initialised: {0}")]
    Library(String),

    #[error("engine handle already destroyed")]
    Destroyed,
}

/// TLS material for a broker connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    pub ca_file: PathBuf,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Skip verification of the broker certificate
    pub insecure: bool,
}

/// Identity of a session: everything needed to create and connect one engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keepalive: Duration,
    /// Upper bound for incoming and outgoing packets
    pub max_packet_size: usize,
    pub credentials: Option<(String, String)>,
    pub tls: Option<TlsOptions>,
}

impl ConnectOptions {
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port,
            keepalive: Duration::from_secs(60),
            max_packet_size: MAX_PACKET_SIZE,
            credentials: None,
            tls: None,
        }
    }
}

/// Operations of one native protocol engine instance
///
/// All calls may be issued concurrently with each other and with [`Engine::process`],
/// which is driven continuously by a single dedicated thread while the session lives.
/// Callbacks fire only from inside `process`.
pub trait Engine: Send + Sync {
    /// Starts an asynchronous connect; the outcome arrives via the connect callback
    fn connect(&self, host: &str, port: u16, keepalive: Duration) -> Result<(), EngineError>;

    fn subscribe(&self, filter: &str, qos: QoS) -> Result<RequestId, EngineError>;

    fn unsubscribe(&self, filter: &str) -> Result<RequestId, EngineError>;

    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<RequestId, EngineError>;

    fn disconnect(&self) -> Result<(), EngineError>;

    /// Services network I/O for at most `timeout` and fires any queued callbacks.
    /// An error means the engine cannot make further progress.
    fn process(&self, timeout: Duration) -> Result<(), EngineError>;

    /// Releases the instance. Only called after the drive loop has stopped.
    fn destroy(&self) -> Result<(), EngineError>;
}

/// Creates engine instances bound to a dispatcher
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        options: &ConnectOptions,
        dispatcher: Dispatcher,
    ) -> Result<Box<dyn Engine>, EngineError>;

    /// Engine library version, for status reports
    fn version(&self) -> String {
        String::from("unknown")
    }
}

/// Per-instance token handed to an engine; routes callbacks through the registry
#[derive(Clone)]
pub struct Dispatcher {
    handle: Handle,
    registry: Arc<CallbackRegistry>,
}

impl Dispatcher {
    pub fn new(handle: Handle, registry: Arc<CallbackRegistry>) -> Self {
        Self { handle, registry }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn connected(&self, error: Option<EngineError>) {
        self.registry.dispatch(self.handle, |set| set.on_connect(error));
    }

    pub fn disconnected(&self, error: Option<EngineError>) {
        self.registry.dispatch(self.handle, |set| set.on_disconnect(error));
    }

    pub fn subscribed(&self, id: RequestId, granted: &[Option<QoS>]) {
        self.registry.dispatch(self.handle, |set| set.on_subscribe(id, granted));
    }

    pub fn unsubscribed(&self, id: RequestId) {
        self.registry.dispatch(self.handle, |set| set.on_unsubscribe(id));
    }

    pub fn published(&self, id: RequestId) {
        self.registry.dispatch(self.handle, |set| set.on_publish(id));
    }

    /// `payload` is only valid for the duration of the call
    pub fn message(&self, id: RequestId, topic: &str, payload: &[u8]) {
        self.registry
            .dispatch(self.handle, |set| set.on_message(id, topic, payload));
    }

    pub fn log(&self, level: LogLevel, text: &str) {
        self.registry.dispatch(self.handle, |set| set.on_log(level, text));
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handle", &self.handle)
            .finish()
    }
}
