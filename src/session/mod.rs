//! # Session
//!
//! A [`Session`] owns exactly one engine instance and the thread that drives it.
//!
//! ## Lifecycle
//!
//! ```text
//! open ──► Registered ──connect──► Connecting ──outcome──► Session(Connected)
//!               │                       │ timeout / refused        │
//!               └──── create failed     └──► teardown ◄── close ───┘
//! ```
//!
//! Opening blocks until the engine reports the connect outcome or the timeout expires.
//! Every failure path tears the half-opened instance down before returning, so no
//! engine handle outlives a failed open.
//!
//! After opening, operations never wait on the network: `subscribe`, `unsubscribe` and
//! `publish` return the engine's request id immediately and the acknowledgement arrives
//! later as an [`Event`] on the sink passed to [`Session::open`].
//!
//! ## Threads
//!
//! The drive loop runs on a dedicated OS thread and calls [`Engine::process`] with a one
//! second bound until the stop flag is set. All callbacks, and therefore all events,
//! originate on that thread and reach the sink in the order the engine produced them.

mod event;
mod handshake;
mod inflight;


use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::engine::{
    CallbackSet, ConnectOptions, Engine, EngineError, EngineFactory, Handle, Library, QoS,
    RequestId,
};
use crate::error::{AckKind, Error, Result};

pub use event::{Event, EventSink};
pub use inflight::{Pending, RequestStats};

use handshake::Opening;
use inflight::InFlight;

/// Upper bound of a single drive loop iteration
pub const DRIVE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Rendezvous = Arc<Mutex<Option<oneshot::Sender<Option<EngineError>>>>>;

/// Builds the callback set that bridges engine callbacks into session state and events
///
/// Connect and disconnect resolve the one-shot `rendezvous` the first time either fires
/// and always forward to the sink.
fn bridge(
    state: Arc<Mutex<SessionState>>,
    inflight: Arc<InFlight>,
    sink: EventSink,
    rendezvous: Rendezvous,
) -> CallbackSet {
    let connect = {
        let (state, sink, rendezvous) = (state.clone(), sink.clone(), rendezvous.clone());
        move |error: Option<EngineError>| {
            *lock(&state) = match error {
                None => SessionState::Connected,
                Some(_) => SessionState::Disconnected,
            };
            if let Some(tx) = lock(&rendezvous).take() {
                let _ = tx.send(error.clone());
            }
            sink.push(Event::Connect { error });
        }
    };

    let disconnect = {
        let (state, sink) = (state.clone(), sink.clone());
        move |error: Option<EngineError>| {
            *lock(&state) = SessionState::Disconnected;
            if let Some(tx) = lock(&rendezvous).take() {
                let cause = error.clone().unwrap_or_else(|| {
                    EngineError::ConnectionLost("disconnected before connect completed".into())
                });
                let _ = tx.send(Some(cause));
            }
            sink.push(Event::Disconnect { error });
        }
    };

    let subscribe = {
        let (inflight, sink) = (inflight.clone(), sink.clone());
        move |request_id: RequestId, granted: &[Option<QoS>]| {
            match inflight.complete(AckKind::Subscribe, request_id) {
                Ok(pending) => {
                    let accepted = !granted.is_empty() && granted.iter().all(Option::is_some);
                    if !accepted {
                        warn!("Broker rejected subscription to {:?}", pending.topic);
                    }
                    sink.push(Event::SubscribeAck {
                        request_id,
                        accepted,
                    });
                }
                Err(e) => warn!("{}", e),
            }
        }
    };

    let unsubscribe = {
        let (inflight, sink) = (inflight.clone(), sink.clone());
        move |request_id: RequestId| match inflight.complete(AckKind::Unsubscribe, request_id) {
            Ok(_) => {
                sink.push(Event::UnsubscribeAck { request_id });
            }
            Err(e) => warn!("{}", e),
        }
    };

    let publish = {
        let sink = sink.clone();
        move |request_id: RequestId| match inflight.complete(AckKind::Publish, request_id) {
            Ok(_) => {
                sink.push(Event::PublishAck { request_id });
            }
            Err(e) => warn!("{}", e),
        }
    };

    let message = {
        let sink = sink.clone();
        move |request_id: RequestId, topic: &str, payload: &[u8]| {
            sink.push(Event::Message {
                request_id,
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
        }
    };

    CallbackSet::new()
        .with_connect(connect)
        .with_disconnect(disconnect)
        .with_subscribe(subscribe)
        .with_unsubscribe(unsubscribe)
        .with_publish(publish)
        .with_message(message)
        .with_log(move |level, text| {
            sink.push(Event::Log {
                level,
                text: text.to_string(),
            });
        })
}

fn spawn_drive(
    engine: Arc<dyn Engine>,
    handle: Handle,
    stop: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("mqtt-drive-{}", handle.id()))
        .spawn(move || {
            debug!("Drive loop for {} started", handle);
            while !stop.load(Ordering::Acquire) {
                if let Err(e) = engine.process(DRIVE_INTERVAL) {
                    if !stop.load(Ordering::Acquire) {
                        warn!("Drive loop for {} stopped: {}", handle, e);
                    }
                    break;
                }
            }
            debug!("Drive loop for {} finished", handle);
        })
        .map_err(|e| Error::Engine(EngineError::Library(format!("drive thread: {}", e))))
}

/// Everything released together when a session ends
struct Resources {
    handle: Handle,
    engine: Arc<dyn Engine>,
    stop: Arc<AtomicBool>,
    drive: Option<thread::JoinHandle<()>>,
    library: Library,
}

impl Resources {
    /// Joins the drive loop, then destroys the engine and removes its callbacks. Blocks.
    fn release(mut self) -> Vec<Error> {
        self.stop.store(true, Ordering::Release);
        let mut errors = Vec::new();
        if let Some(drive) = self.drive.take() {
            if drive.join().is_err() {
                errors.push(Error::Protocol(format!(
                    "drive loop for {} panicked",
                    self.handle
                )));
            }
        }
        if let Err(e) = self.engine.destroy() {
            errors.push(Error::Engine(e));
        }
        self.library.registry().remove(self.handle);
        debug!("Released engine {}", self.handle);
        errors
    }

    async fn release_async(self) -> Vec<Error> {
        let handle = self.handle;
        match task::spawn_blocking(move || self.release()).await {
            Ok(errors) => errors,
            Err(e) => vec![Error::Protocol(format!(
                "teardown of {} failed: {}",
                handle, e
            ))],
        }
    }
}

/// One connected engine instance
pub struct Session {
    handle: Handle,
    options: ConnectOptions,
    engine: Arc<dyn Engine>,
    state: Arc<Mutex<SessionState>>,
    inflight: Arc<InFlight>,
    sink: EventSink,
    resources: Mutex<Option<Resources>>,
}

impl Session {
    /// Creates an engine, connects it and waits at most `timeout` for the outcome
    pub async fn open(
        factory: &dyn EngineFactory,
        options: ConnectOptions,
        sink: EventSink,
        timeout: Duration,
    ) -> Result<Session> {
        Opening::create(factory, options, sink)?
            .connect()
            .await?
            .wait(timeout)
            .await
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.resources).is_none()
    }

    pub fn stats(&self) -> RequestStats {
        self.inflight.stats()
    }

    /// Events dropped because the sink was full
    pub fn dropped_events(&self) -> u64 {
        self.sink.dropped()
    }

    fn require_connected(&self, operation: &str) -> Result<()> {
        match self.state() {
            SessionState::Connected => Ok(()),
            state => Err(Error::OutOfOrder(format!("{} while {}", operation, state))),
        }
    }

    pub fn subscribe(&self, filter: &str, qos: QoS) -> Result<RequestId> {
        validate_filter(filter)?;
        self.require_connected("subscribe")?;
        let id = self.inflight.issue(AckKind::Subscribe, filter, || {
            self.engine.subscribe(filter, qos)
        })?;
        debug!("Subscribe {:?} ({:?}) issued as request {}", filter, qos, id);
        Ok(id)
    }

    pub fn unsubscribe(&self, filter: &str) -> Result<RequestId> {
        validate_filter(filter)?;
        self.require_connected("unsubscribe")?;
        let id = self
            .inflight
            .issue(AckKind::Unsubscribe, filter, || self.engine.unsubscribe(filter))?;
        debug!("Unsubscribe {:?} issued as request {}", filter, id);
        Ok(id)
    }

    pub fn publish(&self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Result<RequestId> {
        validate_topic(topic)?;
        self.require_connected("publish")?;
        self.inflight.issue(AckKind::Publish, topic, || {
            self.engine.publish(topic, payload, qos, retain)
        })
    }

    /// Serialises `value` as JSON and publishes it
    pub fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        value: &T,
        qos: QoS,
        retain: bool,
    ) -> Result<RequestId> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| Error::BadParameter(format!("payload for {:?}: {}", topic, e)))?;
        self.publish(topic, &payload, qos, retain)
    }

    /// Disconnects, stops the drive loop and destroys the engine
    ///
    /// Safe to call more than once; later calls return `Ok(())`. Every failure on the
    /// way is reported in the returned error.
    pub async fn close(&self) -> Result<()> {
        let Some(resources) = lock(&self.resources).take() else {
            return Ok(());
        };
        info!("Closing session {}", self.handle);

        let mut errors = Vec::new();
        let previous = std::mem::replace(&mut *lock(&self.state), SessionState::Disconnected);
        if previous == SessionState::Connected {
            if let Err(e) = self.engine.disconnect() {
                errors.push(Error::Engine(e));
            }
        }
        errors.extend(resources.release_async().await);

        let stats = self.inflight.stats();
        if stats.in_flight > 0 {
            debug!(
                "Session {} closed with {} unacknowledged requests",
                self.handle, stats.in_flight
            );
        }
        Error::aggregate(errors)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let resources = self
            .resources
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(resources) = resources {
            warn!("Session {} dropped without close", self.handle);
            resources.stop.store(true, Ordering::Release);
            let handle = self.handle;
            let spawned = thread::Builder::new()
                .name(format!("mqtt-release-{}", handle.id()))
                .spawn(move || {
                    for e in resources.release() {
                        warn!("Releasing {}: {}", handle, e);
                    }
                });
            if let Err(e) = spawned {
                error!("Could not release {} in the background: {}", handle, e);
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .field("host", &self.options.host)
            .field("port", &self.options.port)
            .field("state", &self.state())
            .finish()
    }
}

fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::BadParameter("empty topic filter".into()));
    }
    Ok(())
}

fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::BadParameter("empty topic".into()));
    }
    if topic.contains(['+', '#']) {
        return Err(Error::BadParameter(format!(
            "wildcards are not allowed in a publish topic: {:?}",
            topic
        )));
    }
    Ok(())
}
