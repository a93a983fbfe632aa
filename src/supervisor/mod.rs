//! # Reconnect / Retention Supervisor
//!
//! Long-running control loop around at most one [`Session`]:
//!
//! ```text
//!             connect tick             open ok
//! NoSession ──────────────► Connecting ───────► Connected ──┐ connect tick:
//!   ▲ ▲                         │                  │        │ subscribe maintained
//!   │ └──────── open failed ────┘                  │  ◄─────┘ filters not yet confirmed
//!   └──────────────── Disconnect event ────────────┘
//! ```
//!
//! Opening runs as its own task, so commands and status requests are answered while the
//! supervisor is `Connecting`. A failed open is retried on the next tick. A separate
//! retention tick at [`sweep_interval`] deletes old messages, so nothing outlives 1.25
//! windows. Inbound messages are classified and stored as they arrive. Failures are
//! logged and the loop continues; only the shutdown token ends it.
//!
//! Each session gets its own event channel. Dropping a session drops its receiver, so
//! stale events of a finished session never reach the tracker of the next one.

mod handle;

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::engine::{EngineFactory, LogLevel, QoS};
use crate::error::{AckKind, Error, Result};
use crate::session::{Event, EventSink, Session};
use crate::store::{classify, MessageStore};
use crate::topics::TopicTracker;

pub use handle::{Command, Status, SupervisorHandle};

const COMMAND_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    NoSession,
    Connecting,
    Connected,
}

/// Period of the retention sweep for a window of `retention`
pub fn sweep_interval(retention: Duration) -> Duration {
    retention / 4
}

/// Connect attempt running beside the loop
struct Attempt {
    task: JoinHandle<Result<Session>>,
    events: mpsc::Receiver<Event>,
}

/// Session currently held by the supervisor, with its events and bookkeeping
struct Link {
    session: Session,
    events: mpsc::Receiver<Event>,
    tracker: TopicTracker,
    connected_at: DateTime<Utc>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    factory: Arc<dyn EngineFactory>,
    store: Arc<MessageStore>,
    retention: Duration,
    maintained: BTreeSet<String>,
    state: SupervisorState,
    attempt: Option<Attempt>,
    link: Option<Link>,
    commands: mpsc::Receiver<Command>,
    dropped_events: u64,
}

async fn next_event(link: &mut Option<Link>) -> Option<Event> {
    match link {
        Some(link) => link.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn attempt_finished(attempt: &mut Option<Attempt>) -> Result<Session> {
    match attempt {
        Some(attempt) => match (&mut attempt.task).await {
            Ok(result) => result,
            Err(e) => Err(Error::Protocol(format!("connect task failed: {}", e))),
        },
        None => std::future::pending().await,
    }
}

impl Supervisor {
    pub fn new(
        mut config: SupervisorConfig,
        factory: Arc<dyn EngineFactory>,
        store: Arc<MessageStore>,
    ) -> Result<(Self, SupervisorHandle)> {
        config.validate()?;
        config.apply_retention_floor();
        let retention = config.retention();
        let (tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let handle = SupervisorHandle::new(tx, store.clone());
        let maintained = config.topics.iter().cloned().collect();
        Ok((
            Self {
                config,
                factory,
                store,
                retention,
                maintained,
                state: SupervisorState::NoSession,
                attempt: None,
                link: None,
                commands,
                dropped_events: 0,
            },
            handle,
        ))
    }

    /// Runs until `shutdown` is cancelled, then closes any open session
    ///
    /// A connect attempt still running at shutdown is awaited, bounded by the connect
    /// timeout, and its session closed.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let retention = self.retention;
        let mut connect_tick = time::interval(self.config.reconnect_interval());
        connect_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retention_tick = time::interval(sweep_interval(retention));
        retention_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Supervisor started for {} (retention {:?}, {} maintained topics)",
            self.config.broker,
            retention,
            self.maintained.len()
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                _ = connect_tick.tick() => self.on_connect_tick(),
                _ = retention_tick.tick() => self.sweep(retention),
                result = attempt_finished(&mut self.attempt) => self.on_attempt(result),
                Some(event) = next_event(&mut self.link) => self.on_event(event).await,
                Some(command) = self.commands.recv() => self.on_command(command),
            }
        }

        let attempt = self.finish_attempt().await;
        let link = self.close_link().await;
        Error::aggregate(attempt.err().into_iter().chain(link.err()).collect())
    }

    fn on_connect_tick(&mut self) {
        if self.link.is_some() {
            self.resubscribe();
            return;
        }
        if self.attempt.is_some() {
            debug!("Connect attempt still running");
            return;
        }

        let options = match self.config.connect_options() {
            Ok(options) => options,
            Err(e) => {
                error!("Cannot build connect options: {}", e);
                return;
            }
        };
        let (sink, events) = EventSink::channel(self.config.event_capacity);

        self.state = SupervisorState::Connecting;
        info!("Connecting to {}:{}", options.host, options.port);
        let factory = self.factory.clone();
        let timeout = self.config.connect_timeout();
        let task = tokio::spawn(async move {
            Session::open(factory.as_ref(), options, sink, timeout).await
        });
        self.attempt = Some(Attempt { task, events });
    }

    fn on_attempt(&mut self, result: Result<Session>) {
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        match result {
            Ok(session) => {
                self.state = SupervisorState::Connected;
                self.link = Some(Link {
                    session,
                    events: attempt.events,
                    tracker: TopicTracker::new(),
                    connected_at: Utc::now(),
                });
            }
            Err(e) => {
                self.state = SupervisorState::NoSession;
                if e.is_connection() {
                    warn!(
                        "Connection failed, retrying in {:?}: {}",
                        self.config.reconnect_interval(),
                        e
                    );
                } else {
                    error!("Opening session failed: {}", e);
                }
            }
        }
    }

    /// Waits for a running connect attempt and closes whatever it opened
    async fn finish_attempt(&mut self) -> Result<()> {
        let Some(attempt) = self.attempt.take() else {
            return Ok(());
        };
        info!("Waiting for the running connect attempt");
        match attempt.task.await {
            Ok(Ok(session)) => session.close().await,
            Ok(Err(e)) => {
                debug!("Connect attempt ended during shutdown: {}", e);
                Ok(())
            }
            Err(e) => Err(Error::Protocol(format!("connect task failed: {}", e))),
        }
    }

    /// Issues a subscribe for every maintained filter that is not yet confirmed
    fn resubscribe(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        for filter in &self.maintained {
            if link.tracker.has(filter) || link.tracker.is_pending(AckKind::Subscribe, filter) {
                continue;
            }
            match link.session.subscribe(filter, self.config.qos) {
                Ok(request_id) => link.tracker.subscribe(filter, request_id),
                Err(e) => {
                    warn!("Subscribing to {:?} failed: {}", filter, e);
                    break;
                }
            }
        }
    }

    fn sweep(&self, retention: Duration) {
        match self.store.sweep(retention) {
            Ok(0) => debug!("Retention sweep found nothing to delete"),
            Ok(deleted) => info!("Retention sweep deleted {} messages", deleted),
            Err(e) => error!("Retention sweep failed: {}", e),
        }
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Connect { error: None } => {
                info!("Connected to {}", self.config.broker);
                self.resubscribe();
            }
            Event::Connect { error: Some(e) } => warn!("Connect reported failure: {}", e),
            Event::Disconnect { error } => {
                match error {
                    Some(e) => warn!("Disconnected from {}: {}", self.config.broker, e),
                    None => info!("Disconnected from {}", self.config.broker),
                }
                if let Err(e) = self.close_link().await {
                    warn!("Releasing the disconnected session: {}", e);
                }
            }
            Event::SubscribeAck {
                request_id,
                accepted,
            } => {
                let Some(link) = self.link.as_mut() else {
                    return;
                };
                if !accepted {
                    match link.tracker.on_reject(request_id) {
                        Some(filter) => warn!("Subscription to {:?} was refused", filter),
                        None => warn!("Refusal for unknown subscribe request {}", request_id),
                    }
                    return;
                }
                match link.tracker.on_ack(AckKind::Subscribe, request_id) {
                    Ok(filter) => info!("Subscribed to {:?}", filter),
                    Err(e) => warn!("{}", e),
                }
            }
            Event::UnsubscribeAck { request_id } => {
                if let Some(link) = self.link.as_mut() {
                    match link.tracker.on_ack(AckKind::Unsubscribe, request_id) {
                        Ok(filter) => info!("Unsubscribed from {:?}", filter),
                        Err(e) => warn!("{}", e),
                    }
                }
            }
            Event::PublishAck { request_id } => debug!("Publish {} acknowledged", request_id),
            Event::Message { topic, payload, .. } => self.ingest(&topic, &payload),
            Event::Log { level, text } => match level {
                LogLevel::Error => error!(target: "mqtt_session::engine", "{}", text),
                LogLevel::Warning => warn!(target: "mqtt_session::engine", "{}", text),
                LogLevel::Notice | LogLevel::Info => {
                    info!(target: "mqtt_session::engine", "{}", text)
                }
                LogLevel::Debug => debug!(target: "mqtt_session::engine", "{}", text),
            },
        }
    }

    fn ingest(&self, topic: &str, payload: &[u8]) {
        let message_type = classify(payload);
        match self.store.insert(Utc::now(), topic, message_type, payload) {
            Ok(id) => debug!(
                "Stored message {} from {:?} as {} ({} bytes)",
                id,
                topic,
                message_type,
                payload.len()
            ),
            Err(e) => error!("Storing message from {:?} failed: {}", topic, e),
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                filter,
                response_tx,
            } => {
                let result = self.with_link(|link, qos| {
                    let request_id = link.session.subscribe(&filter, qos)?;
                    link.tracker.subscribe(&filter, request_id);
                    Ok(request_id)
                });
                if result.is_ok() {
                    self.maintained.insert(filter);
                }
                respond(response_tx, result);
            }
            Command::Unsubscribe {
                filter,
                response_tx,
            } => {
                let result = self.with_link(|link, _| {
                    let request_id = link.session.unsubscribe(&filter)?;
                    link.tracker.unsubscribe(&filter, request_id);
                    Ok(request_id)
                });
                if result.is_ok() {
                    self.maintained.remove(&filter);
                }
                respond(response_tx, result);
            }
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                response_tx,
            } => {
                let result = self.with_link(|link, default_qos| {
                    link.session
                        .publish(&topic, &payload, qos.unwrap_or(default_qos), retain)
                });
                respond(response_tx, result);
            }
            Command::Topics { response_tx } => {
                let topics = self
                    .link
                    .as_ref()
                    .map(|link| link.tracker.list())
                    .unwrap_or_default();
                respond(response_tx, topics);
            }
            Command::Status { response_tx } => respond(response_tx, self.status()),
        }
    }

    fn with_link<T>(&mut self, f: impl FnOnce(&mut Link, QoS) -> Result<T>) -> Result<T> {
        let qos = self.config.qos;
        match self.link.as_mut() {
            Some(link) => f(link, qos),
            None => Err(Error::OutOfOrder("not connected".into())),
        }
    }

    fn status(&self) -> Result<Status> {
        let (session_dropped, requests) = match &self.link {
            Some(link) => (link.session.dropped_events(), Some(link.session.stats())),
            None => (0, None),
        };
        Ok(Status {
            version: format!(
                "{} {} ({})",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                self.factory.version()
            ),
            broker: self.config.broker.clone(),
            database: self.store.path().map(|p| p.to_path_buf()),
            retention_secs: self.retention.as_secs(),
            state: self.state,
            connected_since: self.link.as_ref().map(|link| link.connected_at),
            count: self.store.count()?,
            topics: self
                .link
                .as_ref()
                .map(|link| link.tracker.list())
                .unwrap_or_default(),
            maintained: self.maintained.iter().cloned().collect(),
            dropped_events: self.dropped_events + session_dropped,
            requests,
        })
    }

    /// Closes and forgets the current session, if any
    async fn close_link(&mut self) -> Result<()> {
        self.state = SupervisorState::NoSession;
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        self.dropped_events += link.session.dropped_events();
        let result = link.session.close().await;
        debug!(
            "Session {} released after {}s",
            link.session.handle(),
            (Utc::now() - link.connected_at).num_seconds()
        );
        result
    }
}

fn respond<T>(response_tx: tokio::sync::oneshot::Sender<T>, value: T) {
    if response_tx.send(value).is_err() {
        error!("Failed to send response");
    }
}
