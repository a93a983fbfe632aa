//! Opening handshake as a statum state machine
//!
//! `Registered` owns an engine whose callbacks are installed but which has not been
//! asked to connect. `Connecting` additionally owns the running drive loop. Only a
//! `Connecting` handshake can be turned into a [`Session`], and only by receiving a
//! successful connect outcome.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use statum::{machine, state};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{bridge, lock, spawn_drive, InFlight, Resources, Session, SessionState};
use crate::engine::{ConnectOptions, Dispatcher, Engine, EngineError, EngineFactory, Handle, Library};
use crate::error::{Error, Result};
use crate::session::EventSink;

#[state]
#[derive(Debug, Clone)]
pub enum OpeningState {
    Registered, // Callbacks installed, engine created
    Connecting, // Connect issued, drive loop running
}

#[machine]
pub struct Opening<S: OpeningState> {
    options: ConnectOptions,
    handle: Handle,
    engine: Arc<dyn Engine>,
    state: Arc<Mutex<SessionState>>,
    inflight: Arc<InFlight>,
    sink: EventSink,
    library: Library,
    outcome: oneshot::Receiver<Option<EngineError>>,
    stop: Arc<AtomicBool>,
    drive: Option<thread::JoinHandle<()>>,
}

impl<S: OpeningState> Opening<S> {
    /// Tears the half-opened instance down and returns the error to report
    async fn abandon(self, cause: Error) -> Error {
        *lock(&self.state) = SessionState::Disconnected;
        let resources = Resources {
            handle: self.handle,
            engine: self.engine,
            stop: self.stop,
            drive: self.drive,
            library: self.library,
        };
        let errors = resources.release_async().await;
        if errors.is_empty() {
            cause
        } else {
            Error::Multiple(std::iter::once(cause).chain(errors).collect())
        }
    }
}

impl Opening<Registered> {
    pub fn create(
        factory: &dyn EngineFactory,
        options: ConnectOptions,
        sink: EventSink,
    ) -> Result<Self> {
        let library = Library::init()?;
        let handle = Handle::next();
        let state = Arc::new(Mutex::new(SessionState::Disconnected));
        let inflight = Arc::new(InFlight::default());
        let (tx, rx) = oneshot::channel();

        library.registry().register(
            handle,
            bridge(
                state.clone(),
                inflight.clone(),
                sink.clone(),
                Arc::new(Mutex::new(Some(tx))),
            ),
        );

        let dispatcher = Dispatcher::new(handle, library.registry().clone());
        let engine: Arc<dyn Engine> = match factory.create(&options, dispatcher) {
            Ok(engine) => Arc::from(engine),
            Err(e) => {
                library.registry().remove(handle);
                return Err(Error::Connection(e));
            }
        };
        debug!(
            "Created engine {} ({}) for {}:{}",
            handle,
            factory.version(),
            options.host,
            options.port
        );

        Ok(Self::new(
            options,
            handle,
            engine,
            state,
            inflight,
            sink,
            library,
            rx,
            Arc::new(AtomicBool::new(false)),
            None, // drive
        ))
    }

    /// Issues the asynchronous connect and starts the drive loop
    pub async fn connect(mut self) -> Result<Opening<Connecting>> {
        *lock(&self.state) = SessionState::Connecting;
        let connected =
            self.engine
                .connect(&self.options.host, self.options.port, self.options.keepalive);
        if let Err(e) = connected {
            return Err(self.abandon(Error::Connection(e)).await);
        }

        match spawn_drive(self.engine.clone(), self.handle, self.stop.clone()) {
            Ok(drive) => {
                self.drive = Some(drive);
                Ok(self.transition())
            }
            Err(e) => Err(self.abandon(e).await),
        }
    }
}

impl Opening<Connecting> {
    /// Waits for the connect outcome, tearing down on failure or timeout
    pub async fn wait(mut self, timeout: Duration) -> Result<Session> {
        let outcome = tokio::time::timeout(timeout, &mut self.outcome).await;
        match outcome {
            Ok(Ok(None)) => {
                info!(
                    "Session {} connected to {}:{}",
                    self.handle, self.options.host, self.options.port
                );
                Ok(self.into_session())
            }
            Ok(Ok(Some(error))) => {
                warn!("Session {} failed to connect: {}", self.handle, error);
                Err(self.abandon(Error::Connection(error)).await)
            }
            Ok(Err(_)) => Err(self
                .abandon(Error::Protocol("connect outcome was never delivered".into()))
                .await),
            Err(_) => {
                warn!(
                    "Session {} did not connect within {:?}",
                    self.handle, timeout
                );
                Err(self.abandon(Error::Timeout(timeout)).await)
            }
        }
    }

    fn into_session(self) -> Session {
        Session {
            handle: self.handle,
            options: self.options,
            engine: self.engine.clone(),
            state: self.state,
            inflight: self.inflight,
            sink: self.sink,
            resources: Mutex::new(Some(Resources {
                handle: self.handle,
                engine: self.engine,
                stop: self.stop,
                drive: self.drive,
                library: self.library,
            })),
        }
    }
}
