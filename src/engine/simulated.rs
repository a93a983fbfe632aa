//! In-process engine used by the tests
//!
//! Acknowledgements are queued by the operations and only fired from
//! [`Engine::process`], like a real engine. The factory keeps counters of created,
//! live and destroyed instances so tests can check that no handle leaks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::{ConnectOptions, Dispatcher, Engine, EngineError, EngineFactory, QoS, RequestId};

#[derive(Debug, Default)]
pub(crate) struct SimulatedStats {
    pub created: AtomicUsize,
    pub live: AtomicUsize,
    pub destroyed: AtomicUsize,
    pub connects: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Behaviour {
    /// Delay between `connect` and the connect callback
    pub connect_delay: Duration,
    /// Report this error from the connect callback instead of success
    pub refuse: Option<EngineError>,
    /// Answer every subscription with a failure return code
    pub reject_subscriptions: bool,
    /// Fail `create` for every instance
    pub fail_create: bool,
}

enum Queued {
    Subscribed(RequestId, QoS),
    Unsubscribed(RequestId),
    Published(RequestId),
    Message(String, Vec<u8>),
    Disconnected(Option<EngineError>),
}

/// Shared between the factory and every engine it creates
#[derive(Default)]
struct Shared {
    stats: SimulatedStats,
    behaviour: Mutex<Behaviour>,
    inbox: Mutex<VecDeque<Queued>>,
}

#[derive(Clone, Default)]
pub(crate) struct SimulatedFactory {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behaviour(behaviour: Behaviour) -> Self {
        let factory = Self::default();
        *lock(&factory.shared.behaviour) = behaviour;
        factory
    }

    pub fn set_behaviour(&self, behaviour: Behaviour) {
        *lock(&self.shared.behaviour) = behaviour;
    }

    pub fn stats(&self) -> &SimulatedStats {
        &self.shared.stats
    }

    pub fn live(&self) -> usize {
        self.shared.stats.live.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.shared.stats.destroyed.load(Ordering::SeqCst)
    }

    /// Delivers an inbound message through whichever engine is connected
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        lock(&self.shared.inbox).push_back(Queued::Message(topic.to_string(), payload.to_vec()));
    }

    /// Drops the connection of whichever engine is connected
    pub fn drop_connection(&self, reason: &str) {
        lock(&self.shared.inbox).push_back(Queued::Disconnected(Some(
            EngineError::ConnectionLost(reason.to_string()),
        )));
    }
}

impl EngineFactory for SimulatedFactory {
    fn create(
        &self,
        _options: &ConnectOptions,
        dispatcher: Dispatcher,
    ) -> Result<Box<dyn Engine>, EngineError> {
        let behaviour = lock(&self.shared.behaviour).clone();
        if behaviour.fail_create {
            return Err(EngineError::Library("simulated create failure".into()));
        }
        self.shared.stats.created.fetch_add(1, Ordering::SeqCst);
        self.shared.stats.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimulatedEngine {
            dispatcher,
            shared: self.shared.clone(),
            behaviour,
            state: Mutex::new(SimState::default()),
            destroyed: AtomicBool::new(false),
        }))
    }

    fn version(&self) -> String {
        String::from("simulated")
    }
}

#[derive(Default)]
struct SimState {
    connect_requested: Option<Instant>,
    connect_reported: bool,
    connected: bool,
    next_id: u32,
    queue: VecDeque<Queued>,
}

impl SimState {
    fn allocate(&mut self) -> RequestId {
        self.next_id += 1;
        RequestId(self.next_id)
    }
}

struct SimulatedEngine {
    dispatcher: Dispatcher,
    shared: Arc<Shared>,
    behaviour: Behaviour,
    state: Mutex<SimState>,
    destroyed: AtomicBool,
}

impl SimulatedEngine {
    fn connected_state(&self) -> Result<MutexGuard<'_, SimState>, EngineError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(EngineError::Destroyed);
        }
        let state = lock(&self.state);
        if !state.connected {
            return Err(EngineError::NotConnected);
        }
        Ok(state)
    }
}

impl Engine for SimulatedEngine {
    fn connect(&self, _host: &str, _port: u16, _keepalive: Duration) -> Result<(), EngineError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(EngineError::Destroyed);
        }
        self.shared.stats.connects.fetch_add(1, Ordering::SeqCst);
        lock(&self.state).connect_requested = Some(Instant::now());
        Ok(())
    }

    fn subscribe(&self, _filter: &str, qos: QoS) -> Result<RequestId, EngineError> {
        let mut state = self.connected_state()?;
        let id = state.allocate();
        state.queue.push_back(Queued::Subscribed(id, qos));
        Ok(id)
    }

    fn unsubscribe(&self, _filter: &str) -> Result<RequestId, EngineError> {
        let mut state = self.connected_state()?;
        let id = state.allocate();
        state.queue.push_back(Queued::Unsubscribed(id));
        Ok(id)
    }

    fn publish(
        &self,
        _topic: &str,
        _payload: &[u8],
        _qos: QoS,
        _retain: bool,
    ) -> Result<RequestId, EngineError> {
        let mut state = self.connected_state()?;
        let id = state.allocate();
        state.queue.push_back(Queued::Published(id));
        Ok(id)
    }

    fn disconnect(&self) -> Result<(), EngineError> {
        let mut state = self.connected_state()?;
        state.queue.push_back(Queued::Disconnected(None));
        Ok(())
    }

    fn process(&self, timeout: Duration) -> Result<(), EngineError> {
        let mut outcome: Option<Option<EngineError>> = None;
        let mut fired = Vec::new();
        {
            let mut state = lock(&self.state);
            if let Some(requested) = state.connect_requested {
                if !state.connect_reported && requested.elapsed() >= self.behaviour.connect_delay {
                    state.connect_reported = true;
                    state.connected = self.behaviour.refuse.is_none();
                    outcome = Some(self.behaviour.refuse.clone());
                }
            }
            if state.connected {
                let inbox: Vec<Queued> = lock(&self.shared.inbox).drain(..).collect();
                state.queue.extend(inbox);
                while let Some(queued) = state.queue.pop_front() {
                    let ends = matches!(queued, Queued::Disconnected(_));
                    fired.push(queued);
                    if ends {
                        state.connected = false;
                        break;
                    }
                }
            }
        }

        if outcome.is_none() && fired.is_empty() {
            thread::sleep(timeout.min(Duration::from_millis(2)));
            return Ok(());
        }

        if let Some(error) = outcome {
            self.dispatcher.connected(error.clone());
            if let Some(error) = error {
                return Err(error);
            }
        }

        let mut lost = None;
        for entry in fired {
            match entry {
                Queued::Disconnected(error) => {
                    lost = error.clone();
                    self.dispatcher.disconnected(error);
                }
                Queued::Subscribed(id, qos) => {
                    let granted = if self.behaviour.reject_subscriptions {
                        None
                    } else {
                        Some(qos)
                    };
                    self.dispatcher.subscribed(id, &[granted]);
                }
                Queued::Unsubscribed(id) => self.dispatcher.unsubscribed(id),
                Queued::Published(id) => self.dispatcher.published(id),
                Queued::Message(topic, payload) => {
                    self.dispatcher.message(RequestId(0), &topic, &payload)
                }
            }
        }

        match lost {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn destroy(&self) -> Result<(), EngineError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Destroyed);
        }
        self.shared.stats.live.fetch_sub(1, Ordering::SeqCst);
        self.shared.stats.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
