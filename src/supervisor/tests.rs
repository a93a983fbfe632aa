use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use super::*;
use crate::config::DEFAULT_RETENTION;
use crate::engine::simulated::{Behaviour, SimulatedFactory};
use crate::engine::EngineError;
use crate::store::{MessageType, Query};

macro_rules! eventually {
    ($condition:expr) => {{
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if $condition {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {}",
                stringify!($condition)
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }};
}

fn config(topics: &[&str]) -> SupervisorConfig {
    SupervisorConfig {
        broker: "localhost".into(),
        topics: topics.iter().map(|t| t.to_string()).collect(),
        connect_timeout_secs: 1,
        reconnect_interval_secs: 1,
        ..Default::default()
    }
}

struct Running {
    handle: SupervisorHandle,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl Running {
    fn start(config: SupervisorConfig, factory: &SimulatedFactory) -> Self {
        let store = Arc::new(MessageStore::open_in_memory().unwrap());
        Self::start_with_store(config, factory, store)
    }

    fn start_with_store(
        config: SupervisorConfig,
        factory: &SimulatedFactory,
        store: Arc<MessageStore>,
    ) -> Self {
        let (supervisor, handle) =
            Supervisor::new(config, Arc::new(factory.clone()), store).unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(shutdown.clone()));
        Self {
            handle,
            shutdown,
            task,
        }
    }

    async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.task.await.unwrap()
    }
}

#[tokio::test]
async fn maintains_configured_topics() {
    let factory = SimulatedFactory::new();
    let running = Running::start(config(&["sensors/#", "status/+"]), &factory);

    eventually!(running.handle.topics().await.unwrap().len() == 2);
    assert_eq!(
        running.handle.topics().await.unwrap(),
        vec!["sensors/#".to_string(), "status/+".to_string()]
    );

    running.stop().await.unwrap();
    assert_eq!(factory.live(), 0);
}

#[tokio::test]
async fn messages_are_classified_and_stored() {
    let factory = SimulatedFactory::new();
    let running = Running::start(config(&["sensors/#"]), &factory);
    eventually!(running.handle.status().await.unwrap().state == SupervisorState::Connected);

    factory.deliver("sensors/t1", b"21.5");
    factory.deliver("sensors/door", b"true");

    eventually!(running.handle.messages(Query::default()).await.unwrap().len() == 2);
    let numbers = running
        .handle
        .messages(Query {
            message_type: Some(MessageType::Numeric),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(numbers.len(), 1);
    assert_eq!(numbers[0].topic, "sensors/t1");
    assert_eq!(numbers[0].value, serde_json::json!(21.5));

    let single = running.handle.message(numbers[0].id).await.unwrap();
    assert_eq!(single, numbers[0]);
    assert!(matches!(
        running.handle.message(numbers[0].id + 100).await,
        Err(Error::NotFound(_))
    ));

    running.stop().await.unwrap();
}

#[tokio::test]
async fn reconnects_after_connection_loss() {
    let factory = SimulatedFactory::new();
    let running = Running::start(config(&["a/b"]), &factory);
    eventually!(running.handle.topics().await.unwrap() == vec!["a/b".to_string()]);

    factory.drop_connection("broker restarted");

    eventually!(factory.stats().created.load(Ordering::SeqCst) == 2);
    eventually!(running.handle.topics().await.unwrap() == vec!["a/b".to_string()]);
    assert_eq!(factory.live(), 1);

    running.stop().await.unwrap();
    assert_eq!(factory.live(), 0);
}

#[tokio::test]
async fn failed_connects_are_retried_without_leaking() {
    let factory = SimulatedFactory::with_behaviour(Behaviour {
        refuse: Some(EngineError::Refused("not authorised".into())),
        ..Default::default()
    });
    let running = Running::start(config(&[]), &factory);

    eventually!(factory.destroyed() >= 2 && factory.live() == 0);
    assert!(matches!(
        running.handle.publish("a/b", "x", None, false).await,
        Err(Error::OutOfOrder(_))
    ));

    factory.set_behaviour(Behaviour::default());
    eventually!(running.handle.status().await.unwrap().state == SupervisorState::Connected);

    running.stop().await.unwrap();
    assert_eq!(factory.live(), 0);
}

#[tokio::test]
async fn explicit_unsubscribe_stops_maintaining_filter() {
    let factory = SimulatedFactory::new();
    let running = Running::start(config(&["keep/#"]), &factory);
    eventually!(running.handle.topics().await.unwrap().len() == 1);

    running.handle.subscribe("extra/+").await.unwrap();
    eventually!(running.handle.topics().await.unwrap().len() == 2);

    running.handle.unsubscribe("keep/#").await.unwrap();
    eventually!(running.handle.topics().await.unwrap() == vec!["extra/+".to_string()]);

    let status = running.handle.status().await.unwrap();
    assert_eq!(status.maintained, vec!["extra/+".to_string()]);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn status_reports_connection_and_counts() {
    let factory = SimulatedFactory::new();
    let running = Running::start(config(&["t/#"]), &factory);
    eventually!(running.handle.topics().await.unwrap().len() == 1);

    running
        .handle
        .publish("t/out", b"7".to_vec(), Some(QoS::AtMostOnce), false)
        .await
        .unwrap();
    factory.deliver("t/in", b"hello");
    eventually!(running.handle.status().await.unwrap().count == 1);

    let status = running.handle.status().await.unwrap();
    assert_eq!(status.broker, "localhost");
    assert_eq!(status.state, SupervisorState::Connected);
    assert!(status.connected_since.is_some());
    assert_eq!(status.database, None);
    assert!(status.version.contains("simulated"));
    assert_eq!(status.dropped_events, 0);

    running.stop().await.unwrap();
}

#[tokio::test]
async fn handle_fails_once_supervisor_stopped() {
    let factory = SimulatedFactory::new();
    let running = Running::start(config(&[]), &factory);
    let handle = running.handle.clone();

    running.stop().await.unwrap();

    assert!(matches!(handle.topics().await, Err(Error::OutOfOrder(_))));
}

#[test]
fn invalid_config_is_rejected() {
    let store = Arc::new(MessageStore::open_in_memory().unwrap());
    let result = Supervisor::new(
        SupervisorConfig::default(),
        Arc::new(SimulatedFactory::new()),
        store,
    );
    assert!(matches!(result, Err(Error::BadParameter(_))));
}

#[test]
fn sweep_runs_four_times_per_window() {
    let retention = Duration::from_secs(3600);
    let interval = sweep_interval(retention);
    assert_eq!(interval, Duration::from_secs(900));
    assert_eq!(retention + interval, retention.mul_f64(1.25));
}

#[tokio::test]
async fn expired_messages_are_swept() {
    let factory = SimulatedFactory::new();
    let store = Arc::new(MessageStore::open_in_memory().unwrap());
    let now = Utc::now();
    store
        .insert(now - chrono::Duration::days(3), "old/a", MessageType::Text, b"a")
        .unwrap();
    store
        .insert(now - chrono::Duration::days(2), "old/b", MessageType::Text, b"b")
        .unwrap();
    store
        .insert(now - chrono::Duration::hours(1), "fresh", MessageType::Text, b"c")
        .unwrap();

    let running = Running::start_with_store(
        SupervisorConfig {
            retention_secs: 24 * 3600,
            ..config(&[])
        },
        &factory,
        store.clone(),
    );

    eventually!(store.count().unwrap() == 1);
    let remaining = store.query(&Query::default()).unwrap();
    assert_eq!(remaining[0].topic, "fresh");

    running.stop().await.unwrap();
}

#[tokio::test]
async fn short_retention_is_reported_as_default() {
    let factory = SimulatedFactory::new();
    let running = Running::start(
        SupervisorConfig {
            retention_secs: 5,
            ..config(&[])
        },
        &factory,
    );

    let status = running.handle.status().await.unwrap();
    assert_eq!(status.retention_secs, DEFAULT_RETENTION.as_secs());

    running.stop().await.unwrap();
}

#[tokio::test]
async fn commands_are_answered_while_connecting() {
    let factory = SimulatedFactory::with_behaviour(Behaviour {
        connect_delay: Duration::from_millis(1500),
        ..Default::default()
    });
    let running = Running::start(
        SupervisorConfig {
            connect_timeout_secs: 5,
            ..config(&["a/#"])
        },
        &factory,
    );

    eventually!(running.handle.status().await.unwrap().state == SupervisorState::Connecting);
    assert!(matches!(
        running.handle.publish("a/b", "x", None, false).await,
        Err(Error::OutOfOrder(_))
    ));
    assert!(running.handle.topics().await.unwrap().is_empty());

    eventually!(running.handle.status().await.unwrap().state == SupervisorState::Connected);
    eventually!(running.handle.topics().await.unwrap() == vec!["a/#".to_string()]);

    running.stop().await.unwrap();
    assert_eq!(factory.live(), 0);
}

#[tokio::test]
async fn shutdown_during_connect_releases_the_engine() {
    let factory = SimulatedFactory::with_behaviour(Behaviour {
        connect_delay: Duration::from_millis(500),
        ..Default::default()
    });
    let running = Running::start(
        SupervisorConfig {
            connect_timeout_secs: 5,
            ..config(&[])
        },
        &factory,
    );

    eventually!(running.handle.status().await.unwrap().state == SupervisorState::Connecting);
    running.stop().await.unwrap();
    assert_eq!(factory.live(), 0);
}
