use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task;

use crate::engine::{QoS, RequestId};
use crate::error::{Error, Result};
use crate::session::RequestStats;
use crate::store::{MessageStore, MessageView, Query};

use super::SupervisorState;

/// Request handled inside the supervisor loop
#[derive(Debug)]
pub enum Command {
    Subscribe {
        filter: String,
        response_tx: oneshot::Sender<Result<RequestId>>,
    },
    Unsubscribe {
        filter: String,
        response_tx: oneshot::Sender<Result<RequestId>>,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: Option<QoS>,
        retain: bool,
        response_tx: oneshot::Sender<Result<RequestId>>,
    },
    Topics {
        response_tx: oneshot::Sender<Vec<String>>,
    },
    Status {
        response_tx: oneshot::Sender<Result<Status>>,
    },
}

/// Point-in-time report of the supervisor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub version: String,
    pub broker: String,
    pub database: Option<PathBuf>,
    pub retention_secs: u64,
    pub state: SupervisorState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<DateTime<Utc>>,
    pub count: u64,
    pub topics: Vec<String>,
    pub maintained: Vec<String>,
    pub dropped_events: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<RequestStats>,
}

/// Cloneable front end for a running supervisor
///
/// Topic and publish requests travel to the supervisor loop; message queries go
/// straight to the store.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Command>,
    store: Arc<MessageStore>,
}

impl SupervisorHandle {
    pub(super) fn new(tx: mpsc::Sender<Command>, store: Arc<MessageStore>) -> Self {
        Self { tx, store }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| Error::OutOfOrder("supervisor is not running".into()))?;
        response_rx
            .await
            .map_err(|_| Error::OutOfOrder("supervisor stopped before answering".into()))
    }

    /// Subscribes now and keeps the filter subscribed across reconnects
    pub async fn subscribe(&self, filter: &str) -> Result<RequestId> {
        let filter = filter.to_string();
        self.request(|response_tx| Command::Subscribe {
            filter,
            response_tx,
        })
        .await?
    }

    /// Unsubscribes and stops maintaining the filter
    pub async fn unsubscribe(&self, filter: &str) -> Result<RequestId> {
        let filter = filter.to_string();
        self.request(|response_tx| Command::Unsubscribe {
            filter,
            response_tx,
        })
        .await?
    }

    /// Publishes with the configured QoS unless `qos` is given
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: Option<QoS>,
        retain: bool,
    ) -> Result<RequestId> {
        let topic = topic.to_string();
        let payload = payload.into();
        self.request(|response_tx| Command::Publish {
            topic,
            payload,
            qos,
            retain,
            response_tx,
        })
        .await?
    }

    /// Confirmed subscriptions in sorted order
    pub async fn topics(&self) -> Result<Vec<String>> {
        self.request(|response_tx| Command::Topics { response_tx })
            .await
    }

    pub async fn status(&self) -> Result<Status> {
        self.request(|response_tx| Command::Status { response_tx })
            .await?
    }

    pub async fn messages(&self, query: Query) -> Result<Vec<MessageView>> {
        let store = self.store.clone();
        task::spawn_blocking(move || {
            store
                .query(&query)
                .map(|rows| rows.iter().map(MessageView::from).collect())
        })
        .await
        .map_err(|e| Error::Protocol(format!("query task failed: {}", e)))?
    }

    pub async fn message(&self, id: i64) -> Result<MessageView> {
        let store = self.store.clone();
        task::spawn_blocking(move || store.get(id).map(MessageView::from))
            .await
            .map_err(|e| Error::Protocol(format!("query task failed: {}", e)))?
    }
}
