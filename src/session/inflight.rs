use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::engine::{EngineError, RequestId};
use crate::error::{AckKind, Error, Result};

/// Request issued to the engine and not yet acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    pub kind: AckKind,
    pub topic: String,
}

/// Request counters of one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    pub created: u64,
    pub consumed: u64,
    pub in_flight: usize,
}

/// In-flight request table keyed by request id
///
/// [`InFlight::issue`] holds the table lock across the engine call and the insert, so
/// an acknowledgement can never be looked up before its entry exists.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    pending: Mutex<HashMap<RequestId, Pending>>,
    created: AtomicU64,
    consumed: AtomicU64,
}

impl InFlight {
    pub fn issue(
        &self,
        kind: AckKind,
        topic: &str,
        call: impl FnOnce() -> std::result::Result<RequestId, EngineError>,
    ) -> Result<RequestId> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let id = call()?;
        if let Some(previous) = pending.insert(
            id,
            Pending {
                kind,
                topic: topic.to_string(),
            },
        ) {
            return Err(Error::Protocol(format!(
                "engine reused request id {} still pending for {} {:?}",
                id, previous.kind, previous.topic
            )));
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Consumes the entry for `id`; it must exist and be of `kind`
    pub fn complete(&self, kind: AckKind, id: RequestId) -> Result<Pending> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.get(&id) {
            Some(entry) if entry.kind == kind => {
                let entry = pending.remove(&id).ok_or(Error::UnexpectedAcknowledgement {
                    kind,
                    request_id: id,
                })?;
                self.consumed.fetch_add(1, Ordering::Relaxed);
                Ok(entry)
            }
            _ => Err(Error::UnexpectedAcknowledgement {
                kind,
                request_id: id,
            }),
        }
    }

    pub fn stats(&self) -> RequestStats {
        let in_flight = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        RequestStats {
            created: self.created.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            in_flight,
        }
    }
}
