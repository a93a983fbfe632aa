//! Subscription bookkeeping
//!
//! Correlates subscribe/unsubscribe acknowledgements to their topic filters by request
//! id. A filter enters the confirmed set only through a subscribe acknowledgement and
//! leaves it only through an unsubscribe acknowledgement.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::engine::RequestId;
use crate::error::{AckKind, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingFilter {
    kind: AckKind,
    filter: String,
}

#[derive(Debug, Default)]
pub struct TopicTracker {
    pending: HashMap<RequestId, PendingFilter>,
    confirmed: BTreeSet<String>,
}

impl TopicTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, filter: &str, request_id: RequestId) {
        self.record(AckKind::Subscribe, filter, request_id);
    }

    pub fn unsubscribe(&mut self, filter: &str, request_id: RequestId) {
        self.record(AckKind::Unsubscribe, filter, request_id);
    }

    fn record(&mut self, kind: AckKind, filter: &str, request_id: RequestId) {
        let entry = PendingFilter {
            kind,
            filter: filter.to_string(),
        };
        if let Some(previous) = self.pending.insert(request_id, entry) {
            debug!(
                "Request {} replaced pending {} of {:?}",
                request_id, previous.kind, previous.filter
            );
        }
    }

    /// Applies an acknowledgement and returns the affected filter
    ///
    /// Unknown or already consumed request ids leave the tracker untouched and are
    /// reported as [`Error::UnexpectedAcknowledgement`].
    pub fn on_ack(&mut self, kind: AckKind, request_id: RequestId) -> Result<String> {
        let unexpected = Error::UnexpectedAcknowledgement { kind, request_id };
        match self.pending.get(&request_id) {
            Some(entry) if entry.kind == kind => {}
            _ => return Err(unexpected),
        }
        let entry = self.pending.remove(&request_id).ok_or(unexpected)?;

        match kind {
            AckKind::Subscribe => {
                self.confirmed.insert(entry.filter.clone());
            }
            AckKind::Unsubscribe => {
                self.confirmed.remove(&entry.filter);
            }
            AckKind::Publish => {}
        }
        Ok(entry.filter)
    }

    /// Drops the pending entry of a subscription the broker refused
    pub fn on_reject(&mut self, request_id: RequestId) -> Option<String> {
        match self.pending.get(&request_id) {
            Some(entry) if entry.kind == AckKind::Subscribe => {
                self.pending.remove(&request_id).map(|entry| entry.filter)
            }
            _ => None,
        }
    }

    pub fn has(&self, filter: &str) -> bool {
        self.confirmed.contains(filter)
    }

    /// Confirmed filters in sorted order
    pub fn list(&self) -> Vec<String> {
        self.confirmed.iter().cloned().collect()
    }

    /// True when a request for `filter` of `kind` is awaiting acknowledgement
    pub fn is_pending(&self, kind: AckKind, filter: &str) -> bool {
        self.pending
            .values()
            .any(|entry| entry.kind == kind && entry.filter == filter)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_subscribe_confirms_once() {
        let mut tracker = TopicTracker::new();
        tracker.subscribe("a/b", RequestId(1));
        tracker.subscribe("a/b", RequestId(2));

        assert_eq!(tracker.on_ack(AckKind::Subscribe, RequestId(1)).unwrap(), "a/b");
        assert!(tracker.has("a/b"));
        assert_eq!(tracker.on_ack(AckKind::Subscribe, RequestId(2)).unwrap(), "a/b");
        assert_eq!(tracker.list(), vec!["a/b".to_string()]);
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn unexpected_ack_does_not_mutate() {
        let mut tracker = TopicTracker::new();
        tracker.subscribe("a/b", RequestId(1));
        tracker.on_ack(AckKind::Subscribe, RequestId(1)).unwrap();

        let consumed = tracker.on_ack(AckKind::Subscribe, RequestId(1));
        let never_issued = tracker.on_ack(AckKind::Unsubscribe, RequestId(99));

        assert!(matches!(
            consumed,
            Err(Error::UnexpectedAcknowledgement { request_id: RequestId(1), .. })
        ));
        assert!(matches!(
            never_issued,
            Err(Error::UnexpectedAcknowledgement { .. })
        ));
        assert_eq!(tracker.list(), vec!["a/b".to_string()]);
    }

    #[test]
    fn mismatched_kind_keeps_pending_entry() {
        let mut tracker = TopicTracker::new();
        tracker.subscribe("a/b", RequestId(3));

        assert!(tracker.on_ack(AckKind::Unsubscribe, RequestId(3)).is_err());
        assert!(tracker.is_pending(AckKind::Subscribe, "a/b"));
        assert!(!tracker.has("a/b"));
    }

    #[test]
    fn unsubscribe_ack_removes_filter() {
        let mut tracker = TopicTracker::new();
        tracker.subscribe("x/#", RequestId(1));
        tracker.subscribe("a/+", RequestId(2));
        tracker.on_ack(AckKind::Subscribe, RequestId(1)).unwrap();
        tracker.on_ack(AckKind::Subscribe, RequestId(2)).unwrap();
        assert_eq!(tracker.list(), vec!["a/+".to_string(), "x/#".to_string()]);

        tracker.unsubscribe("x/#", RequestId(3));
        assert!(tracker.has("x/#"));
        tracker.on_ack(AckKind::Unsubscribe, RequestId(3)).unwrap();

        assert!(!tracker.has("x/#"));
        assert_eq!(tracker.list(), vec!["a/+".to_string()]);
    }

    #[test]
    fn rejected_subscription_is_not_confirmed() {
        let mut tracker = TopicTracker::new();
        tracker.subscribe("secret/#", RequestId(5));

        assert_eq!(tracker.on_reject(RequestId(5)).as_deref(), Some("secret/#"));
        assert_eq!(tracker.on_reject(RequestId(5)), None);
        assert!(!tracker.has("secret/#"));
        assert_eq!(tracker.pending(), 0);
    }
}
