//! Pending request table.
//!
//! Every posted operation and every timer is a [`Request`] keyed by a
//! [`RequestId`]. The id doubles as the completion context handed to the
//! provider, so a completion finds its request with one lookup. Ids are never
//! reused within one table; a context that no longer resolves belongs to a
//! request that was already resolved or cancelled.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::connection::ConnId;
use crate::error::CompletionCode;
use crate::task::TaskSlot;
use crate::transport::{CompletionEntry, OpKind};

/// Identifier of a pending request, also its provider completion context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// What to do when a network request completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    /// Initiator: the command message left (GET or PUT).
    CommandSent,
    /// Initiator: the GET payload landed in the bulk slot.
    BulkReceived,
    /// Initiator: the PUT payload left.
    BulkSent,
    /// Responder: a command arrived in the command slot.
    CommandReceived,
    /// Responder: the GET reply write finished.
    ReplyWritten,
    /// Responder: the PUT payload arrived in the bulk slot.
    PutPayloadReceived,
    /// A standalone remote read or write.
    OneSided,
}

/// Kind-specific data carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPayload {
    /// An operation posted on a connection.
    Network {
        /// Owning connection.
        conn: ConnId,
        /// Posted operation kind.
        op: OpKind,
        /// Continuation to run on completion.
        step: Step,
        /// Requested transfer size.
        bytes: usize,
    },
    /// A timer, resolved by the event loop once `deadline` passes.
    Timer {
        /// When the timer fires.
        deadline: Instant,
    },
}

/// A pending or resolved request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request id.
    pub id: RequestId,
    /// Kind-specific data.
    pub payload: RequestPayload,
    /// Task slot to report into, if attached.
    pub task: Option<TaskSlot>,
    /// Outcome, [`CompletionCode::Success`] until resolved otherwise.
    pub result: CompletionCode,
    /// Bytes transferred according to the completion.
    pub len: usize,
    /// Remote completion data delivered with the completion.
    pub data: Option<u64>,
}

impl Request {
    /// The owning connection of a network request.
    pub fn conn(&self) -> Option<ConnId> {
        match self.payload {
            RequestPayload::Network { conn, .. } => Some(conn),
            RequestPayload::Timer { .. } => None,
        }
    }

    /// The continuation of a network request.
    pub fn step(&self) -> Option<Step> {
        match self.payload {
            RequestPayload::Network { step, .. } => Some(step),
            RequestPayload::Timer { .. } => None,
        }
    }

    /// Applies a completion entry to the request.
    pub fn apply(&mut self, entry: &CompletionEntry) {
        self.result = entry.error.unwrap_or(CompletionCode::Success);
        self.len = entry.len;
        self.data = entry.data;
    }
}

/// Table of pending requests.
#[derive(Debug, Default)]
pub struct RequestTable {
    pending: BTreeMap<RequestId, Request>,
    next_id: u64,
}

impl RequestTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new pending request and returns its id.
    pub fn insert(&mut self, payload: RequestPayload, task: Option<TaskSlot>) -> RequestId {
        self.next_id += 1;
        let id = RequestId(self.next_id);
        self.pending.insert(
            id,
            Request {
                id,
                payload,
                task,
                result: CompletionCode::Success,
                len: 0,
                data: None,
            },
        );
        id
    }

    /// Borrows a pending request.
    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.pending.get(&id)
    }

    /// Removes a request so it can be resolved. A second call returns `None`.
    pub fn take(&mut self, id: RequestId) -> Option<Request> {
        self.pending.remove(&id)
    }

    /// Resolves the request named by a completion context.
    pub fn resolve(&mut self, entry: &CompletionEntry) -> Option<Request> {
        let mut request = self.take(RequestId(entry.context))?;
        request.apply(entry);
        Some(request)
    }

    /// Pending network requests of `conn`, oldest first.
    pub fn pending_for(&self, conn: ConnId) -> Vec<RequestId> {
        self.pending
            .values()
            .filter(|r| r.conn() == Some(conn))
            .map(|r| r.id)
            .collect()
    }

    /// Timers whose deadline is at or before `now`, oldest first.
    pub fn expired_timers(&self, now: Instant) -> Vec<RequestId> {
        self.pending
            .values()
            .filter(|r| matches!(r.payload, RequestPayload::Timer { deadline } if deadline <= now))
            .map(|r| r.id)
            .collect()
    }

    /// The earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .filter_map(|r| match r.payload {
                RequestPayload::Timer { deadline } => Some(deadline),
                RequestPayload::Network { .. } => None,
            })
            .min()
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn network(conn: u64, step: Step) -> RequestPayload {
        RequestPayload::Network {
            conn: ConnId(conn),
            op: OpKind::Recv,
            step,
            bytes: 16,
        }
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut table = RequestTable::new();
        let a = table.insert(network(1, Step::CommandSent), None);
        table.take(a).unwrap();
        let b = table.insert(network(1, Step::CommandSent), None);
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_resolve_exactly_once() {
        let mut table = RequestTable::new();
        let id = table.insert(network(1, Step::BulkReceived), None);
        let entry = CompletionEntry {
            context: id.0,
            op: OpKind::Recv,
            len: 16,
            data: Some(16),
            error: None,
        };
        let req = table.resolve(&entry).unwrap();
        assert_eq!(req.result, CompletionCode::Success);
        assert_eq!(req.len, 16);
        assert_eq!(req.data, Some(16));
        assert_eq!(req.step(), Some(Step::BulkReceived));
        assert!(table.resolve(&entry).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_error_entry_sets_result() {
        let mut table = RequestTable::new();
        let id = table.insert(network(2, Step::CommandSent), None);
        let entry = CompletionEntry::failed(id.0, OpKind::Send, CompletionCode::LocalError);
        let req = table.resolve(&entry).unwrap();
        assert_eq!(req.result, CompletionCode::LocalError);
    }

    #[test]
    fn test_pending_for_filters_by_connection() {
        let mut table = RequestTable::new();
        let a = table.insert(network(1, Step::CommandSent), None);
        let _b = table.insert(network(2, Step::CommandSent), None);
        let c = table.insert(network(1, Step::BulkReceived), None);
        table.insert(
            RequestPayload::Timer {
                deadline: Instant::now(),
            },
            None,
        );
        assert_eq!(table.pending_for(ConnId(1)), vec![a, c]);
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_timers() {
        let mut table = RequestTable::new();
        let now = Instant::now();
        let soon = table.insert(RequestPayload::Timer { deadline: now }, None);
        let later = table.insert(
            RequestPayload::Timer {
                deadline: now + Duration::from_secs(60),
            },
            None,
        );
        assert_eq!(table.expired_timers(now), vec![soon]);
        assert_eq!(table.next_deadline(), Some(now));
        table.take(soon);
        assert_eq!(table.next_deadline(), table.get(later).map(|_| now + Duration::from_secs(60)));
        assert!(table.get(later).unwrap().conn().is_none());
    }
}
