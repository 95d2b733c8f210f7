//! Completion dispatch.
//!
//! [`poll`] turns one connection's completion queue into a lazy stream of
//! resolved [`Request`]s. Entries whose context no longer names a pending
//! request are logged and dropped, so no request is delivered twice.

use std::iter::FusedIterator;

use tracing::{debug, warn};

use crate::connection::{ConnId, ConnState, ConnectionManager};
use crate::metrics::EngineMetrics;
use crate::request::{Request, RequestTable};
use crate::transport::{CqHandle, TransportProvider};

/// Iterator over the completed requests of one connection.
///
/// Each call to `next` pulls entries from the provider until one resolves a
/// pending request or the queue is empty. Once the queue reports empty the
/// iterator stays exhausted.
pub struct Drain<'a, P: TransportProvider> {
    provider: &'a P,
    cq: CqHandle,
    conn: ConnId,
    requests: &'a mut RequestTable,
    metrics: &'a EngineMetrics,
    done: bool,
}

impl<'a, P: TransportProvider> Iterator for Drain<'a, P> {
    type Item = Request;

    fn next(&mut self) -> Option<Request> {
        while !self.done {
            let entry = match self.provider.poll_completion(self.cq) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.done = true;
                    break;
                }
                Err(e) => {
                    warn!(conn = %self.conn, "poll completion failed: {}", e);
                    self.done = true;
                    break;
                }
            };
            match self.requests.resolve(&entry) {
                Some(request) => {
                    self.metrics.completion(!request.result.is_success());
                    debug!(
                        conn = %self.conn,
                        request = %request.id,
                        result = %request.result,
                        len = request.len,
                        "completion"
                    );
                    return Some(request);
                }
                None => {
                    self.metrics.inc_completions_dropped();
                    warn!(
                        conn = %self.conn,
                        context = entry.context,
                        op = ?entry.op,
                        "completion for unknown or resolved request dropped"
                    );
                }
            }
        }
        None
    }
}

impl<'a, P: TransportProvider> FusedIterator for Drain<'a, P> {}

/// Drains the completion queue of one connection.
pub fn poll<'a, P: TransportProvider>(
    provider: &'a P,
    conn: ConnId,
    cq: CqHandle,
    requests: &'a mut RequestTable,
    metrics: &'a EngineMetrics,
) -> Drain<'a, P> {
    Drain {
        provider,
        cq,
        conn,
        requests,
        metrics,
        done: false,
    }
}

/// Drains every live connection once, in insertion order, skipping
/// connections that are closing or closed.
pub fn poll_all<P: TransportProvider>(
    provider: &P,
    manager: &ConnectionManager,
    requests: &mut RequestTable,
    metrics: &EngineMetrics,
) -> Vec<(ConnId, Request)> {
    let mut completed = Vec::new();
    for conn in manager.iter() {
        if matches!(conn.state(), ConnState::Closing | ConnState::Closed) {
            continue;
        }
        let Some(cq) = conn.cq() else { continue };
        completed.extend(poll(provider, conn.id(), cq, requests, metrics).map(|r| (conn.id(), r)));
    }
    completed
}
