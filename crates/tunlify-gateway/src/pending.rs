//! Pending-request table
//!
//! Correlates `request` frames with their `response`/`error` frames by
//! request id. An entry exists iff exactly one waiter holds the receiving
//! end; removal happens exactly once (completion, failure, cancellation or
//! janitor sweep), so a waiter is resumed at most once.

use std::collections::HashMap;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use tunlify_catalog::TunnelKey;
use tunlify_proto::BodyEncoding;

/// Successful response payload off the control channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxiedResponse {
    pub status_code: Option<u16>,
    pub headers: HashMap<String, String>,
    pub encoding: BodyEncoding,
    pub body: String,
}

/// Terminal failure for a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestFailure {
    /// The 30-second budget elapsed (or the janitor hit the retention cap).
    Timeout,
    /// The control channel closed while the request was in flight.
    TunnelGone,
    /// The client answered with an `error` frame.
    Upstream(String),
}

pub type RequestOutcome = Result<ProxiedResponse, RequestFailure>;

struct PendingEntry {
    tx: oneshot::Sender<RequestOutcome>,
    key: TunnelKey,
    method: String,
    path: String,
    registered_at: Instant,
}

#[derive(Default)]
pub struct PendingRequests {
    entries: DashMap<String, PendingEntry>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `request_id`. Must be called before the
    /// `request` frame is enqueued so a fast response cannot beat the
    /// registration.
    pub fn register(
        &self,
        request_id: &str,
        key: TunnelKey,
        method: &str,
        path: &str,
    ) -> oneshot::Receiver<RequestOutcome> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            request_id.to_string(),
            PendingEntry {
                tx,
                key,
                method: method.to_string(),
                path: path.to_string(),
                registered_at: Instant::now(),
            },
        );
        debug!(request_id, method, path, "registered pending request");
        rx
    }

    /// Deliver a response. Returns false when the id is unknown (already
    /// completed, timed out, or never registered).
    pub fn complete(&self, request_id: &str, response: ProxiedResponse) -> bool {
        self.finish(request_id, Ok(response))
    }

    /// Fail a single request.
    pub fn fail(&self, request_id: &str, failure: RequestFailure) -> bool {
        self.finish(request_id, Err(failure))
    }

    fn finish(&self, request_id: &str, outcome: RequestOutcome) -> bool {
        let Some((_, entry)) = self.entries.remove(request_id) else {
            warn!(request_id, "no pending request for this id");
            return false;
        };
        // The entry is out of the table before the waiter resumes; the
        // send only fails if the waiter already gave up.
        entry.tx.send(outcome).is_ok()
    }

    /// Fail every request bound to a tunnel key with `TunnelGone`. Used by
    /// the channel-close broadcast.
    pub fn cancel_by_key(&self, key: &TunnelKey) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().key == *key)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &ids {
            if let Some((_, entry)) = self.entries.remove(id) {
                debug!(
                    request_id = %id,
                    method = %entry.method,
                    path = %entry.path,
                    tunnel = %key,
                    "failing pending request: tunnel gone"
                );
                let _ = entry.tx.send(Err(RequestFailure::TunnelGone));
            }
        }

        ids.len()
    }

    /// Forcibly fail requests older than `max_age`. Janitor path.
    pub fn sweep(&self, max_age: std::time::Duration) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().registered_at.elapsed() >= max_age)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &ids {
            if let Some((_, entry)) = self.entries.remove(id) {
                warn!(
                    request_id = %id,
                    tunnel = %entry.key,
                    "sweeping stale pending request"
                );
                let _ = entry.tx.send(Err(RequestFailure::Timeout));
            }
        }

        ids.len()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}
