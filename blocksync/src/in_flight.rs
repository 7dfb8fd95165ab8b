use std::time::Duration;

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::time::Instant;

use crate::{
    crypto::Hash,
    message::{BlockHeader, PeerId},
};

/// Headers from one peer, either waiting for a body request or with one outstanding.
#[derive(Debug, Clone)]
pub struct HeaderBatch {
    pub peer: PeerId,
    /// Ascending by block number.
    pub headers: Vec<BlockHeader>,
    /// Set when the body request for these headers is sent.
    pub sent_at: Option<Instant>,
}

impl HeaderBatch {
    pub fn new(peer: PeerId, headers: Vec<BlockHeader>) -> Self {
        Self {
            peer,
            headers,
            sent_at: None,
        }
    }

    pub fn hashes(&self) -> Vec<Hash> {
        self.headers.iter().map(|h| h.hash).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn first_number(&self) -> Option<u64> {
        self.headers.first().map(|h| h.number)
    }

    pub fn last_number(&self) -> Option<u64> {
        self.headers.last().map(|h| h.number)
    }
}

/// What happened when a header batch was offered to the in-flight table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// No request was outstanding for the peer. Request these bodies.
    Fresh(Vec<Hash>),
    /// The outstanding request went stale and was superseded. Request these bodies.
    Retry(Vec<Hash>),
    /// A fresh request is already outstanding; the batch was dropped.
    Busy,
}

/// At most one outstanding body request per peer.
#[derive(Debug)]
pub struct InFlightRequests {
    requests: DashMap<PeerId, HeaderBatch>,
    timeout: Duration,
}

impl InFlightRequests {
    pub fn new(timeout: Duration) -> Self {
        Self {
            requests: DashMap::new(),
            timeout,
        }
    }

    /// Record `batch` as the peer's outstanding request unless a fresh one already exists. The check and the
    /// insert-or-replace happen under the peer's entry lock.
    pub fn admit(&self, mut batch: HeaderBatch, now: Instant) -> Admission {
        match self.requests.entry(batch.peer) {
            Entry::Vacant(entry) => {
                let hashes = batch.hashes();
                batch.sent_at = Some(now);
                entry.insert(batch);
                Admission::Fresh(hashes)
            }
            Entry::Occupied(mut entry) => {
                let sent_at = entry.get().sent_at.unwrap_or(now);
                if now.saturating_duration_since(sent_at) > self.timeout {
                    let hashes = batch.hashes();
                    batch.sent_at = Some(now);
                    entry.insert(batch);
                    Admission::Retry(hashes)
                } else {
                    Admission::Busy
                }
            }
        }
    }

    /// Remove and return the peer's outstanding request, if any.
    pub fn take(&self, peer: PeerId) -> Option<HeaderBatch> {
        self.requests.remove(&peer).map(|(_, batch)| batch)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}
