//! Pending call table.
//!
//! Maps a correlation id to the caller waiting for its response. An entry is
//! removed exactly once, when the matching response settles it. There is no
//! expiry: a request whose response never arrives keeps its entry for the
//! lifetime of the context.

use crate::registry::HandlerResult;
use crate::transport::PeerId;
use crate::util::lock;
use crate::{Result, RpcError};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

struct PendingEntry {
    settle: oneshot::Sender<HandlerResult>,
    /// Peer the request was sent to (server only).
    peer: Option<PeerId>,
}

/// Outstanding calls issued by one context.
#[derive(Default)]
pub struct PendingCalls {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new outstanding call and get the receiver its response will
    /// be delivered to.
    pub fn insert(&self, id: &str, peer: Option<PeerId>) -> Result<oneshot::Receiver<HandlerResult>> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(id) {
            return Err(RpcError::invalid_arguments(format!(
                "correlation id {id} is already outstanding"
            )));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(id.to_string(), PendingEntry { settle: tx, peer });
        Ok(rx)
    }

    /// Settle the call `id` with a response that arrived from `from`.
    ///
    /// Returns `false` without touching the table when no entry exists, or
    /// when the entry was recorded for a different peer than the sender.
    pub fn settle(&self, id: &str, from: Option<&PeerId>, outcome: HandlerResult) -> bool {
        let entry = {
            let mut entries = lock(&self.entries);
            let sender_matches = match entries.get(id) {
                None => return false,
                Some(entry) => entry.peer.is_none() || entry.peer.as_ref() == from,
            };
            if !sender_matches {
                return false;
            }
            entries.remove(id)
        };
        let Some(entry) = entry else {
            return false;
        };
        // The caller may have stopped waiting; that is not an error here.
        let _ = entry.settle.send(outcome);
        true
    }

    /// Drop an entry whose request never left this context.
    pub fn discard(&self, id: &str) -> bool {
        lock(&self.entries).remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        lock(&self.entries).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wait for a pending call to settle and translate the outcome.
pub async fn wait_for(rx: oneshot::Receiver<HandlerResult>) -> Result<serde_json::Value> {
    match rx.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(payload)) => Err(RpcError::from_payload(payload)),
        Err(_) => Err(RpcError::Closed),
    }
}
