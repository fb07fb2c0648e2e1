//! Table of in-flight requests keyed by correlation id.
//!
//! Removal and resolution happen under the same lock acquisition, so whichever
//! actor (callback listener, dispatcher, reaper) removes an entry first is the
//! only one that can fulfil its slot. The slot itself is a `oneshot` sender,
//! which hands the outcome to the waiting task safely across threads.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

/// How a pending slot was fulfilled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    Response(String),
    Cancelled,
    Expired,
}

#[derive(Debug)]
struct PendingEntry {
    created_at: Instant,
    slot: oneshot::Sender<SlotOutcome>,
}

/// Waiting half of a pending entry, held by the dispatcher.
#[derive(Debug)]
pub struct PendingReceiver {
    id: String,
    rx: oneshot::Receiver<SlotOutcome>,
}

impl PendingReceiver {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Suspend until the slot is fulfilled. `None` means the entry was
    /// removed without an outcome (delivery failure or teardown).
    pub async fn wait(self) -> Option<SlotOutcome> {
        self.rx.await.ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PendingTable {
    entries: Arc<Mutex<HashMap<String, PendingEntry>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> PendingReceiver {
        self.create_at(Instant::now())
    }

    pub fn create_at(&self, now: Instant) -> PendingReceiver {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock();
        let mut id = new_request_id();
        while entries.contains_key(&id) {
            id = new_request_id();
        }
        entries.insert(
            id.clone(),
            PendingEntry {
                created_at: now,
                slot: tx,
            },
        );
        PendingReceiver { id, rx }
    }

    /// Remove `id` and fulfil its slot. Returns `false` when the id is not
    /// pending, which covers late or duplicate resolutions.
    pub fn resolve(&self, id: &str, outcome: SlotOutcome) -> bool {
        let entry = self.entries.lock().remove(id);
        match entry {
            Some(entry) => {
                // The waiter may already be gone; the entry is resolved either way.
                let _ = entry.slot.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove `id` without fulfilling it; the waiter observes a closed slot.
    pub fn remove(&self, id: &str) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    /// Expire every entry older than `max_age`. Returns the reaped ids.
    pub fn reap_expired(&self, max_age: Duration) -> Vec<String> {
        self.reap_expired_at(Instant::now(), max_age)
    }

    pub fn reap_expired_at(&self, now: Instant, max_age: Duration) -> Vec<String> {
        let expired: Vec<(String, PendingEntry)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.created_at) > max_age)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        expired
            .into_iter()
            .map(|(id, entry)| {
                let _ = entry.slot.send(SlotOutcome::Expired);
                tracing::info!(target = "ask_relay::pending", request_id = %id, "reaped expired request");
                id
            })
            .collect()
    }

    /// Ids currently awaiting resolution.
    pub fn ids(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn new_request_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("req_{}", &hex[..12])
}
