//! Recent-event buffer plus live broadcast for session viewers.
//!
//! Late joiners use a ready/pull handshake: subscribe to the live channel
//! first, pull the buffered snapshot, then skip live events already present
//! in the snapshot. No timing assumptions are involved.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};

use crate::events::EnrichedEvent;

/// Live channel depth; slow readers past this see `Lagged`.
const BROADCAST_CAPACITY: usize = 1024;

/// Messages sent to a session viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    /// Buffered events, oldest first.
    Snapshot {
        session_id: String,
        events: Vec<EnrichedEvent>,
    },
    /// Snapshot delivered; live events follow.
    Ready { session_id: String },
    Event { event: EnrichedEvent },
}

pub struct EventHub {
    buffers: RwLock<HashMap<String, VecDeque<EnrichedEvent>>>,
    capacity: AtomicUsize,
    tx: broadcast::Sender<EnrichedEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity: AtomicUsize::new(capacity),
            tx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Change the per-session buffer bound, trimming existing buffers.
    pub async fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::SeqCst);
        let mut buffers = self.buffers.write().await;
        for buffer in buffers.values_mut() {
            trim(buffer, capacity);
        }
    }

    pub async fn publish(&self, event: EnrichedEvent) {
        {
            let capacity = self.capacity();
            let mut buffers = self.buffers.write().await;
            let buffer = buffers.entry(event.session_id().to_string()).or_default();
            buffer.push_back(event.clone());
            trim(buffer, capacity);
        }
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub async fn snapshot(&self, session_id: &str) -> Vec<EnrichedEvent> {
        self.buffers
            .read()
            .await
            .get(session_id)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EnrichedEvent> {
        self.tx.subscribe()
    }

    pub async fn clear(&self, session_id: &str) {
        self.buffers.write().await.remove(session_id);
    }
}

fn trim(buffer: &mut VecDeque<EnrichedEvent>, capacity: usize) {
    while buffer.len() > capacity {
        buffer.pop_front();
    }
}
