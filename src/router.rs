//! Fan-out of enriched events to the trajectory, viewers and the sink.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::events::EnrichedEvent;
use crate::notify::{EventHub, Notifier};
use crate::trajectory::TrajectoryLog;

pub struct EventRouter {
    pub trajectory: Arc<TrajectoryLog>,
    pub hub: Arc<EventHub>,
    pub notifier: Arc<Notifier>,
}

impl EventRouter {
    /// Must be called inside a tokio runtime: replay buffers are dropped by a
    /// background task when the trajectory evicts their session.
    pub fn new(trajectory: Arc<TrajectoryLog>, hub: Arc<EventHub>, notifier: Arc<Notifier>) -> Self {
        let mut evictions = trajectory.subscribe_evictions();
        let buffers = Arc::clone(&hub);
        tokio::spawn(async move {
            loop {
                match evictions.recv().await {
                    Ok(session_id) => {
                        buffers.clear(&session_id).await;
                        debug!(session_id = %session_id, "Replay buffer cleared");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed eviction notices; some replay buffers stay");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self {
            trajectory,
            hub,
            notifier,
        }
    }

    /// Record the event, then publish it. Duplicates stop at the trajectory.
    pub async fn route(&self, event: EnrichedEvent) -> bool {
        if !self.trajectory.ingest(&event).await {
            return false;
        }
        self.notifier.deliver_event(&event).await;
        self.hub.publish(event).await;
        true
    }
}
