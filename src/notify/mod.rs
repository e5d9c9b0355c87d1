//! Best-effort notifications to observers outside the core.
//!
//! - [`Notifier`] pushes enriched events and status changes to an optional
//!   sink. A sink that fails once is dropped.
//! - [`EventHub`] keeps recent events per session for late-joining viewers.
//! - [`ws`] serves the hub over WebSocket.

pub mod hub;
pub mod ws;

pub use hub::{EventHub, HubMessage};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::SinkError;
use crate::events::EnrichedEvent;
use crate::tasks::model::TaskUpdate;

/// Receiver of pushed notifications (extension popup, push channel, ...).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver_event(&self, event: &EnrichedEvent) -> Result<(), SinkError>;

    async fn deliver_status(&self, update: &TaskUpdate) -> Result<(), SinkError>;
}

/// Holds at most one sink.
#[derive(Default)]
pub struct Notifier {
    sink: RwLock<Option<Arc<dyn NotificationSink>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink: RwLock::new(Some(sink)),
        }
    }

    pub async fn set_sink(&self, sink: Option<Arc<dyn NotificationSink>>) {
        *self.sink.write().await = sink;
    }

    pub async fn has_sink(&self) -> bool {
        self.sink.read().await.is_some()
    }

    pub async fn deliver_event(&self, event: &EnrichedEvent) {
        let Some(sink) = self.current().await else {
            return;
        };
        if let Err(e) = sink.deliver_event(event).await {
            self.drop_sink(&sink, &e).await;
        }
    }

    pub async fn deliver_status(&self, update: &TaskUpdate) {
        let Some(sink) = self.current().await else {
            return;
        };
        if let Err(e) = sink.deliver_status(update).await {
            self.drop_sink(&sink, &e).await;
        }
    }

    async fn current(&self) -> Option<Arc<dyn NotificationSink>> {
        self.sink.read().await.clone()
    }

    /// Clear the sink unless it was already replaced.
    async fn drop_sink(&self, failed: &Arc<dyn NotificationSink>, error: &SinkError) {
        let mut slot = self.sink.write().await;
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, failed)) {
            warn!(error = %error, "Notification sink failed; disabling it");
            *slot = None;
        } else {
            debug!(error = %error, "Stale notification sink failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use uuid::Uuid;

    use crate::tasks::model::TaskStatus;

    struct FlakySink {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSink for FlakySink {
        async fn deliver_event(&self, _event: &EnrichedEvent) -> Result<(), SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn deliver_status(&self, _update: &TaskUpdate) -> Result<(), SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SinkError::Delivery("popup closed".into()))
            } else {
                Ok(())
            }
        }
    }

    fn update() -> TaskUpdate {
        TaskUpdate::StatusChanged {
            task_id: Uuid::new_v4(),
            status: TaskStatus::Running,
            error: None,
        }
    }

    #[tokio::test]
    async fn failing_sink_is_cleared_after_first_error() {
        let sink = Arc::new(FlakySink {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let notifier = Notifier::with_sink(sink.clone());

        notifier.deliver_status(&update()).await;
        notifier.deliver_status(&update()).await;
        notifier.deliver_status(&update()).await;

        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert!(!notifier.has_sink().await);
    }

    #[tokio::test]
    async fn healthy_sink_is_kept() {
        let sink = Arc::new(FlakySink {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let notifier = Notifier::with_sink(sink.clone());
        notifier.deliver_status(&update()).await;
        notifier.deliver_status(&update()).await;
        assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
        assert!(notifier.has_sink().await);
    }

    #[tokio::test]
    async fn missing_sink_is_silent() {
        let notifier = Notifier::new();
        notifier.deliver_status(&update()).await;
        assert!(!notifier.has_sink().await);
    }
}
