//! Pluggable source listeners
//!
//! External-data sources (chat exports, feeds) plug in behind the
//! [`SourceListener`] trait. The registry hands each listener a
//! [`SourceEvents`] handle whose callbacks publish `source:entry`,
//! `source:status` and `source:error` onto the global bus topic, so
//! dashboards see third-party activity the same way they see sessions.

use crate::bus::{BusMessage, EventBus, GLOBAL_TOPIC};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Callback handle passed to listeners; every callback fans out on the
/// global topic.
#[derive(Clone)]
pub struct SourceEvents {
    bus: EventBus,
    source: String,
}

impl SourceEvents {
    pub fn new(bus: EventBus, source: impl Into<String>) -> Self {
        Self {
            bus,
            source: source.into(),
        }
    }

    /// A new entry arrived from the source.
    pub async fn entry(&self, entry: Value) {
        self.bus
            .publish(
                GLOBAL_TOPIC,
                BusMessage::new(
                    "source:entry",
                    serde_json::json!({ "source": self.source, "entry": entry }),
                ),
            )
            .await;
    }

    /// Lifecycle/status change (started, syncing, stopped, ...).
    pub async fn status(&self, status: &str) {
        self.bus
            .publish(
                GLOBAL_TOPIC,
                BusMessage::new(
                    "source:status",
                    serde_json::json!({ "source": self.source, "status": status }),
                ),
            )
            .await;
    }

    /// Non-fatal listener error; the listener keeps running.
    pub async fn error(&self, message: &str) {
        tracing::warn!(source = %self.source, message, "source listener error");
        self.bus
            .publish(
                GLOBAL_TOPIC,
                BusMessage::new(
                    "source:error",
                    serde_json::json!({ "source": self.source, "error": message }),
                ),
            )
            .await;
    }
}

/// A registered external-data listener.
#[async_trait]
pub trait SourceListener: Send + Sync {
    /// Stable name, used as the `source` tag on callbacks.
    fn name(&self) -> &str;

    /// Begin listening; long-running work should be spawned, not awaited.
    async fn start(&self, events: SourceEvents) -> Result<()>;

    /// Stop listening and release resources.
    async fn stop(&self) -> Result<()>;

    /// Optional on-demand sync.
    async fn sync_now(&self, _events: SourceEvents) -> Result<()> {
        Ok(())
    }
}

/// Holds the registered listeners and wires their callbacks to the bus.
pub struct SourceRegistry {
    bus: EventBus,
    listeners: Vec<Arc<dyn SourceListener>>,
}

impl SourceRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            listeners: Vec::new(),
        }
    }

    pub fn register(&mut self, listener: Arc<dyn SourceListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Start every listener; a failing listener is logged and skipped,
    /// the rest keep starting.
    pub async fn start_all(&self) {
        for listener in &self.listeners {
            let events = SourceEvents::new(self.bus.clone(), listener.name());
            if let Err(e) = listener.start(events.clone()).await {
                tracing::error!(source = listener.name(), error = %e, "source listener failed to start");
                events.error(&e.to_string()).await;
            } else {
                events.status("started").await;
            }
        }
    }

    pub async fn stop_all(&self) {
        for listener in &self.listeners {
            if let Err(e) = listener.stop().await {
                tracing::warn!(source = listener.name(), error = %e, "source listener failed to stop");
            }
        }
    }
}
