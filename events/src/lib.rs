//! Event types shared between the upstream sessions and callback delivery.
//!
//! # Architecture
//!
//! - **StreamEnvelope**: the `{event, payload}` frame read from an upstream
//!   streaming socket
//! - **NotificationEvent**: a qualifying event, attributed to the registration
//!   it arrived on, ready to be delivered
//! - **EventHandler**: Trait for implementing event handlers
//! - **EventPublisher**: Publishes events to registered handlers
//!
//! This crate has no dependencies on internal crates (entity, relay, etc.),
//! avoiding circular dependencies. Payloads are carried as JSON values.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Event type of the only upstream frames that are relayed.
pub const NOTIFICATION_EVENT: &str = "notification";

/// A single frame received on an upstream streaming socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl StreamEnvelope {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn is_notification(&self) -> bool {
        self.event == NOTIFICATION_EVENT
    }
}

/// A notification received for one registration, carrying everything needed
/// to deliver it to that registration's callback.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub instance_url: String,
    pub app_id: String,
    pub tag: String,
    pub callback_url: String,
    /// Inner payload of the upstream envelope, unchanged.
    pub payload: Value,
}

/// Trait for handling relayed notifications.
/// Implementations perform the side effect (delivery, logging, ...) and report
/// failures themselves; nothing is returned to the publishing session.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &NotificationEvent);
}

/// Publishes events to registered handlers.
/// Handlers are called sequentially in registration order.
#[derive(Clone)]
pub struct EventPublisher {
    handlers: Arc<Vec<Arc<dyn EventHandler>>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Vec::new()),
        }
    }

    /// Register a new event handler.
    /// Note: This creates a new publisher instance with the additional handler.
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        let mut handlers = (*self.handlers).clone();
        handlers.push(handler);
        self.handlers = Arc::new(handlers);
        self
    }

    /// Publish an event to all registered handlers, one after the other.
    pub async fn publish(&self, event: NotificationEvent) {
        for handler in self.handlers.iter() {
            handler.handle(&event).await;
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}
