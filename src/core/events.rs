//! Run-scoped event bus.
//!
//! Notifications (`node_execution_start`, `component_execution_complete`, ...) fan out to
//! subscribed [`EventHandler`]s. Requests for node input travel over a dedicated
//! request/response channel: the executor sends an [`InputRequest`] and awaits the
//! [`NodeInput`] its responder delivers.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::NodeValue;
use crate::core::node::NodeInput;

/// How a published event is dispatched to its handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventNature {
    /// Handlers run in the background; the publisher does not wait.
    Notify,
    /// The publisher awaits every handler in subscription order.
    WithWait,
    /// Handlers run in the background and the publisher gets their join handles.
    WithFuture,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NodeInputRequired,
    NodeExecutionStart,
    NodeExecutionComplete,
    ComponentExecutionStart,
    ComponentExecutionComplete,
    Custom(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: EventType,
    pub nature: EventNature,
    pub source_id: String,
    pub source_hier: String,
    pub payload: NodeValue,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        event_type: EventType,
        nature: EventNature,
        source_id: impl Into<String>,
        source_hier: impl Into<String>,
        payload: NodeValue,
    ) -> Self {
        Self {
            event_type,
            nature,
            source_id: source_id.into(),
            source_hier: source_hier.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn notify(
        event_type: EventType,
        source_id: impl Into<String>,
        source_hier: impl Into<String>,
        payload: NodeValue,
    ) -> Self {
        Self::new(event_type, EventNature::Notify, source_id, source_hier, payload)
    }
}

/// A subscriber to bus notifications.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &Event);
}

/// A pending request for a node's input. Dropping it without responding leaves the node
/// without external input.
#[derive(Debug)]
pub struct InputRequest {
    pub node_id: String,
    pub node_hier: String,
    pub node_type: String,
    pub requested_at: DateTime<Utc>,
    responder: oneshot::Sender<NodeInput>,
}

impl InputRequest {
    /// Delivers the input. Returns `false` if the requesting node is no longer waiting.
    pub fn respond(self, input: NodeInput) -> bool {
        self.responder.send(input).is_ok()
    }
}

pub type InputRequestReceiver = mpsc::UnboundedReceiver<InputRequest>;

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
    input_sender: RwLock<Option<mpsc::UnboundedSender<InputRequest>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Opens the input request channel. A previously opened channel is replaced.
    pub fn input_requests(&self) -> InputRequestReceiver {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut slot = self.input_sender.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            log::warn!("Replacing an existing input request channel.");
        }
        *slot = Some(sender);
        receiver
    }

    pub fn has_subscribers(&self, event_type: &EventType) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .is_some_and(|handlers| !handlers.is_empty())
    }

    /// Dispatches `event` according to its nature. Only `WithFuture` returns handles.
    pub async fn publish(&self, event: Event) -> Vec<JoinHandle<()>> {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            return Vec::new();
        }

        match event.nature {
            EventNature::WithWait => {
                for handler in handlers {
                    handler.handle(&event).await;
                }
                Vec::new()
            }
            EventNature::Notify | EventNature::WithFuture => {
                let event = Arc::new(event);
                let handles: Vec<JoinHandle<()>> = handlers
                    .into_iter()
                    .map(|handler| {
                        let event = Arc::clone(&event);
                        tokio::spawn(async move { handler.handle(&event).await })
                    })
                    .collect();
                if event.nature == EventNature::WithFuture {
                    handles
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Asks the registered input provider for a node's input and waits for the answer.
    ///
    /// Returns `None` when no channel is open or the request is dropped unanswered.
    pub async fn request_input(
        &self,
        node_id: &str,
        node_hier: &str,
        node_type: &str,
    ) -> Option<NodeInput> {
        let sender = self
            .input_sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            log::warn!("Node '{node_hier}' requires input but no input channel is open.");
            return None;
        };

        let (responder, response) = oneshot::channel();
        let request = InputRequest {
            node_id: node_id.to_string(),
            node_hier: node_hier.to_string(),
            node_type: node_type.to_string(),
            requested_at: Utc::now(),
            responder,
        };
        if sender.send(request).is_err() {
            log::warn!("Input channel closed before node '{node_hier}' could request input.");
            return None;
        }

        match response.await {
            Ok(input) => Some(input),
            Err(_) => {
                log::warn!("Input request for node '{node_hier}' was not handled.");
                None
            }
        }
    }
}
