//! Agent contract: the uniform request/response surface of a capability provider

use std::sync::Arc;

use async_trait::async_trait;
use conductor_core::{AgentDescriptor, CapabilityInvocation, Message, MessageKind, Response, Result};
use serde_json::Value;
use tracing::{debug, warn};

use crate::broker::{MessageBroker, MessageHandler, Subscription};

/// An independently implemented unit exposing named capabilities.
/// The orchestration core never looks inside `invoke`.
#[async_trait]
pub trait Agent: Send + Sync {
    fn descriptor(&self) -> &AgentDescriptor;

    /// Run one capability. Failures are reported in the response, not as errors.
    async fn invoke(&self, capability_id: &str, input: Value) -> Response;

    /// Called for non-request messages (events, broadcasts)
    async fn on_event(&self, _message: &Message) {}
}

/// Adapts an [`Agent`] to the broker's handler interface
pub struct AgentHandler {
    agent: Arc<dyn Agent>,
}

impl AgentHandler {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl MessageHandler for AgentHandler {
    async fn handle(&self, message: Message) -> Option<Response> {
        if message.kind != MessageKind::Request {
            self.agent.on_event(&message).await;
            return None;
        }

        let descriptor = self.agent.descriptor();
        let invocation = match CapabilityInvocation::from_payload(&message.payload) {
            Ok(invocation) => invocation,
            Err(e) => {
                warn!("Agent '{}' received malformed request {}: {}", descriptor.id, message.id, e);
                return Some(Response::err("invalid_payload", e.to_string()));
            }
        };

        if !descriptor.has_capability(&invocation.capability_id) {
            return Some(Response::err(
                "unknown_capability",
                format!(
                    "agent '{}' has no capability '{}'",
                    descriptor.id, invocation.capability_id
                ),
            ));
        }

        debug!(
            "Agent '{}' invoking capability '{}' for '{}'",
            descriptor.id, invocation.capability_id, message.source
        );
        Some(self.agent.invoke(&invocation.capability_id, invocation.input).await)
    }
}

impl MessageBroker {
    /// Register the agent's descriptor and subscribe it to its own id
    pub async fn mount(&self, agent: Arc<dyn Agent>) -> Result<Subscription> {
        let descriptor = agent.descriptor().clone();
        self.registry().register(descriptor.clone()).await?;
        Ok(self
            .subscribe(&descriptor.id, Arc::new(AgentHandler::new(agent)))
            .await)
    }
}
