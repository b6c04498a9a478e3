//! In-process stand-ins for external agents, driven by config

use async_trait::async_trait;
use conductor_bus::Agent;
use conductor_core::{AgentDescriptor, Message, Response};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::{AgentEntry, Behavior};

pub struct LoopbackAgent {
    descriptor: AgentDescriptor,
    behavior: Behavior,
}

impl LoopbackAgent {
    pub fn new(descriptor: AgentDescriptor, behavior: Behavior) -> Self {
        Self {
            descriptor,
            behavior,
        }
    }

    pub fn from_entry(entry: &AgentEntry) -> Self {
        Self::new(entry.descriptor.clone(), entry.behavior.clone())
    }
}

#[async_trait]
impl Agent for LoopbackAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, capability_id: &str, input: Value) -> Response {
        debug!(
            "Loopback agent '{}' handling '{}'",
            self.descriptor.id, capability_id
        );
        match &self.behavior {
            Behavior::Echo => Response::ok(input),
            Behavior::Static { value } => Response::ok(value.clone()),
            Behavior::Fail { message } => Response::err("loopback_failure", message.clone()),
            Behavior::Delay { delay_ms } => {
                tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                Response::ok(input)
            }
        }
    }

    async fn on_event(&self, message: &Message) {
        debug!(
            "Loopback agent '{}' got {} from '{}'",
            self.descriptor.id, message.kind, message.source
        );
    }
}
