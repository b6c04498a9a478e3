//! Shared types for conductor-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OrchestrationError, Result};

/// A named operation an agent can perform. The id is scoped to its agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Declared input shape, opaque to the orchestration core
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input_schema: Value,
    /// Declared output shape, opaque to the orchestration core
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub output_schema: Value,
}

impl Capability {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            input_schema: Value::Null,
            output_schema: Value::Null,
        }
    }
}

/// Grant of actions on a resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Permission {
    pub resource: String,
    #[serde(default)]
    pub actions: Vec<String>,
}

/// Advisory rate-limit hints. Nothing in conductor enforces these.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_hour: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<u32>,
}

/// Identity and declared surface of an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDescriptor {
    pub id: String,
    /// Category tag used by `AgentRegistry::get_by_type`
    pub agent_type: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub rate_limit: RateLimit,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_enabled() -> bool {
    true
}

impl AgentDescriptor {
    pub fn new(
        id: impl Into<String>,
        agent_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
            name: name.into(),
            description: String::new(),
            version: default_version(),
            enabled: true,
            capabilities: Vec::new(),
            permissions: Vec::new(),
            rate_limit: RateLimit::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_permission(mut self, resource: impl Into<String>, actions: &[&str]) -> Self {
        self.permissions.push(Permission {
            resource: resource.into(),
            actions: actions.iter().map(|a| a.to_string()).collect(),
        });
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Mark the descriptor as disabled before registration
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn capability(&self, capability_id: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.id == capability_id)
    }

    pub fn has_capability(&self, capability_id: &str) -> bool {
        self.capability(capability_id).is_some()
    }

    /// Check whether a permission grant covers `action` on `resource`
    pub fn is_permitted(&self, resource: &str, action: &str) -> bool {
        self.permissions
            .iter()
            .any(|p| p.resource == resource && p.actions.iter().any(|a| a == action || a == "*"))
    }

    /// Check the descriptor's own invariants: a non-empty id and
    /// capability ids unique within the agent.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| OrchestrationError::InvalidDescriptor {
            agent_id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("agent id must not be empty".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for capability in &self.capabilities {
            if !seen.insert(capability.id.as_str()) {
                return Err(invalid(format!(
                    "duplicate capability id '{}'",
                    capability.id
                )));
            }
        }
        Ok(())
    }
}

/// What kind of message this is
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Event,
    Broadcast,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Response => write!(f, "response"),
            Self::Event => write!(f, "event"),
            Self::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// A point-to-point message between agents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub source: String,
    pub target: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        kind: MessageKind,
        payload: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            target: target.into(),
            kind,
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// Build a request invoking `capability_id` on `target`
    pub fn invocation(
        source: impl Into<String>,
        target: impl Into<String>,
        capability_id: impl Into<String>,
        input: Value,
    ) -> Self {
        let invocation = CapabilityInvocation {
            capability_id: capability_id.into(),
            input,
        };
        Self::new(source, target, MessageKind::Request, invocation.into_payload())
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// The key used to pair this message with its response. Defaults to the message id.
    pub fn correlation_id(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or(&self.id)
    }
}

/// Payload carried by a capability request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityInvocation {
    pub capability_id: String,
    #[serde(default)]
    pub input: Value,
}

impl CapabilityInvocation {
    pub fn into_payload(self) -> Value {
        serde_json::json!({
            "capability_id": self.capability_id,
            "input": self.input,
        })
    }

    pub fn from_payload(payload: &Value) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_value(payload.clone())
    }
}

/// Structured error carried by a failed response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseError {
    pub kind: String,
    pub message: String,
}

/// Reply to exactly one message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn ok_empty() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn err(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ResponseError {
                kind: kind.into(),
                message: message.into(),
            }),
        }
    }

    /// Turn a failed response into `OrchestrationError::Agent`
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            return Ok(self);
        }
        let (kind, message) = match self.error {
            Some(e) => (e.kind, e.message),
            None => ("unknown".to_string(), "agent reported failure".to_string()),
        };
        Err(OrchestrationError::Agent { kind, message })
    }
}
