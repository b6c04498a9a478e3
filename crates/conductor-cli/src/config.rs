use anyhow::{Context, Result};
use conductor_core::AgentDescriptor;
use conductor_workflow::{
    Compensation, ErrorPolicy, InputBinding, OrchestratorConfig, StepCondition, Workflow,
    WorkflowStep,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    #[serde(default)]
    pub workflows: Vec<WorkflowEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_source_id")]
    pub source_id: String,
    #[serde(default)]
    pub retry_delay_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,
}

fn default_source_id() -> String {
    "orchestrator".to_string()
}

fn default_event_capacity() -> usize {
    64
}

fn default_step_timeout_secs() -> u64 {
    30
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            source_id: default_source_id(),
            retry_delay_ms: 0,
            event_capacity: default_event_capacity(),
            default_step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl OrchestratorSection {
    pub fn to_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            source_id: self.source_id.clone(),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            event_capacity: self.event_capacity,
        }
    }

    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }
}

/// An agent served in-process by a loopback behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    #[serde(flatten)]
    pub descriptor: AgentDescriptor,
    #[serde(default)]
    pub behavior: Behavior,
}

/// What a loopback agent does with every invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Behavior {
    /// Return the input unchanged
    #[default]
    Echo,
    /// Return a fixed value
    Static { value: Value },
    /// Always fail
    Fail {
        #[serde(default = "default_fail_message")]
        message: String,
    },
    /// Echo after a pause
    Delay { delay_ms: u64 },
}

fn default_fail_message() -> String {
    "configured to fail".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub steps: Vec<StepEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEntry {
    pub id: String,
    pub agent: String,
    pub capability: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputEntry>,
    #[serde(default)]
    pub condition: StepCondition,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<Compensation>,
}

/// Declarative form of [`InputBinding`]; transforms are code-only
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum InputEntry {
    Static {
        value: Value,
    },
    Previous {
        step: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        select: Option<String>,
    },
    Context {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        variable: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        select: Option<String>,
    },
}

impl InputEntry {
    fn to_binding(&self) -> InputBinding {
        let (binding, select) = match self {
            Self::Static { value } => return InputBinding::literal(value.clone()),
            Self::Previous { step, select } => (InputBinding::previous(step.as_str()), select),
            Self::Context { variable, select } => {
                let binding = match variable {
                    Some(name) => InputBinding::variable(name.as_str()),
                    None => InputBinding::variables(),
                };
                (binding, select)
            }
        };
        match select {
            Some(pointer) => binding.select(pointer.as_str()),
            None => binding,
        }
    }
}

impl WorkflowEntry {
    pub fn to_workflow(&self, default_step_timeout: Duration) -> Workflow {
        let name = if self.name.is_empty() {
            self.id.clone()
        } else {
            self.name.clone()
        };
        let mut workflow = Workflow::new(&self.id, name)
            .with_description(&self.description)
            .with_error_policy(self.error_policy);
        if let Some(secs) = self.timeout_secs {
            workflow = workflow.with_timeout(Duration::from_secs(secs));
        }

        for entry in &self.steps {
            let mut step = WorkflowStep::new(&entry.id, &entry.agent, &entry.capability)
                .with_condition(entry.condition.clone())
                .with_retries(entry.retries)
                .with_timeout(
                    entry
                        .timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or(default_step_timeout),
                );
            if let Some(input) = &entry.input {
                step = step.with_input(input.to_binding());
            }
            if let Some(c) = &entry.compensation {
                step = step.with_compensation(&c.agent_id, &c.capability_id);
            }
            workflow = workflow.with_step(step);
        }
        workflow
    }
}

pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conductor")
}

impl ConductorConfig {
    pub fn load(custom_path: &Option<PathBuf>) -> Result<Self> {
        let path = custom_path
            .clone()
            .unwrap_or_else(|| config_dir().join("config.toml"));

        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config at {}. Run `conductor init` first.",
                path.display()
            )
        })?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;

        for agent in &config.agents {
            if agent.descriptor.capabilities.is_empty() {
                warn!(
                    "Agent '{}' declares no capabilities; no step can invoke it",
                    agent.descriptor.id
                );
            }
        }
        Ok(config)
    }

    pub fn workflow(&self, id: &str) -> Option<&WorkflowEntry> {
        self.workflows.iter().find(|w| w.id == id)
    }
}

/// Namespace of environment variables a config file may reference
const ENV_PREFIX: &str = "CONDUCTOR_";

fn expand_env_vars(s: &str) -> String {
    expand_vars(s, |name| std::env::var(name).ok())
}

/// Expand `${NAME}` and `${NAME:-fallback}` references. The fallback is
/// used when the variable is unset or empty. Names outside the
/// `CONDUCTOR_` namespace are left as written.
fn expand_vars(s: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let reference = &rest[start + 2..start + len];
        let (name, fallback) = match reference.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (reference, None),
        };

        result.push_str(&rest[..start]);
        if name.starts_with(ENV_PREFIX) {
            let value = lookup(name)
                .filter(|v| !v.is_empty())
                .or_else(|| fallback.map(str::to_string))
                .unwrap_or_default();
            result.push_str(&value);
        } else {
            warn!(
                "Not expanding '{}' in config: only {}* variables are expanded",
                name, ENV_PREFIX
            );
            // Left as-is so the mistake is visible
            result.push_str(&rest[start..=start + len]);
        }
        rest = &rest[start + len + 1..];
    }
    result.push_str(rest);
    result
}
