//! Agent registry

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{OrchestrationError, Result};
use crate::types::AgentDescriptor;

#[derive(Default)]
struct RegistryInner {
    agents: HashMap<String, AgentDescriptor>,
    /// agent_type -> agent ids, in registration order
    by_type: HashMap<String, Vec<String>>,
}

/// In-memory table of agent descriptors, indexed by id and by type tag
#[derive(Default)]
pub struct AgentRegistry {
    inner: RwLock<RegistryInner>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Fails if the id is already taken.
    pub async fn register(&self, descriptor: AgentDescriptor) -> Result<()> {
        descriptor.validate()?;

        let mut inner = self.inner.write().await;
        if inner.agents.contains_key(&descriptor.id) {
            return Err(OrchestrationError::DuplicateAgent(descriptor.id));
        }

        info!(
            "Registered agent '{}' ({}) with {} capabilities",
            descriptor.id,
            descriptor.agent_type,
            descriptor.capabilities.len()
        );
        inner
            .by_type
            .entry(descriptor.agent_type.clone())
            .or_default()
            .push(descriptor.id.clone());
        inner.agents.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    /// Remove a descriptor and its type-index entry. Absent ids are ignored.
    pub async fn unregister(&self, id: &str) {
        let mut inner = self.inner.write().await;
        let Some(descriptor) = inner.agents.remove(id) else {
            return;
        };

        let now_empty = match inner.by_type.get_mut(&descriptor.agent_type) {
            Some(ids) => {
                ids.retain(|existing| existing != id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            inner.by_type.remove(&descriptor.agent_type);
        }
        info!("Unregistered agent '{}'", id);
    }

    pub async fn get(&self, id: &str) -> Option<AgentDescriptor> {
        self.inner.read().await.agents.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.agents.contains_key(id)
    }

    /// Agents carrying the given type tag, in registration order
    pub async fn get_by_type(&self, agent_type: &str) -> Vec<AgentDescriptor> {
        let inner = self.inner.read().await;
        inner
            .by_type
            .get(agent_type)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.agents.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn get_enabled(&self) -> Vec<AgentDescriptor> {
        self.collect_sorted(|agent| agent.enabled).await
    }

    pub async fn get_all(&self) -> Vec<AgentDescriptor> {
        self.collect_sorted(|_| true).await
    }

    /// Toggle the enabled flag in place. Absent ids are ignored.
    pub async fn set_enabled(&self, id: &str, enabled: bool) {
        let mut inner = self.inner.write().await;
        if let Some(agent) = inner.agents.get_mut(id) {
            agent.enabled = enabled;
            debug!("Agent '{}' enabled = {}", id, enabled);
        }
    }

    /// Every agent exposing a capability with this id. Capability ids are
    /// scoped per agent, so several agents may match.
    pub async fn find_by_capability(&self, capability_id: &str) -> Vec<AgentDescriptor> {
        self.collect_sorted(|agent| agent.has_capability(capability_id))
            .await
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.agents.len()
    }

    async fn collect_sorted<F>(&self, predicate: F) -> Vec<AgentDescriptor>
    where
        F: Fn(&AgentDescriptor) -> bool,
    {
        let inner = self.inner.read().await;
        let mut agents: Vec<AgentDescriptor> = inner
            .agents
            .values()
            .filter(|agent| predicate(agent))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }
}
