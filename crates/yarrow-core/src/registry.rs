//! In-memory agent registry and metadata contract.
//!
//! Every state-mutating entry point goes through `try_acquire`: a
//! per-agent exclusive lock with try-acquire semantics. A second caller
//! for a busy agent gets a `Busy` rejection instead of queueing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::agent::Agent;
use crate::error::AgentError;

/// Map from agent-id to the live agent. Lookups are read-mostly; the
/// agent itself is only mutated under its own lock.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<Uuid, Arc<Mutex<Agent>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, agent: Agent) -> Uuid {
        let id = agent.id();
        self.agents
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, Arc::new(Mutex::new(agent)));
        id
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Mutex<Agent>>> {
        self.agents
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Uuid> {
        self.agents
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Non-blocking acquisition of the agent's exclusive lock.
    pub fn try_acquire(&self, id: Uuid) -> Result<OwnedMutexGuard<Agent>, AgentError> {
        let agent = self.get(id).ok_or(AgentError::UnknownAgent(id))?;
        agent.try_lock_owned().map_err(|_| AgentError::Busy(id))
    }
}

/// Metadata contract the core depends on: bearer tokens resolve to an
/// owner id. The backing tables are an external collaborator.
pub trait MetadataStore: Send + Sync {
    fn user_from_api_key(&self, api_key: &str) -> Option<Uuid>;
}

/// Reference metadata store backed by a token map.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    tokens: RwLock<HashMap<String, Uuid>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_token(&self, token: impl Into<String>, user_id: Uuid) {
        self.tokens
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(token.into(), user_id);
    }
}

impl MetadataStore for InMemoryMetadataStore {
    fn user_from_api_key(&self, api_key: &str) -> Option<Uuid> {
        self.tokens
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(api_key)
            .copied()
    }
}
