use momentum_core::AgentConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::agent::{Agent, CliAgent};
use crate::error::AgentError;

pub const DEFAULT_AGENT: &str = "claude";

/// Builds a fresh agent instance for one task run.
pub type AgentFactory = Arc<dyn Fn(&AgentConfig) -> Arc<dyn Agent> + Send + Sync>;

/// Named agent factories. `claude` is always registered by [`AgentRegistry::new`].
pub struct AgentRegistry {
    factories: RwLock<HashMap<String, AgentFactory>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register(DEFAULT_AGENT, |config: &AgentConfig| {
            Arc::new(CliAgent::claude(config.clone())) as Arc<dyn Agent>
        });
        registry
    }

    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) a factory under `name`.
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&AgentConfig) -> Arc<dyn Agent> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.into(), Arc::new(factory));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.factories
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn create(&self, name: &str, config: &AgentConfig) -> Result<Arc<dyn Agent>, AgentError> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::NotFound {
                name: name.to_string(),
            })?;
        Ok(factory(config))
    }

    pub fn has(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(name)
    }

    /// Registered names, sorted.
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
