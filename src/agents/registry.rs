//! Task registry: capability name to handler.

use std::collections::HashMap;
use std::sync::Arc;

use super::{
    Agent, AiModelAgent, AppAgent, CategoryAgent, DynamicModelAgent, IntentAgent, RequestAgent,
    UserInteractionAgent, UserProfileAgent,
};
use crate::error::RouterError;

/// Explicit name → handler map, populated at startup.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
    aliases: HashMap<String, String>,
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in handler.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(IntentAgent));
        registry.register(Arc::new(AppAgent));
        registry.register(Arc::new(RequestAgent));
        registry.register(Arc::new(CategoryAgent));
        registry.register(Arc::new(DynamicModelAgent));
        registry.register(Arc::new(UserProfileAgent));
        registry.register(Arc::new(AiModelAgent));
        registry.register(Arc::new(UserInteractionAgent));
        registry.alias("UserAppAgent", "AppAgent");
        tracing::debug!("Registered {} agents", registry.agents.len());
        registry
    }

    /// Register a handler under its own name, replacing any previous one.
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    /// Make `alias` resolve to the handler registered as `target`.
    pub fn alias(&mut self, alias: &str, target: &str) {
        self.aliases.insert(alias.to_string(), target.to_string());
    }

    /// The registered name `name` refers to (itself when not an alias).
    pub fn canonical_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Look up a handler.
    ///
    /// # Errors
    /// `RouterError::UnknownCapability` when nothing is registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Agent>, RouterError> {
        self.agents
            .get(self.canonical_name(name))
            .cloned()
            .ok_or_else(|| RouterError::UnknownCapability(name.to_string()))
    }

    /// Registered capability names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
