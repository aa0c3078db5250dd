//! Per-request execution context.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agents::AgentResult;

/// Reserved key under which a step's generated prompt is injected.
pub const PROMPT_KEY: &str = "prompt";

/// String-keyed map threaded through one request's plan execution.
///
/// Completed steps are merged in under their agent name, so a later step can
/// read any earlier result. Always plain JSON, so a snapshot can be persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext(Map<String, Value>);

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from caller-supplied JSON. Non-object values give an empty context.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// A non-empty string entry.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Merge a step result under the agent's name.
    pub fn insert_result(&mut self, agent: &str, result: &AgentResult) {
        self.0.insert(agent.to_string(), result.to_value());
    }

    /// A previously merged step result.
    pub fn result(&self, agent: &str) -> Option<AgentResult> {
        self.0.get(agent).and_then(AgentResult::from_value)
    }

    pub fn prompt(&self) -> Option<&str> {
        self.get_str(PROMPT_KEY)
    }

    pub fn intent(&self) -> Option<&str> {
        self.get_str("intent")
    }

    pub fn app_id(&self) -> Option<&str> {
        self.get_str("app_id")
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// JSON snapshot for persistence and prompts.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Snapshot without the injected prompt.
    pub fn snapshot_without_prompt(&self) -> Value {
        let mut map = self.0.clone();
        map.remove(PROMPT_KEY);
        Value::Object(map)
    }
}

impl From<Map<String, Value>> for ExecutionContext {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
