//! Core types for the agent system.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::completion::CompletionError;
use crate::store::StoreError;

/// Outcome status of one capability invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Success,
    Error,
}

/// Result of an agent processing a task.
///
/// # Invariants
/// - `status == Error` implies `details.error_message` and `details.error_type` are set
/// - `details` is plain JSON, so a result survives a trip through `ExecutionContext` unchanged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub status: AgentStatus,
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl AgentResult {
    /// Create a successful result with no details.
    pub fn success() -> Self {
        Self {
            status: AgentStatus::Success,
            details: Map::new(),
        }
    }

    /// Create a successful result from a JSON object. Non-object values are
    /// stored under `value`.
    pub fn success_with(details: Value) -> Self {
        let details = match details {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            status: AgentStatus::Success,
            details,
        }
    }

    /// Create a failure result.
    pub fn error(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        let mut details = Map::new();
        details.insert("error_message".to_string(), Value::String(message.into()));
        details.insert("error_type".to_string(), Value::String(error_type.into()));
        Self {
            status: AgentStatus::Error,
            details,
        }
    }

    /// Add one detail entry.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == AgentStatus::Success
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }

    /// A detail rendered as a string; numbers are stringified.
    pub fn detail_str(&self, key: &str) -> Option<String> {
        match self.details.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.details.get("error_message").and_then(Value::as_str)
    }

    pub fn error_type(&self) -> Option<&str> {
        self.details.get("error_type").and_then(Value::as_str)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Read a result back from a context entry.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Errors a handler can raise while processing a task.
///
/// The executor turns these into error `AgentResult`s; they only abort a
/// request when raised by a bootstrap step.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("{0}")]
    Completion(#[from] CompletionError),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid completion response: {0}")]
    InvalidResponse(String),

    #[error("Persistence rejected {0}")]
    Rejected(String),
}

impl AgentError {
    /// Short name of the failure kind, recorded as `details.cause`.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Completion(CompletionError::Timeout(_)) => "CompletionTimeout",
            AgentError::Completion(_) => "CompletionError",
            AgentError::Store(_) | AgentError::Rejected(_) => "PersistenceError",
            AgentError::InvalidInput(_) => "InvalidInput",
            AgentError::InvalidResponse(_) => "InvalidResponse",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_in_wire_shape() {
        let result = AgentResult::success().with_detail("app_id", "abc");
        assert_eq!(
            result.to_value(),
            json!({"status": "success", "details": {"app_id": "abc"}})
        );

        let failed = AgentResult::error("Dependencies not met", "MissingDependency");
        assert_eq!(failed.to_value()["status"], "error");
        assert_eq!(failed.error_type(), Some("MissingDependency"));
    }

    #[test]
    fn round_trips_through_json_unchanged() {
        let result = AgentResult::success_with(json!({
            "request_id": 7,
            "fields": {"skill": "react", "years": 5},
        }));
        let back = AgentResult::from_value(&result.to_value()).unwrap();
        assert_eq!(back, result);
        assert_eq!(back.detail_str("request_id").as_deref(), Some("7"));
    }

    #[test]
    fn success_with_wraps_scalars() {
        let result = AgentResult::success_with(json!("plain"));
        assert_eq!(result.detail("value"), Some(&json!("plain")));
    }
}
