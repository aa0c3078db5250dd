//! Router error taxonomy.
//!
//! Only [`RouterError::Bootstrap`] (and persistence failures while setting up
//! a request) abort a request. Every other kind is recovered at the step
//! where it happened and recorded in that step's `AgentResult`.

use thiserror::Error;

use crate::agents::AgentResult;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum RouterError {
    /// The completion service answered the routing prompt with something
    /// that is not a plan.
    #[error("Plan generation failed: {0}")]
    PlanGeneration(String),

    /// A step's prerequisites did not complete successfully.
    #[error("Dependencies not met for {agent}: missing {missing:?}")]
    MissingDependency { agent: String, missing: Vec<String> },

    /// No handler registered under this capability name.
    #[error("Unknown agent: {0}")]
    UnknownCapability(String),

    /// A mandatory bootstrap step failed; nothing else ran.
    #[error("Bootstrap step {agent} failed: {message}")]
    Bootstrap {
        agent: String,
        message: String,
        result: Option<Box<AgentResult>>,
    },

    /// A handler failed while processing its task.
    #[error("{agent} failed: {message}")]
    Capability { agent: String, message: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
}

impl RouterError {
    /// Stable name recorded as `details.error_type`.
    pub fn error_type(&self) -> &'static str {
        match self {
            RouterError::PlanGeneration(_) => "PlanGenerationError",
            RouterError::MissingDependency { .. } => "MissingDependency",
            RouterError::UnknownCapability(_) => "UnknownCapability",
            RouterError::Bootstrap { .. } => "BootstrapFailure",
            RouterError::Capability { .. } => "CapabilityError",
            RouterError::Persistence(_) => "PersistenceError",
        }
    }

    pub fn bootstrap(agent: &str, message: impl Into<String>) -> Self {
        RouterError::Bootstrap {
            agent: agent.to_string(),
            message: message.into(),
            result: None,
        }
    }

    /// Convert into the error `AgentResult` recorded for a step.
    pub fn into_result(self) -> AgentResult {
        let error_type = self.error_type();
        AgentResult::error(self.to_string(), error_type)
    }

    /// Structured payload for API layers.
    pub fn to_value(&self) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "status": "error",
            "error_type": self.error_type(),
            "error_message": self.to_string(),
        });
        if let RouterError::Bootstrap {
            agent,
            result: Some(result),
            ..
        } = self
        {
            payload["agent"] = serde_json::Value::String(agent.clone());
            payload["details"] = serde_json::to_value(result).unwrap_or_default();
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_maps_to_a_stable_error_type() {
        let cases = [
            (RouterError::PlanGeneration("x".into()), "PlanGenerationError"),
            (
                RouterError::MissingDependency {
                    agent: "B".into(),
                    missing: vec!["A".into()],
                },
                "MissingDependency",
            ),
            (RouterError::UnknownCapability("Nope".into()), "UnknownCapability"),
            (RouterError::bootstrap("IntentAgent", "down"), "BootstrapFailure"),
            (
                RouterError::Capability {
                    agent: "C".into(),
                    message: "bad".into(),
                },
                "CapabilityError",
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.error_type(), expected);
        }
    }

    #[test]
    fn into_result_carries_message_and_type() {
        let result = RouterError::UnknownCapability("PersonaAgent".into()).into_result();
        assert!(!result.is_success());
        assert_eq!(result.error_type(), Some("UnknownCapability"));
        assert!(result.error_message().unwrap().contains("PersonaAgent"));
    }
}
