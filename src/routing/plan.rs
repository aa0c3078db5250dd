//! Routing plan types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One capability invocation in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingStep {
    pub agent: String,
    /// Position in the plan, starting at 1
    pub order: u32,
    pub task: String,
    /// Agents that must have succeeded before this step runs
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl RoutingStep {
    pub fn new(agent: impl Into<String>, order: u32, task: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            order,
            task: task.into(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// A step as proposed by the completion service, before repair.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedStep {
    pub agent: String,
    pub order: Option<u32>,
    pub task: Option<String>,
    pub dependencies: Vec<String>,
}

/// One entry of a candidate plan.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanItem {
    Step(ProposedStep),
    /// Something that could not be read as a step.
    Error { error: String, raw: Option<String> },
}

impl PlanItem {
    pub fn error(error: impl Into<String>, raw: Option<String>) -> Self {
        PlanItem::Error {
            error: error.into(),
            raw,
        }
    }

    /// Read one JSON array element.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return PlanItem::error("Plan entry is not an object", Some(value.to_string()));
        };
        if let Some(error) = obj.get("error").and_then(Value::as_str) {
            return PlanItem::error(error, Some(value.to_string()));
        }
        let Some(agent) = obj
            .get("agent")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|a| !a.is_empty())
        else {
            return PlanItem::error("Plan entry has no agent", Some(value.to_string()));
        };

        let order = obj.get("order").and_then(read_order);
        let task = obj
            .get("task")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        let dependencies = match obj.get("dependencies") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect(),
            Some(Value::String(single)) if !single.trim().is_empty() => {
                vec![single.trim().to_string()]
            }
            _ => Vec::new(),
        };

        PlanItem::Step(ProposedStep {
            agent: agent.to_string(),
            order,
            task,
            dependencies,
        })
    }
}

/// Positive integer order from a number or numeric string.
fn read_order(value: &Value) -> Option<u32> {
    let n = match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f > 0.0)
                .map(|f| f as u64)
        })?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    u32::try_from(n).ok().filter(|n| *n > 0)
}

/// Candidate plan straight from the generator.
pub type RawPlan = Vec<PlanItem>;

/// A normalized plan: non-empty, sorted by order, mandatory steps present.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoutingPlan {
    pub steps: Vec<RoutingStep>,
    /// Error markers found in the candidate plan
    pub errors: Vec<String>,
}

impl RoutingPlan {
    pub fn step(&self, agent: &str) -> Option<&RoutingStep> {
        self.steps.iter().find(|s| s.agent == agent)
    }

    pub fn agents(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.agent.as_str()).collect()
    }
}
