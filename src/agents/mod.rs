//! Agents module - capability handlers.
//!
//! # Agent Types
//! - **IntentAgent**: bootstrap, resolves the request's intent
//! - **AppAgent**: bootstrap, resolves the per-(user, intent) app aggregate
//! - **RequestAgent**, **CategoryAgent**, **DynamicModelAgent**,
//!   **UserProfileAgent**, **AIModelAgent**, **UserInteractionAgent**:
//!   plan steps dispatched by the executor
//!
//! Handlers are looked up by capability name in an [`AgentRegistry`].

mod ai_model;
mod app;
mod category;
mod context;
mod dynamic_model;
mod intent;
mod interaction;
mod profile;
mod registry;
mod request;
mod types;

pub use ai_model::AiModelAgent;
pub use app::AppAgent;
pub use category::CategoryAgent;
pub use context::AgentContext;
pub use dynamic_model::DynamicModelAgent;
pub use intent::IntentAgent;
pub use interaction::UserInteractionAgent;
pub use profile::UserProfileAgent;
pub use registry::AgentRegistry;
pub use request::RequestAgent;
pub use types::{AgentError, AgentResult, AgentStatus};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::routing::ExecutionContext;
use crate::store::CrudOutcome;

/// Base trait for all capability handlers.
///
/// # Invariants
/// - `process_task()` returns `Ok` with an error `AgentResult` for expected
///   failures (nothing to create, unusable answer) and `Err` for failures of
///   its collaborators
/// - an error result carries `error_message` and `error_type`
#[async_trait]
pub trait Agent: Send + Sync {
    /// Capability name the agent is registered under.
    fn name(&self) -> &'static str;

    /// Get a human-readable description of this agent.
    fn description(&self) -> &str {
        "Generic agent"
    }

    /// Slow work for a bootstrap step, run before its transaction opens.
    ///
    /// `ctx.repo` is the plain store here. The returned entries are merged
    /// into the context `process_task` sees.
    async fn prepare(
        &self,
        _input: &str,
        _task: &str,
        _context: &ExecutionContext,
        _ctx: &AgentContext<'_>,
    ) -> Result<Map<String, Value>, AgentError> {
        Ok(Map::new())
    }

    /// Process one plan step.
    ///
    /// `context` is an immutable snapshot of everything merged so far plus
    /// the step's injected prompt.
    async fn process_task(
        &self,
        input: &str,
        task: &str,
        context: &ExecutionContext,
        ctx: &AgentContext<'_>,
    ) -> Result<AgentResult, AgentError>;
}

/// Id of the record a CRUD call produced or found.
pub(crate) fn require_id(outcome: &CrudOutcome, what: &str) -> Result<String, AgentError> {
    if !outcome.is_success() {
        return Err(AgentError::Rejected(format!(
            "{}: {}",
            what,
            outcome.error_message().unwrap_or("unknown error")
        )));
    }
    outcome
        .id()
        .ok_or_else(|| AgentError::Rejected(format!("{}: no id returned", what)))
}

/// First `max` characters of `input`, for descriptions.
pub(crate) fn excerpt(input: &str, max: usize) -> String {
    let mut out: String = input.chars().take(max).collect();
    if input.chars().count() > max {
        out.push_str("...");
    }
    out
}

/// The word following the first of `markers` in `input`.
pub(crate) fn word_after<'a>(input: &'a str, markers: &[&str]) -> Option<&'a str> {
    let words: Vec<&str> = input.split_whitespace().collect();
    let pos = words
        .iter()
        .position(|w| markers.contains(&w.to_lowercase().as_str()))?;
    words.get(pos + 1).copied()
}
