//! Request categorisation.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{excerpt, require_id, Agent, AgentContext, AgentError, AgentResult};
use crate::completion::Completion;
use crate::error::RouterError;
use crate::routing::ExecutionContext;
use crate::store::{CrudOperation, EntityKind};

const CATEGORY_SYSTEM_PROMPT: &str =
    "You are an AI assistant that helps categorize user requests. Respond with a single category name.";

pub struct CategoryAgent;

#[async_trait]
impl Agent for CategoryAgent {
    fn name(&self) -> &'static str {
        "CategoryAgent"
    }

    fn description(&self) -> &str {
        "Assigns the request to a category"
    }

    async fn process_task(
        &self,
        input: &str,
        task: &str,
        context: &ExecutionContext,
        ctx: &AgentContext<'_>,
    ) -> Result<AgentResult, AgentError> {
        let prompt = ctx.step_prompt(self.name(), input, task, context).await?;
        let request = ctx
            .request()
            .with_system(CATEGORY_SYSTEM_PROMPT)
            .with_temperature(0.3)
            .with_max_tokens(50);
        let answer = ctx.complete(&prompt, &request).await?;

        let Some(name) = category_name(&answer) else {
            return Ok(RouterError::Capability {
                agent: self.name().to_string(),
                message: "completion returned no category name".to_string(),
            }
            .into_result());
        };

        let outcome = ctx
            .perform(
                CrudOperation::Create,
                EntityKind::Category,
                json!({
                    "name": name,
                    "description": format!("Category for: {}", excerpt(input, 50)),
                }),
            )
            .await?;
        let id = require_id(&outcome, "category")?;

        Ok(AgentResult::success()
            .with_detail("id", id.clone())
            .with_detail("category_id", id)
            .with_detail("category_name", name)
            .with_detail("created", outcome.operation == CrudOperation::Create))
    }
}

/// A category name from a text, object or array answer.
fn category_name(answer: &Completion) -> Option<String> {
    let raw = match answer {
        Completion::Text(text) => text.lines().find(|l| !l.trim().is_empty())?.to_string(),
        Completion::Object(obj) => ["category", "category_name", "name"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))?
            .to_string(),
        Completion::Array(items) => match items.first()? {
            Value::String(s) => s.clone(),
            Value::Object(obj) => return category_name(&Completion::Object(obj.clone())),
            _ => return None,
        },
    };
    let name = raw
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`' || c == '.')
        .trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, ScriptedLlm};

    #[test]
    fn reads_name_from_any_shape() {
        assert_eq!(category_name(&Completion::parse("\"Hiring\".\n")), Some("Hiring".into()));
        assert_eq!(category_name(&Completion::parse(r#"{"category": "Travel"}"#)), Some("Travel".into()));
        assert_eq!(category_name(&Completion::parse(r#"["Food", "Other"]"#)), Some("Food".into()));
        assert_eq!(
            category_name(&Completion::parse(r#"[{"category_name": "Legal"}, "Other"]"#)),
            Some("Legal".into())
        );
        assert_eq!(category_name(&Completion::parse("  ")), None);
    }

    #[tokio::test]
    async fn get_or_creates_category() {
        let harness = Harness::new(ScriptedLlm::new(|_| Ok("Software Hiring".to_string())));
        let ctx = harness.ctx();
        let context = ExecutionContext::new();

        let first = CategoryAgent.process_task("find a dev", "t", &context, &ctx).await.unwrap();
        let second = CategoryAgent.process_task("find a dev", "t", &context, &ctx).await.unwrap();

        assert_eq!(first.detail_str("category_name").as_deref(), Some("Software Hiring"));
        assert_eq!(first.detail("created"), Some(&Value::Bool(true)));
        assert_eq!(second.detail("created"), Some(&Value::Bool(false)));
        assert_eq!(first.detail("id"), second.detail("category_id"));
    }

    #[tokio::test]
    async fn uses_injected_prompt() {
        let llm = ScriptedLlm::new(|_| Ok("Travel".to_string()));
        let prompts = llm.prompts();
        let harness = Harness::new(llm);
        let context = ExecutionContext::from_value(json!({"prompt": "categorise this please"}));

        CategoryAgent
            .process_task("trip", "t", &context, &harness.ctx())
            .await
            .unwrap();
        assert_eq!(prompts.lock().unwrap()[0], "categorise this please");
    }
}
