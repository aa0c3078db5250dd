//! User profile creation.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{excerpt, require_id, word_after, Agent, AgentContext, AgentError, AgentResult};
use crate::completion::Completion;
use crate::error::RouterError;
use crate::routing::ExecutionContext;
use crate::store::{CrudOperation, EntityKind};

pub struct UserProfileAgent;

#[async_trait]
impl Agent for UserProfileAgent {
    fn name(&self) -> &'static str {
        "UserProfileAgent"
    }

    fn description(&self) -> &str {
        "Creates a typed user profile with suggested fields"
    }

    async fn process_task(
        &self,
        input: &str,
        task: &str,
        context: &ExecutionContext,
        ctx: &AgentContext<'_>,
    ) -> Result<AgentResult, AgentError> {
        let profile_type = context
            .get_str("profile_type")
            .or_else(|| word_after(input, &["profile", "type"]))
            .map(str::to_string);
        let Some(profile_type) = profile_type else {
            return Ok(RouterError::Capability {
                agent: self.name().to_string(),
                message: "Profile type could not be determined".to_string(),
            }
            .into_result());
        };

        let profile_type_id = require_id(
            &ctx.perform(
                CrudOperation::Create,
                EntityKind::ProfileType,
                json!({
                    "name": profile_type,
                    "description": format!("Profile type for: {}", excerpt(input, 50)),
                }),
            )
            .await?,
            "profile type",
        )?;

        let profile_id = require_id(
            &ctx.perform(
                CrudOperation::Create,
                EntityKind::UserProfile,
                json!({ "profile_type": profile_type_id }),
            )
            .await?,
            "user profile",
        )?;

        let prompt = ctx.step_prompt(self.name(), input, task, context).await?;
        let request = ctx.request().with_temperature(0.7).with_max_tokens(1000);
        let fields = suggested_fields(ctx.complete(&prompt, &request).await?)?;

        let mut created = 0usize;
        for (name, value) in &fields {
            let outcome = ctx
                .perform(
                    CrudOperation::Create,
                    EntityKind::UserProfileField,
                    json!({
                        "profile": profile_id,
                        "field_name": name,
                        "field_value": value,
                    }),
                )
                .await?;
            if outcome.is_success() {
                created += 1;
            } else {
                tracing::warn!("Failed to create field: {}", name);
            }
        }

        Ok(AgentResult::success()
            .with_detail("profile_id", profile_id)
            .with_detail("profile_type", profile_type)
            .with_detail("fields_created", created))
    }
}

/// `(name, value)` pairs from `[{name, value}]` or `{"fields": [...]}`.
fn suggested_fields(answer: Completion) -> Result<Vec<(String, Value)>, AgentError> {
    let answer = answer
        .reparse()
        .ok_or_else(|| AgentError::InvalidResponse("profile fields answer is not JSON".to_string()))?;
    let items = match &answer {
        Completion::Array(items) => items.clone(),
        Completion::Object(obj) => obj
            .get("fields")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| AgentError::InvalidResponse("profile fields answer has no 'fields' array".to_string()))?,
        Completion::Text(_) => Vec::new(),
    };

    Ok(items
        .iter()
        .filter_map(|item| {
            let name = item.get("name")?.as_str()?.to_string();
            let value = item.get("value").cloned().unwrap_or(Value::Null);
            Some((name, value))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, ScriptedLlm};

    #[tokio::test]
    async fn creates_profile_with_fields() {
        let harness = Harness::new(ScriptedLlm::new(|_| {
            Ok(r#"[{"name": "stack", "value": "react"}, {"name": "seniority", "value": "senior"}, {"bad": 1}]"#.to_string())
        }));
        let result = UserProfileAgent
            .process_task("create profile Developer for me", "t", &ExecutionContext::new(), &harness.ctx())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.detail_str("profile_type").as_deref(), Some("Developer"));
        assert_eq!(result.detail("fields_created"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn undetermined_type_is_an_error_result() {
        let harness = Harness::new(ScriptedLlm::new(|_| anyhow::bail!("not called")));
        let result = UserProfileAgent
            .process_task("hello there", "t", &ExecutionContext::new(), &harness.ctx())
            .await
            .unwrap();
        assert!(!result.is_success());
        assert_eq!(result.error_type(), Some("CapabilityError"));
    }
}
