//! User request capture.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{excerpt, require_id, Agent, AgentContext, AgentError, AgentResult};
use crate::completion::Completion;
use crate::routing::ExecutionContext;
use crate::store::{CrudOperation, EntityKind, NewIntent};

const REQUEST_SYSTEM_PROMPT: &str = "You are an AI assistant that helps analyze user requests and suggest appropriate fields and values. Always respond with valid JSON.";

/// Records the request as a typed user request backed by a dynamic instance
/// whose fields come from the completion service.
pub struct RequestAgent;

impl RequestAgent {
    /// Keyword heuristic used when the context names no request type.
    pub fn request_type_for(input: &str) -> &'static str {
        let words: Vec<String> = input
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .collect();
        if words.iter().any(|w| w == "developer") {
            "DeveloperRequest"
        } else if words.iter().any(|w| w == "job") {
            "JobRequest"
        } else {
            "GeneralRequest"
        }
    }
}

#[async_trait]
impl Agent for RequestAgent {
    fn name(&self) -> &'static str {
        "RequestAgent"
    }

    fn description(&self) -> &str {
        "Captures the request with AI-suggested fields"
    }

    async fn process_task(
        &self,
        input: &str,
        task: &str,
        context: &ExecutionContext,
        ctx: &AgentContext<'_>,
    ) -> Result<AgentResult, AgentError> {
        let request_type = context
            .get_str("request_type")
            .map(str::to_string)
            .unwrap_or_else(|| Self::request_type_for(input).to_string());
        let request_type_id = require_id(
            &ctx.perform(
                CrudOperation::Create,
                EntityKind::RequestType,
                json!({
                    "name": request_type,
                    "description": format!("Request type for: {}", excerpt(input, 50)),
                }),
            )
            .await?,
            "request type",
        )?;

        let intent_name = context.intent().unwrap_or("General").to_string();
        let intent = match ctx.repo.find_intent(ctx.user, &intent_name).await? {
            Some(intent) => intent,
            None => {
                let proposal = NewIntent {
                    name: intent_name.clone(),
                    description: format!("Intent for: {}", intent_name),
                    keywords: Vec::new(),
                };
                ctx.repo.create_intent(ctx.user, proposal).await?.0
            }
        };

        let request_id = require_id(
            &ctx.perform(
                CrudOperation::Create,
                EntityKind::UserRequest,
                json!({
                    "request_type": request_type_id,
                    "intent": intent.id.to_string(),
                    "initial_request": input,
                    "is_active": true,
                    "is_location_specific": context.get_bool("is_location_specific").unwrap_or(false),
                    "visibility": "private",
                }),
            )
            .await?,
            "user request",
        )?;

        let model_name = format!("{}_Model", request_type);
        let model_id = require_id(
            &ctx.perform(
                CrudOperation::Create,
                EntityKind::DynamicModel,
                json!({
                    "name": model_name,
                    "description": format!("Dynamic model for request type: {}", request_type),
                    "is_request_type": true,
                }),
            )
            .await?,
            "dynamic model",
        )?;

        let prompt = format!(
            "{}\nModel Name: {}",
            ctx.step_prompt(self.name(), input, task, context).await?,
            model_name
        );
        let request = ctx
            .request()
            .with_system(REQUEST_SYSTEM_PROMPT)
            .with_temperature(0.7)
            .with_max_tokens(1000)
            .json_object();
        let fields = read_fields(ctx.complete(&prompt, &request).await?)?;

        let instance_id = require_id(
            &ctx.perform(
                CrudOperation::Create,
                EntityKind::DynamicInstance,
                json!({ "model": model_id }),
            )
            .await?,
            "dynamic instance",
        )?;

        for (name, value) in &fields {
            let field = ctx
                .perform(
                    CrudOperation::Create,
                    EntityKind::DynamicField,
                    json!({
                        "model": model_id,
                        "name": name,
                        "field_type": "CharField",
                        "required": false,
                    }),
                )
                .await?;
            let Some(field_id) = field.is_success().then(|| field.id()).flatten() else {
                tracing::warn!("Skipping value for field {} of {}", name, model_name);
                continue;
            };
            ctx.perform(
                CrudOperation::Create,
                EntityKind::DynamicFieldValue,
                json!({
                    "instance": instance_id,
                    "field": field_id,
                    "value": value,
                }),
            )
            .await?;
        }

        ctx.perform(
            CrudOperation::Update,
            EntityKind::UserRequest,
            json!({ "id": request_id, "dynamic_instance": instance_id }),
        )
        .await?;

        Ok(AgentResult::success()
            .with_detail("request_id", request_id)
            .with_detail("request_type", request_type)
            .with_detail("intent", intent.name)
            .with_detail("dynamic_instance_id", instance_id)
            .with_detail("fields", Value::Object(fields)))
    }
}

/// The `fields` object of the analysis answer.
fn read_fields(answer: Completion) -> Result<Map<String, Value>, AgentError> {
    let answer = answer
        .reparse()
        .ok_or_else(|| AgentError::InvalidResponse("request analysis is not JSON".to_string()))?;
    answer
        .first_object()
        .and_then(|obj| obj.get("fields"))
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| AgentError::InvalidResponse("request analysis has no 'fields' object".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Repository;
    use crate::testing::{Harness, ScriptedLlm};

    #[test]
    fn request_type_heuristic() {
        assert_eq!(RequestAgent::request_type_for("find me a React developer"), "DeveloperRequest");
        assert_eq!(RequestAgent::request_type_for("post a job, remote"), "JobRequest");
        assert_eq!(RequestAgent::request_type_for("plan a trip"), "GeneralRequest");
    }

    #[tokio::test]
    async fn records_request_with_suggested_fields() {
        let harness = Harness::new(ScriptedLlm::new(|_| {
            Ok(r#"{"fields": {"skill": "react", "years": 5, "remote": true}}"#.to_string())
        }));
        let ctx = harness.ctx();
        let context = ExecutionContext::from_value(json!({"intent": "findReactDeveloper"}));

        let result = RequestAgent
            .process_task("find me a react developer with 5 years experience", "Process request", &context, &ctx)
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.detail_str("request_type").as_deref(), Some("DeveloperRequest"));
        assert_eq!(result.detail_str("intent").as_deref(), Some("findReactDeveloper"));
        assert_eq!(result.detail("fields").unwrap()["years"], 5);

        let request = harness
            .store
            .perform(
                &harness.user,
                CrudOperation::Read,
                EntityKind::UserRequest,
                json!({"id": result.detail_str("request_id").unwrap()}).as_object().cloned().unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            request.details[0]["dynamic_instance"].as_str(),
            result.detail_str("dynamic_instance_id").as_deref()
        );

        let values = harness
            .store
            .perform(
                &harness.user,
                CrudOperation::Read,
                EntityKind::DynamicFieldValue,
                json!({"instance": result.detail_str("dynamic_instance_id").unwrap()})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(values.details.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn answer_without_fields_is_invalid() {
        let harness = Harness::new(ScriptedLlm::new(|_| Ok("sure, here you go".to_string())));
        let err = RequestAgent
            .process_task("plan a trip", "t", &ExecutionContext::new(), &harness.ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidResponse");
    }
}
