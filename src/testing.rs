//! Test doubles shared by the unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::agents::AgentContext;
use crate::completion::CompletionClient;
use crate::llm::{ChatMessage, ChatOptions, ChatResponse, LlmClient, Role};
use crate::routing::PromptGenerator;
use crate::store::{InMemoryStore, UserId};

type Responder = dyn Fn(&str) -> anyhow::Result<String> + Send + Sync;

/// An `LlmClient` that answers from a closure over the user prompt.
pub struct ScriptedLlm {
    responder: Box<Responder>,
    delay: Option<Duration>,
    /// Extra delay for prompts containing the marker
    slow_prompt: Option<(&'static str, Duration)>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLlm {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            delay: None,
            slow_prompt: None,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Delay only the prompts containing `marker`.
    pub fn with_delay_on(mut self, marker: &'static str, delay: Duration) -> Self {
        self.slow_prompt = Some((marker, delay));
        self
    }

    /// Handle to every user prompt received so far.
    pub fn prompts(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.prompts)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _options: ChatOptions,
    ) -> anyhow::Result<ChatResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if let Some((marker, delay)) = self.slow_prompt {
            if prompt.contains(marker) {
                tokio::time::sleep(delay).await;
            }
        }
        self.prompts.lock().unwrap().push(prompt.clone());

        let content = (self.responder)(&prompt)?;
        Ok(ChatResponse {
            content: Some(content),
            finish_reason: Some("stop".to_string()),
            usage: None,
            model: Some(model.to_string()),
        })
    }
}

/// In-memory services for exercising a handler directly.
pub struct Harness {
    pub store: InMemoryStore,
    pub completion: CompletionClient,
    pub prompts: PromptGenerator,
    pub user: UserId,
}

impl Harness {
    pub fn new(llm: ScriptedLlm) -> Self {
        Self {
            store: InMemoryStore::new(),
            completion: CompletionClient::new(Arc::new(llm), Duration::from_secs(5)),
            prompts: PromptGenerator::new(),
            user: UserId::new("alice"),
        }
    }

    pub fn ctx(&self) -> AgentContext<'_> {
        AgentContext {
            user: &self.user,
            repo: &self.store,
            completion: &self.completion,
            model: "test-model",
            prompts: &self.prompts,
            interaction_log_limit: 50,
        }
    }
}
