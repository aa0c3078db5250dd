//! Completion client - the router's only door to the language model.
//!
//! The upstream model is asked for JSON but is not trusted to produce it.
//! Every answer is folded into [`Completion`], so callers pattern-match on the
//! shape they got instead of assuming the shape they asked for.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::llm::{ChatMessage, ChatOptions, LlmClient};

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an AI assistant that helps with routing decisions. Always respond with valid JSON.";

/// A parsed completion answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Object(Map<String, Value>),
    Array(Vec<Value>),
    /// Anything that was not a JSON object or array. JSON-encoded strings are
    /// unwrapped once, so `"\"[1]\""` arrives here as `[1]`.
    Text(String),
}

impl Completion {
    /// Fold raw model output into a `Completion`.
    pub fn parse(raw: &str) -> Self {
        let body = strip_code_fence(raw.trim());
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(map)) => Completion::Object(map),
            Ok(Value::Array(items)) => Completion::Array(items),
            Ok(Value::String(inner)) => Completion::Text(inner),
            _ => Completion::Text(raw.trim().to_string()),
        }
    }

    /// Re-parse a `Text` answer that itself holds JSON. Object and array
    /// answers are returned unchanged; text that is not JSON yields `None`.
    pub fn reparse(self) -> Option<Self> {
        match self {
            Completion::Text(text) => match Completion::parse(&text) {
                Completion::Text(_) => None,
                structured => Some(structured),
            },
            structured => Some(structured),
        }
    }

    /// The first object in the answer: the object itself, or the first
    /// element of an array when that element is an object.
    pub fn first_object(&self) -> Option<&Map<String, Value>> {
        match self {
            Completion::Object(map) => Some(map),
            Completion::Array(items) => items.first().and_then(Value::as_object),
            Completion::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Completion::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Completion::Object(map) => Value::Object(map),
            Completion::Array(items) => Value::Array(items),
            Completion::Text(text) => Value::String(text),
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    static FENCE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)^```[A-Za-z0-9_-]*\s*\n(.*?)\n?\s*```$").expect("valid fence regex")
    });
    fence
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or(text)
}

/// Parameters of one completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u64,
    pub system: String,
    /// Ask the provider for a JSON object (not all providers honor it).
    pub json_object: bool,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 1.0,
            max_tokens: 3320,
            system: DEFAULT_SYSTEM_PROMPT.to_string(),
            json_object: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub fn json_object(mut self) -> Self {
        self.json_object = true;
        self
    }
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion timed out after {0:?}")]
    Timeout(Duration),

    #[error("completion request failed: {0}")]
    Transport(String),

    #[error("completion returned no content")]
    Empty,
}

/// Timeout-bounded wrapper around an [`LlmClient`].
#[derive(Clone)]
pub struct CompletionClient {
    llm: Arc<dyn LlmClient>,
    timeout: Duration,
}

impl CompletionClient {
    pub fn new(llm: Arc<dyn LlmClient>, timeout: Duration) -> Self {
        Self { llm, timeout }
    }

    /// Send `prompt` and return the parsed answer.
    pub async fn complete(
        &self,
        prompt: &str,
        request: &CompletionRequest,
    ) -> Result<Completion, CompletionError> {
        let messages = [
            ChatMessage::system(request.system.clone()),
            ChatMessage::user(prompt),
        ];
        let options = ChatOptions {
            temperature: Some(request.temperature),
            top_p: Some(1.0),
            max_tokens: Some(request.max_tokens),
            json_object: request.json_object,
        };

        let call = self.llm.chat_completion(&request.model, &messages, options);
        let response = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| CompletionError::Timeout(self.timeout))?
            .map_err(|e| CompletionError::Transport(e.to_string()))?;

        let content = response.content.ok_or(CompletionError::Empty)?;
        tracing::debug!("Raw completion ({}): {}", request.model, content);
        Ok(Completion::parse(&content))
    }
}
