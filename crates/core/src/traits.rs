use crate::error::GatewayError;
use crate::models::{Role, Turn};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Incremental completion output. Consumed by a single reader.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, GatewayError>> + Send>>;

#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn name(&self) -> &str;

    /// One vector per input, in input order.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub history: Vec<Turn>,
    /// Summary of the preceding notes window, sent ahead of the prompt.
    pub previous_summary: Option<String>,
    pub prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Flattened conversation: system, previous summary, history, prompt.
    pub fn messages(&self) -> Vec<Turn> {
        let mut messages = Vec::with_capacity(self.history.len() + 3);
        if let Some(system) = &self.system {
            messages.push(Turn {
                role: Role::System,
                text: system.clone(),
            });
        }
        if let Some(summary) = self.previous_summary.as_ref().filter(|s| !s.is_empty()) {
            messages.push(Turn::assistant(summary.clone()));
        }
        messages.extend(self.history.iter().cloned());
        messages.push(Turn::user(self.prompt.clone()));
        messages
    }
}

#[async_trait]
pub trait CompletionModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<String, GatewayError>;

    async fn stream_complete(&self, request: &CompletionRequest)
        -> Result<TextStream, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_put_previous_summary_before_history_and_prompt() {
        let request = CompletionRequest {
            system: Some("rules".to_string()),
            history: vec![Turn::user("q1"), Turn::assistant("a1")],
            previous_summary: Some("earlier notes".to_string()),
            prompt: "q2".to_string(),
            ..CompletionRequest::default()
        };

        let roles = request
            .messages()
            .into_iter()
            .map(|turn| (turn.role, turn.text))
            .collect::<Vec<_>>();

        assert_eq!(
            roles,
            vec![
                (Role::System, "rules".to_string()),
                (Role::Assistant, "earlier notes".to_string()),
                (Role::User, "q1".to_string()),
                (Role::Assistant, "a1".to_string()),
                (Role::User, "q2".to_string()),
            ]
        );
    }

    #[test]
    fn empty_previous_summary_is_skipped() {
        let request = CompletionRequest {
            previous_summary: Some(String::new()),
            ..CompletionRequest::new("hello")
        };
        assert_eq!(request.messages(), vec![Turn::user("hello")]);
    }
}
