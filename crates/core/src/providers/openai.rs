//! Chat-completions/embeddings wire format shared by OpenAI and Mistral.

use super::{check_status, sse, ProviderSettings};
use crate::error::GatewayError;
use crate::models::{Role, Turn};
use crate::traits::{CompletionModel, CompletionRequest, EmbeddingModel, TextStream};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

pub struct OpenAiCompatibleProvider {
    name: String,
    api_key: String,
    chat_url: Url,
    embeddings_url: Url,
    chat_model: String,
    embedding_model: String,
    client: Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(name: &str, settings: ProviderSettings) -> Result<Self, GatewayError> {
        let api_key = settings.require_key(name)?;
        let base = Url::parse(&format!("{}/", settings.base_url.trim_end_matches('/')))?;

        Ok(Self {
            name: name.to_string(),
            api_key,
            chat_url: base.join("chat/completions")?,
            embeddings_url: base.join("embeddings")?,
            chat_model: settings.chat_model.clone(),
            embedding_model: settings.embedding_model.clone(),
            client: settings.http_client()?,
        })
    }

    fn chat_body<'a>(&'a self, request: &'a CompletionRequest, stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.chat_model,
            messages: request.messages().into_iter().map(ChatMessage::from).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream,
        }
    }

    async fn post_chat(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .client
            .post(self.chat_url.clone())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        check_status(&self.name, response).await
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        let response = self
            .client
            .post(self.embeddings_url.clone())
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.embedding_model,
                input: texts,
            })
            .send()
            .await?;
        let response = check_status(&self.name, response).await?;

        let mut parsed: EmbeddingResponse =
            response
                .json()
                .await
                .map_err(|error| GatewayError::MalformedResponse {
                    provider: self.name.clone(),
                    details: error.to_string(),
                })?;
        parsed.data.sort_by_key(|entry| entry.index);

        if parsed.data.len() != texts.len() {
            return Err(GatewayError::MalformedResponse {
                provider: self.name.clone(),
                details: format!(
                    "{} embeddings for {} inputs",
                    parsed.data.len(),
                    texts.len()
                ),
            });
        }

        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

#[async_trait]
impl CompletionModel for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, GatewayError> {
        let response = self.post_chat(&self.chat_body(request, false)).await?;
        let parsed: ChatResponse =
            response
                .json()
                .await
                .map_err(|error| GatewayError::MalformedResponse {
                    provider: self.name.clone(),
                    details: error.to_string(),
                })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| GatewayError::MalformedResponse {
                provider: self.name.clone(),
                details: "response had no choices".to_string(),
            })
    }

    async fn stream_complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<TextStream, GatewayError> {
        let response = self.post_chat(&self.chat_body(request, true)).await?;
        let provider = self.name.clone();

        Ok(sse::text_stream(&self.name, response, move |payload| {
            parse_stream_delta(&provider, payload)
        }))
    }
}

fn parse_stream_delta(provider: &str, payload: &str) -> Result<Option<String>, GatewayError> {
    let chunk: StreamChunk =
        serde_json::from_str(payload).map_err(|error| GatewayError::MalformedResponse {
            provider: provider.to_string(),
            details: error.to_string(),
        })?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content))
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

impl From<Turn> for ChatMessage {
    fn from(turn: Turn) -> Self {
        let role = match turn.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        Self {
            role,
            content: turn.text,
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}
