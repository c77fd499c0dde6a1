use super::{check_status, sse, ProviderSettings};
use crate::error::GatewayError;
use crate::models::Role;
use crate::traits::{CompletionModel, CompletionRequest, EmbeddingModel, TextStream};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

const PROVIDER: &str = "gemini";

pub struct GeminiProvider {
    api_key: String,
    base: Url,
    chat_model: String,
    embedding_model: String,
    client: Client,
}

impl GeminiProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self, GatewayError> {
        Ok(Self {
            api_key: settings.require_key(PROVIDER)?,
            base: Url::parse(&format!("{}/", settings.base_url.trim_end_matches('/')))?,
            chat_model: settings.chat_model.clone(),
            embedding_model: settings.embedding_model.clone(),
            client: settings.http_client()?,
        })
    }

    fn model_url(&self, model: &str, method: &str) -> Result<Url, GatewayError> {
        Ok(self.base.join(&format!("models/{model}:{method}"))?)
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        url: Url,
        body: &T,
    ) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await?;
        check_status(PROVIDER, response).await
    }
}

fn malformed(error: impl std::fmt::Display) -> GatewayError {
    GatewayError::MalformedResponse {
        provider: PROVIDER.to_string(),
        details: error.to_string(),
    }
}

#[async_trait]
impl EmbeddingModel for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        let model = format!("models/{}", self.embedding_model);
        let body = BatchEmbedRequest {
            requests: texts
                .iter()
                .map(|text| EmbedContentRequest {
                    model: model.clone(),
                    content: Content::text(None, text.clone()),
                })
                .collect(),
        };

        let url = self.model_url(&self.embedding_model, "batchEmbedContents")?;
        let parsed: BatchEmbedResponse = self
            .post(url, &body)
            .await?
            .json()
            .await
            .map_err(malformed)?;

        if parsed.embeddings.len() != texts.len() {
            return Err(malformed(format!(
                "{} embeddings for {} inputs",
                parsed.embeddings.len(),
                texts.len()
            )));
        }

        Ok(parsed
            .embeddings
            .into_iter()
            .map(|embedding| embedding.values)
            .collect())
    }
}

#[async_trait]
impl CompletionModel for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, GatewayError> {
        let url = self.model_url(&self.chat_model, "generateContent")?;
        let parsed: GenerateResponse = self
            .post(url, &GenerateRequest::from(request))
            .await?
            .json()
            .await
            .map_err(malformed)?;

        parsed
            .text()
            .ok_or_else(|| malformed("response had no candidates"))
    }

    async fn stream_complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<TextStream, GatewayError> {
        let mut url = self.model_url(&self.chat_model, "streamGenerateContent")?;
        url.query_pairs_mut().append_pair("alt", "sse");
        let response = self.post(url, &GenerateRequest::from(request)).await?;

        Ok(sse::text_stream(PROVIDER, response, |payload| {
            let chunk: GenerateResponse = serde_json::from_str(payload).map_err(malformed)?;
            Ok(chunk.text())
        }))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

impl From<&CompletionRequest> for GenerateRequest {
    fn from(request: &CompletionRequest) -> Self {
        let mut system_instruction = None;
        let mut contents = Vec::new();

        for turn in request.messages() {
            match turn.role {
                Role::System => system_instruction = Some(Content::text(None, turn.text)),
                Role::User => contents.push(Content::text(Some("user"), turn.text)),
                Role::Assistant => contents.push(Content::text(Some("model"), turn.text)),
            }
        }

        let generation_config = if request.max_tokens.is_some() || request.temperature.is_some() {
            Some(GenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
            })
        } else {
            None
        };

        Self {
            contents,
            system_instruction,
            generation_config,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn text(role: Option<&str>, text: String) -> Self {
        Self {
            role: role.map(str::to_string),
            parts: vec![Part { text: Some(text) }],
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

impl GenerateResponse {
    fn text(self) -> Option<String> {
        let candidate = self.candidates.into_iter().next()?;
        let content = candidate.content?;
        Some(
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<String>(),
        )
    }
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Serialize)]
struct BatchEmbedRequest {
    requests: Vec<EmbedContentRequest>,
}

#[derive(Serialize)]
struct EmbedContentRequest {
    model: String,
    content: Content,
}

#[derive(Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<ContentEmbedding>,
}

#[derive(Deserialize)]
struct ContentEmbedding {
    values: Vec<f32>,
}
