//! Stub capabilities shared by the crate's unit tests.

use crate::embeddings::{CharacterNgramEmbedder, EmbeddingConfig, EmbeddingGateway};
use crate::error::GatewayError;
use crate::models::Chunk;
use crate::retry::RetryPolicy;
use crate::traits::{CompletionModel, CompletionRequest, EmbeddingModel, TextStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{watch, Notify};

pub(crate) fn local_gateway() -> EmbeddingGateway {
    EmbeddingGateway::new(
        Arc::new(CharacterNgramEmbedder::default()),
        EmbeddingConfig::default(),
        RetryPolicy::none(),
    )
}

pub(crate) fn chunks_for(document: &str, texts: &[&str]) -> Vec<Chunk> {
    texts
        .iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            id: format!("{document}-{index}"),
            text: text.to_string(),
            source_page: None,
            source_document: document.to_string(),
            sequence_index: index as u64,
        })
        .collect()
}

pub(crate) enum Reply {
    Text(String),
    RateLimited,
    Fail(String),
}

/// Completion stub that records every request. Replies are consumed in
/// order; once the script runs out, `fallback` decides the answer.
pub(crate) struct ScriptedModel {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Box<dyn Fn(&CompletionRequest) -> String + Send + Sync>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub(crate) fn answering(answer: &str) -> Self {
        let answer = answer.to_string();
        Self::with_fallback(move |_| answer.clone())
    }

    /// Answers with `<previous_summary>|<prompt>`.
    pub(crate) fn echo_previous_summary() -> Self {
        Self::with_fallback(|request| {
            format!(
                "{}|{}",
                request.previous_summary.clone().unwrap_or_default(),
                request.prompt
            )
        })
    }

    pub(crate) fn with_fallback(
        fallback: impl Fn(&CompletionRequest) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Box::new(fallback),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn then(self, reply: Reply) -> Self {
        self.replies.lock().push_back(reply);
        self
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    fn next_reply(&self, request: &CompletionRequest) -> Result<String, GatewayError> {
        self.requests.lock().push(request.clone());
        match self.replies.lock().pop_front() {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::RateLimited) => Err(GatewayError::RateLimited {
                provider: "scripted".to_string(),
                details: "slow down".to_string(),
            }),
            Some(Reply::Fail(details)) => Err(GatewayError::Upstream {
                provider: "scripted".to_string(),
                status: 500,
                details,
            }),
            None => Ok((self.fallback)(request)),
        }
    }
}

#[async_trait]
impl CompletionModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, GatewayError> {
        self.next_reply(request)
    }

    async fn stream_complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<TextStream, GatewayError> {
        let text = self.next_reply(request)?;
        let pieces = text
            .split_inclusive(' ')
            .map(|piece| Ok(piece.to_string()))
            .collect::<Vec<_>>();
        Ok(Box::pin(futures::stream::iter(pieces)))
    }
}

/// Local embedder that parks every call until the gate is opened.
pub(crate) struct GatedEmbedder {
    open: watch::Sender<bool>,
    blocked: Notify,
    inner: CharacterNgramEmbedder,
}

impl Default for GatedEmbedder {
    fn default() -> Self {
        let (open, _) = watch::channel(false);
        Self {
            open,
            blocked: Notify::new(),
            inner: CharacterNgramEmbedder::default(),
        }
    }
}

impl GatedEmbedder {
    pub(crate) fn gateway(self: &Arc<Self>) -> EmbeddingGateway {
        EmbeddingGateway::new(self.clone(), EmbeddingConfig::default(), RetryPolicy::none())
    }

    pub(crate) fn open(&self) {
        self.open.send_replace(true);
    }

    pub(crate) fn close(&self) {
        self.open.send_replace(false);
    }

    pub(crate) async fn wait_until_blocked(&self) {
        self.blocked.notified().await;
    }
}

#[async_trait]
impl EmbeddingModel for GatedEmbedder {
    fn name(&self) -> &str {
        "gated"
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        let mut open = self.open.subscribe();
        let is_open = *open.borrow();
        if !is_open {
            self.blocked.notify_one();
            let opened = open.wait_for(|open| *open).await.is_ok();
            if !opened {
                return Err(GatewayError::MalformedResponse {
                    provider: "gated".to_string(),
                    details: "gate dropped".to_string(),
                });
            }
        }
        self.inner.embed_texts(texts).await
    }
}
