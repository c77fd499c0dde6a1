use crate::embeddings::EmbeddingGateway;
use crate::error::QaError;
use crate::index::VectorIndex;
use crate::models::RetrievedChunk;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_TOP_K: usize = 10;

/// Query-side view of an index: embeds the question with the same gateway
/// the index was built with, then delegates to similarity search.
#[derive(Clone)]
pub struct Retriever {
    index: Arc<VectorIndex>,
    embeddings: EmbeddingGateway,
    min_score: Option<f32>,
}

impl Retriever {
    pub fn new(index: Arc<VectorIndex>, embeddings: EmbeddingGateway) -> Self {
        Self {
            index,
            embeddings,
            min_score: None,
        }
    }

    /// Drops hits scoring below `min_score`, so results may come back empty.
    pub fn with_min_score(mut self, min_score: Option<f32>) -> Self {
        self.min_score = min_score;
        self
    }

    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedChunk>, QaError> {
        if !self.index.is_loaded() {
            return Err(QaError::NoDocumentLoaded);
        }
        if query.trim().is_empty() {
            return Err(QaError::EmptyQuery);
        }

        let query_vector = self.embeddings.embed_one(query).await?;
        let mut hits = self.index.search(&query_vector, k)?;

        if let Some(threshold) = self.min_score {
            hits.retain(|hit| hit.score >= threshold);
        }

        debug!(
            k,
            hits = hits.len(),
            top_score = hits.first().map(|hit| hit.score).unwrap_or_default(),
            "retrieved chunks"
        );
        Ok(hits)
    }
}
