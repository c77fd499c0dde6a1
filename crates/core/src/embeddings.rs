use crate::error::{EmbeddingFailure, GatewayError};
use crate::retry::RetryPolicy;
use crate::traits::EmbeddingModel;
use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 128;

/// Offline, deterministic embedding over hashed character trigrams.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingModel for CharacterNgramEmbedder {
    fn name(&self) -> &str {
        "local-ngram"
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub batch_size: usize,
    /// Upper bound on batches in flight at once.
    pub concurrency: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            concurrency: 5,
        }
    }
}

/// Uniform entry point to an embedding capability: batching, bounded
/// fan-out and rate-limit backoff, with output order matching input order.
#[derive(Clone)]
pub struct EmbeddingGateway {
    model: Arc<dyn EmbeddingModel>,
    config: EmbeddingConfig,
    retry: RetryPolicy,
}

impl EmbeddingGateway {
    pub fn new(model: Arc<dyn EmbeddingModel>, config: EmbeddingConfig, retry: RetryPolicy) -> Self {
        Self {
            model,
            config,
            retry,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingFailure> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batch_size = self.config.batch_size.max(1);
        let requests = texts
            .chunks(batch_size)
            .map(<[String]>::to_vec)
            .enumerate()
            .map(|(batch_index, batch)| self.embed_chunk(batch_index, batch))
            .collect::<Vec<_>>();

        let batches: Vec<Vec<Vec<f32>>> = stream::iter(requests)
            .buffered(self.config.concurrency.max(1))
            .try_collect()
            .await?;

        let vectors = batches.into_iter().flatten().collect::<Vec<_>>();

        let expected = vectors.first().map(Vec::len).unwrap_or_default();
        if let Some(position) = vectors.iter().position(|vector| vector.len() != expected || expected == 0) {
            return Err(self.malformed(
                position / batch_size,
                format!(
                    "vector {position} has dimension {} (expected {expected})",
                    vectors[position].len()
                ),
            ));
        }

        Ok(vectors)
    }

    async fn embed_chunk(
        &self,
        batch_index: usize,
        batch: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingFailure> {
        let vectors = self
            .retry
            .run("embed", || self.model.embed_texts(&batch))
            .await
            .map_err(|source| EmbeddingFailure {
                batch_index,
                source,
            })?;

        if vectors.len() != batch.len() {
            return Err(self.malformed(
                batch_index,
                format!("{} vectors for {} inputs", vectors.len(), batch.len()),
            ));
        }
        Ok(vectors)
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingFailure> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| self.malformed(0, "no vector returned".to_string()))
    }

    fn malformed(&self, batch_index: usize, details: String) -> EmbeddingFailure {
        EmbeddingFailure {
            batch_index,
            source: GatewayError::MalformedResponse {
                provider: self.model.name().to_string(),
                details,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("Hydraulic pressure and flow");
        let second = embedder.embed("Hydraulic pressure and flow");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        assert_eq!(embedder.embed("abc").len(), 32);
    }

    /// Encodes each text as `[len, first byte]` and finishes later batches
    /// sooner, so out-of-order completion would be visible.
    struct SkewedModel;

    #[async_trait]
    impl EmbeddingModel for SkewedModel {
        fn name(&self) -> &str {
            "skewed"
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
            let first = texts[0].as_bytes()[0];
            tokio::time::sleep(Duration::from_millis(200 - first as u64)).await;
            Ok(texts
                .iter()
                .map(|text| vec![text.len() as f32, text.as_bytes()[0] as f32])
                .collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn embed_batch_preserves_input_order_across_batches() {
        let gateway = EmbeddingGateway::new(
            Arc::new(SkewedModel),
            EmbeddingConfig {
                batch_size: 2,
                concurrency: 3,
            },
            RetryPolicy::none(),
        );
        let texts = ["a", "bb", "ccc", "dddd", "eeeee"]
            .iter()
            .map(|text| text.to_string())
            .collect::<Vec<_>>();

        let vectors = gateway.embed_batch(&texts).await.unwrap();
        let firsts = vectors.iter().map(|vector| vector[1] as u8).collect::<Vec<_>>();
        assert_eq!(firsts, b"abcde".to_vec());
        let lens = vectors.iter().map(|vector| vector[0] as usize).collect::<Vec<_>>();
        assert_eq!(lens, vec![1, 2, 3, 4, 5]);
    }

    struct FlakyModel {
        failures_left: Mutex<u32>,
        attempts: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl EmbeddingModel for FlakyModel {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
            self.attempts.lock().push(Instant::now());
            let mut failures = self.failures_left.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(GatewayError::RateLimited {
                    provider: "flaky".to_string(),
                    details: "429 Too Many Requests".to_string(),
                });
            }
            Ok(texts.iter().map(|_| vec![0.25, 0.75]).collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_batches_back_off_then_succeed() {
        let model = Arc::new(FlakyModel {
            failures_left: Mutex::new(2),
            attempts: Mutex::new(Vec::new()),
        });
        let gateway = EmbeddingGateway::new(
            model.clone(),
            EmbeddingConfig::default(),
            RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(100),
            },
        );

        let vector = gateway.embed_one("hello").await.unwrap();
        assert_eq!(vector, vec![0.25, 0.75]);

        let attempts = model.attempts.lock().clone();
        assert_eq!(attempts.len(), 3);
        let first_gap = attempts[1] - attempts[0];
        let second_gap = attempts[2] - attempts[1];
        assert!(first_gap >= Duration::from_millis(100));
        assert!(second_gap >= Duration::from_millis(200));
        assert!(second_gap > first_gap);
    }

    struct BrokenModel;

    #[async_trait]
    impl EmbeddingModel for BrokenModel {
        fn name(&self) -> &str {
            "broken"
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
            if texts.iter().any(|text| text == "poison") {
                return Err(GatewayError::Upstream {
                    provider: "broken".to_string(),
                    status: 400,
                    details: "bad input".to_string(),
                });
            }
            Ok(texts.iter().map(|_| vec![1.0]).collect())
        }
    }

    #[tokio::test]
    async fn failure_names_the_offending_batch() {
        let gateway = EmbeddingGateway::new(
            Arc::new(BrokenModel),
            EmbeddingConfig {
                batch_size: 2,
                concurrency: 1,
            },
            RetryPolicy::none(),
        );
        let texts = ["ok", "ok", "ok", "poison"]
            .iter()
            .map(|text| text.to_string())
            .collect::<Vec<_>>();

        let failure = gateway.embed_batch(&texts).await.unwrap_err();
        assert_eq!(failure.batch_index, 1);
        assert!(matches!(failure.source, GatewayError::Upstream { status: 400, .. }));
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let gateway = EmbeddingGateway::new(
            Arc::new(BrokenModel),
            EmbeddingConfig::default(),
            RetryPolicy::none(),
        );
        assert!(gateway.embed_batch(&[]).await.unwrap().is_empty());
    }
}
