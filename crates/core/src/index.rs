//! Persisted flat vector index with a parallel chunk store.
//!
//! On-disk layout under one corpus/provider directory:
//!
//! ```text
//! CURRENT                      id of the live generation
//! generations/<id>/manifest.json
//! generations/<id>/vectors.json
//! generations/<id>/chunks.json
//! ```
//!
//! A build writes `generations/.tmp-<id>`, re-reads it to verify parity,
//! renames it into place and only then swaps `CURRENT`. The previous
//! generation is removed after the swap.

use crate::embeddings::EmbeddingGateway;
use crate::error::IndexError;
use crate::models::{Chunk, DocumentFingerprint, RetrievedChunk};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

const CURRENT_POINTER: &str = "CURRENT";
const STAGED_POINTER: &str = "CURRENT.tmp";
const GENERATIONS_DIR: &str = "generations";
const TEMP_PREFIX: &str = ".tmp-";
const MANIFEST_FILE: &str = "manifest.json";
const VECTORS_FILE: &str = "vectors.json";
const CHUNKS_FILE: &str = "chunks.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationManifest {
    pub generation_id: String,
    pub source_document: String,
    pub source_checksum: Option<String>,
    pub embedding_model: String,
    pub dimensions: usize,
    pub count: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VectorArtifact {
    dimensions: usize,
    vectors: Vec<Vec<f32>>,
}

/// One complete, immutable index generation.
#[derive(Debug)]
pub struct IndexSnapshot {
    manifest: GenerationManifest,
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
}

impl IndexSnapshot {
    pub fn manifest(&self) -> &GenerationManifest {
        &self.manifest
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn vector_count(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Cosine similarity, best first; equal scores keep chunk order.
    pub fn search(&self, query_vector: &[f32], k: usize) -> Vec<RetrievedChunk> {
        let mut scored = self
            .vectors
            .iter()
            .enumerate()
            .map(|(position, vector)| (position, cosine_similarity(query_vector, vector)))
            .collect::<Vec<_>>();

        scored.sort_by(|(left_pos, left), (right_pos, right)| {
            right.total_cmp(left).then_with(|| {
                self.chunks[*left_pos]
                    .sequence_index
                    .cmp(&self.chunks[*right_pos].sequence_index)
            })
        });

        scored
            .into_iter()
            .take(k)
            .map(|(position, score)| RetrievedChunk {
                chunk: self.chunks[position].clone(),
                score,
            })
            .collect()
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() {
        return 0.0;
    }
    let dot = left.iter().zip(right).map(|(a, b)| a * b).sum::<f32>();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        0.0
    } else {
        dot / (left_norm * right_norm)
    }
}

/// `<base>/<corpus>/<provider>`; one index per corpus and provider pairing.
pub fn index_location(base: &Path, corpus: &str, provider: &str) -> PathBuf {
    base.join(sanitize(corpus)).join(sanitize(provider))
}

fn sanitize(component: &str) -> String {
    let cleaned = component
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect::<String>();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

/// Single-writer, many-reader index. Readers clone the live snapshot and
/// never observe a generation that is still being written.
pub struct VectorIndex {
    root: PathBuf,
    embeddings: EmbeddingGateway,
    current: RwLock<Option<Arc<IndexSnapshot>>>,
    writer: Mutex<()>,
}

impl VectorIndex {
    pub fn new(root: impl Into<PathBuf>, embeddings: EmbeddingGateway) -> Self {
        Self {
            root: root.into(),
            embeddings,
            current: RwLock::new(None),
            writer: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.current.read().clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.current.read().is_some()
    }

    /// Builds a generation from chunks whose source is not fingerprinted.
    pub async fn build(&self, chunks: Vec<Chunk>) -> Result<Arc<IndexSnapshot>, IndexError> {
        let source = chunks
            .first()
            .map(|chunk| chunk.source_document.clone())
            .unwrap_or_default();
        let _guard = self.writer.lock().await;
        self.build_locked(source, None, chunks).await
    }

    pub async fn build_from(
        &self,
        document: &DocumentFingerprint,
        chunks: Vec<Chunk>,
    ) -> Result<Arc<IndexSnapshot>, IndexError> {
        let _guard = self.writer.lock().await;
        self.build_locked(
            document.document_id.clone(),
            Some(document.checksum.clone()),
            chunks,
        )
        .await
    }

    pub async fn load(&self) -> Result<Arc<IndexSnapshot>, IndexError> {
        let _guard = self.writer.lock().await;

        let generation_id = match fs::read_to_string(self.root.join(CURRENT_POINTER)).await {
            Ok(id) => id.trim().to_string(),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(IndexError::NotFound(self.root.display().to_string()));
            }
            Err(error) => return Err(error.into()),
        };
        let directory = self.generations_dir().join(&generation_id);

        let chunks: Vec<Chunk> = match read_json(&directory.join(CHUNKS_FILE)).await {
            Ok(chunks) => chunks,
            Err(error) => {
                return Err(IndexError::CorruptIndex(format!(
                    "chunk store for generation {generation_id} is unreadable: {error}"
                )));
            }
        };
        let manifest = read_json::<GenerationManifest>(&directory.join(MANIFEST_FILE))
            .await
            .ok();

        let checked = match read_json::<VectorArtifact>(&directory.join(VECTORS_FILE)).await {
            Err(error) => Err(error.to_string()),
            Ok(artifact) if !artifact_matches(&artifact, chunks.len()) => Err(format!(
                "{} vectors for {} chunks",
                artifact.vectors.len(),
                chunks.len()
            )),
            Ok(artifact) => match &manifest {
                Some(manifest) if manifest.count != chunks.len() => Err(format!(
                    "manifest records {} chunks, store holds {}",
                    manifest.count,
                    chunks.len()
                )),
                _ => Ok(artifact),
            },
        };

        let artifact = match checked {
            Ok(artifact) => artifact,
            Err(reason) => {
                warn!(generation = %generation_id, %reason, "index mismatch detected, rebuilding");
                let (source, checksum) = match manifest {
                    Some(manifest) => (manifest.source_document, manifest.source_checksum),
                    None => (source_of(&chunks), None),
                };
                return self
                    .build_locked(source, checksum, chunks)
                    .await
                    .map_err(|error| {
                        IndexError::CorruptIndex(format!(
                            "generation {generation_id} ({reason}) could not be rebuilt: {error}"
                        ))
                    });
            }
        };

        let manifest = manifest.unwrap_or_else(|| GenerationManifest {
            generation_id: generation_id.clone(),
            source_document: source_of(&chunks),
            source_checksum: None,
            embedding_model: self.embeddings.model_name().to_string(),
            dimensions: artifact.dimensions,
            count: chunks.len(),
            created_at: Utc::now(),
        });
        let snapshot = Arc::new(IndexSnapshot {
            manifest,
            chunks,
            vectors: artifact.vectors,
        });
        info!(
            generation = %generation_id,
            chunks = snapshot.chunks.len(),
            "loaded index generation"
        );
        *self.current.write() = Some(snapshot.clone());
        Ok(snapshot)
    }

    pub fn search(&self, query_vector: &[f32], k: usize) -> Result<Vec<RetrievedChunk>, IndexError> {
        let snapshot = self.snapshot().ok_or(IndexError::NotLoaded)?;
        if !snapshot.is_empty() && query_vector.len() != snapshot.manifest.dimensions {
            return Err(IndexError::Dimension {
                expected: snapshot.manifest.dimensions,
                found: query_vector.len(),
            });
        }
        Ok(snapshot.search(query_vector, k))
    }

    fn generations_dir(&self) -> PathBuf {
        self.root.join(GENERATIONS_DIR)
    }

    async fn build_locked(
        &self,
        source_document: String,
        source_checksum: Option<String>,
        chunks: Vec<Chunk>,
    ) -> Result<Arc<IndexSnapshot>, IndexError> {
        let texts = chunks.iter().map(|chunk| chunk.text.clone()).collect::<Vec<_>>();
        let vectors = self.embeddings.embed_batch(&texts).await?;

        if vectors.len() != chunks.len() {
            return Err(IndexError::Parity {
                vectors: vectors.len(),
                chunks: chunks.len(),
            });
        }

        let generation_id = Uuid::new_v4().simple().to_string();
        let dimensions = vectors.first().map(Vec::len).unwrap_or_default();
        let manifest = GenerationManifest {
            generation_id: generation_id.clone(),
            source_document,
            source_checksum,
            embedding_model: self.embeddings.model_name().to_string(),
            dimensions,
            count: chunks.len(),
            created_at: Utc::now(),
        };
        let artifact = VectorArtifact {
            dimensions,
            vectors,
        };

        let generations = self.generations_dir();
        let staging = generations.join(format!("{TEMP_PREFIX}{generation_id}"));
        let published = generations.join(&generation_id);

        if let Err(error) = self
            .stage_generation(&staging, &manifest, &artifact, &chunks)
            .await
        {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(error);
        }
        if let Err(error) = fs::rename(&staging, &published).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(error.into());
        }
        self.swap_pointer(&generation_id).await?;

        let snapshot = Arc::new(IndexSnapshot {
            manifest,
            chunks,
            vectors: artifact.vectors,
        });
        *self.current.write() = Some(snapshot.clone());

        self.remove_stale_generations(&generation_id).await;
        info!(
            generation = %generation_id,
            chunks = snapshot.chunks.len(),
            dimensions,
            "built index generation"
        );
        Ok(snapshot)
    }

    async fn stage_generation(
        &self,
        staging: &Path,
        manifest: &GenerationManifest,
        artifact: &VectorArtifact,
        chunks: &[Chunk],
    ) -> Result<(), IndexError> {
        fs::create_dir_all(staging).await?;
        fs::write(staging.join(CHUNKS_FILE), serde_json::to_vec(chunks)?).await?;
        fs::write(staging.join(VECTORS_FILE), serde_json::to_vec(artifact)?).await?;
        fs::write(staging.join(MANIFEST_FILE), serde_json::to_vec_pretty(manifest)?).await?;

        let stored_chunks: Vec<Chunk> = read_json(&staging.join(CHUNKS_FILE)).await?;
        let stored_vectors: VectorArtifact = read_json(&staging.join(VECTORS_FILE)).await?;
        if stored_chunks.len() != chunks.len() || !artifact_matches(&stored_vectors, chunks.len()) {
            return Err(IndexError::Parity {
                vectors: stored_vectors.vectors.len(),
                chunks: stored_chunks.len(),
            });
        }
        Ok(())
    }

    async fn swap_pointer(&self, generation_id: &str) -> Result<(), IndexError> {
        let pointer = self.root.join(CURRENT_POINTER);
        let staged = self.root.join(STAGED_POINTER);
        fs::write(&staged, generation_id.as_bytes()).await?;
        fs::rename(&staged, &pointer).await?;
        Ok(())
    }

    async fn remove_stale_generations(&self, keep: &str) {
        let mut entries = match fs::read_dir(self.generations_dir()).await {
            Ok(entries) => entries,
            Err(error) => {
                warn!(%error, "could not list index generations");
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name().to_string_lossy() == keep {
                continue;
            }
            if let Err(error) = fs::remove_dir_all(entry.path()).await {
                warn!(path = %entry.path().display(), %error, "could not remove stale generation");
            }
        }
    }
}

fn artifact_matches(artifact: &VectorArtifact, chunk_count: usize) -> bool {
    artifact.vectors.len() == chunk_count
        && artifact
            .vectors
            .iter()
            .all(|vector| vector.len() == artifact.dimensions)
}

fn source_of(chunks: &[Chunk]) -> String {
    chunks
        .first()
        .map(|chunk| chunk.source_document.clone())
        .unwrap_or_default()
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, IndexError> {
    let bytes = fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}
