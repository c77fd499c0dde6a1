pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod index;
pub mod ingest;
pub mod memory;
pub mod models;
pub mod notes;
pub mod orchestrator;
pub mod page_lookup;
pub mod prompt;
pub mod providers;
pub mod retriever;
pub mod retry;
pub mod traits;

#[cfg(test)]
mod testing;

pub use chunking::{chunk_document, normalize_whitespace, sliding_windows, ChunkingConfig};
pub use embeddings::{
    CharacterNgramEmbedder, EmbeddingConfig, EmbeddingGateway, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{EmbeddingFailure, GatewayError, IndexError, IngestError, QaError};
pub use extractor::{DocumentExtractor, DocumentFormat, Extraction, OcrEndpointConfig, TextExtractor};
pub use index::{index_location, GenerationManifest, IndexSnapshot, VectorIndex};
pub use ingest::{digest_file, discover_documents, fingerprint_document, prepare_document, PreparedDocument};
pub use memory::ConversationMemory;
pub use models::{
    Answer, Chunk, DocumentFingerprint, ExtractedText, Grounding, PageContentMap,
    PageText, QueryResponse, RetrievedChunk, Role, Turn,
};
pub use notes::{NotesConfig, NotesGenerator, NotesMode};
pub use orchestrator::{LoadReport, QaSession, SessionConfig, SessionState};
pub use page_lookup::extract_page_reference;
pub use providers::{ProviderHandle, ProviderKind, ProviderSettings};
pub use retriever::{Retriever, DEFAULT_TOP_K};
pub use retry::RetryPolicy;
pub use traits::{CompletionModel, CompletionRequest, EmbeddingModel, TextStream};
