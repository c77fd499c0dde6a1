use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("spreadsheet error: {0}")]
    Spreadsheet(String),

    #[error("presentation error: {0}")]
    Presentation(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("multimodal OCR failed: {0}")]
    OcrFailed(String),

    #[error("no OCR endpoint configured for {0}")]
    OcrUnavailable(String),

    #[error("extraction task failed: {0}")]
    Task(String),
}

/// Failure of an upstream embedding or completion call.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{provider} rate limited the request: {details}")]
    RateLimited { provider: String, details: String },

    #[error("{provider} returned {status}: {details}")]
    Upstream {
        provider: String,
        status: u16,
        details: String,
    },

    #[error("malformed response from {provider}: {details}")]
    MalformedResponse { provider: String, details: String },

    #[error("missing credentials for {0}")]
    MissingCredentials(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl GatewayError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, GatewayError::RateLimited { .. })
    }
}

#[derive(Debug, Error)]
#[error("embedding batch {batch_index} failed: {source}")]
pub struct EmbeddingFailure {
    pub batch_index: usize,
    #[source]
    pub source: GatewayError,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("no persisted index under {0}")]
    NotFound(String),

    #[error("no index generation is loaded")]
    NotLoaded,

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("embedding count {vectors} doesn't match chunk count {chunks}")]
    Parity { vectors: usize, chunks: usize },

    #[error("vector dimension {found} != {expected}")]
    Dimension { expected: usize, found: usize },

    #[error(transparent)]
    Embedding(#[from] EmbeddingFailure),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum QaError {
    #[error("No document uploaded yet.")]
    NoDocumentLoaded,

    #[error("query is empty")]
    EmptyQuery,

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider setup failed: {0}")]
    ProviderSetup(GatewayError),

    #[error(transparent)]
    Index(IndexError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingFailure),

    #[error("completion failed: {0}")]
    Completion(#[from] GatewayError),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}

impl From<IndexError> for QaError {
    fn from(value: IndexError) -> Self {
        match value {
            IndexError::NotLoaded => QaError::NoDocumentLoaded,
            IndexError::Embedding(failure) => QaError::Embedding(failure),
            other => QaError::Index(other),
        }
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
