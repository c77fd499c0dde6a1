use crate::chunking::{chunk_document, ChunkingConfig};
use crate::embeddings::{EmbeddingConfig, EmbeddingGateway};
use crate::error::{IngestError, QaError};
use crate::extractor::{DocumentExtractor, TextExtractor};
use crate::index::{index_location, VectorIndex};
use crate::ingest::{prepare_document, PreparedDocument};
use crate::memory::ConversationMemory;
use crate::models::{
    Answer, DocumentFingerprint, ExtractedText, Grounding, PageContentMap, QueryResponse,
};
use crate::page_lookup::extract_page_reference;
use crate::prompt;
use crate::providers::{ProviderHandle, ProviderKind};
use crate::retriever::{Retriever, DEFAULT_TOP_K};
use crate::retry::RetryPolicy;
use crate::traits::{CompletionModel, CompletionRequest};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub top_k: usize,
    /// Retrieval hits below this cosine score are dropped. `None` keeps the raw top-K.
    pub min_score: Option<f32>,
    pub reset_memory_on_load: bool,
    pub max_memory_turns: Option<usize>,
    pub max_answer_tokens: Option<u32>,
    /// Use the offline trigram embedder with this many dimensions instead of
    /// the provider's embedding endpoint.
    pub local_embeddings: Option<usize>,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            min_score: None,
            reset_memory_on_load: true,
            max_memory_turns: None,
            max_answer_tokens: None,
            local_embeddings: None,
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// `ask` borrows the session mutably, so at most one question is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No generation loaded yet.
    Idle,
    Ready,
}

#[derive(Debug, Clone)]
pub struct LoadReport {
    pub document: DocumentFingerprint,
    pub chunks: usize,
    pub pages: Vec<u32>,
    pub degraded: Option<String>,
}

/// One user's question-answering session over a single loaded document.
pub struct QaSession {
    provider: ProviderKind,
    completion: Arc<dyn CompletionModel>,
    index: Arc<VectorIndex>,
    retriever: Retriever,
    extractor: Arc<dyn TextExtractor>,
    config: SessionConfig,
    pages: PageContentMap,
    memory: ConversationMemory,
    state: SessionState,
}

impl QaSession {
    pub fn new(index_root: impl Into<PathBuf>, provider: ProviderHandle, config: SessionConfig) -> Self {
        let embeddings =
            EmbeddingGateway::new(provider.embeddings.clone(), config.embedding, config.retry);
        let index = Arc::new(VectorIndex::new(index_root, embeddings.clone()));
        let retriever = Retriever::new(index.clone(), embeddings).with_min_score(config.min_score);
        let memory = match config.max_memory_turns {
            Some(limit) => ConversationMemory::with_limit(limit),
            None => ConversationMemory::new(),
        };

        Self {
            provider: provider.kind,
            completion: provider.completion,
            index,
            retriever,
            extractor: Arc::new(DocumentExtractor::from_env()),
            config,
            pages: PageContentMap::default(),
            memory,
            state: SessionState::Idle,
        }
    }

    /// Resolves `provider_name` against the environment and scopes the index
    /// to `<base_dir>/<corpus>/<provider>`.
    pub fn open(
        base_dir: &Path,
        corpus: &str,
        provider_name: &str,
        config: SessionConfig,
    ) -> Result<Self, QaError> {
        let kind = provider_name.parse::<ProviderKind>()?;
        let mut handle = kind
            .connect(kind.settings_from_env())
            .map_err(QaError::ProviderSetup)?;

        let scope = match config.local_embeddings {
            Some(dimensions) => {
                handle = handle.with_local_embeddings(dimensions.max(1));
                format!("{kind}-local{dimensions}")
            }
            None => kind.to_string(),
        };

        Ok(Self::new(index_location(base_dir, corpus, &scope), handle, config))
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    /// Sorted page numbers of the loaded document.
    pub fn page_numbers(&self) -> Vec<u32> {
        self.pages.page_numbers()
    }

    pub fn page_text(&self, page: u32) -> Option<&str> {
        self.pages.get(page)
    }

    /// Clears conversation memory; the loaded document stays.
    pub fn reset(&mut self) {
        self.memory.clear();
    }

    /// Picks up the generation persisted by an earlier process. Page text is
    /// recovered from the stored chunks.
    pub async fn resume(&mut self) -> Result<usize, QaError> {
        let snapshot = self.index.load().await?;
        self.pages = PageContentMap::from_chunks(snapshot.chunks());
        self.state = SessionState::Ready;

        info!(
            generation = %snapshot.manifest().generation_id,
            chunks = snapshot.chunks().len(),
            pages = self.pages.page_numbers().len(),
            "resumed session"
        );
        Ok(snapshot.chunks().len())
    }

    /// Replaces the session's document. On failure the previous document,
    /// index generation and page map stay in place.
    pub async fn load_document(&mut self, path: &Path) -> Result<LoadReport, QaError> {
        let extractor = self.extractor.clone();
        let chunking = self.config.chunking;
        let owned = path.to_path_buf();

        let prepared = tokio::task::spawn_blocking(move || {
            prepare_document(extractor.as_ref(), &owned, chunking)
        })
        .await
        .map_err(|error| IngestError::Task(error.to_string()))??;

        self.install(prepared).await
    }

    /// Loads text that was extracted elsewhere.
    pub async fn load_extracted(
        &mut self,
        document_id: &str,
        text: ExtractedText,
    ) -> Result<LoadReport, QaError> {
        let chunks = chunk_document(document_id, &text, self.config.chunking)?;
        let mut hasher = Sha256::new();
        hasher.update(text.full_text().as_bytes());

        let fingerprint = DocumentFingerprint {
            document_id: document_id.to_string(),
            document_title: document_id.to_string(),
            source_path: String::new(),
            checksum: format!("{:x}", hasher.finalize()),
            ingested_at: Utc::now(),
        };

        self.install(PreparedDocument {
            fingerprint,
            text,
            chunks,
            degraded: None,
        })
        .await
    }

    async fn install(&mut self, prepared: PreparedDocument) -> Result<LoadReport, QaError> {
        let PreparedDocument {
            fingerprint,
            text,
            chunks,
            degraded,
        } = prepared;

        let snapshot = self.index.build_from(&fingerprint, chunks).await?;

        self.pages = PageContentMap::from_extracted(&text);
        if self.config.reset_memory_on_load {
            self.memory.clear();
        }
        self.state = SessionState::Ready;

        info!(
            document = %fingerprint.document_title,
            chunks = snapshot.chunks().len(),
            pages = self.pages.page_numbers().len(),
            "document loaded"
        );

        Ok(LoadReport {
            document: fingerprint,
            chunks: snapshot.chunks().len(),
            pages: self.pages.page_numbers(),
            degraded,
        })
    }

    /// Answers from a named page when the query points at one that exists,
    /// otherwise from retrieved chunks. Completion failures come back as an
    /// answer flagged `degraded` and are left out of memory.
    pub async fn ask(&mut self, query: &str) -> Result<Answer, QaError> {
        if !self.index.is_loaded() {
            return Err(QaError::NoDocumentLoaded);
        }
        if query.trim().is_empty() {
            return Err(QaError::EmptyQuery);
        }

        self.answer(query).await
    }

    /// [`QaSession::ask`] flattened into the `{answer}` / `{error}` shape.
    pub async fn query(&mut self, query: &str) -> QueryResponse {
        QueryResponse::from_result(self.ask(query).await)
    }

    async fn answer(&mut self, query: &str) -> Result<Answer, QaError> {
        let page = extract_page_reference(query)
            .and_then(|number| self.pages.get(number).map(|text| (number, text.to_string())));

        if let Some((number, text)) = page {
            debug!(page = number, "answering from page text");
            let request = CompletionRequest {
                history: self.memory.turns(),
                max_tokens: self.config.max_answer_tokens,
                ..CompletionRequest::new(prompt::page_question(&text, query))
            };
            return Ok(self.complete(query, request, Grounding::Page { number, text }).await);
        }

        let hits = self.retriever.retrieve(query, self.config.top_k).await?;
        if hits.is_empty() {
            return Ok(Answer {
                text: prompt::NO_RELEVANT_INFORMATION.to_string(),
                grounding: Grounding::Nothing,
                degraded: false,
            });
        }

        let grounding = Grounding::Retrieved(hits);
        let request = CompletionRequest {
            system: Some(prompt::QA_INSTRUCTIONS.to_string()),
            history: self.memory.turns(),
            max_tokens: self.config.max_answer_tokens,
            ..CompletionRequest::new(prompt::grounded_question(&grounding.context_text(), query))
        };
        Ok(self.complete(query, request, grounding).await)
    }

    async fn complete(
        &mut self,
        query: &str,
        request: CompletionRequest,
        grounding: Grounding,
    ) -> Answer {
        let completion = self.completion.clone();
        let outcome = self
            .config
            .retry
            .run("complete", || completion.complete(&request))
            .await;

        match outcome {
            Ok(text) => {
                self.memory.record_exchange(query, &text);
                Answer {
                    text,
                    grounding,
                    degraded: false,
                }
            }
            Err(error) => {
                warn!(%error, "completion failed");
                Answer {
                    text: format!("Error: {error}"),
                    grounding,
                    degraded: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::IndexError;
    use crate::models::{PageText, Role};
    use crate::testing::{Reply, ScriptedModel};
    use tempfile::tempdir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn session(dir: &Path, model: Arc<ScriptedModel>) -> QaSession {
        let handle = ProviderHandle::new(
            ProviderKind::ChatGpt,
            Arc::new(CharacterNgramEmbedder::default()),
            model,
        );
        QaSession::new(
            dir,
            handle,
            SessionConfig {
                retry: RetryPolicy::none(),
                ..SessionConfig::default()
            },
        )
    }

    fn three_pages() -> ExtractedText {
        ExtractedText::Paged(vec![
            PageText {
                number: 1,
                text: "Thermodynamics studies heat and work.".to_string(),
            },
            PageText {
                number: 2,
                text: "Entropy always grows. UNIQUE_MARKER_42 appears here.".to_string(),
            },
            PageText {
                number: 3,
                text: "Engines convert heat into motion.".to_string(),
            },
        ])
    }

    #[tokio::test]
    async fn named_page_takes_precedence_over_retrieval() -> TestResult {
        let dir = tempdir()?;
        let model = Arc::new(ScriptedModel::answering("page answer"));
        let mut session = session(dir.path(), model.clone());
        session.load_extracted("thermo", three_pages()).await?;

        let answer = session.ask("what is on the 2nd page?").await?;

        assert_eq!(
            answer.grounding,
            Grounding::Page {
                number: 2,
                text: "Entropy always grows. UNIQUE_MARKER_42 appears here.".to_string(),
            }
        );
        assert_eq!(answer.text, "page answer");
        assert!(model.requests()[0].prompt.contains("UNIQUE_MARKER_42"));
        assert_eq!(session.state(), SessionState::Ready);
        Ok(())
    }

    #[tokio::test]
    async fn missing_page_falls_through_to_retrieval() -> TestResult {
        let dir = tempdir()?;
        let model = Arc::new(ScriptedModel::answering("retrieved answer"));
        let mut session = session(dir.path(), model.clone());
        session.load_extracted("thermo", three_pages()).await?;

        let answer = session.ask("what is on page 9 about engines?").await?;

        match answer.grounding {
            Grounding::Retrieved(hits) => assert_eq!(hits.len(), 3),
            other => panic!("expected retrieval grounding, got {other:?}"),
        }
        assert_eq!(
            model.requests()[0].system.as_deref(),
            Some(prompt::QA_INSTRUCTIONS)
        );
        Ok(())
    }

    #[tokio::test]
    async fn empty_corpus_answers_without_calling_the_model() -> TestResult {
        let dir = tempdir()?;
        let model = Arc::new(ScriptedModel::answering("should not be used"));
        let mut session = session(dir.path(), model.clone());
        let report = session
            .load_extracted("blank", ExtractedText::Flat("   ".to_string()))
            .await?;
        assert_eq!(report.chunks, 0);

        let answer = session.ask("anything at all?").await?;
        assert_eq!(answer.text, prompt::NO_RELEVANT_INFORMATION);
        assert_eq!(answer.grounding, Grounding::Nothing);
        assert!(model.requests().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn asking_before_loading_reports_no_document() -> TestResult {
        let dir = tempdir()?;
        let mut session = session(dir.path(), Arc::new(ScriptedModel::answering("x")));

        assert!(matches!(
            session.ask("hello?").await,
            Err(QaError::NoDocumentLoaded)
        ));
        assert_eq!(
            serde_json::to_string(&session.query("hello?").await)?,
            r#"{"error":"No document uploaded yet."}"#
        );
        assert_eq!(session.state(), SessionState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn memory_carries_previous_exchanges_until_reset() -> TestResult {
        let dir = tempdir()?;
        let model = Arc::new(
            ScriptedModel::answering("later")
                .then(Reply::Text("first answer".to_string())),
        );
        let mut session = session(dir.path(), model.clone());
        session.load_extracted("thermo", three_pages()).await?;

        session.ask("what is entropy?").await?;
        session.ask("and engines?").await?;

        let history = &model.requests()[1].history;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].text, "what is entropy?");
        assert_eq!(history[1].text, "first answer");
        assert_eq!(session.memory().len(), 4);

        session.reset();
        assert!(session.memory().is_empty());
        assert_eq!(session.page_numbers(), vec![1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn failed_completion_is_an_answer_and_skips_memory() -> TestResult {
        let dir = tempdir()?;
        let model = Arc::new(
            ScriptedModel::answering("recovered").then(Reply::Fail("upstream down".to_string())),
        );
        let mut session = session(dir.path(), model);
        session.load_extracted("thermo", three_pages()).await?;

        let failed = session.ask("what is entropy?").await?;
        assert!(failed.degraded);
        assert!(failed.text.starts_with("Error:"));
        assert!(failed.text.contains("upstream down"));
        assert!(session.memory().is_empty());

        let answer = session.ask("what is entropy?").await?;
        assert!(!answer.degraded);
        assert_eq!(session.memory().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn loading_a_new_document_replaces_pages_index_and_memory() -> TestResult {
        let dir = tempdir()?;
        let model = Arc::new(ScriptedModel::answering("ok"));
        let mut session = session(dir.path(), model);
        session.load_extracted("thermo", three_pages()).await?;
        session.ask("what is entropy?").await?;

        let rockets = ExtractedText::Paged(vec![PageText {
            number: 1,
            text: "Rockets carry oxidizer.".to_string(),
        }]);
        session.load_extracted("rockets", rockets).await?;

        assert_eq!(session.page_numbers(), vec![1]);
        assert!(session.memory().is_empty());

        let answer = session.ask("Thermodynamics studies heat and work.").await?;
        match answer.grounding {
            Grounding::Retrieved(hits) => {
                assert!(hits.iter().all(|hit| hit.chunk.source_document == "rockets"))
            }
            other => panic!("expected retrieval grounding, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn resumed_session_recovers_pages_from_chunk_store() -> TestResult {
        let dir = tempdir()?;
        let model = Arc::new(ScriptedModel::answering("ok"));

        let mut first = session(dir.path(), model.clone());
        first.load_extracted("thermo", three_pages()).await?;

        let mut second = session(dir.path(), model);
        assert!(matches!(
            second.ask("what is on page 2?").await,
            Err(QaError::NoDocumentLoaded)
        ));

        assert_eq!(second.resume().await?, 3);
        assert_eq!(second.page_numbers(), vec![1, 2, 3]);

        let answer = second.ask("what is on page 2?").await?;
        assert!(matches!(answer.grounding, Grounding::Page { number: 2, .. }));
        assert_eq!(
            second.page_text(2),
            Some("Entropy always grows. UNIQUE_MARKER_42 appears here.")
        );
        Ok(())
    }

    #[tokio::test]
    async fn session_can_be_driven_from_a_spawned_task() -> TestResult {
        let dir = tempdir()?;
        let mut session = session(dir.path(), Arc::new(ScriptedModel::answering("spawned")));

        let answer = tokio::spawn(async move {
            session.load_extracted("thermo", three_pages()).await?;
            let answer = session.ask("how do engines use heat?").await?;
            Ok::<_, QaError>(answer)
        })
        .await??;

        assert_eq!(answer.text, "spawned");
        assert!(matches!(answer.grounding, Grounding::Retrieved(_)));
        Ok(())
    }

    #[tokio::test]
    async fn resume_without_persisted_index_is_not_found() -> TestResult {
        let dir = tempdir()?;
        let mut session = session(dir.path(), Arc::new(ScriptedModel::answering("x")));

        assert!(matches!(
            session.resume().await,
            Err(QaError::Index(IndexError::NotFound(_)))
        ));
        Ok(())
    }

    #[test]
    fn unknown_provider_is_rejected() -> TestResult {
        let dir = tempdir()?;
        let result = QaSession::open(dir.path(), "course", "claude", SessionConfig::default());
        assert!(matches!(result, Err(QaError::UnknownProvider(name)) if name == "claude"));
        Ok(())
    }
}
