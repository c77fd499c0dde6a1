use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentFingerprint {
    pub document_id: String,
    pub document_title: String,
    pub source_path: String,
    pub checksum: String,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

/// Text recovered from one source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractedText {
    /// Paginated formats, ordered by page number (1-based).
    Paged(Vec<PageText>),
    /// Formats without page structure.
    Flat(String),
}

impl ExtractedText {
    pub fn is_blank(&self) -> bool {
        match self {
            ExtractedText::Paged(pages) => pages.iter().all(|page| page.text.trim().is_empty()),
            ExtractedText::Flat(text) => text.trim().is_empty(),
        }
    }

    pub fn pages(&self) -> &[PageText] {
        match self {
            ExtractedText::Paged(pages) => pages,
            ExtractedText::Flat(_) => &[],
        }
    }

    /// All text, pages joined with newlines.
    pub fn full_text(&self) -> String {
        match self {
            ExtractedText::Paged(pages) => pages
                .iter()
                .map(|page| page.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            ExtractedText::Flat(text) => text.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub source_page: Option<u32>,
    pub source_document: String,
    pub sequence_index: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Page number to raw page text for the currently loaded document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContentMap {
    pages: BTreeMap<u32, String>,
}

impl PageContentMap {
    pub fn from_extracted(extracted: &ExtractedText) -> Self {
        let pages = extracted
            .pages()
            .iter()
            .map(|page| (page.number, page.text.clone()))
            .collect();
        Self { pages }
    }

    /// Rebuilds page text from a chunk store, joining each page's chunks in
    /// sequence order. Overlapping windows are kept as stored.
    pub fn from_chunks(chunks: &[Chunk]) -> Self {
        let mut ordered = chunks.iter().collect::<Vec<_>>();
        ordered.sort_by_key(|chunk| chunk.sequence_index);

        let mut pages = BTreeMap::<u32, Vec<&str>>::new();
        for chunk in ordered {
            if let Some(page) = chunk.source_page {
                pages.entry(page).or_default().push(&chunk.text);
            }
        }

        Self {
            pages: pages
                .into_iter()
                .map(|(page, texts)| (page, texts.join("\n")))
                .collect(),
        }
    }

    pub fn get(&self, page: u32) -> Option<&str> {
        self.pages.get(&page).map(String::as_str)
    }

    pub fn page_numbers(&self) -> Vec<u32> {
        self.pages.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// What an answer was conditioned on.
#[derive(Debug, Clone, PartialEq)]
pub enum Grounding {
    Page { number: u32, text: String },
    Retrieved(Vec<RetrievedChunk>),
    Nothing,
}

impl Grounding {
    pub fn context_text(&self) -> String {
        match self {
            Grounding::Page { text, .. } => text.clone(),
            Grounding::Retrieved(hits) => hits
                .iter()
                .map(|hit| hit.chunk.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            Grounding::Nothing => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub text: String,
    pub grounding: Grounding,
    /// Set when the completion call failed and `text` carries the error.
    pub degraded: bool,
}

/// Value handed back across the query boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum QueryResponse {
    Answer { answer: String },
    Error { error: String },
}

impl QueryResponse {
    pub fn from_result<E: std::fmt::Display>(result: Result<Answer, E>) -> Self {
        match result {
            Ok(answer) => QueryResponse::Answer {
                answer: answer.text,
            },
            Err(error) => QueryResponse::Error {
                error: error.to_string(),
            },
        }
    }
}
