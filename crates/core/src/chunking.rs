use crate::error::IngestError;
use crate::models::{Chunk, ExtractedText};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            overlap: 100,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be positive".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than chunk_size {}",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    fn step(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fixed-size character windows advancing by `chunk_size - overlap`.
/// Whitespace-only windows are dropped.
pub fn sliding_windows(text: &str, config: ChunkingConfig) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut windows = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + config.chunk_size).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            windows.push(piece.to_string());
        }
        if end == chars.len() {
            break;
        }
        start += config.step();
    }

    windows
}

/// Splits extracted text into chunks. Each page is whitespace-normalized and
/// windowed on its own, so a chunk never crosses a page boundary.
pub fn chunk_document(
    document_id: &str,
    extracted: &ExtractedText,
    config: ChunkingConfig,
) -> Result<Vec<Chunk>, IngestError> {
    config.validate()?;

    let mut chunks = Vec::new();
    let mut cursor = 0u64;

    let mut push = |page: Option<u32>, text: &str, chunks: &mut Vec<Chunk>| {
        for window in sliding_windows(&normalize_whitespace(text), config) {
            chunks.push(Chunk {
                id: make_chunk_id(document_id, page, cursor, &window),
                text: window,
                source_page: page,
                source_document: document_id.to_string(),
                sequence_index: cursor,
            });
            cursor += 1;
        }
    };

    match extracted {
        ExtractedText::Paged(pages) => {
            for page in pages {
                push(Some(page.number), &page.text, &mut chunks);
            }
        }
        ExtractedText::Flat(text) => push(None, text, &mut chunks),
    }

    Ok(chunks)
}

fn make_chunk_id(document_id: &str, page: Option<u32>, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(page.unwrap_or(0).to_le_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
