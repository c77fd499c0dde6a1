use crate::chunking::{chunk_document, ChunkingConfig};
use crate::error::{IngestError, Result};
use crate::extractor::{DocumentFormat, Extraction, TextExtractor};
use crate::models::{Chunk, DocumentFingerprint, ExtractedText};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Supported files under `folder`, recursively, in path order.
pub fn discover_documents(folder: &Path) -> Vec<PathBuf> {
    let mut files = WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| DocumentFormat::from_path(entry.path()).is_some())
        .map(|entry| entry.path().to_path_buf())
        .collect::<Vec<_>>();

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn fingerprint_document(path: &Path) -> Result<DocumentFingerprint> {
    let checksum = digest_file(path)?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))?;

    Ok(DocumentFingerprint {
        document_id: generate_document_id(path),
        document_title: name.to_string(),
        source_path: path.to_string_lossy().to_string(),
        checksum,
        ingested_at: Utc::now(),
    })
}

fn generate_document_id(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A document read from disk and cut into chunks, ready for indexing.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub fingerprint: DocumentFingerprint,
    pub text: ExtractedText,
    pub chunks: Vec<Chunk>,
    /// Why extraction fell back to placeholder text, when it did.
    pub degraded: Option<String>,
}

/// Blocking: extraction may parse large files or call the OCR endpoint.
pub fn prepare_document(
    extractor: &dyn TextExtractor,
    path: &Path,
    config: ChunkingConfig,
) -> Result<PreparedDocument> {
    let fingerprint = fingerprint_document(path)?;

    let extraction = extractor.extract(path);
    let degraded = match &extraction {
        Extraction::Degraded { error, .. } => Some(error.to_string()),
        Extraction::Text(_) => None,
    };
    let text = extraction.into_text();

    let chunks = chunk_document(&fingerprint.document_id, &text, config)?;
    if let Some(reason) = &degraded {
        warn!(path = %path.display(), %reason, "indexing placeholder text");
    } else if text.is_blank() {
        warn!(path = %path.display(), "document has no extractable text");
    }
    info!(
        path = %path.display(),
        pages = text.pages().len(),
        chunks = chunks.len(),
        "prepared document"
    );

    Ok(PreparedDocument {
        fingerprint,
        text,
        chunks,
        degraded,
    })
}
