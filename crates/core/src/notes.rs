//! Study notes streamed window by window over one or more documents.
//!
//! Each window's request carries the complete notes of the window before it,
//! across file boundaries too, so the model can continue without repeating
//! itself. Fragments leave in strict window order.

use crate::error::{GatewayError, IngestError};
use crate::extractor::{Extraction, TextExtractor};
use crate::models::ExtractedText;
use crate::prompt;
use crate::retry::RetryPolicy;
use crate::traits::{CompletionModel, CompletionRequest};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

const FRAGMENT_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotesMode {
    /// Structured report notes over wide windows.
    Report,
    /// Plain summaries over narrow windows.
    Summary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotesConfig {
    pub report_window: usize,
    pub summary_window: usize,
    /// Upper bound on in-flight calls in [`NotesGenerator::summarize_texts`].
    pub concurrency: usize,
}

impl Default for NotesConfig {
    fn default() -> Self {
        Self {
            report_window: 20,
            summary_window: 5,
            concurrency: 5,
        }
    }
}

impl NotesConfig {
    pub fn window(&self, mode: NotesMode) -> usize {
        match mode {
            NotesMode::Report => self.report_window,
            NotesMode::Summary => self.summary_window,
        }
        .max(1)
    }
}

/// Joins hyphenated line breaks and flattens the remaining newlines.
pub fn clean_window_text(text: &str) -> String {
    text.replace("-\n", "")
        .replace('\n', " ")
        .trim()
        .to_string()
}

/// Groups page texts into windows of `window` pages. Unpaginated text is a
/// single window.
pub fn page_windows(text: &ExtractedText, window: usize) -> Vec<String> {
    match text {
        ExtractedText::Paged(pages) => pages
            .chunks(window.max(1))
            .map(|group| {
                group
                    .iter()
                    .map(|page| page.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .collect(),
        ExtractedText::Flat(text) => vec![text.clone()],
    }
}

#[derive(Clone)]
pub struct NotesGenerator {
    completion: Arc<dyn CompletionModel>,
    extractor: Arc<dyn TextExtractor>,
    config: NotesConfig,
    retry: RetryPolicy,
}

impl NotesGenerator {
    pub fn new(
        completion: Arc<dyn CompletionModel>,
        extractor: Arc<dyn TextExtractor>,
        config: NotesConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            completion,
            extractor,
            config,
            retry,
        }
    }

    /// Streams note fragments for `paths` in order. Extraction and completion
    /// failures become inline fragments and the walk carries on. Dropping the
    /// stream stops the producer at its next send.
    pub fn stream(&self, paths: Vec<PathBuf>, mode: NotesMode) -> ReceiverStream<String> {
        let (sender, receiver) = mpsc::channel(FRAGMENT_BUFFER);
        let generator = self.clone();

        tokio::spawn(async move {
            let mut previous_summary = String::new();

            for path in paths {
                let extractor = generator.extractor.clone();
                let target = path.clone();
                let extraction =
                    match tokio::task::spawn_blocking(move || extractor.extract(&target)).await {
                        Ok(extraction) => extraction,
                        Err(error) => Extraction::Degraded {
                            path: path.clone(),
                            error: IngestError::Task(error.to_string()),
                        },
                    };

                if let Extraction::Degraded { .. } = extraction {
                    let placeholder = match extraction.into_text() {
                        ExtractedText::Flat(text) => text,
                        other => other.full_text(),
                    };
                    if sender.send(placeholder).await.is_err() {
                        return;
                    }
                    continue;
                }

                let text = extraction.into_text();
                let windows = page_windows(&text, generator.config.window(mode));
                info!(path = %path.display(), windows = windows.len(), "streaming notes");

                for window in windows {
                    let cleaned = clean_window_text(&window);
                    if cleaned.is_empty() {
                        continue;
                    }
                    match generator
                        .stream_window(&cleaned, &previous_summary, mode, &sender)
                        .await
                    {
                        WindowOutcome::Completed(summary) => previous_summary = summary,
                        WindowOutcome::Failed => {}
                        WindowOutcome::Closed => return,
                    }
                }
            }
        });

        ReceiverStream::new(receiver)
    }

    async fn stream_window(
        &self,
        cleaned: &str,
        previous_summary: &str,
        mode: NotesMode,
        sender: &mpsc::Sender<String>,
    ) -> WindowOutcome {
        let request = self.request(cleaned, previous_summary, mode);
        let completion = self.completion.clone();

        let mut fragments = match self
            .retry
            .run("notes", || completion.stream_complete(&request))
            .await
        {
            Ok(fragments) => fragments,
            Err(error) => return report_failure(error, sender).await,
        };

        let mut summary = String::new();
        while let Some(fragment) = fragments.next().await {
            match fragment {
                Ok(text) => {
                    summary.push_str(&text);
                    if sender.send(text).await.is_err() {
                        return WindowOutcome::Closed;
                    }
                }
                Err(error) => return report_failure(error, sender).await,
            }
        }
        WindowOutcome::Completed(summary)
    }

    fn request(&self, text: &str, previous_summary: &str, mode: NotesMode) -> CompletionRequest {
        CompletionRequest {
            system: Some(prompt::notes_system(mode == NotesMode::Report).to_string()),
            previous_summary: Some(previous_summary.to_string()).filter(|s| !s.is_empty()),
            ..CompletionRequest::new(prompt::notes_window(text))
        }
    }

    /// Summarizes independent pieces with at most `concurrency` calls in
    /// flight. Results are joined in input order; a failed piece becomes an
    /// inline `Error: ...` entry.
    pub async fn summarize_texts(&self, texts: Vec<String>, mode: NotesMode) -> String {
        let pieces = texts
            .into_iter()
            .map(|text| self.summarize_piece(text, mode))
            .collect::<Vec<_>>();

        stream::iter(pieces)
            .buffered(self.config.concurrency.max(1))
            .collect::<Vec<_>>()
            .await
            .join("\n\n")
    }

    async fn summarize_piece(&self, text: String, mode: NotesMode) -> String {
        let request = self.request(&clean_window_text(&text), "", mode);
        let completion = self.completion.clone();
        match self
            .retry
            .run("summarize", || completion.complete(&request))
            .await
        {
            Ok(summary) => summary,
            Err(error) => {
                warn!(%error, "summary piece failed");
                format!("Error: {error}")
            }
        }
    }
}

enum WindowOutcome {
    Completed(String),
    Failed,
    Closed,
}

async fn report_failure(error: GatewayError, sender: &mpsc::Sender<String>) -> WindowOutcome {
    warn!(%error, "notes window failed");
    if sender.send(format!("Error: {error}")).await.is_err() {
        WindowOutcome::Closed
    } else {
        WindowOutcome::Failed
    }
}
