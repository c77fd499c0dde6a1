//! Prompt templates for grounded answers and study notes.

pub const NO_RELEVANT_INFORMATION: &str =
    "I couldn't find relevant information in the uploaded document.";

pub const QA_INSTRUCTIONS: &str = "You are a precise exam assistant. Answer strictly from the \
provided document context and add no outside information. Quote definitions, examples and \
worked solutions exactly as they appear. If the context does not contain the answer, reply: \
\"I couldn't find relevant information in the uploaded document.\"";

const REPORT_NOTES: &str = "You are a STEM teacher turning extracted document text into \
structured, exam-ready study notes. Keep definitions verbatim, break derivations into steps, \
use headings and bullet points, and continue seamlessly from any earlier notes without \
repeating them. Produce notes only, no introduction or conclusion.";

const SUMMARY_NOTES: &str = "Condense the following extracted text into clear, concise notes. \
Keep definitions verbatim and use bullet points. Continue from any earlier notes without \
repeating them.";

/// Retrieval-grounded question: context in rank order, then the question.
pub fn grounded_question(context: &str, question: &str) -> String {
    format!("Context:\n{context}\n\nQuestion: {question}")
}

pub fn page_question(page_text: &str, question: &str) -> String {
    format!(
        "Summarize the following content and answer the user's question: {page_text}\nQuestion: {question}"
    )
}

pub fn notes_system(structured_report: bool) -> &'static str {
    if structured_report {
        REPORT_NOTES
    } else {
        SUMMARY_NOTES
    }
}

pub fn notes_window(text: &str) -> String {
    format!("Continue processing the next chunk of text:\n{text}")
}
