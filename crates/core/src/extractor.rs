use crate::error::IngestError;
use crate::models::{ExtractedText, PageText};
use base64::{engine::general_purpose::STANDARD, Engine};
use calamine::Reader as _;
use lopdf::Document;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::warn;

const FORM_FEED: char = '\u{000c}';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    PlainText,
    Image,
    Slides,
    Spreadsheet,
}

impl DocumentFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "pdf" => Some(Self::Pdf),
            "txt" | "text" | "md" | "csv" => Some(Self::PlainText),
            "png" | "jpg" | "jpeg" | "tif" | "tiff" | "bmp" | "webp" => Some(Self::Image),
            "pptx" => Some(Self::Slides),
            "xlsx" | "xlsm" | "xls" | "ods" => Some(Self::Spreadsheet),
            _ => None,
        }
    }

    fn mime_type(self, path: &Path) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Image => match path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(str::to_ascii_lowercase)
                .as_deref()
            {
                Some("png") => "image/png",
                Some("tif") | Some("tiff") => "image/tiff",
                Some("bmp") => "image/bmp",
                Some("webp") => "image/webp",
                _ => "image/jpeg",
            },
            _ => "application/octet-stream",
        }
    }
}

/// Outcome of extracting one file. Failures are values, not errors, so a
/// batch of files always runs to completion.
#[derive(Debug)]
pub enum Extraction {
    Text(ExtractedText),
    Degraded { path: PathBuf, error: IngestError },
}

impl Extraction {
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Extraction::Degraded {
                error: IngestError::UnsupportedFormat(_),
                ..
            }
        )
    }

    /// Text for downstream stages. A degraded extraction becomes a single
    /// placeholder describing the failure.
    pub fn into_text(self) -> ExtractedText {
        match self {
            Extraction::Text(text) => text,
            Extraction::Degraded { path, error } => ExtractedText::Flat(placeholder_text(&path, &error)),
        }
    }
}

pub fn placeholder_text(path: &Path, error: &IngestError) -> String {
    match error {
        IngestError::UnsupportedFormat(_) => {
            format!("[unsupported file type: {}]", path.display())
        }
        other => format!("[error extracting {}: {other}]", path.display()),
    }
}

pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Extraction;
}

#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl OcrEndpointConfig {
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("LLM_OCR_ENDPOINT").ok()?;
        let endpoint = endpoint.trim().to_string();
        if endpoint.is_empty() {
            return None;
        }

        let api_key = std::env::var("LLM_OCR_API_KEY").ok().and_then(|value| {
            let key = value.trim().to_string();
            if key.is_empty() {
                None
            } else {
                Some(key)
            }
        });

        Some(Self { endpoint, api_key })
    }
}

#[derive(Debug, Clone, Serialize)]
struct OcrRequest {
    file_base64: String,
    mime_type: String,
    source_path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrResponse {
    pages: Option<Vec<OcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

/// Extracts text from PDFs, plain text, images (through an OCR endpoint),
/// `.pptx` slide decks and spreadsheets.
#[derive(Debug, Clone, Default)]
pub struct DocumentExtractor {
    ocr: Option<OcrEndpointConfig>,
}

impl DocumentExtractor {
    pub fn new(ocr: Option<OcrEndpointConfig>) -> Self {
        Self { ocr }
    }

    pub fn from_env() -> Self {
        Self::new(OcrEndpointConfig::from_env())
    }

    pub fn try_extract(&self, path: &Path) -> Result<ExtractedText, IngestError> {
        let format = DocumentFormat::from_path(path).ok_or_else(|| {
            IngestError::UnsupportedFormat(
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .unwrap_or("<none>")
                    .to_string(),
            )
        })?;

        match format {
            DocumentFormat::Pdf => self.extract_pdf(path),
            DocumentFormat::PlainText => extract_plain_text(path),
            DocumentFormat::Image => self.extract_image(path),
            DocumentFormat::Slides => extract_slides(path),
            DocumentFormat::Spreadsheet => extract_spreadsheet(path),
        }
    }

    fn extract_pdf(&self, path: &Path) -> Result<ExtractedText, IngestError> {
        let pages = match extract_pdf_pages(path) {
            Ok(pages) => pages,
            Err(IngestError::PdfParse(parse_error)) => {
                return match self.ocr_pages(path, DocumentFormat::Pdf) {
                    Ok(Some(pages)) => Ok(ExtractedText::Paged(pages)),
                    Ok(None) => Err(IngestError::PdfParse(parse_error)),
                    Err(ocr_error) => Err(IngestError::PdfParse(format!(
                        "{parse_error}; multimodal OCR fallback failed: {ocr_error}"
                    ))),
                };
            }
            Err(error) => return Err(error),
        };

        if pages.is_empty() {
            // Scanned PDFs carry no text layer.
            if let Some(pages) = self.ocr_pages(path, DocumentFormat::Pdf)? {
                return Ok(ExtractedText::Paged(pages));
            }
            warn!(path = %path.display(), "pdf had no readable page text");
        }

        Ok(ExtractedText::Paged(pages))
    }

    fn extract_image(&self, path: &Path) -> Result<ExtractedText, IngestError> {
        match self.ocr_pages(path, DocumentFormat::Image)? {
            Some(pages) => Ok(ExtractedText::Flat(
                pages
                    .into_iter()
                    .map(|page| page.text)
                    .collect::<Vec<_>>()
                    .join("\n"),
            )),
            None => Err(IngestError::OcrUnavailable(path.display().to_string())),
        }
    }

    fn ocr_pages(
        &self,
        path: &Path,
        format: DocumentFormat,
    ) -> Result<Option<Vec<PageText>>, IngestError> {
        let cfg = match &self.ocr {
            Some(cfg) => cfg,
            None => return Ok(None),
        };

        let bytes = std::fs::read(path)?;
        let payload = OcrRequest {
            file_base64: STANDARD.encode(bytes),
            mime_type: format.mime_type(path).to_string(),
            source_path: path.to_string_lossy().to_string(),
        };

        let mut request = Client::new()
            .post(&cfg.endpoint)
            .header("content-type", "application/json")
            .json(&payload);

        if let Some(api_key) = &cfg.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send()?;

        if !response.status().is_success() {
            return Err(IngestError::OcrFailed(format!(
                "OCR request to {} returned {}",
                cfg.endpoint,
                response.status()
            )));
        }

        let payload: OcrResponse = response.json()?;
        payload_to_pages(&payload, path).map(Some)
    }
}

impl TextExtractor for DocumentExtractor {
    fn extract(&self, path: &Path) -> Extraction {
        match self.try_extract(path) {
            Ok(text) => Extraction::Text(text),
            Err(error) => {
                warn!(path = %path.display(), %error, "extraction degraded to placeholder");
                Extraction::Degraded {
                    path: path.to_path_buf(),
                    error,
                }
            }
        }
    }
}

fn extract_pdf_pages(path: &Path) -> Result<Vec<PageText>, IngestError> {
    let document =
        Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| IngestError::PdfParse(error.to_string()))?;

        if !text.trim().is_empty() {
            pages.push(PageText {
                number: page_no,
                text,
            });
        }
    }

    Ok(pages)
}

/// Plain text is paginated only when it carries form feeds.
fn extract_plain_text(path: &Path) -> Result<ExtractedText, IngestError> {
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes).to_string();
    Ok(split_form_feeds(&text))
}

pub fn split_form_feeds(text: &str) -> ExtractedText {
    if !text.contains(FORM_FEED) {
        return ExtractedText::Flat(text.to_string());
    }

    let pages = text
        .split(FORM_FEED)
        .enumerate()
        .filter_map(|(index, page)| {
            let trimmed = page.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(PageText {
                    number: (index + 1) as u32,
                    text: trimmed.to_string(),
                })
            }
        })
        .collect();

    ExtractedText::Paged(pages)
}

fn extract_slides(path: &Path) -> Result<ExtractedText, IngestError> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|error| IngestError::Presentation(error.to_string()))?;

    let mut slide_names = archive
        .file_names()
        .filter(|name| name.starts_with("ppt/slides/slide") && name.ends_with(".xml"))
        .map(str::to_string)
        .collect::<Vec<_>>();
    slide_names.sort_by_key(|name| slide_number(name));

    let mut slides = Vec::new();
    for name in slide_names {
        let mut xml = String::new();
        archive
            .by_name(&name)
            .map_err(|error| IngestError::Presentation(error.to_string()))?
            .read_to_string(&mut xml)?;

        let text = slide_xml_text(&xml);
        if !text.is_empty() {
            slides.push(text);
        }
    }

    Ok(ExtractedText::Flat(slides.join("\n\n")))
}

fn slide_number(name: &str) -> u32 {
    name.trim_start_matches("ppt/slides/slide")
        .trim_end_matches(".xml")
        .parse()
        .unwrap_or(0)
}

/// Collects `<a:t>` runs, one line per `<a:p>` paragraph.
fn slide_xml_text(xml: &str) -> String {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut lines = Vec::new();
    let mut line = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) if element.local_name().as_ref() == b"t" => {
                in_text = true;
            }
            Ok(Event::Text(text)) if in_text => {
                if let Ok(value) = text.unescape() {
                    if !line.is_empty() {
                        line.push(' ');
                    }
                    line.push_str(value.trim());
                }
            }
            Ok(Event::End(element)) => match element.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    if !line.trim().is_empty() {
                        lines.push(std::mem::take(&mut line));
                    }
                    line.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    if !line.trim().is_empty() {
        lines.push(line);
    }

    lines.join("\n")
}

fn extract_spreadsheet(path: &Path) -> Result<ExtractedText, IngestError> {
    let mut workbook = calamine::open_workbook_auto(path)
        .map_err(|error| IngestError::Spreadsheet(error.to_string()))?;

    let mut sheets = Vec::new();
    for sheet_name in workbook.sheet_names().to_vec() {
        let range = workbook
            .worksheet_range(&sheet_name)
            .map_err(|error| IngestError::Spreadsheet(error.to_string()))?;

        let mut table = format!("Sheet: {sheet_name}\n");
        for row in range.rows() {
            let cells = row.iter().map(cell_text).collect::<Vec<_>>();
            if cells.iter().all(String::is_empty) {
                continue;
            }
            table.push_str(&cells.join(" | "));
            table.push('\n');
        }
        sheets.push(table);
    }

    Ok(ExtractedText::Flat(sheets.join("\n")))
}

fn cell_text(cell: &calamine::Data) -> String {
    match cell {
        calamine::Data::Empty => String::new(),
        calamine::Data::String(value) => value.clone(),
        calamine::Data::Float(value) => value.to_string(),
        calamine::Data::Int(value) => value.to_string(),
        calamine::Data::Bool(value) => value.to_string(),
        calamine::Data::DateTime(value) => value.as_f64().to_string(),
        calamine::Data::DateTimeIso(value) | calamine::Data::DurationIso(value) => value.clone(),
        calamine::Data::Error(error) => format!("#{error:?}"),
    }
}

fn payload_to_pages(payload: &OcrResponse, path: &Path) -> Result<Vec<PageText>, IngestError> {
    if let Some(listed) = &payload.pages {
        let listed = listed
            .iter()
            .filter_map(|page| {
                let text = page.text.as_ref().map(|value| value.trim().to_string());
                text.and_then(|normalized| {
                    if normalized.is_empty() {
                        None
                    } else {
                        Some(PageText {
                            number: page.page.unwrap_or(1),
                            text: normalized,
                        })
                    }
                })
            })
            .collect::<Vec<_>>();

        if !listed.is_empty() {
            return Ok(listed);
        }
    }

    if let Some(raw_text) = &payload.text {
        if let ExtractedText::Paged(pages) = split_form_feeds(&format!("{raw_text}{FORM_FEED}")) {
            if !pages.is_empty() {
                return Ok(pages);
            }
        }
    }

    Err(IngestError::OcrFailed(format!(
        "OCR response was empty for {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn ocr_payload_with_pages_converts_only_nonempty_text() {
        let response = OcrResponse {
            pages: Some(vec![
                OcrPage {
                    page: Some(2),
                    text: Some("  ".to_string()),
                },
                OcrPage {
                    page: Some(3),
                    text: Some("Page 3".to_string()),
                },
            ]),
            text: None,
        };

        let pages = payload_to_pages(&response, Path::new("x.png"))
            .expect("OCR response should be parsed");

        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].number, 3);
        assert_eq!(pages[0].text, "Page 3");
    }

    #[test]
    fn ocr_payload_fallback_text_split_by_form_feed() {
        let response = OcrResponse {
            pages: None,
            text: Some("First\u{000C}Second\n".to_string()),
        };

        let pages = payload_to_pages(&response, Path::new("x.pdf"))
            .expect("OCR response should be parsed");

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].text, "First");
        assert_eq!(pages[1].number, 2);
        assert_eq!(pages[1].text, "Second");
    }

    #[test]
    fn plain_text_with_form_feeds_is_paginated() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.txt");
        fs::write(&path, "one\u{000C}two\u{000C}three")?;

        let extracted = DocumentExtractor::default().try_extract(&path)?;
        let pages = extracted.pages();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[1].number, 2);
        assert_eq!(pages[1].text, "two");
        Ok(())
    }

    #[test]
    fn plain_text_without_form_feeds_is_flat() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.md");
        fs::write(&path, "# Title\nbody")?;

        let extracted = DocumentExtractor::default().try_extract(&path)?;
        assert_eq!(extracted, ExtractedText::Flat("# Title\nbody".to_string()));
        Ok(())
    }

    #[test]
    fn unsupported_extension_degrades_to_placeholder() {
        let extraction = DocumentExtractor::default().extract(Path::new("archive.tar.gz"));
        assert!(extraction.is_unsupported());

        let text = extraction.into_text();
        assert_eq!(
            text,
            ExtractedText::Flat("[unsupported file type: archive.tar.gz]".to_string())
        );
    }

    #[test]
    fn broken_pdf_degrades_instead_of_failing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;

        let extraction = DocumentExtractor::default().extract(&path);
        assert!(matches!(extraction, Extraction::Degraded { .. }));
        assert!(!extraction.is_unsupported());
        match extraction.into_text() {
            ExtractedText::Flat(text) => assert!(text.starts_with("[error extracting")),
            other => panic!("unexpected extraction {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn image_without_ocr_endpoint_degrades() {
        let extraction = DocumentExtractor::new(None).extract(Path::new("scan.png"));
        assert!(matches!(
            extraction,
            Extraction::Degraded {
                error: IngestError::OcrUnavailable(_),
                ..
            }
        ));
    }

    #[test]
    fn slides_are_flattened_in_slide_order() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("deck.pptx");
        let file = fs::File::create(&path)?;
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();

        let slide = |text: &str| {
            format!(
                r#"<p:sld xmlns:a="a" xmlns:p="p"><p:txBody><a:p><a:r><a:t>{text}</a:t></a:r></a:p></p:txBody></p:sld>"#
            )
        };
        writer.start_file("ppt/slides/slide10.xml", options)?;
        writer.write_all(slide("Tenth").as_bytes())?;
        writer.start_file("ppt/slides/slide2.xml", options)?;
        writer.write_all(slide("Second").as_bytes())?;
        writer.finish()?;

        let extracted = DocumentExtractor::default().try_extract(&path)?;
        assert_eq!(extracted, ExtractedText::Flat("Second\n\nTenth".to_string()));
        Ok(())
    }

    #[test]
    fn formats_are_detected_case_insensitively() {
        assert_eq!(
            DocumentFormat::from_path(Path::new("A.PDF")),
            Some(DocumentFormat::Pdf)
        );
        assert_eq!(
            DocumentFormat::from_path(Path::new("sheet.xlsx")),
            Some(DocumentFormat::Spreadsheet)
        );
        assert_eq!(DocumentFormat::from_path(Path::new("noext")), None);
    }
}
