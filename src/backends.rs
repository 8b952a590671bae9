//! Text extraction backends.
//!
//! A backend turns raw document bytes into plain UTF-8 text. Each backend
//! declares which inputs it accepts (by extension or MIME class); the
//! extraction engine tries the accepting backends in configured order.
//! Backends never panic outward: library panics are caught and reported as
//! errors.

use std::io::Read;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Zip-bomb guard for a single OOXML part.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const TEXT_EXTENSIONS: &[&str] = &[
    ".txt", ".md", ".markdown", ".csv", ".tsv", ".json", ".xml", ".html", ".htm", ".log",
    ".eml", ".yaml", ".yml", ".ini", ".rst",
];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),

    #[error("text decoding failed: {0}")]
    Text(String),

    #[error("backend panicked: {0}")]
    Panicked(String),

    #[error("no text extracted")]
    Empty,
}

/// What is known about an input before it is opened.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hint<'a> {
    /// Lowercased extension including the dot.
    pub extension: Option<&'a str>,
    pub mime: Option<&'a str>,
}

impl Hint<'_> {
    fn is_ext(&self, candidates: &[&str]) -> bool {
        self.extension.is_some_and(|e| candidates.contains(&e))
    }

    fn is_mime(&self, candidates: &[&str]) -> bool {
        self.mime.is_some_and(|m| candidates.contains(&m))
    }
}

/// One extraction strategy. Implementations must be cheap to clone or share;
/// `attempt` runs on a blocking thread.
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    /// Static affinity: whether this backend should be tried for `hint`.
    fn accepts(&self, hint: &Hint<'_>) -> bool;

    fn attempt(&self, bytes: &[u8], hint: &Hint<'_>) -> Result<String, ExtractError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Whole-document PDF text via `pdf-extract`.
    Pdf,
    /// Page-by-page PDF text via `lopdf`; keeps whatever pages decode.
    PdfPages,
    /// docx, pptx, xlsx.
    Ooxml,
    PlainText,
}

impl Backend {
    pub fn from_name(name: &str) -> Option<Backend> {
        match name {
            "pdf" => Some(Backend::Pdf),
            "pdf-pages" => Some(Backend::PdfPages),
            "ooxml" => Some(Backend::Ooxml),
            "text" => Some(Backend::PlainText),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Pdf => "pdf",
            Backend::PdfPages => "pdf-pages",
            Backend::Ooxml => "ooxml",
            Backend::PlainText => "text",
        }
    }
}

impl Capability for Backend {
    fn name(&self) -> &str {
        self.as_str()
    }

    fn accepts(&self, hint: &Hint<'_>) -> bool {
        match self {
            Backend::Pdf | Backend::PdfPages => hint.is_ext(&[".pdf"]) || hint.is_mime(&[MIME_PDF]),
            Backend::Ooxml => {
                hint.is_ext(&[".docx", ".pptx", ".xlsx"])
                    || hint.is_mime(&[MIME_DOCX, MIME_PPTX, MIME_XLSX])
            }
            Backend::PlainText => {
                hint.is_ext(TEXT_EXTENSIONS) || hint.mime.is_some_and(|m| m.starts_with("text/"))
            }
        }
    }

    fn attempt(&self, bytes: &[u8], hint: &Hint<'_>) -> Result<String, ExtractError> {
        match self {
            Backend::Pdf => extract_pdf(bytes),
            Backend::PdfPages => extract_pdf_pages(bytes),
            Backend::Ooxml => {
                if hint.is_ext(&[".docx"]) || hint.is_mime(&[MIME_DOCX]) {
                    extract_docx(bytes)
                } else if hint.is_ext(&[".pptx"]) || hint.is_mime(&[MIME_PPTX]) {
                    extract_pptx(bytes)
                } else {
                    extract_xlsx(bytes)
                }
            }
            Backend::PlainText => decode_text(bytes),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(bytes)))
        .map_err(|p| ExtractError::Panicked(panic_message(p)))?
        .map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_pdf_pages(bytes: &[u8]) -> Result<String, ExtractError> {
    catch_unwind(AssertUnwindSafe(|| {
        let doc = lopdf::Document::load_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
        let mut pages = Vec::new();
        let mut broken = 0usize;
        for page_number in doc.get_pages().keys() {
            match doc.extract_text(&[*page_number]) {
                Ok(text) => pages.push(text),
                Err(e) => {
                    broken += 1;
                    tracing::debug!(page = page_number, error = %e, "skipping unreadable PDF page");
                }
            }
        }
        if pages.is_empty() && broken > 0 {
            return Err(ExtractError::Pdf(format!("all {} pages failed to decode", broken)));
        }
        Ok(pages.join("\n"))
    }))
    .map_err(|p| ExtractError::Panicked(panic_message(p)))?
}

/// UTF-8 when valid, otherwise Latin-1. Content with NUL bytes is treated
/// as binary.
fn decode_text(bytes: &[u8]) -> Result<String, ExtractError> {
    if bytes.contains(&0) {
        return Err(ExtractError::Text("binary content".to_string()));
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(s.strip_prefix('\u{feff}').unwrap_or(s).to_string()),
        Err(_) => Ok(bytes.iter().map(|&b| b as char).collect()),
    }
}

type ZipReader<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_zip(bytes: &[u8]) -> Result<ZipReader<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_zip_entry_bounded(
    archive: &mut ZipReader<'_>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= max_bytes {
        return Err(ExtractError::Ooxml(format!(
            "zip entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

/// Sort `prefix<N>.xml` part names numerically.
fn numbered_parts(archive: &ZipReader<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    text_elements(&xml, " ")
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let mut slides = Vec::new();
    for name in numbered_parts(&archive, "ppt/slides/slide") {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let text = text_elements(&xml, " ")?;
        if !text.is_empty() {
            slides.push(text);
        }
    }
    Ok(slides.join("\n"))
}

/// Concatenate the text of every `<*:t>` element, which is where both
/// WordprocessingML and DrawingML keep runs of text.
fn text_elements(xml: &[u8], separator: &str) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut runs: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_t = true,
            Ok(Event::End(e)) if e.local_name().as_ref() == b"t" => in_t = false,
            Ok(Event::Text(te)) if in_t => {
                runs.push(te.unescape().unwrap_or_default().into_owned());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(runs.join(separator))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_zip(bytes)?;
    let shared_strings = match archive.index_for_name("xl/sharedStrings.xml") {
        Some(_) => read_shared_strings(&mut archive)?,
        None => Vec::new(),
    };
    let mut sheets = Vec::new();
    for name in numbered_parts(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        let cells = sheet_cells(&xml, &shared_strings)?;
        if !cells.is_empty() {
            sheets.push(cells);
        }
    }
    Ok(sheets.join("\n"))
}

fn read_shared_strings(archive: &mut ZipReader<'_>) -> Result<Vec<String>, ExtractError> {
    use quick_xml::events::Event;

    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().unwrap_or_default());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_t = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Cell values of one worksheet: shared strings resolved, inline strings and
/// numbers taken as written.
fn sheet_cells(xml: &[u8], shared_strings: &[String]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut cells: Vec<String> = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut shared = false;
    loop {
        if cells.len() >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"c" => {
                    shared = e.attributes().flatten().any(|a| {
                        a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                    });
                }
                b"v" | b"t" => in_value = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_value => {
                let raw = te.unescape().unwrap_or_default();
                let value = raw.trim();
                if value.is_empty() {
                    // nothing
                } else if shared {
                    if let Some(s) = value.parse::<usize>().ok().and_then(|i| shared_strings.get(i)) {
                        cells.push(s.clone());
                    }
                } else {
                    cells.push(value.to_string());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => shared = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(cells.join(" "))
}
