//! Labeling prompt construction and reply parsing.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

use crate::config::VocabularyConfig;
use crate::models::InputRecord;

/// Parent folders offered as context, nearest last.
const PARENT_FOLDERS: usize = 5;

pub const SYSTEM_PROMPT: &str = "You are a document classification assistant helping to organize a personal document library.

Your task is to analyze documents and provide structured metadata including:
- Document type (from a controlled vocabulary)
- A clear, descriptive title
- Suggested canonical filename
- Relevant tags
- Target taxonomy folder path
- Date (if discernible)
- Issuer/source (if applicable)
- Confidence score
- Brief explanation of your reasoning

Be precise and consistent. When uncertain, express lower confidence rather than guessing.
Always respond with valid JSON only, no additional text.";

/// Everything the model sees about one input.
#[derive(Debug, Clone)]
pub struct LabelContext {
    pub filename: String,
    pub parent_folders: Vec<String>,
    pub size: i64,
    pub mime: Option<String>,
    pub mtime: i64,
    pub text: Option<String>,
    pub doc_types: Vec<String>,
    pub tags: Vec<String>,
    pub taxonomy: Vec<String>,
}

impl LabelContext {
    pub fn new(input: &InputRecord, text: Option<String>, vocabulary: &VocabularyConfig) -> Self {
        let path = Path::new(&input.path);
        let folders: Vec<String> = path
            .parent()
            .map(|p| {
                p.components()
                    .filter_map(|c| match c {
                        std::path::Component::Normal(s) => Some(s.to_string_lossy().to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let skip = folders.len().saturating_sub(PARENT_FOLDERS);

        Self {
            filename: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| input.path.clone()),
            parent_folders: folders.into_iter().skip(skip).collect(),
            size: input.size,
            mime: input.mime_hint.clone(),
            mtime: input.mtime,
            text,
            doc_types: vocabulary.doc_types.clone(),
            tags: vocabulary.tags.clone(),
            taxonomy: vocabulary.taxonomy.clone(),
        }
    }

    /// Fixed context used to fingerprint the prompt template.
    fn sample() -> Self {
        Self {
            filename: "example.pdf".to_string(),
            parent_folders: vec!["folder".to_string()],
            size: 1000,
            mime: None,
            mtime: 0,
            text: None,
            doc_types: vec!["type".to_string()],
            tags: vec!["tag".to_string()],
            taxonomy: vec!["01 Category".to_string()],
        }
    }
}

/// First `max_chars` characters, with a marker when anything was cut.
fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}\n\n[... truncated ...]", &text[..cut]),
        None => text.to_string(),
    }
}

pub fn render_user_prompt(ctx: &LabelContext, max_chars: usize) -> String {
    let text = ctx
        .text
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .map(|t| excerpt(t, max_chars))
        .unwrap_or_else(|| "[No text extracted]".to_string());
    let modified = chrono::DateTime::from_timestamp(ctx.mtime, 0)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let taxonomy: Vec<String> = ctx.taxonomy.iter().map(|t| format!("  - {}", t)).collect();

    format!(
        r#"Analyze this document and provide classification metadata.

DOCUMENT INFORMATION:
- Filename: {filename}
- Parent folders: {folders}
- File size: {size} bytes
- MIME type: {mime}
- Modified: {modified}

EXTRACTED TEXT (first {max_chars} chars):
{text}

AVAILABLE DOCUMENT TYPES:
{doc_types}

AVAILABLE TAXONOMY:
{taxonomy}

SUGGESTED TAGS:
{tags}

OUTPUT FORMAT:
Respond with ONLY a JSON object matching this schema:
{{
  "doc_type": "<type from available list>",
  "title": "<descriptive title>",
  "canonical_name": "<YYYY-MM-DD__Domain__Issuer__Title format without extension>",
  "tags": ["<tag1>", "<tag2>"],
  "target_path": "<taxonomy path, e.g., '03 Financial/Bank Statements'>",
  "date": "<YYYY-MM-DD or null>",
  "issuer": "<issuer/source name or null>",
  "source": "<additional source info or null>",
  "confidence": <0.0 to 1.0>,
  "rationale": "<1-2 sentence explanation>"
}}

Respond with ONLY the JSON, no markdown formatting, no additional text."#,
        filename = ctx.filename,
        folders = ctx.parent_folders.join(" > "),
        size = ctx.size,
        mime = ctx.mime.as_deref().unwrap_or("unknown"),
        modified = modified,
        max_chars = max_chars,
        text = text,
        doc_types = ctx.doc_types.join(", "),
        taxonomy = taxonomy.join("\n"),
        tags = ctx.tags.join(", "),
    )
}

/// Short hash identifying the prompt template, recorded with every label so
/// results from different prompt versions can be told apart.
pub fn fingerprint(max_chars: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SYSTEM_PROMPT.as_bytes());
    hasher.update(b"\n\n");
    hasher.update(render_user_prompt(&LabelContext::sample(), max_chars).as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// A validated model reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LabelResponse {
    pub doc_type: String,
    pub title: String,
    #[serde(alias = "canonical_filename")]
    pub canonical_name: String,
    #[serde(default, alias = "suggested_tags")]
    pub tags: Vec<String>,
    #[serde(alias = "target_group_path")]
    pub target_path: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    pub confidence: f64,
    #[serde(alias = "why")]
    pub rationale: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("no JSON object in reply")]
    NoJson,

    #[error("invalid label JSON: {0}")]
    Invalid(String),

    #[error("doc_type is empty")]
    EmptyDocType,

    #[error("confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),
}

/// Strip code fences and surrounding prose, then deserialize and validate.
pub fn parse_response(raw: &str) -> Result<LabelResponse, ParseError> {
    let start = raw.find('{').ok_or(ParseError::NoJson)?;
    let end = raw.rfind('}').ok_or(ParseError::NoJson)?;
    if end < start {
        return Err(ParseError::NoJson);
    }

    let mut label: LabelResponse =
        serde_json::from_str(&raw[start..=end]).map_err(|e| ParseError::Invalid(e.to_string()))?;

    label.doc_type = label.doc_type.trim().to_lowercase();
    if label.doc_type.is_empty() {
        return Err(ParseError::EmptyDocType);
    }
    if !(0.0..=1.0).contains(&label.confidence) {
        return Err(ParseError::ConfidenceOutOfRange(label.confidence));
    }

    label.tags = label
        .tags
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    label.date = non_empty(label.date);
    label.issuer = non_empty(label.issuer);
    label.source = non_empty(label.source);
    Ok(label)
}

/// Models often send `""` or `"null"` for absent optional fields.
fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("null"))
}
