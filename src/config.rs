//! TOML configuration.
//!
//! Every component receives the parts of [`Config`] it needs at construction
//! time; nothing reads configuration from global state. A JSON snapshot of the
//! effective configuration is stored with each run in the ledger.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub labeling: LabelingConfig,
    #[serde(default)]
    pub vocabulary: VocabularyConfig,
    #[serde(default)]
    pub planning: PlanningConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Directory holding gzip-compressed extracted-text sidecars.
    pub sidecar_dir: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScanConfig {
    /// Default root for `archivist scan` when none is given on the command line.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_skip_dirs")]
    pub skip_dirs: Vec<String>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            root: None,
            skip_dirs: default_skip_dirs(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_skip_dirs() -> Vec<String> {
    [".git", ".cache", "__pycache__", "node_modules", ".Trash"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExtractionConfig {
    /// Backend names in priority order. The first backend has priority 1.
    #[serde(default = "default_backends")]
    pub backends: Vec<String>,
    /// Ceiling on extracted text length, in characters.
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,
    /// Inputs larger than this are skipped without being read.
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: u64,
    #[serde(default = "default_skip_extensions")]
    pub skip_extensions: Vec<String>,
    /// Size of the extraction worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-input limit on reading and extracting one file.
    #[serde(default = "default_extraction_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            backends: default_backends(),
            max_text_chars: default_max_text_chars(),
            max_input_bytes: default_max_input_bytes(),
            skip_extensions: default_skip_extensions(),
            workers: default_workers(),
            timeout_secs: default_extraction_timeout_secs(),
        }
    }
}

fn default_backends() -> Vec<String> {
    ["pdf", "pdf-pages", "ooxml", "text"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_max_text_chars() -> usize {
    50_000
}
fn default_max_input_bytes() -> u64 {
    256 * 1024 * 1024
}
fn default_skip_extensions() -> Vec<String> {
    [
        ".jpg", ".jpeg", ".png", ".gif", ".heic", ".mp4", ".mov", ".zip", ".tar", ".gz",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_extraction_timeout_secs() -> u64 {
    600
}
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InferenceConfig {
    /// Base URL of an OpenAI-compatible server, e.g. `http://localhost:1234/v1`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_escalation_model")]
    pub escalation_model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries after the first attempt, per tier.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Concurrent labeling requests. Keep at 1 unless the server is known
    /// to handle parallel requests.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            default_model: default_model(),
            escalation_model: default_escalation_model(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:1234/v1".to_string()
}
fn default_model() -> String {
    "qwen2.5-7b-instruct".to_string()
}
fn default_escalation_model() -> String {
    "qwen2.5-14b-instruct".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_concurrency() -> usize {
    1
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LabelingConfig {
    #[serde(default = "default_true")]
    pub escalation_enabled: bool,
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,
    /// Doc types that always go to the escalation tier.
    #[serde(default = "default_sensitive_types")]
    pub sensitive_types: Vec<String>,
    /// Doc types for which a date and issuer are normally present.
    #[serde(default = "default_fields_expected_for")]
    pub fields_expected_for: Vec<String>,
    /// Characters of extracted text sent as context.
    #[serde(default = "default_context_chars")]
    pub context_chars: usize,
}

impl Default for LabelingConfig {
    fn default() -> Self {
        Self {
            escalation_enabled: true,
            escalation_threshold: default_escalation_threshold(),
            sensitive_types: default_sensitive_types(),
            fields_expected_for: default_fields_expected_for(),
            context_chars: default_context_chars(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_escalation_threshold() -> f64 {
    0.7
}
fn default_sensitive_types() -> Vec<String> {
    ["tax", "medical", "legal", "insurance"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_fields_expected_for() -> Vec<String> {
    ["financial", "tax", "medical", "insurance", "legal"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_context_chars() -> usize {
    8000
}

/// Controlled vocabularies offered to the model.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VocabularyConfig {
    #[serde(default = "default_doc_types")]
    pub doc_types: Vec<String>,
    #[serde(default = "default_tags")]
    pub tags: Vec<String>,
    #[serde(default = "default_taxonomy")]
    pub taxonomy: Vec<String>,
}

impl Default for VocabularyConfig {
    fn default() -> Self {
        Self {
            doc_types: default_doc_types(),
            tags: default_tags(),
            taxonomy: default_taxonomy(),
        }
    }
}

fn default_doc_types() -> Vec<String> {
    [
        "identity", "legal", "contract", "medical", "prescription", "lab_result",
        "financial", "bank_statement", "investment", "receipt", "tax", "insurance",
        "policy", "claim", "home", "mortgage", "utility", "vehicle", "work", "payslip",
        "retirement", "travel", "passport", "booking", "photo", "media", "other",
        "uncategorized",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_tags() -> Vec<String> {
    [
        "important", "action-required", "archived", "tax-deductible", "warranty",
        "recurring",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_taxonomy() -> Vec<String> {
    [
        "01 Identity & Legal",
        "02 Medical",
        "03 Financial",
        "04 Taxes",
        "05 Insurance",
        "06 Home",
        "07 Vehicles",
        "08 Work & Retirement",
        "09 Travel",
        "10 Family Photos & Media",
        "98 Uncategorized",
        "99 Needs Review",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PlanningConfig {
    #[serde(default = "default_review_below")]
    pub review_below: f64,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            review_below: default_review_below(),
        }
    }
}

fn default_review_below() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Snapshot stored alongside each run in the ledger.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.extraction.max_text_chars < 2 {
        anyhow::bail!("extraction.max_text_chars must be >= 2");
    }
    if config.extraction.workers == 0 {
        anyhow::bail!("extraction.workers must be > 0");
    }
    if config.extraction.timeout_secs == 0 {
        anyhow::bail!("extraction.timeout_secs must be > 0");
    }
    for name in &config.extraction.backends {
        if crate::backends::Backend::from_name(name).is_none() {
            anyhow::bail!(
                "Unknown extraction backend: '{}'. Must be one of pdf, pdf-pages, ooxml, text.",
                name
            );
        }
    }

    if config.inference.concurrency == 0 {
        anyhow::bail!("inference.concurrency must be > 0");
    }
    if config.inference.timeout_secs == 0 {
        anyhow::bail!("inference.timeout_secs must be > 0");
    }

    if !(0.0..=1.0).contains(&config.labeling.escalation_threshold) {
        anyhow::bail!("labeling.escalation_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.planning.review_below) {
        anyhow::bail!("planning.review_below must be in [0.0, 1.0]");
    }

    if config.vocabulary.doc_types.is_empty() {
        anyhow::bail!("vocabulary.doc_types must not be empty");
    }
    if !config.vocabulary.doc_types.iter().any(|t| t == "other") {
        anyhow::bail!("vocabulary.doc_types must contain the fallback type 'other'");
    }

    Ok(config)
}
