//! Core data models used throughout the pipeline.
//!
//! Inputs, runs, extraction records, label records, and plans are all
//! persisted rows. Extraction and label records are append-only: one row per
//! (input, run), with history accumulating across runs.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Pipeline stage a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Inventory,
    Extraction,
    Labeling,
    Planning,
    Materialization,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Inventory => "inventory",
            StageKind::Extraction => "extraction",
            StageKind::Labeling => "labeling",
            StageKind::Planning => "planning",
            StageKind::Materialization => "materialization",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inventory" => Ok(StageKind::Inventory),
            "extraction" => Ok(StageKind::Extraction),
            "labeling" => Ok(StageKind::Labeling),
            "planning" => Ok(StageKind::Planning),
            "materialization" => Ok(StageKind::Materialization),
            other => anyhow::bail!("unknown stage kind: {}", other),
        }
    }
}

/// Lifecycle state of a run. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => anyhow::bail!("unknown run status: {}", other),
        }
    }
}

/// One execution of one pipeline stage.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: i64,
    pub stage: StageKind,
    pub status: RunStatus,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub config: serde_json::Value,
    pub stats: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputStatus {
    Active,
    Unreadable,
}

impl InputStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputStatus::Active => "active",
            InputStatus::Unreadable => "unreadable",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "unreadable" => InputStatus::Unreadable,
            _ => InputStatus::Active,
        }
    }
}

/// A discovered input. Identity is `content_hash`; the row is keyed by path.
#[derive(Debug, Clone, Serialize)]
pub struct InputRecord {
    pub id: i64,
    pub path: String,
    pub content_hash: String,
    pub size: i64,
    pub mtime: i64,
    pub mime_hint: Option<String>,
    pub status: InputStatus,
    pub discovery_run: i64,
    pub last_seen_run: i64,
}

impl InputRecord {
    /// Lowercased extension including the dot, e.g. `".pdf"`.
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.path)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Success,
    Failed,
    Skipped,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Success => "success",
            ExtractionStatus::Failed => "failed",
            ExtractionStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => ExtractionStatus::Success,
            "skipped" => ExtractionStatus::Skipped,
            _ => ExtractionStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionRecord {
    pub id: i64,
    pub input_id: i64,
    pub run_id: i64,
    pub content_hash: String,
    pub status: ExtractionStatus,
    pub backend: Option<String>,
    pub sidecar_hash: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LabelRecord {
    pub id: i64,
    pub input_id: i64,
    pub run_id: i64,
    pub content_hash: String,
    pub doc_type: String,
    pub title: String,
    pub canonical_name: String,
    pub tags: Vec<String>,
    pub target_path: String,
    pub date: Option<String>,
    pub issuer: Option<String>,
    pub source: Option<String>,
    pub confidence: f64,
    pub rationale: String,
    pub model: String,
    pub prompt_fingerprint: String,
    pub escalated: bool,
    pub notes: Vec<String>,
    pub created_at: i64,
}

/// Why an input got no label in a run. `status` is `failed` or `skipped`.
#[derive(Debug, Clone, Serialize)]
pub struct LabelFailure {
    pub id: i64,
    pub input_id: i64,
    pub run_id: i64,
    pub content_hash: String,
    pub status: String,
    pub error: String,
    pub prompt_fingerprint: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanRecord {
    pub id: i64,
    pub input_id: i64,
    pub label_id: i64,
    pub run_id: i64,
    pub source_path: String,
    pub target_dir: String,
    pub target_filename: String,
    pub tags: Vec<String>,
    pub needs_review: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_kind_round_trips_through_str() {
        for kind in [
            StageKind::Inventory,
            StageKind::Extraction,
            StageKind::Labeling,
            StageKind::Planning,
            StageKind::Materialization,
        ] {
            assert_eq!(kind.as_str().parse::<StageKind>().unwrap(), kind);
        }
        assert!("scan".parse::<StageKind>().is_err());
    }

    #[test]
    fn input_extension_is_lowercased() {
        let rec = InputRecord {
            id: 1,
            path: "/docs/Scan.PDF".to_string(),
            content_hash: "ab".to_string(),
            size: 1,
            mtime: 0,
            mime_hint: None,
            status: InputStatus::Active,
            discovery_run: 1,
            last_seen_run: 1,
        };
        assert_eq!(rec.extension().as_deref(), Some(".pdf"));
    }
}
