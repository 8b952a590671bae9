//! Labeling engine with confidence-driven escalation.
//!
//! Each input moves through an explicit state machine:
//!
//! ```text
//! Pending ──default tier──▶ DefaultInferred ──no trigger──────────────▶ Stored
//!    │                            │
//!    │                            └─trigger─▶ Escalated ─ok──────────▶ Stored (escalated)
//!    │                                           │
//!    │                                           ├─malformed─▶ Stored (default + note)
//!    │                                           └─transport─▶ Failed
//!    └──malformed or transport after retries──────────────────────────▶ Failed
//! ```
//!
//! Escalation triggers are pure functions of the default-tier result so they
//! can be tested without a model. Malformed replies and retryable transport
//! errors are retried at the same tier up to `max_retries` times, waiting
//! according to an injected [`BackoffPolicy`].

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{Config, LabelingConfig, VocabularyConfig};
use crate::inference::{
    BackoffPolicy, InferenceCapability, InferenceError, OpenAiClient, Tier,
};
use crate::inventory;
use crate::ledger::RunLedger;
use crate::models::{InputRecord, LabelFailure, LabelRecord, StageKind};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::prompts::{self, LabelContext, LabelResponse};
use crate::sidecar::{SidecarError, SidecarStore};

/// Doc type substituted for anything outside the vocabulary.
pub const FALLBACK_DOC_TYPE: &str = "other";
/// Prefix of the note stored when escalation output could not be used.
pub const ESCALATION_FAILED_NOTE: &str = "escalation failed";

const STALE_WINDOW: Duration = Duration::from_secs(6 * 3600);

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("malformed reply after {attempts} attempts: {last}")]
    Malformed { attempts: u32, last: String },

    #[error(transparent)]
    Inference(InferenceError),

    /// Every attempt was refused. The server is down; stop the stage.
    #[error("inference server unreachable: {0}")]
    Unreachable(String),
}

impl LabelError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, LabelError::Unreachable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    LowConfidence,
    SensitiveType,
    MissingFields,
}

pub fn low_confidence(confidence: f64, threshold: f64) -> bool {
    confidence < threshold
}

pub fn sensitive_type(doc_type: &str, sensitive: &[String]) -> bool {
    sensitive.iter().any(|t| t == doc_type)
}

/// Date and issuer both absent for a type where they are normally present.
pub fn missing_expected_fields(
    doc_type: &str,
    date: Option<&str>,
    issuer: Option<&str>,
    expected_for: &[String],
) -> bool {
    date.is_none() && issuer.is_none() && expected_for.iter().any(|t| t == doc_type)
}

pub fn triggers(label: &LabelResponse, config: &LabelingConfig) -> Vec<Trigger> {
    let mut fired = Vec::new();
    if low_confidence(label.confidence, config.escalation_threshold) {
        fired.push(Trigger::LowConfidence);
    }
    if sensitive_type(&label.doc_type, &config.sensitive_types) {
        fired.push(Trigger::SensitiveType);
    }
    if missing_expected_fields(
        &label.doc_type,
        label.date.as_deref(),
        label.issuer.as_deref(),
        &config.fields_expected_for,
    ) {
        fired.push(Trigger::MissingFields);
    }
    fired
}

/// Replace a doc type outside the vocabulary with the fallback type.
fn coerce_doc_type(label: &mut LabelResponse, vocabulary: &VocabularyConfig) -> Option<String> {
    if vocabulary.doc_types.iter().any(|t| *t == label.doc_type) {
        return None;
    }
    let note = format!("doc_type coerced from '{}'", label.doc_type);
    label.doc_type = FALLBACK_DOC_TYPE.to_string();
    Some(note)
}

/// A label ready to be stored.
#[derive(Debug, Clone)]
pub struct Labeled {
    pub label: LabelResponse,
    pub model: String,
    pub escalated: bool,
    pub escalation_failed: bool,
    pub triggers: Vec<Trigger>,
    pub notes: Vec<String>,
}

enum State {
    Pending,
    DefaultInferred {
        label: LabelResponse,
        notes: Vec<String>,
    },
    Escalated {
        default: LabelResponse,
        notes: Vec<String>,
        triggers: Vec<Trigger>,
        result: Result<LabelResponse, LabelError>,
    },
    Stored(Labeled),
    Failed(LabelError),
}

pub struct LabelEngine<C: InferenceCapability> {
    client: C,
    labeling: LabelingConfig,
    vocabulary: VocabularyConfig,
    max_retries: u32,
    backoff: BackoffPolicy,
}

impl<C: InferenceCapability> LabelEngine<C> {
    pub fn new(client: C, config: &Config, backoff: BackoffPolicy) -> Self {
        Self {
            client,
            labeling: config.labeling.clone(),
            vocabulary: config.vocabulary.clone(),
            max_retries: config.inference.max_retries,
            backoff,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Label one input. `escalate` gates the escalation tier.
    pub async fn label(&self, ctx: &LabelContext, escalate: bool) -> Result<Labeled, LabelError> {
        let user = prompts::render_user_prompt(ctx, self.labeling.context_chars);
        let mut state = State::Pending;

        loop {
            state = match state {
                State::Pending => match self.infer(Tier::Default, &user).await {
                    Ok(mut label) => {
                        let notes = coerce_doc_type(&mut label, &self.vocabulary)
                            .into_iter()
                            .collect();
                        State::DefaultInferred { label, notes }
                    }
                    Err(e) => State::Failed(e),
                },
                State::DefaultInferred { label, notes } => {
                    let fired = triggers(&label, &self.labeling);
                    if escalate && !fired.is_empty() {
                        tracing::debug!(file = %ctx.filename, triggers = ?fired, "escalating");
                        let result = self.infer(Tier::Escalation, &user).await;
                        State::Escalated {
                            default: label,
                            notes,
                            triggers: fired,
                            result,
                        }
                    } else {
                        State::Stored(Labeled {
                            label,
                            model: self.client.model_for(Tier::Default).to_string(),
                            escalated: false,
                            escalation_failed: false,
                            triggers: fired,
                            notes,
                        })
                    }
                }
                State::Escalated {
                    default,
                    mut notes,
                    triggers,
                    result,
                } => match result {
                    Ok(mut label) => {
                        // Notes about the default reply no longer apply.
                        notes = coerce_doc_type(&mut label, &self.vocabulary)
                            .into_iter()
                            .collect();
                        State::Stored(Labeled {
                            label,
                            model: self.client.model_for(Tier::Escalation).to_string(),
                            escalated: true,
                            escalation_failed: false,
                            triggers,
                            notes,
                        })
                    }
                    Err(e @ LabelError::Malformed { .. }) => {
                        tracing::warn!(file = %ctx.filename, error = %e, "escalation output unusable; keeping default result");
                        notes.push(format!("{}: {}", ESCALATION_FAILED_NOTE, e));
                        State::Stored(Labeled {
                            label: default,
                            model: self.client.model_for(Tier::Default).to_string(),
                            escalated: false,
                            escalation_failed: true,
                            triggers,
                            notes,
                        })
                    }
                    Err(e) => State::Failed(e),
                },
                State::Stored(labeled) => return Ok(labeled),
                State::Failed(e) => return Err(e),
            };
        }
    }

    /// Call one tier until a valid reply arrives or the attempt budget runs out.
    async fn infer(&self, tier: Tier, user: &str) -> Result<LabelResponse, LabelError> {
        let attempts = self.max_retries + 1;
        let mut all_refused = true;
        let mut last: Option<LabelError> = None;

        for attempt in 0..attempts {
            let delay = self.backoff.delay(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.client.complete(tier, prompts::SYSTEM_PROMPT, user).await {
                Ok(raw) => {
                    all_refused = false;
                    match prompts::parse_response(&raw) {
                        Ok(label) => return Ok(label),
                        Err(e) => {
                            tracing::debug!(?tier, attempt, error = %e, "malformed reply");
                            last = Some(LabelError::Malformed {
                                attempts,
                                last: e.to_string(),
                            });
                        }
                    }
                }
                Err(InferenceError::Malformed(msg)) => {
                    all_refused = false;
                    last = Some(LabelError::Malformed {
                        attempts,
                        last: msg,
                    });
                }
                Err(e) => {
                    if !matches!(e, InferenceError::Unreachable(_)) {
                        all_refused = false;
                    }
                    if !e.is_retryable() {
                        return Err(LabelError::Inference(e));
                    }
                    tracing::debug!(?tier, attempt, error = %e, "inference attempt failed");
                    last = Some(LabelError::Inference(e));
                }
            }
        }

        if all_refused {
            if let Some(LabelError::Inference(InferenceError::Unreachable(url))) = last {
                return Err(LabelError::Unreachable(url));
            }
        }
        Err(last.unwrap_or(LabelError::Malformed {
            attempts,
            last: "no attempts made".to_string(),
        }))
    }
}

async fn insert_label(
    pool: &SqlitePool,
    input: &InputRecord,
    run_id: i64,
    labeled: &Labeled,
    fingerprint: &str,
) -> Result<i64> {
    let label = &labeled.label;
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO labels (input_id, run_id, content_hash, doc_type, title, canonical_name, tags_json,
            target_path, date, issuer, source, confidence, rationale, model, prompt_fingerprint,
            escalated, notes_json, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(input.id)
    .bind(run_id)
    .bind(&input.content_hash)
    .bind(&label.doc_type)
    .bind(&label.title)
    .bind(&label.canonical_name)
    .bind(serde_json::to_string(&label.tags)?)
    .bind(&label.target_path)
    .bind(&label.date)
    .bind(&label.issuer)
    .bind(&label.source)
    .bind(label.confidence)
    .bind(&label.rationale)
    .bind(&labeled.model)
    .bind(fingerprint)
    .bind(labeled.escalated)
    .bind(serde_json::to_string(&labeled.notes)?)
    .bind(Utc::now().timestamp())
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to record label for {}", input.path))?;
    Ok(id)
}

/// Record why `input` got no label in this run.
async fn record_failure(
    pool: &SqlitePool,
    input: &InputRecord,
    run_id: i64,
    status: &str,
    error: &str,
    fingerprint: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO label_failures (input_id, run_id, content_hash, status, error,
            prompt_fingerprint, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(input.id)
    .bind(run_id)
    .bind(&input.content_hash)
    .bind(status)
    .bind(error)
    .bind(fingerprint)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await
    .with_context(|| format!("failed to record labeling failure for {}", input.path))?;
    Ok(())
}

/// Failed and skipped labeling attempts for an input, newest first.
pub async fn failures(pool: &SqlitePool, input_id: i64) -> Result<Vec<LabelFailure>> {
    let rows = sqlx::query("SELECT * FROM label_failures WHERE input_id = ? ORDER BY id DESC")
        .bind(input_id)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .iter()
        .map(|r| LabelFailure {
            id: r.get("id"),
            input_id: r.get("input_id"),
            run_id: r.get("run_id"),
            content_hash: r.get("content_hash"),
            status: r.get("status"),
            error: r.get("error"),
            prompt_fingerprint: r.get("prompt_fingerprint"),
            created_at: r.get("created_at"),
        })
        .collect())
}

/// Label history for an input, newest first.
pub async fn history(pool: &SqlitePool, input_id: i64) -> Result<Vec<LabelRecord>> {
    let rows = sqlx::query("SELECT * FROM labels WHERE input_id = ? ORDER BY id DESC")
        .bind(input_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(label_from_row).collect())
}

/// Most recent label of every active input, for its current content.
pub async fn current_labels(pool: &SqlitePool) -> Result<Vec<(InputRecord, LabelRecord)>> {
    let rows = sqlx::query(
        r#"
        SELECT l.* FROM labels l
        JOIN inputs i ON i.id = l.input_id
        WHERE i.status = 'active' AND l.content_hash = i.content_hash
          AND l.id = (
            SELECT MAX(l2.id) FROM labels l2
            WHERE l2.input_id = i.id AND l2.content_hash = i.content_hash
          )
        ORDER BY i.id
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let label = label_from_row(row);
        if let Some(input) = inventory::get_by_id(pool, label.input_id).await? {
            out.push((input, label));
        }
    }
    Ok(out)
}

pub(crate) fn label_from_row(row: &SqliteRow) -> LabelRecord {
    let tags_json: String = row.get("tags_json");
    let notes_json: String = row.get("notes_json");
    LabelRecord {
        id: row.get("id"),
        input_id: row.get("input_id"),
        run_id: row.get("run_id"),
        content_hash: row.get("content_hash"),
        doc_type: row.get("doc_type"),
        title: row.get("title"),
        canonical_name: row.get("canonical_name"),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        target_path: row.get("target_path"),
        date: row.get("date"),
        issuer: row.get("issuer"),
        source: row.get("source"),
        confidence: row.get("confidence"),
        rationale: row.get("rationale"),
        model: row.get("model"),
        prompt_fingerprint: row.get("prompt_fingerprint"),
        escalated: row.get("escalated"),
        notes: serde_json::from_str(&notes_json).unwrap_or_default(),
        created_at: row.get("created_at"),
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct LabelStats {
    pub candidates: u64,
    pub stored: u64,
    pub failed: u64,
    pub skipped: u64,
    pub escalated: u64,
    pub escalation_failed: u64,
    pub coerced: u64,
}

enum InputResult {
    Stored(Labeled),
    Skipped(String),
    Failed(LabelError),
}

pub struct LabelStage<C: InferenceCapability> {
    pool: SqlitePool,
    snapshot: serde_json::Value,
    store: SidecarStore,
    vocabulary: VocabularyConfig,
    escalation_enabled: bool,
    concurrency: usize,
    fingerprint: String,
    engine: Arc<LabelEngine<C>>,
}

impl LabelStage<OpenAiClient> {
    pub fn new(pool: SqlitePool, config: &Config) -> Result<Self> {
        let client = OpenAiClient::from_config(&config.inference)?;
        let engine = LabelEngine::new(client, config, BackoffPolicy::from_config(&config.inference));
        Ok(Self::with_engine(pool, config, engine))
    }
}

impl<C: InferenceCapability> LabelStage<C> {
    pub fn with_engine(pool: SqlitePool, config: &Config, engine: LabelEngine<C>) -> Self {
        Self {
            pool,
            snapshot: config.snapshot(),
            store: SidecarStore::new(&config.storage.sidecar_dir),
            vocabulary: config.vocabulary.clone(),
            escalation_enabled: config.labeling.escalation_enabled,
            concurrency: config.inference.concurrency.max(1),
            fingerprint: prompts::fingerprint(config.labeling.context_chars),
            engine: Arc::new(engine),
        }
    }

    pub async fn run(
        &self,
        force: bool,
        limit: Option<usize>,
        no_escalation: bool,
        progress: &dyn ProgressReporter,
    ) -> Result<(i64, LabelStats)> {
        let ledger = RunLedger::new(self.pool.clone());
        ledger.warn_if_stale(StageKind::Labeling, STALE_WINDOW).await?;

        let escalate = self.escalation_enabled && !no_escalation;
        let mut snapshot = self.snapshot.clone();
        snapshot["args"] = serde_json::json!({
            "force": force,
            "limit": limit,
            "escalate": escalate,
            "prompt_fingerprint": self.fingerprint,
        });
        let run_id = ledger.begin(StageKind::Labeling, &snapshot).await?;

        match self.execute(run_id, force, limit, escalate, progress).await {
            Ok(stats) => {
                ledger.complete(run_id, &stats).await?;
                Ok((run_id, stats))
            }
            Err(e) => {
                ledger.fail(run_id, &format!("{:#}", e)).await?;
                Err(e)
            }
        }
    }

    async fn preflight(&self) -> Result<()> {
        let client = self.engine.client();
        match client.health().await {
            Ok(health) => {
                for tier in [Tier::Default, Tier::Escalation] {
                    let model = client.model_for(tier);
                    if !health.has_model(model) {
                        tracing::warn!(model, ?tier, available = ?health.models, "model not listed by inference server");
                    }
                }
                Ok(())
            }
            Err(InferenceError::Unreachable(url)) => {
                anyhow::bail!("inference server unreachable at {}; is it running?", url)
            }
            Err(e) => {
                tracing::warn!(error = %e, "inference health check failed; continuing");
                Ok(())
            }
        }
    }

    async fn execute(
        &self,
        run_id: i64,
        force: bool,
        limit: Option<usize>,
        escalate: bool,
        progress: &dyn ProgressReporter,
    ) -> Result<LabelStats> {
        self.preflight().await?;

        let mut candidates = inventory::labeling_candidates(&self.pool, force).await?;
        if let Some(limit) = limit {
            candidates.truncate(limit);
        }
        let mut stats = LabelStats {
            candidates: candidates.len() as u64,
            ..LabelStats::default()
        };
        tracing::info!(run_id, candidates = stats.candidates, escalate, "labeling started");

        let total = stats.candidates;
        let mut done = 0u64;
        let mut results = stream::iter(candidates)
            .map(|input| async move {
                let result = self.label_input(&input, escalate).await;
                (input, result)
            })
            .buffer_unordered(self.concurrency);

        while let Some((input, result)) = results.next().await {
            match result? {
                InputResult::Stored(labeled) => {
                    insert_label(&self.pool, &input, run_id, &labeled, &self.fingerprint).await?;
                    stats.stored += 1;
                    if labeled.escalated {
                        stats.escalated += 1;
                    }
                    if labeled.escalation_failed {
                        stats.escalation_failed += 1;
                    }
                    if labeled.notes.iter().any(|n| n.starts_with("doc_type coerced")) {
                        stats.coerced += 1;
                    }
                    tracing::debug!(
                        path = %input.path,
                        doc_type = %labeled.label.doc_type,
                        confidence = labeled.label.confidence,
                        escalated = labeled.escalated,
                        "labeled"
                    );
                }
                InputResult::Skipped(reason) => {
                    tracing::warn!(path = %input.path, reason = %reason, "skipped");
                    record_failure(&self.pool, &input, run_id, "skipped", &reason, &self.fingerprint)
                        .await?;
                    stats.skipped += 1;
                }
                InputResult::Failed(e) => {
                    tracing::warn!(path = %input.path, error = %e, "labeling failed");
                    record_failure(
                        &self.pool,
                        &input,
                        run_id,
                        "failed",
                        &e.to_string(),
                        &self.fingerprint,
                    )
                    .await?;
                    stats.failed += 1;
                }
            }
            done += 1;
            progress.report(ProgressEvent::Processing {
                stage: StageKind::Labeling,
                n: done,
                total,
            });
        }

        tracing::info!(
            run_id,
            stored = stats.stored,
            escalated = stats.escalated,
            failed = stats.failed,
            "labeling complete"
        );
        Ok(stats)
    }

    /// Per-input errors become [`InputResult`]s; an unreachable server is
    /// returned as an error and ends the stage.
    async fn label_input(&self, input: &InputRecord, escalate: bool) -> Result<InputResult> {
        let store = self.store.clone();
        let hash = input.content_hash.clone();
        let text = match tokio::task::spawn_blocking(move || store.read(&hash))
            .await
            .context("sidecar reader task failed")?
        {
            Ok(text) => text,
            Err(SidecarError::NotFound(_)) => {
                return Ok(InputResult::Skipped(
                    "extracted text missing; re-run extraction".to_string(),
                ))
            }
            Err(e) => return Ok(InputResult::Skipped(e.to_string())),
        };

        let ctx = LabelContext::new(input, Some(text), &self.vocabulary);
        match self.engine.label(&ctx, escalate).await {
            Ok(labeled) => Ok(InputResult::Stored(labeled)),
            Err(e) if e.is_fatal() => Err(anyhow::Error::new(e)),
            Err(e) => Ok(InputResult::Failed(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity;
    use crate::inference::Health;
    use crate::models::RunStatus;
    use crate::progress::NoProgress;
    use crate::scanner::Discovered;
    use crate::testutil::test_pool;
    use async_trait::async_trait;
    use tempfile::TempDir;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    type Reply = std::result::Result<String, InferenceError>;

    /// Replays canned replies per tier and records every call.
    #[derive(Default)]
    struct Scripted {
        default: Mutex<VecDeque<Reply>>,
        escalation: Mutex<VecDeque<Reply>>,
        calls: Mutex<Vec<Tier>>,
    }

    impl Scripted {
        fn with(default: Vec<Reply>, escalation: Vec<Reply>) -> Self {
            Self {
                default: Mutex::new(default.into()),
                escalation: Mutex::new(escalation.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Tier> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl InferenceCapability for Scripted {
        async fn complete(&self, tier: Tier, _system: &str, _user: &str) -> Reply {
            self.calls.lock().unwrap().push(tier);
            let queue = match tier {
                Tier::Default => &self.default,
                Tier::Escalation => &self.escalation,
            };
            queue
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(InferenceError::Transport("script exhausted".to_string())))
        }

        fn model_for(&self, tier: Tier) -> &str {
            match tier {
                Tier::Default => "small",
                Tier::Escalation => "large",
            }
        }

        async fn health(&self) -> std::result::Result<Health, InferenceError> {
            Ok(Health::default())
        }
    }

    fn reply(doc_type: &str, confidence: f64, dated: bool) -> Reply {
        let (date, issuer) = if dated {
            ("\"2023-03-31\"", "\"Chase\"")
        } else {
            ("null", "null")
        };
        Ok(format!(
            r#"{{"doc_type": "{}", "title": "t", "canonical_name": "c", "tags": [],
                "target_path": "03 Financial", "date": {}, "issuer": {},
                "confidence": {}, "rationale": "r"}}"#,
            doc_type, date, issuer, confidence
        ))
    }

    fn garbage() -> Reply {
        Ok("not json at all".to_string())
    }

    fn engine(client: Scripted) -> LabelEngine<Scripted> {
        let config = crate::config::parse_config(
            "[db]\npath = \"x\"\n[storage]\nsidecar_dir = \"y\"\n",
        )
        .unwrap();
        LabelEngine::new(client, &config, BackoffPolicy::none())
    }

    fn ctx() -> LabelContext {
        let input = InputRecord {
            id: 1,
            path: "/docs/statement.pdf".to_string(),
            content_hash: "ab".to_string(),
            size: 10,
            mtime: 0,
            mime_hint: None,
            status: crate::models::InputStatus::Active,
            discovery_run: 1,
            last_seen_run: 1,
        };
        LabelContext::new(&input, Some("text".to_string()), &VocabularyConfig::default())
    }

    #[test]
    fn trigger_predicates() {
        assert!(low_confidence(0.5, 0.7));
        assert!(!low_confidence(0.7, 0.7));
        assert!(!low_confidence(0.9, 0.7));

        let sensitive = vec!["tax".to_string(), "medical".to_string()];
        assert!(sensitive_type("tax", &sensitive));
        assert!(!sensitive_type("receipt", &sensitive));

        let expected = vec!["financial".to_string()];
        assert!(missing_expected_fields("financial", None, None, &expected));
        assert!(!missing_expected_fields("financial", Some("2023"), None, &expected));
        assert!(!missing_expected_fields("financial", None, Some("Chase"), &expected));
        assert!(!missing_expected_fields("receipt", None, None, &expected));
    }

    #[tokio::test]
    async fn confident_result_is_not_escalated() {
        let engine = engine(Scripted::with(vec![reply("financial", 0.9, true)], vec![]));
        let labeled = engine.label(&ctx(), true).await.unwrap();
        assert!(!labeled.escalated);
        assert_eq!(labeled.model, "small");
        assert!(labeled.triggers.is_empty());
        assert_eq!(engine.client().calls(), vec![Tier::Default]);
    }

    #[tokio::test]
    async fn low_confidence_escalates() {
        let engine = engine(Scripted::with(
            vec![reply("financial", 0.5, true)],
            vec![reply("financial", 0.95, true)],
        ));
        let labeled = engine.label(&ctx(), true).await.unwrap();
        assert!(labeled.escalated);
        assert_eq!(labeled.model, "large");
        assert!((labeled.label.confidence - 0.95).abs() < 1e-9);
        assert_eq!(labeled.triggers, vec![Trigger::LowConfidence]);
        assert_eq!(
            engine.client().calls(),
            vec![Tier::Default, Tier::Escalation]
        );
    }

    #[tokio::test]
    async fn escalation_disabled_keeps_default() {
        let engine = engine(Scripted::with(vec![reply("tax", 0.3, true)], vec![]));
        let labeled = engine.label(&ctx(), false).await.unwrap();
        assert!(!labeled.escalated);
        assert_eq!(labeled.triggers.len(), 2);
        assert_eq!(engine.client().calls(), vec![Tier::Default]);
    }

    #[tokio::test]
    async fn missing_fields_escalate_expected_types() {
        let engine = engine(Scripted::with(
            vec![reply("financial", 0.95, false)],
            vec![reply("financial", 0.95, true)],
        ));
        let labeled = engine.label(&ctx(), true).await.unwrap();
        assert!(labeled.escalated);
        assert_eq!(labeled.triggers, vec![Trigger::MissingFields]);
    }

    #[tokio::test]
    async fn malformed_replies_retry_then_succeed() {
        let engine = engine(Scripted::with(
            vec![garbage(), garbage(), reply("receipt", 0.9, true)],
            vec![],
        ));
        let labeled = engine.label(&ctx(), true).await.unwrap();
        assert_eq!(labeled.label.doc_type, "receipt");
        assert_eq!(engine.client().calls().len(), 3);
    }

    #[tokio::test]
    async fn malformed_after_all_attempts_fails() {
        let engine = engine(Scripted::with(
            vec![garbage(), garbage(), garbage(), reply("receipt", 0.9, true)],
            vec![],
        ));
        let err = engine.label(&ctx(), true).await.unwrap_err();
        assert!(matches!(err, LabelError::Malformed { attempts: 3, .. }));
        assert_eq!(engine.client().calls().len(), 3);
    }

    #[tokio::test]
    async fn malformed_escalation_keeps_default_with_note() {
        let engine = engine(Scripted::with(
            vec![reply("medical", 0.9, true)],
            vec![garbage(), garbage(), garbage()],
        ));
        let labeled = engine.label(&ctx(), true).await.unwrap();
        assert!(!labeled.escalated);
        assert!(labeled.escalation_failed);
        assert_eq!(labeled.label.doc_type, "medical");
        assert_eq!(labeled.model, "small");
        assert!(labeled.notes[0].starts_with("escalation failed: "));
    }

    #[tokio::test]
    async fn escalation_transport_failure_fails_input() {
        let engine = engine(Scripted::with(
            vec![reply("medical", 0.9, true)],
            vec![Err(InferenceError::Status {
                status: 400,
                body: "bad".to_string(),
            })],
        ));
        let err = engine.label(&ctx(), true).await.unwrap_err();
        assert!(matches!(
            err,
            LabelError::Inference(InferenceError::Status { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let engine = engine(Scripted::with(
            vec![Err(InferenceError::Status {
                status: 404,
                body: String::new(),
            })],
            vec![],
        ));
        assert!(engine.label(&ctx(), true).await.is_err());
        assert_eq!(engine.client().calls().len(), 1);
    }

    #[tokio::test]
    async fn refused_on_every_attempt_is_fatal() {
        let refused = || Err(InferenceError::Unreachable("http://localhost:1".to_string()));
        let engine = engine(Scripted::with(vec![refused(), refused(), refused()], vec![]));
        let err = engine.label(&ctx(), true).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn unknown_doc_type_is_coerced() {
        let engine = engine(Scripted::with(vec![reply("spaceship", 0.9, true)], vec![]));
        let labeled = engine.label(&ctx(), true).await.unwrap();
        assert_eq!(labeled.label.doc_type, FALLBACK_DOC_TYPE);
        assert_eq!(labeled.notes, vec!["doc_type coerced from 'spaceship'"]);
        assert!(!labeled.escalated);
    }

    /// One registered input per text with a successful extraction. Sidecars
    /// are written only when `with_sidecars` is set.
    async fn extracted_library(
        texts: &[&str],
        with_sidecars: bool,
    ) -> (TempDir, SqlitePool, Config, Vec<InputRecord>) {
        let (dir, pool) = test_pool().await;
        let config = crate::config::parse_config(&format!(
            "[db]\npath = \"{0}/db.sqlite\"\n[storage]\nsidecar_dir = \"{0}/sidecars\"\n",
            dir.path().display()
        ))
        .unwrap();
        let store = SidecarStore::new(&config.storage.sidecar_dir);
        let scan_run = RunLedger::new(pool.clone())
            .begin(StageKind::Inventory, &serde_json::json!({}))
            .await
            .unwrap();

        for (i, text) in texts.iter().enumerate() {
            let hash = identity::hash_bytes(text.as_bytes());
            let discovered = Discovered {
                path: dir.path().join(format!("doc{}.txt", i)),
                size: text.len() as u64,
                mtime: 0,
                mime_hint: Some("text/plain".to_string()),
            };
            let registered = inventory::register(&pool, scan_run, &discovered, &hash)
                .await
                .unwrap();
            if with_sidecars {
                store.write(&hash, text).unwrap();
            }
            sqlx::query(
                "INSERT INTO extractions (input_id, run_id, content_hash, status, backend, sidecar_hash, created_at)
                 VALUES (?, ?, ?, 'success', 'text', ?, 0)",
            )
            .bind(registered.input_id)
            .bind(scan_run)
            .bind(&hash)
            .bind(&hash)
            .execute(&pool)
            .await
            .unwrap();
        }

        let inputs = inventory::list(&pool, None).await.unwrap();
        (dir, pool, config, inputs)
    }

    #[tokio::test]
    async fn failed_input_keeps_its_reason() {
        let (_dir, pool, config, inputs) = extracted_library(&["statement"], true).await;
        let stage = LabelStage::with_engine(
            pool.clone(),
            &config,
            engine(Scripted::with(vec![garbage(), garbage(), garbage()], vec![])),
        );

        let (run_id, stats) = stage.run(false, None, false, &NoProgress).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.stored, 0);

        let failures = failures(&pool, inputs[0].id).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].run_id, run_id);
        assert_eq!(failures[0].status, "failed");
        assert!(failures[0].error.starts_with("malformed reply after 3 attempts: "));
        assert!(history(&pool, inputs[0].id).await.unwrap().is_empty());
        assert!(current_labels(&pool).await.unwrap().is_empty());

        // Still a candidate for the next run.
        let candidates = inventory::labeling_candidates(&pool, false).await.unwrap();
        assert_eq!(candidates.len(), 1);
    }

    #[tokio::test]
    async fn missing_sidecar_is_recorded_as_skipped() {
        let (_dir, pool, config, inputs) = extracted_library(&["statement"], false).await;
        let stage = LabelStage::with_engine(
            pool.clone(),
            &config,
            engine(Scripted::with(vec![reply("receipt", 0.9, true)], vec![])),
        );

        let (_, stats) = stage.run(false, None, false, &NoProgress).await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert!(stage.engine.client().calls().is_empty());

        let failures = failures(&pool, inputs[0].id).await.unwrap();
        assert_eq!(failures[0].status, "skipped");
        assert!(failures[0].error.contains("extracted text missing"));
    }

    #[tokio::test]
    async fn labels_stored_before_server_loss_survive_failed_run() {
        let refused = || Err(InferenceError::Unreachable("http://localhost:1".to_string()));
        let (_dir, pool, config, inputs) =
            extracted_library(&["first statement", "second statement"], true).await;
        let stage = LabelStage::with_engine(
            pool.clone(),
            &config,
            engine(Scripted::with(
                vec![reply("receipt", 0.9, true), refused(), refused(), refused()],
                vec![],
            )),
        );

        let err = stage.run(false, None, false, &NoProgress).await.unwrap_err();
        assert!(format!("{:#}", err).contains("unreachable"));

        let run = RunLedger::new(pool.clone())
            .latest_completed(StageKind::Labeling)
            .await
            .unwrap();
        assert!(run.is_none());
        let runs = RunLedger::new(pool.clone())
            .list(Some(StageKind::Labeling), 1)
            .await
            .unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);

        let first = history(&pool, inputs[0].id).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].run_id, runs[0].id);
        assert_eq!(first[0].model, "small");
        assert!(history(&pool, inputs[1].id).await.unwrap().is_empty());
    }
}
