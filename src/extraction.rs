//! Extraction stage: ordered backend fallback, truncation, deduplication.
//!
//! For each candidate input the [`FallbackEngine`] tries every accepting
//! backend in configured order until one yields non-empty text. The text is
//! middle-truncated to a character ceiling and written once per content hash
//! to the sidecar store. Inputs that share a hash reuse the stored sidecar
//! instead of invoking any backend.
//!
//! Work is grouped by content hash and groups run on a bounded pool. One
//! record is written per (input, run) before that input is considered done,
//! so an interrupted run leaves only complete records behind.

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::backends::{Backend, Capability, Hint};
use crate::config::{Config, ExtractionConfig};
use crate::identity;
use crate::inventory;
use crate::ledger::RunLedger;
use crate::models::{ExtractionRecord, ExtractionStatus, InputRecord, StageKind};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::sidecar::SidecarStore;

/// Backend name recorded when an input reused an existing sidecar.
pub const SIDECAR_CACHE: &str = "sidecar-cache";

const STALE_WINDOW: Duration = Duration::from_secs(6 * 3600);

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    Extracted {
        text: String,
        backend: String,
        truncated: bool,
    },
    /// Every accepting backend failed; carries `"name: error; ..."`.
    Failed(String),
    /// No backend accepts this input.
    Skipped(String),
}

/// Keep the first and last `max_chars / 2` characters of `text`, joined by a
/// marker, when it is longer than `max_chars`.
pub fn truncate_middle(text: &str, max_chars: usize) -> Cow<'_, str> {
    let count = text.chars().count();
    if count <= max_chars {
        return Cow::Borrowed(text);
    }
    let half = max_chars / 2;
    let byte_at = |n: usize| {
        text.char_indices()
            .nth(n)
            .map(|(i, _)| i)
            .unwrap_or(text.len())
    };
    let head = &text[..byte_at(half)];
    let tail = &text[byte_at(count - half)..];
    Cow::Owned(format!(
        "{}\n\n[... truncated to {} characters ...]\n\n{}",
        head, max_chars, tail
    ))
}

pub struct FallbackEngine<B: Capability = Backend> {
    backends: Vec<B>,
    max_chars: usize,
}

impl FallbackEngine<Backend> {
    pub fn from_config(config: &ExtractionConfig) -> Self {
        let backends = config
            .backends
            .iter()
            .filter_map(|name| Backend::from_name(name))
            .collect();
        Self::new(backends, config.max_text_chars)
    }
}

impl<B: Capability> FallbackEngine<B> {
    /// `backends` are tried in the order given.
    pub fn new(backends: Vec<B>, max_chars: usize) -> Self {
        Self {
            backends,
            max_chars,
        }
    }

    pub fn extract(&self, bytes: &[u8], hint: &Hint<'_>) -> ExtractionOutcome {
        let mut errors = Vec::new();
        let mut tried = 0usize;

        for backend in self.backends.iter().filter(|b| b.accepts(hint)) {
            tried += 1;
            match backend.attempt(bytes, hint) {
                Ok(text) if !text.trim().is_empty() => {
                    let truncated = truncate_middle(&text, self.max_chars);
                    let was_truncated = matches!(truncated, Cow::Owned(_));
                    return ExtractionOutcome::Extracted {
                        text: truncated.into_owned(),
                        backend: backend.name().to_string(),
                        truncated: was_truncated,
                    };
                }
                Ok(_) => errors.push(format!(
                    "{}: {}",
                    backend.name(),
                    crate::backends::ExtractError::Empty
                )),
                Err(e) => errors.push(format!("{}: {}", backend.name(), e)),
            }
            tracing::debug!(backend = backend.name(), "backend failed, trying next");
        }

        if tried == 0 {
            let kind = hint
                .extension
                .or(hint.mime)
                .unwrap_or("unknown type");
            return ExtractionOutcome::Skipped(format!("no backend for {}", kind));
        }
        ExtractionOutcome::Failed(errors.join("; "))
    }
}

struct NewExtraction<'a> {
    input_id: i64,
    run_id: i64,
    content_hash: &'a str,
    status: ExtractionStatus,
    backend: Option<&'a str>,
    sidecar_hash: Option<&'a str>,
    error: Option<&'a str>,
}

async fn insert_record(pool: &SqlitePool, rec: NewExtraction<'_>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO extractions (input_id, run_id, content_hash, status, backend, sidecar_hash, error, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(rec.input_id)
    .bind(rec.run_id)
    .bind(rec.content_hash)
    .bind(rec.status.as_str())
    .bind(rec.backend)
    .bind(rec.sidecar_hash)
    .bind(rec.error)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await
    .with_context(|| format!("failed to record extraction for input {}", rec.input_id))?;
    Ok(())
}

/// Extraction history for an input, newest first.
pub async fn history(pool: &SqlitePool, input_id: i64) -> Result<Vec<ExtractionRecord>> {
    let rows = sqlx::query("SELECT * FROM extractions WHERE input_id = ? ORDER BY id DESC")
        .bind(input_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(extraction_from_row).collect())
}

/// The most recent successful extraction for the input's given content hash.
pub async fn current(
    pool: &SqlitePool,
    input_id: i64,
    content_hash: &str,
) -> Result<Option<ExtractionRecord>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM extractions
        WHERE input_id = ? AND content_hash = ? AND status = 'success'
        ORDER BY id DESC LIMIT 1
        "#,
    )
    .bind(input_id)
    .bind(content_hash)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| extraction_from_row(&r)))
}

fn extraction_from_row(row: &SqliteRow) -> ExtractionRecord {
    let status: String = row.get("status");
    ExtractionRecord {
        id: row.get("id"),
        input_id: row.get("input_id"),
        run_id: row.get("run_id"),
        content_hash: row.get("content_hash"),
        status: ExtractionStatus::parse(&status),
        backend: row.get("backend"),
        sidecar_hash: row.get("sidecar_hash"),
        error: row.get("error"),
        created_at: row.get("created_at"),
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ExtractionStats {
    pub candidates: u64,
    pub succeeded: u64,
    pub deduplicated: u64,
    pub failed: u64,
    pub skipped: u64,
    pub sidecars_written: u64,
    pub truncated: u64,
    pub by_backend: BTreeMap<String, u64>,
}

impl ExtractionStats {
    fn merge(&mut self, other: ExtractionStats) {
        self.succeeded += other.succeeded;
        self.deduplicated += other.deduplicated;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.sidecars_written += other.sidecars_written;
        self.truncated += other.truncated;
        for (k, v) in other.by_backend {
            *self.by_backend.entry(k).or_default() += v;
        }
    }
}

struct HashGroup {
    content_hash: String,
    inputs: Vec<InputRecord>,
}

pub struct ExtractionStage<B: Capability + 'static = Backend> {
    pool: SqlitePool,
    config: ExtractionConfig,
    snapshot: serde_json::Value,
    store: SidecarStore,
    engine: Arc<FallbackEngine<B>>,
}

impl ExtractionStage<Backend> {
    pub fn new(pool: SqlitePool, config: &Config) -> Self {
        let engine = FallbackEngine::from_config(&config.extraction);
        Self::with_engine(pool, config, engine)
    }
}

impl<B: Capability + 'static> ExtractionStage<B> {
    pub fn with_engine(pool: SqlitePool, config: &Config, engine: FallbackEngine<B>) -> Self {
        Self {
            pool,
            config: config.extraction.clone(),
            snapshot: config.snapshot(),
            store: SidecarStore::new(&config.storage.sidecar_dir),
            engine: Arc::new(engine),
        }
    }

    /// Run one extraction pass under a new ledger run.
    pub async fn run(
        &self,
        force: bool,
        limit: Option<usize>,
        progress: &dyn ProgressReporter,
    ) -> Result<(i64, ExtractionStats)> {
        let ledger = RunLedger::new(self.pool.clone());
        ledger.warn_if_stale(StageKind::Extraction, STALE_WINDOW).await?;

        let mut snapshot = self.snapshot.clone();
        snapshot["args"] = serde_json::json!({ "force": force, "limit": limit });
        let run_id = ledger.begin(StageKind::Extraction, &snapshot).await?;

        match self.execute(run_id, force, limit, progress).await {
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

    async fn execute(
        &self,
        run_id: i64,
        force: bool,
        limit: Option<usize>,
        progress: &dyn ProgressReporter,
    ) -> Result<ExtractionStats> {
        let mut stats = ExtractionStats::default();

        let active = inventory::count_active(&self.pool).await? as u64;
        let mut candidates = inventory::extraction_candidates(&self.pool, force).await?;
        // Inputs already extracted for their current hash.
        stats.skipped += active.saturating_sub(candidates.len() as u64);
        if let Some(limit) = limit {
            candidates.truncate(limit);
        }
        stats.candidates = candidates.len() as u64;
        let already_done = stats.skipped;

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<InputRecord>> = HashMap::new();
        for input in candidates {
            if let Some(reason) = self.skip_reason(&input) {
                insert_record(
                    &self.pool,
                    NewExtraction {
                        input_id: input.id,
                        run_id,
                        content_hash: &input.content_hash,
                        status: ExtractionStatus::Skipped,
                        backend: None,
                        sidecar_hash: None,
                        error: Some(&reason),
                    },
                )
                .await?;
                stats.skipped += 1;
                continue;
            }
            let members = groups.entry(input.content_hash.clone()).or_default();
            if members.is_empty() {
                order.push(input.content_hash.clone());
            }
            members.push(input);
        }

        let groups: Vec<HashGroup> = order
            .into_iter()
            .filter_map(|hash| {
                groups.remove(&hash).map(|inputs| HashGroup {
                    content_hash: hash,
                    inputs,
                })
            })
            .collect();

        tracing::info!(
            run_id,
            candidates = stats.candidates,
            groups = groups.len(),
            workers = self.config.workers,
            "extraction started"
        );

        let total = stats.candidates;
        let mut done = stats.skipped - already_done;
        let mut results = stream::iter(groups)
            .map(|group| self.process_group(run_id, group, force))
            .buffer_unordered(self.config.workers.max(1));

        while let Some(result) = results.next().await {
            let (processed, group_stats) = result?;
            stats.merge(group_stats);
            done += processed;
            progress.report(ProgressEvent::Processing {
                stage: StageKind::Extraction,
                n: done,
                total,
            });
        }

        tracing::info!(
            run_id,
            succeeded = stats.succeeded,
            deduplicated = stats.deduplicated,
            failed = stats.failed,
            skipped = stats.skipped,
            "extraction complete"
        );
        Ok(stats)
    }

    fn skip_reason(&self, input: &InputRecord) -> Option<String> {
        if let Some(ext) = input.extension() {
            if self
                .config
                .skip_extensions
                .iter()
                .any(|s| s.eq_ignore_ascii_case(&ext))
            {
                return Some(format!("extension {} is skipped", ext));
            }
        }
        if input.size as u64 > self.config.max_input_bytes {
            return Some(format!(
                "input is {} bytes, over the {} byte limit",
                input.size, self.config.max_input_bytes
            ));
        }
        None
    }

    /// Process every input sharing one content hash. Returns how many inputs
    /// were recorded. Errors are stage-fatal.
    async fn process_group(
        &self,
        run_id: i64,
        group: HashGroup,
        force: bool,
    ) -> Result<(u64, ExtractionStats)> {
        let mut stats = ExtractionStats::default();
        let hash = group.content_hash;
        let mut written = false;
        // Set when the content itself could not be extracted; later members
        // share the same bytes and get the same outcome.
        let mut content_outcome: Option<(ExtractionStatus, String)> = None;

        for input in &group.inputs {
            let mut rec = NewExtraction {
                input_id: input.id,
                run_id,
                content_hash: &hash,
                status: ExtractionStatus::Success,
                backend: None,
                sidecar_hash: None,
                error: None,
            };

            if let Some((status, reason)) = &content_outcome {
                rec.status = *status;
                rec.error = Some(reason);
                match status {
                    ExtractionStatus::Skipped => stats.skipped += 1,
                    _ => stats.failed += 1,
                }
                insert_record(&self.pool, rec).await?;
                continue;
            }

            let reuse = written || (!force && self.store.exists(&hash));
            if reuse {
                rec.backend = Some(SIDECAR_CACHE);
                rec.sidecar_hash = Some(&hash);
                insert_record(&self.pool, rec).await?;
                stats.succeeded += 1;
                stats.deduplicated += 1;
                *stats.by_backend.entry(SIDECAR_CACHE.to_string()).or_default() += 1;
                continue;
            }

            match self.extract_input(input).await? {
                InputResult::Unreadable(reason) => {
                    tracing::warn!(path = %input.path, reason = %reason, "input unreadable");
                    rec.status = ExtractionStatus::Failed;
                    rec.error = Some(&reason);
                    insert_record(&self.pool, rec).await?;
                    stats.failed += 1;
                }
                InputResult::Outcome(ExtractionOutcome::Extracted {
                    text,
                    backend,
                    truncated,
                }) => {
                    let store = self.store.clone();
                    let key = hash.clone();
                    tokio::task::spawn_blocking(move || store.write(&key, &text))
                        .await
                        .context("sidecar writer task failed")?
                        .context("sidecar write failed")?;
                    written = true;

                    rec.backend = Some(&backend);
                    rec.sidecar_hash = Some(&hash);
                    insert_record(&self.pool, rec).await?;
                    stats.succeeded += 1;
                    stats.sidecars_written += 1;
                    if truncated {
                        stats.truncated += 1;
                    }
                    *stats.by_backend.entry(backend.clone()).or_default() += 1;
                    tracing::debug!(path = %input.path, backend = %backend, truncated, "extracted");
                }
                InputResult::Outcome(ExtractionOutcome::Failed(reason)) => {
                    tracing::warn!(path = %input.path, reason = %reason, "extraction failed");
                    rec.status = ExtractionStatus::Failed;
                    rec.error = Some(&reason);
                    insert_record(&self.pool, rec).await?;
                    stats.failed += 1;
                    content_outcome = Some((ExtractionStatus::Failed, reason));
                }
                InputResult::Outcome(ExtractionOutcome::Skipped(reason)) => {
                    rec.status = ExtractionStatus::Skipped;
                    rec.error = Some(&reason);
                    insert_record(&self.pool, rec).await?;
                    stats.skipped += 1;
                    content_outcome = Some((ExtractionStatus::Skipped, reason));
                }
            }
        }

        Ok((group.inputs.len() as u64, stats))
    }

    /// Read the input and run the engine on a blocking thread, bounded by
    /// `extraction.timeout_secs`. A timed-out thread is abandoned, not killed.
    async fn extract_input(&self, input: &InputRecord) -> Result<InputResult> {
        let limit = Duration::from_secs(self.config.timeout_secs);
        let engine = Arc::clone(&self.engine);
        let path = input.path.clone();
        let expected = input.content_hash.clone();
        let extension = input.extension();
        let mime = input.mime_hint.clone();

        let task = tokio::task::spawn_blocking(move || {
            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                Err(e) => return InputResult::Unreadable(format!("cannot read {}: {}", path, e)),
            };
            if identity::hash_bytes(&bytes) != expected {
                return InputResult::Unreadable(
                    "content changed since inventory; rescan first".to_string(),
                );
            }
            let hint = Hint {
                extension: extension.as_deref(),
                mime: mime.as_deref(),
            };
            InputResult::Outcome(engine.extract(&bytes, &hint))
        });

        match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined.context("extraction worker task failed"),
            Err(_) => {
                tracing::warn!(path = %input.path, timeout_secs = limit.as_secs(), "extraction timed out");
                Ok(InputResult::Outcome(ExtractionOutcome::Failed(format!(
                    "timed out after {}s",
                    limit.as_secs()
                ))))
            }
        }
    }
}

enum InputResult {
    Unreadable(String),
    Outcome(ExtractionOutcome),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ExtractError;
    use crate::progress::NoProgress;
    use crate::scanner::Discovered;
    use crate::testutil::test_pool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Fake {
        name: &'static str,
        result: Result<&'static str, &'static str>,
        calls: Arc<AtomicUsize>,
    }

    impl Fake {
        fn new(name: &'static str, result: Result<&'static str, &'static str>) -> Self {
            Self {
                name,
                result,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Capability for Fake {
        fn name(&self) -> &str {
            self.name
        }
        fn accepts(&self, hint: &Hint<'_>) -> bool {
            hint.extension == Some(".pdf")
        }
        fn attempt(&self, _bytes: &[u8], _hint: &Hint<'_>) -> Result<String, ExtractError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result
                .map(str::to_string)
                .map_err(|e| ExtractError::Pdf(e.to_string()))
        }
    }

    fn pdf() -> Hint<'static> {
        Hint {
            extension: Some(".pdf"),
            mime: None,
        }
    }

    #[test]
    fn first_success_short_circuits() {
        let a = Fake::new("a", Err("broken xref"));
        let b = Fake::new("b", Ok("hello"));
        let c = Fake::new("c", Ok("unused"));
        let engine = FallbackEngine::new(vec![a.clone(), b.clone(), c.clone()], 100);

        let outcome = engine.extract(b"x", &pdf());
        assert_eq!(
            outcome,
            ExtractionOutcome::Extracted {
                text: "hello".to_string(),
                backend: "b".to_string(),
                truncated: false
            }
        );
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn all_failures_are_summarized_in_order() {
        let engine = FallbackEngine::new(
            vec![Fake::new("a", Err("bad")), Fake::new("b", Ok("   \n"))],
            100,
        );
        match engine.extract(b"x", &pdf()) {
            ExtractionOutcome::Failed(summary) => {
                assert_eq!(
                    summary,
                    "a: PDF extraction failed: bad; b: no text extracted"
                );
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn no_accepting_backend_is_skipped() {
        let engine = FallbackEngine::new(vec![Fake::new("a", Ok("x"))], 100);
        let hint = Hint {
            extension: Some(".heic"),
            mime: None,
        };
        assert_eq!(
            engine.extract(b"x", &hint),
            ExtractionOutcome::Skipped("no backend for .heic".to_string())
        );
    }

    #[test]
    fn truncation_keeps_both_ends() {
        assert_eq!(truncate_middle("short", 10), "short");

        let text: String = "a".repeat(60) + &"b".repeat(60);
        let out = truncate_middle(&text, 100);
        assert!(out.starts_with(&"a".repeat(50)));
        assert!(out.ends_with(&"b".repeat(50)));
        assert!(out.contains("\n\n[... truncated to 100 characters ...]\n\n"));
        assert!(!out.contains(&"a".repeat(51)));
        assert!(!out.contains(&"b".repeat(51)));
    }

    #[test]
    fn truncation_is_character_based() {
        let text = "é".repeat(30);
        let out = truncate_middle(&text, 10);
        assert!(out.starts_with("ééééé\n\n"));
        assert!(out.ends_with("\n\nééééé"));
    }

    #[test]
    fn engine_marks_truncated_output() {
        let long: &'static str = Box::leak("x".repeat(500).into_boxed_str());
        let engine = FallbackEngine::new(vec![Fake::new("a", Ok(long))], 100);
        match engine.extract(b"x", &pdf()) {
            ExtractionOutcome::Extracted { truncated, text, .. } => {
                assert!(truncated);
                assert!(text.chars().count() < 500);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Outlives a one-second extraction limit.
    struct Stuck;

    impl Capability for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }
        fn accepts(&self, _hint: &Hint<'_>) -> bool {
            true
        }
        fn attempt(&self, _bytes: &[u8], _hint: &Hint<'_>) -> Result<String, ExtractError> {
            std::thread::sleep(Duration::from_secs(3));
            Ok("late".to_string())
        }
    }

    #[tokio::test]
    async fn hung_backend_is_recorded_as_timed_out() {
        let (dir, pool) = test_pool().await;
        let file = dir.path().join("hang.pdf");
        std::fs::write(&file, b"%PDF-1.4 endless").unwrap();
        let config = crate::config::parse_config(&format!(
            "[db]\npath = \"{0}/db.sqlite\"\n[storage]\nsidecar_dir = \"{0}/sidecars\"\n[extraction]\ntimeout_secs = 1\n",
            dir.path().display()
        ))
        .unwrap();

        let scan_run = RunLedger::new(pool.clone())
            .begin(StageKind::Inventory, &serde_json::json!({}))
            .await
            .unwrap();
        let discovered = Discovered {
            path: file.clone(),
            size: 16,
            mtime: 0,
            mime_hint: None,
        };
        let hash = identity::hash_file(&file).unwrap();
        inventory::register(&pool, scan_run, &discovered, &hash)
            .await
            .unwrap();

        let stage =
            ExtractionStage::with_engine(pool.clone(), &config, FallbackEngine::new(vec![Stuck], 100));
        let (run_id, stats) = stage.run(false, None, &NoProgress).await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 0);

        let input = inventory::list(&pool, None).await.unwrap().remove(0);
        let record = history(&pool, input.id).await.unwrap().remove(0);
        assert_eq!(record.run_id, run_id);
        assert_eq!(record.status, ExtractionStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("timed out after 1s"));
    }
}
