//! Per-input history: what happened to one input across every run.
//!
//! `archivist show <path|hash>` resolves the key to one or more inputs and
//! prints their extraction, label and plan records, newest first, with the
//! reason for every failure or skip.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::models::{ExtractionRecord, InputRecord, LabelFailure, LabelRecord, PlanRecord};
use crate::stats::format_ts_iso;
use crate::{db, extraction, identity, inventory, labeling, planner};

#[derive(Debug, Clone, Serialize)]
pub struct InventoryFailure {
    pub run_id: i64,
    pub error: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputHistory {
    pub input: InputRecord,
    pub inventory_failures: Vec<InventoryFailure>,
    pub extractions: Vec<ExtractionRecord>,
    pub labels: Vec<LabelRecord>,
    pub label_failures: Vec<LabelFailure>,
    pub plans: Vec<PlanRecord>,
}

/// Resolve `key` (a content hash or a path) to the matching inputs.
pub async fn resolve(pool: &SqlitePool, key: &str) -> Result<Vec<InputRecord>> {
    if identity::is_content_hash(key) {
        return inventory::by_hash(pool, key).await;
    }
    let path = std::fs::canonicalize(key)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| key.to_string());
    Ok(inventory::get_by_path(pool, &path).await?.into_iter().collect())
}

pub async fn input_history(pool: &SqlitePool, input: InputRecord) -> Result<InputHistory> {
    let rows = sqlx::query(
        "SELECT run_id, error, created_at FROM inventory_failures WHERE path = ? ORDER BY id DESC",
    )
    .bind(&input.path)
    .fetch_all(pool)
    .await?;

    Ok(InputHistory {
        inventory_failures: rows
            .iter()
            .map(|r| InventoryFailure {
                run_id: r.get("run_id"),
                error: r.get("error"),
                created_at: r.get("created_at"),
            })
            .collect(),
        extractions: extraction::history(pool, input.id).await?,
        labels: labeling::history(pool, input.id).await?,
        label_failures: labeling::failures(pool, input.id).await?,
        plans: planner::history(pool, input.id).await?,
        input,
    })
}

pub async fn run_show(config: &Config, key: &str, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let inputs = resolve(&pool, key).await?;
    if inputs.is_empty() {
        pool.close().await;
        bail!("no input found for {}", key);
    }

    let mut histories = Vec::with_capacity(inputs.len());
    for input in inputs {
        histories.push(input_history(&pool, input).await?);
    }
    pool.close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&histories)?);
        return Ok(());
    }

    for h in &histories {
        print_history(h);
    }
    Ok(())
}

fn print_history(h: &InputHistory) {
    let input = &h.input;
    println!("--- Input {} ---", input.id);
    println!("path:         {}", input.path);
    println!("hash:         {}", input.content_hash);
    println!("size:         {} bytes", input.size);
    println!("mime:         {}", input.mime_hint.as_deref().unwrap_or("unknown"));
    println!("status:       {}", input.status.as_str());
    println!("discovered:   run {} (last seen run {})", input.discovery_run, input.last_seen_run);

    if !h.inventory_failures.is_empty() {
        println!();
        println!("Inventory failures:");
        for f in &h.inventory_failures {
            println!("  run {:<5} {}  {}", f.run_id, format_ts_iso(f.created_at), f.error);
        }
    }

    println!();
    println!("Extractions ({}):", h.extractions.len());
    for e in &h.extractions {
        let stale = if e.content_hash != input.content_hash { " (old content)" } else { "" };
        println!(
            "  run {:<5} {}  {:<8} {}{}",
            e.run_id,
            format_ts_iso(e.created_at),
            e.status.as_str(),
            e.backend.as_deref().or(e.error.as_deref()).unwrap_or(""),
            stale
        );
    }

    println!();
    println!("Labels ({}):", h.labels.len());
    for l in &h.labels {
        println!(
            "  run {:<5} {}  {} ({:.2}) via {}{}",
            l.run_id,
            format_ts_iso(l.created_at),
            l.doc_type,
            l.confidence,
            l.model,
            if l.escalated { ", escalated" } else { "" }
        );
        println!("             {} -> {}", l.title, l.target_path);
        if !l.tags.is_empty() {
            println!("             tags: {}", l.tags.join(", "));
        }
        for note in &l.notes {
            println!("             note: {}", note);
        }
    }

    if !h.label_failures.is_empty() {
        println!();
        println!("Labeling failures ({}):", h.label_failures.len());
        for f in &h.label_failures {
            let stale = if f.content_hash != input.content_hash { " (old content)" } else { "" };
            println!(
                "  run {:<5} {}  {:<8} {}{}",
                f.run_id,
                format_ts_iso(f.created_at),
                f.status,
                f.error,
                stale
            );
        }
    }

    if !h.plans.is_empty() {
        println!();
        println!("Plans ({}):", h.plans.len());
        for p in &h.plans {
            println!(
                "  run {:<5} {}/{}{}",
                p.run_id,
                p.target_dir,
                p.target_filename,
                if p.needs_review { "  [needs review]" } else { "" }
            );
        }
    }
    println!();
}
