//! # Archivist
//!
//! A local-first pipeline that turns a pile of personal documents into a
//! labeled, reviewable filing plan.
//!
//! Archivist inventories a directory tree by content hash, extracts text
//! through an ordered chain of extraction backends, labels each document
//! with a local OpenAI-compatible model (escalating to a larger model when
//! the first answer looks weak), and records where every file would go.
//! Nothing on disk is moved. Every stage execution is recorded in an
//! append-only run ledger.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────┐   ┌────────────┐   ┌──────────┐
//! │ Inventory │──▶│ Extraction │──▶│  Labeling  │──▶│ Planning │
//! │ walk+hash │   │  fallback  │   │ escalation │   │  plans   │
//! └─────┬─────┘   └─────┬──────┘   └─────┬──────┘   └────┬─────┘
//!       │               │ sidecars        │ inference     │
//!       ▼               ▼                 ▼               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 SQLite (inputs, records, runs)               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! archivist init                 # create database
//! archivist scan ~/Documents     # inventory by content hash
//! archivist extract              # text sidecars
//! archivist label                # doc type, title, tags, target path
//! archivist plan                 # placement plan
//! archivist runs list            # what ran, and how it ended
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`identity`] | Content hashing |
//! | [`scanner`] | Directory walking |
//! | [`inventory`] | Input registry and the scan stage |
//! | [`ledger`] | Run ledger |
//! | [`backends`] | Text extraction backends |
//! | [`extraction`] | Fallback engine and the extraction stage |
//! | [`sidecar`] | Compressed extracted-text storage |
//! | [`inference`] | OpenAI-compatible inference client |
//! | [`prompts`] | Labeling prompt and response parsing |
//! | [`labeling`] | Escalating label engine and the labeling stage |
//! | [`planner`] | Placement plans |
//! | [`history`] | Per-input history |
//! | [`stats`] | Library statistics |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod backends;
pub mod config;
pub mod db;
pub mod extraction;
pub mod history;
pub mod identity;
pub mod inference;
pub mod inventory;
pub mod labeling;
pub mod ledger;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod planner;
pub mod progress;
pub mod prompts;
pub mod scanner;
pub mod sidecar;
pub mod stats;

#[cfg(test)]
mod testutil;
