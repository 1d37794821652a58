//! # greylit
//!
//! Result processing for grey-literature systematic reviews.
//!
//! Raw search-engine results are ingested per search session, normalized and
//! enriched in concurrent batches, deduplicated across the whole session, and
//! summarized for reporting. Progress and errors are tracked on a persistent
//! processing session so runs can be observed and retried.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────┐   ┌──────────┐
//! │  ingest  │──▶│  Pipeline            │──▶│  SQLite  │
//! │  (JSON)  │   │  batches → dedup →   │   │  store   │
//! └──────────┘   │  statistics          │   └────┬─────┘
//!                └──────────────────────┘        │
//!                                  ┌─────────────┤
//!                                  ▼             ▼
//!                            ┌──────────┐  ┌──────────┐
//!                            │  status  │  │  stats   │
//!                            │  groups  │  │  (JSON)  │
//!                            └──────────┘  └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! greylit init
//! greylit ingest review-42 results.json --title "Rural telehealth"
//! greylit process review-42
//! greylit status review-42 --errors 5
//! greylit stats review-42 --json
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the result store |
//! | [`pipeline`] | Batch orchestrator, retry and merge |
//! | [`progress`] | Progress reporting on stderr |
//! | [`ingest`] | Raw result ingestion |
//! | [`stats`] | Status, statistics and group views |
//! | [`error`] | Pipeline error type |
//!
//! The pure domain logic (similarity, metadata, deduplication, the session
//! state machine) lives in the `greylit-core` crate.

pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod migrate;
pub mod pipeline;
pub mod progress;
pub mod sqlite_store;
pub mod stats;
