use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index if missing. Safe to run repeatedly.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Create search_sessions table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS search_sessions (
            id TEXT PRIMARY KEY,
            title TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create raw_results table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_results (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            title TEXT NOT NULL,
            link TEXT NOT NULL,
            snippet TEXT NOT NULL DEFAULT '',
            detected_date TEXT,
            has_pdf INTEGER NOT NULL DEFAULT 0,
            is_processed INTEGER NOT NULL DEFAULT 0,
            processing_error TEXT,
            FOREIGN KEY (session_id) REFERENCES search_sessions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create duplicate_groups table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS duplicate_groups (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            canonical_result_id TEXT NOT NULL,
            canonical_url TEXT NOT NULL,
            similarity_type TEXT NOT NULL,
            confidence REAL NOT NULL,
            result_count INTEGER NOT NULL,
            sources_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            FOREIGN KEY (session_id) REFERENCES search_sessions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create processed_results table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_results (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            raw_result_id TEXT,
            title TEXT NOT NULL,
            normalized_url TEXT NOT NULL,
            snippet TEXT NOT NULL DEFAULT '',
            publication_year INTEGER,
            document_type TEXT NOT NULL,
            is_pdf INTEGER NOT NULL DEFAULT 0,
            relevance_score REAL,
            duplicate_group_id TEXT,
            is_reviewed INTEGER NOT NULL DEFAULT 0,
            review_priority INTEGER NOT NULL DEFAULT 0,
            position INTEGER NOT NULL,
            processed_at INTEGER NOT NULL,
            UNIQUE(session_id, raw_result_id),
            FOREIGN KEY (session_id) REFERENCES search_sessions(id),
            FOREIGN KEY (raw_result_id) REFERENCES raw_results(id) ON DELETE SET NULL,
            FOREIGN KEY (duplicate_group_id) REFERENCES duplicate_groups(id) ON DELETE SET NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create processing_sessions table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_sessions (
            session_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            current_stage TEXT NOT NULL,
            stage_progress INTEGER NOT NULL DEFAULT 0,
            total_raw_results INTEGER NOT NULL DEFAULT 0,
            processed_count INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            duplicate_count INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            task_id TEXT,
            started_at INTEGER,
            completed_at INTEGER,
            last_heartbeat INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create processing_errors table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            message TEXT NOT NULL,
            details TEXT,
            FOREIGN KEY (session_id) REFERENCES processing_sessions(session_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_raw_results_session ON raw_results(session_id, position)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processed_results_session ON processed_results(session_id, position)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processed_results_group ON processed_results(duplicate_group_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_duplicate_groups_session ON duplicate_groups(session_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_processing_errors_session ON processing_errors(session_id, id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
