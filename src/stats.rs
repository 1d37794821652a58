//! Operator views over a search session.
//!
//! `greylit status` shows where a processing run is, `greylit stats` prints
//! the session statistics handed to reporting, and `greylit groups` lists
//! duplicate groups for review.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use greylit_core::session::ProcessingSession;
use greylit_core::statistics::SessionStatistics;
use greylit_core::store::ResultStore;

use crate::config::Config;
use crate::db;
use crate::progress::format_number;
use crate::sqlite_store::SqliteStore;

/// Print the processing session's state and its most recent errors.
pub async fn run_status(config: &Config, session_id: &str, errors: usize) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());

    let Some(session) = store.processing_session(session_id).await? else {
        pool.close().await;
        bail!("no processing session for search session {}", session_id);
    };
    print!("{}", render_status(&session, Utc::now(), errors));

    pool.close().await;
    Ok(())
}

fn render_status(session: &ProcessingSession, now: DateTime<Utc>, errors: usize) -> String {
    let mut out = String::new();
    out.push_str(&format!("Processing session {}\n", session.session_id));
    out.push_str(&format!("  Status:      {}\n", session.status));
    out.push_str(&format!(
        "  Stage:       {} ({}%)\n",
        session.current_stage, session.stage_progress
    ));
    out.push_str(&format!(
        "  Progress:    {} / {} ({:.1}%)\n",
        format_number(session.processed_count),
        format_number(session.total_raw_results),
        session.progress_percentage()
    ));
    out.push_str(&format!(
        "  Processed:   {}\n",
        format_number(session.processed_count)
    ));
    out.push_str(&format!("  Errors:      {}\n", format_number(session.error_count)));
    out.push_str(&format!(
        "  Duplicates:  {}\n",
        format_number(session.duplicate_count)
    ));
    out.push_str(&format!("  Retries:     {}\n", session.retry_count));
    if let Some(task_id) = &session.task_id {
        out.push_str(&format!("  Task:        {}\n", task_id));
    }
    if let Some(secs) = session.duration_seconds(now) {
        out.push_str(&format!("  Duration:    {}\n", format_duration(secs)));
    }
    if let Some(eta) = session.estimated_completion(now) {
        out.push_str(&format!("  ETA:         {}\n", format_time(eta)));
    }
    if let Some(heartbeat) = session.last_heartbeat {
        out.push_str(&format!("  Heartbeat:   {}\n", format_relative(heartbeat, now)));
    }

    let recent = session.recent_errors(errors);
    if !recent.is_empty() {
        out.push_str(&format!("\n  Recent errors ({}):\n", recent.len()));
        for detail in recent {
            out.push_str(&format!(
                "  {}  {}\n",
                format_time(detail.timestamp),
                detail.message
            ));
            if let Some(details) = &detail.details {
                out.push_str(&format!("      {}\n", details));
            }
        }
    }
    out
}

/// Print session statistics, as a table or as JSON.
pub async fn run_stats(config: &Config, session_id: &str, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());

    if !store.search_session_exists(session_id).await? {
        pool.close().await;
        bail!("unknown search session: {}", session_id);
    }
    let total_raw = store.raw_result_count(session_id).await?;
    let results = store.processed_results(session_id).await?;
    let groups = store.duplicate_groups(session_id).await?;
    let stats = SessionStatistics::compute(total_raw, &results, &groups);

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print!("{}", render_stats(session_id, &stats));
    }

    pool.close().await;
    Ok(())
}

fn render_stats(session_id: &str, stats: &SessionStatistics) -> String {
    let mut out = String::new();
    out.push_str(&format!("Session statistics {}\n", session_id));
    out.push_str(&format!("  Raw results:       {}\n", format_number(stats.total_results)));
    out.push_str(&format!(
        "  Processed:         {}\n",
        format_number(stats.processed_results)
    ));
    out.push_str(&format!(
        "  Duplicate groups:  {}\n",
        format_number(stats.duplicate_groups)
    ));
    out.push_str(&format!("  Unique:            {}\n", format_number(stats.unique_results)));
    out.push_str(&format!("  Avg relevance:     {:.3}\n", stats.average_relevance));
    out.push_str(&format!("  Full text:         {:.1}%\n", stats.full_text_percentage));
    out.push_str(&format!("  Academic:          {:.1}%\n", stats.academic_percentage));

    if !stats.document_type_distribution.is_empty() {
        out.push_str("\n  By document type:\n");
        for (kind, count) in &stats.document_type_distribution {
            out.push_str(&format!("  {:<12} {:>8}\n", kind, format_number(*count)));
        }
    }
    if !stats.publication_year_distribution.is_empty() {
        out.push_str("\n  By publication year:\n");
        for (year, count) in &stats.publication_year_distribution {
            out.push_str(&format!("  {:<12} {:>8}\n", year, format_number(*count)));
        }
    }
    out
}

/// List a session's duplicate groups.
pub async fn run_groups(config: &Config, session_id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());

    let groups = store.duplicate_groups(session_id).await?;
    if groups.is_empty() {
        println!("No duplicate groups.");
    } else {
        println!(
            "{:<36}  {:<14} {:>6} {:>5}  {}",
            "GROUP", "TYPE", "CONF", "SIZE", "CANONICAL URL"
        );
        for group in &groups {
            println!(
                "{:<36}  {:<14} {:>6.3} {:>5}  {}",
                group.id,
                group.similarity_type,
                group.confidence,
                group.result_count,
                group.canonical_url
            );
        }
    }

    pool.close().await;
    Ok(())
}

fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

fn format_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Relative time for recent instants ("42s ago"), absolute otherwise.
fn format_relative(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - ts).num_seconds();
    if delta < 0 {
        return format_time(ts);
    }
    if delta < 60 {
        format!("{}s ago", delta)
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        format_time(ts)
    }
}
