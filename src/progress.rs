//! Processing progress reporting.
//!
//! Reports observable progress during `greylit process` and `greylit retry`
//! so operators see which stage a run is in, how many batches are done, and
//! the final statistics. Progress is emitted on **stderr** so stdout remains
//! parseable for scripts.

use std::io::Write;
use std::sync::Arc;

use greylit_core::session::{ProcessingStage, ProcessingStatus};
use greylit_core::statistics::SessionStatistics;

/// A single progress event for a processing run.
#[derive(Clone, Debug)]
pub enum PipelineProgressEvent {
    /// The run entered a new stage.
    Stage {
        session_id: String,
        stage: ProcessingStage,
    },
    /// A batch finished: cumulative counts across all batches so far.
    Batch {
        session_id: String,
        completed_batches: usize,
        total_batches: usize,
        processed: u64,
        errors: u64,
        total: u64,
    },
    /// The run ended. Statistics are present when it completed.
    Finished {
        session_id: String,
        status: ProcessingStatus,
        statistics: Option<SessionStatistics>,
    },
}

/// Receives progress events from the pipeline. Implementations write to
/// stderr (human or JSON) or collect events in tests.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: PipelineProgressEvent);
}

/// Human-friendly progress on stderr: "process s1  batch 3/10  150 / 500 results  (2 errors)".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: PipelineProgressEvent) {
        let line = match &event {
            PipelineProgressEvent::Stage { session_id, stage } => {
                format!("process {}  {}...\n", session_id, stage)
            }
            PipelineProgressEvent::Batch {
                session_id,
                completed_batches,
                total_batches,
                processed,
                errors,
                total,
            } => {
                let mut line = format!(
                    "process {}  batch {}/{}  {} / {} results",
                    session_id,
                    completed_batches,
                    total_batches,
                    format_number(*processed),
                    format_number(*total)
                );
                if *errors > 0 {
                    line.push_str(&format!("  ({} errors)", format_number(*errors)));
                }
                line.push('\n');
                line
            }
            PipelineProgressEvent::Finished {
                session_id,
                status,
                statistics,
            } => match statistics {
                Some(stats) => format!(
                    "process {}  {}  {} results, {} duplicate groups, {} unique\n",
                    session_id,
                    status,
                    format_number(stats.processed_results),
                    format_number(stats.duplicate_groups),
                    format_number(stats.unique_results)
                ),
                None => format!("process {}  {}\n", session_id, status),
            },
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: PipelineProgressEvent) {
        let obj = match &event {
            PipelineProgressEvent::Stage { session_id, stage } => serde_json::json!({
                "event": "stage",
                "session_id": session_id,
                "stage": stage,
            }),
            PipelineProgressEvent::Batch {
                session_id,
                completed_batches,
                total_batches,
                processed,
                errors,
                total,
            } => serde_json::json!({
                "event": "batch",
                "session_id": session_id,
                "completed_batches": completed_batches,
                "total_batches": total_batches,
                "processed": processed,
                "errors": errors,
                "total": total,
            }),
            PipelineProgressEvent::Finished {
                session_id,
                status,
                statistics,
            } => serde_json::json!({
                "event": "finished",
                "session_id": session_id,
                "status": status,
                "statistics": statistics,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: PipelineProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn progress_mode_parses_cli_values() {
        use clap::ValueEnum;
        assert_eq!(ProgressMode::from_str("json", true).unwrap(), ProgressMode::Json);
        assert_eq!(ProgressMode::from_str("off", true).unwrap(), ProgressMode::Off);
        assert!(ProgressMode::from_str("verbose", true).is_err());
    }
}
