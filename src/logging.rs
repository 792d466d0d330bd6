//! Log plumbing: rolling file subscribers plus the newline-delimited
//! JSON statistics feed.
//!
//! Three rolling targets live in the logs directory: the application
//! log, a dedicated transcoder log (everything emitted with the
//! [`TRANSCODER_TARGET`] tracing target), and an errors-only log.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{Duration, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::sync_ext::MutexExt;

/// Tracing target that routes events into the transcoder log file.
pub const TRANSCODER_TARGET: &str = "transcoder";

/// Keeps the non-blocking writers alive for the process lifetime.
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

impl std::fmt::Debug for LogGuards {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogGuards").finish_non_exhaustive()
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `default_level`.
pub fn init(logs_dir: &Path, default_level: &str) -> anyhow::Result<LogGuards> {
    std::fs::create_dir_all(logs_dir)?;

    let env_filter = |fallback: &str| {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(fallback))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let (app_writer, app_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, "recodarr.log"));
    let (tc_writer, tc_guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
        logs_dir,
        "transcoder.log",
    ));
    let (err_writer, err_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, "errors.log"));

    let app_layer = fmt::layer()
        .with_writer(app_writer)
        .with_ansi(false)
        .with_filter(filter_fn(|meta| meta.target() != TRANSCODER_TARGET))
        .with_filter(env_filter(default_level));

    let transcoder_layer = fmt::layer()
        .with_writer(tc_writer)
        .with_ansi(false)
        .with_filter(filter_fn(|meta| meta.target() == TRANSCODER_TARGET));

    let errors_layer = fmt::layer()
        .with_writer(err_writer)
        .with_ansi(false)
        .with_filter(LevelFilter::ERROR);

    let stdout_layer = fmt::layer()
        .with_filter(env_filter(default_level));

    tracing_subscriber::registry()
        .with(app_layer)
        .with(transcoder_layer)
        .with(errors_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(LogGuards {
        _guards: vec![app_guard, tc_guard, err_guard],
    })
}

const STATS_STAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// One structured statistics event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatsEvent {
    ScanComplete {
        path: String,
        files_found: u64,
        duration_seconds: f64,
    },
    TranscodeComplete {
        file: String,
        original_size_mb: f64,
        new_size_mb: f64,
        savings_percent: f64,
        duration_seconds: f64,
    },
    TranscodeError {
        file: String,
        error: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct StatsLine {
    timestamp: String,
    #[serde(flatten)]
    event: StatsEvent,
}

/// Rolled-up view of recent statistics events.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSummary {
    pub days: i64,
    pub total_transcodes: u64,
    pub total_errors: u64,
    pub total_saved_mb: f64,
    pub avg_savings_percent: f64,
}

/// Append-only JSONL statistics file, one event per line.
pub struct StatsLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for StatsLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsLog").field("path", &self.path).finish()
    }
}

impl StatsLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Record an event. Statistics are best-effort: failures are
    /// logged and swallowed so they can never break a job.
    pub fn record(&self, event: StatsEvent) {
        let line = StatsLine {
            timestamp: Local::now().format(STATS_STAMP_FORMAT).to_string(),
            event,
        };
        let _guard = self.write_lock.lock_unpoisoned();
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            let json = serde_json::to_string(&line)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            writeln!(file, "{json}")
        })();
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to append statistics event");
        }
    }

    /// Summarise the last `days` days of events. Unparseable lines are
    /// skipped.
    pub fn summary(&self, days: i64) -> StatsSummary {
        let mut summary = StatsSummary {
            days,
            ..StatsSummary::default()
        };
        let cutoff = Local::now().naive_local() - Duration::days(days);

        let Ok(file) = std::fs::File::open(&self.path) else {
            return summary;
        };
        let mut savings_percents = Vec::new();
        for line in BufReader::new(file).lines() {
            let Ok(line) = line else { break };
            let Ok(parsed) = serde_json::from_str::<StatsLine>(&line) else {
                continue;
            };
            let Some(stamp) = NaiveDateTime::parse_from_str(&parsed.timestamp, STATS_STAMP_FORMAT)
                .ok()
            else {
                continue;
            };
            if stamp < cutoff {
                continue;
            }
            match parsed.event {
                StatsEvent::TranscodeComplete {
                    original_size_mb,
                    new_size_mb,
                    savings_percent,
                    ..
                } => {
                    summary.total_transcodes += 1;
                    summary.total_saved_mb += original_size_mb - new_size_mb;
                    savings_percents.push(savings_percent);
                }
                StatsEvent::TranscodeError { .. } => summary.total_errors += 1,
                StatsEvent::ScanComplete { .. } => {}
            }
        }
        if !savings_percents.is_empty() {
            summary.avg_savings_percent =
                savings_percents.iter().sum::<f64>() / savings_percents.len() as f64;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_round_trip_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let stats = StatsLog::new(dir.path().join("statistics.jsonl"));

        stats.record(StatsEvent::ScanComplete {
            path: "/media".to_string(),
            files_found: 12,
            duration_seconds: 1.5,
        });
        stats.record(StatsEvent::TranscodeComplete {
            file: "a.mkv".to_string(),
            original_size_mb: 4000.0,
            new_size_mb: 2000.0,
            savings_percent: 50.0,
            duration_seconds: 600.0,
        });
        stats.record(StatsEvent::TranscodeComplete {
            file: "b.mkv".to_string(),
            original_size_mb: 1000.0,
            new_size_mb: 750.0,
            savings_percent: 25.0,
            duration_seconds: 300.0,
        });
        stats.record(StatsEvent::TranscodeError {
            file: "c.mkv".to_string(),
            error: "transcoder exited with code 3".to_string(),
        });

        let summary = stats.summary(7);
        assert_eq!(summary.total_transcodes, 2);
        assert_eq!(summary.total_errors, 1);
        assert!((summary.total_saved_mb - 2250.0).abs() < 0.001);
        assert!((summary.avg_savings_percent - 37.5).abs() < 0.001);
    }

    #[test]
    fn summary_of_missing_file_is_empty() {
        let stats = StatsLog::new(PathBuf::from("/nonexistent/statistics.jsonl"));
        let summary = stats.summary(7);
        assert_eq!(summary.total_transcodes, 0);
        assert_eq!(summary.total_errors, 0);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statistics.jsonl");
        std::fs::write(&path, "not json\n{\"half\":\n").unwrap();

        let stats = StatsLog::new(path);
        stats.record(StatsEvent::TranscodeError {
            file: "x.mkv".to_string(),
            error: "boom".to_string(),
        });
        let summary = stats.summary(1);
        assert_eq!(summary.total_errors, 1);
    }
}
