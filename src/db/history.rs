use chrono::{Duration, Local};
use rusqlite::{Row, params};
use serde::Serialize;

use super::{Database, STAMP_FORMAT};
use crate::domain::HistoryRecord;
use crate::error::StorageResult;

const HISTORY_COLUMNS: &str = "id, file_path, profile_name, original_size_bytes, \
     new_size_bytes, savings_bytes, encoding_time_seconds, codec, container, completed_at";

/// Aggregate view of recent history for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct StatsDashboard {
    pub days: i64,
    pub total_transcodes: i64,
    pub total_saved_bytes: i64,
    pub total_encoding_time_seconds: i64,
    pub avg_savings_percent: f64,
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        id: row.get(0)?,
        file_path: row.get(1)?,
        profile_name: row.get(2)?,
        original_size_bytes: row.get(3)?,
        new_size_bytes: row.get(4)?,
        savings_bytes: row.get(5)?,
        encoding_time_seconds: row.get(6)?,
        codec: row.get(7)?,
        container: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

impl Database {
    /// Append one history row. Called exactly once per successful
    /// finalise, after the file replace, so history never names a file
    /// that does not exist.
    pub fn record_history(&self, record: &HistoryRecord) -> StorageResult<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO history (file_path, profile_name, original_size_bytes, \
                 new_size_bytes, savings_bytes, encoding_time_seconds, codec, container, \
                 completed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.file_path,
                    record.profile_name,
                    record.original_size_bytes,
                    record.new_size_bytes,
                    record.savings_bytes,
                    record.encoding_time_seconds,
                    record.codec,
                    record.container,
                    record.completed_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn history(&self, limit: i64) -> StorageResult<Vec<HistoryRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {HISTORY_COLUMNS} FROM history ORDER BY id DESC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit], history_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn history_count_for_path(&self, file_path: &str) -> StorageResult<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM history WHERE file_path = ?1",
                params![file_path],
                |r| r.get(0),
            )?)
        })
    }

    /// Summarise the last `days` days of history.
    pub fn stats_dashboard(&self, days: i64) -> StorageResult<StatsDashboard> {
        let cutoff = (Local::now() - Duration::days(days))
            .format(STAMP_FORMAT)
            .to_string();
        self.with_conn(|conn| {
            let (count, saved, time): (i64, i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(savings_bytes), 0), \
                 COALESCE(SUM(encoding_time_seconds), 0) \
                 FROM history WHERE completed_at >= ?1",
                params![cutoff],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )?;
            let avg_pct: f64 = conn.query_row(
                "SELECT COALESCE(AVG(CAST(savings_bytes AS REAL) * 100.0 / \
                 NULLIF(original_size_bytes, 0)), 0.0) \
                 FROM history WHERE completed_at >= ?1",
                params![cutoff],
                |r| r.get(0),
            )?;
            Ok(StatsDashboard {
                days,
                total_transcodes: count,
                total_saved_bytes: saved,
                total_encoding_time_seconds: time,
                avg_savings_percent: avg_pct,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::now_stamp;

    fn record(path: &str, original: i64, new: i64) -> HistoryRecord {
        HistoryRecord {
            id: 0,
            file_path: path.to_string(),
            profile_name: "p".to_string(),
            original_size_bytes: original,
            new_size_bytes: new,
            savings_bytes: original - new,
            encoding_time_seconds: 120,
            codec: "av1".to_string(),
            container: "mkv".to_string(),
            completed_at: now_stamp(),
        }
    }

    #[test]
    fn history_appends_and_lists_newest_first() {
        let db = Database::open_in_memory().unwrap();
        db.record_history(&record("/m/a.mkv", 1000, 400)).unwrap();
        db.record_history(&record("/m/b.mkv", 2000, 1500)).unwrap();

        let rows = db.history(10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].file_path, "/m/b.mkv");
        assert_eq!(db.history_count_for_path("/m/a.mkv").unwrap(), 1);
    }

    #[test]
    fn dashboard_aggregates_recent_rows() {
        let db = Database::open_in_memory().unwrap();
        db.record_history(&record("/m/a.mkv", 1000, 500)).unwrap();
        db.record_history(&record("/m/b.mkv", 4000, 3000)).unwrap();

        let dash = db.stats_dashboard(7).unwrap();
        assert_eq!(dash.total_transcodes, 2);
        assert_eq!(dash.total_saved_bytes, 1500);
        assert_eq!(dash.total_encoding_time_seconds, 240);
        // 50% and 25% average to 37.5%.
        assert!((dash.avg_savings_percent - 37.5).abs() < 0.01);
    }

    #[test]
    fn negative_savings_are_recorded_faithfully() {
        let db = Database::open_in_memory().unwrap();
        db.record_history(&record("/m/grew.mkv", 1000, 1200)).unwrap();
        let rows = db.history(1).unwrap();
        assert_eq!(rows[0].savings_bytes, -200);
    }
}
