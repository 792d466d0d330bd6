use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Row, params, params_from_iter};

use super::{Database, now_stamp};
use crate::domain::{
    MediaSpecs, PermissionStatus, QueueItem, QueueItemPatch, QueueStatus, TargetSpecs,
    UpscalePlan,
};
use crate::error::{StorageError, StorageResult};

const QUEUE_COLUMNS: &str = "id, file_path, root_id, profile_id, status, priority, \
     current_specs, target_specs, file_size_bytes, estimated_savings_bytes, progress, \
     current_cpu_percent, current_memory_mb, permission_status, permission_message, \
     paused_reason, error_message, upscale_plan, created_at, started_at, completed_at";

/// A queue row as produced by the scan pipeline.
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub file_path: String,
    pub root_id: Option<i64>,
    pub profile_id: i64,
    pub status: QueueStatus,
    pub priority: i64,
    pub current_specs: Option<MediaSpecs>,
    pub target_specs: Option<TargetSpecs>,
    pub file_size_bytes: i64,
    pub estimated_savings_bytes: i64,
    pub permission_status: Option<PermissionStatus>,
    pub permission_message: Option<String>,
    pub upscale_plan: Option<UpscalePlan>,
}

impl NewQueueItem {
    /// Minimal pending row; the scan pipeline fills in the rest.
    pub fn pending(file_path: impl Into<String>, profile_id: i64, root_id: Option<i64>) -> Self {
        Self {
            file_path: file_path.into(),
            root_id,
            profile_id,
            status: QueueStatus::Pending,
            priority: 50,
            current_specs: None,
            target_specs: None,
            file_size_bytes: 0,
            estimated_savings_bytes: 0,
            permission_status: None,
            permission_message: None,
            upscale_plan: None,
        }
    }
}

struct RawQueueRow {
    id: i64,
    file_path: String,
    root_id: Option<i64>,
    profile_id: i64,
    status: String,
    priority: i64,
    current_specs: Option<String>,
    target_specs: Option<String>,
    file_size_bytes: i64,
    estimated_savings_bytes: i64,
    progress: f64,
    current_cpu_percent: f64,
    current_memory_mb: f64,
    permission_status: Option<String>,
    permission_message: Option<String>,
    paused_reason: Option<String>,
    error_message: Option<String>,
    upscale_plan: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<RawQueueRow> {
    Ok(RawQueueRow {
        id: row.get(0)?,
        file_path: row.get(1)?,
        root_id: row.get(2)?,
        profile_id: row.get(3)?,
        status: row.get(4)?,
        priority: row.get(5)?,
        current_specs: row.get(6)?,
        target_specs: row.get(7)?,
        file_size_bytes: row.get(8)?,
        estimated_savings_bytes: row.get(9)?,
        progress: row.get(10)?,
        current_cpu_percent: row.get(11)?,
        current_memory_mb: row.get(12)?,
        permission_status: row.get(13)?,
        permission_message: row.get(14)?,
        paused_reason: row.get(15)?,
        error_message: row.get(16)?,
        upscale_plan: row.get(17)?,
        created_at: row.get(18)?,
        started_at: row.get(19)?,
        completed_at: row.get(20)?,
    })
}

fn decode_json<T: serde::de::DeserializeOwned>(
    column: &'static str,
    value: Option<String>,
) -> StorageResult<Option<T>> {
    match value {
        None => Ok(None),
        Some(text) if text.is_empty() => Ok(None),
        Some(text) => serde_json::from_str(&text).map(Some).map_err(|_| {
            StorageError::InvalidValue {
                column,
                value: text,
            }
        }),
    }
}

impl TryFrom<RawQueueRow> for QueueItem {
    type Error = StorageError;

    fn try_from(raw: RawQueueRow) -> Result<Self, StorageError> {
        Ok(QueueItem {
            id: raw.id,
            file_path: raw.file_path,
            root_id: raw.root_id,
            profile_id: raw.profile_id,
            status: QueueStatus::parse(&raw.status)?,
            priority: raw.priority,
            current_specs: decode_json("current_specs", raw.current_specs)?,
            target_specs: decode_json("target_specs", raw.target_specs)?,
            file_size_bytes: raw.file_size_bytes,
            estimated_savings_bytes: raw.estimated_savings_bytes,
            progress: raw.progress,
            current_cpu_percent: raw.current_cpu_percent,
            current_memory_mb: raw.current_memory_mb,
            permission_status: raw
                .permission_status
                .as_deref()
                .map(PermissionStatus::parse)
                .transpose()?,
            permission_message: raw.permission_message,
            paused_reason: raw.paused_reason,
            error_message: raw.error_message,
            upscale_plan: decode_json("upscale_plan", raw.upscale_plan)?,
            created_at: raw.created_at,
            started_at: raw.started_at,
            completed_at: raw.completed_at,
        })
    }
}

fn encode_json<T: serde::Serialize>(value: &Option<T>) -> StorageResult<Option<String>> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v))
        .transpose()
        .map_err(|e| StorageError::ConstraintViolation(format!("unencodable JSON column: {e}")))
}

impl Database {
    /// Insert a new queue item.
    ///
    /// Enforces the per-path uniqueness rule: a second row for the
    /// same `file_path` is refused while any non-terminal row exists.
    pub fn insert_queue_item(&self, new: &NewQueueItem) -> StorageResult<i64> {
        let current_specs = encode_json(&new.current_specs)?;
        let target_specs = encode_json(&new.target_specs)?;
        let upscale_plan = encode_json(&new.upscale_plan)?;

        self.with_tx(|tx| {
            let active: i64 = tx.query_row(
                "SELECT COUNT(*) FROM queue WHERE file_path = ?1 \
                 AND status NOT IN ('completed', 'failed')",
                params![new.file_path],
                |r| r.get(0),
            )?;
            if active > 0 {
                return Err(StorageError::ConstraintViolation(format!(
                    "an active queue item already exists for {}",
                    new.file_path
                )));
            }

            tx.execute(
                "INSERT INTO queue (file_path, root_id, profile_id, status, priority, \
                 current_specs, target_specs, file_size_bytes, estimated_savings_bytes, \
                 permission_status, permission_message, upscale_plan, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    new.file_path,
                    new.root_id,
                    new.profile_id,
                    new.status.as_str(),
                    new.priority,
                    current_specs,
                    target_specs,
                    new.file_size_bytes,
                    new.estimated_savings_bytes,
                    new.permission_status.map(PermissionStatus::as_str),
                    new.permission_message,
                    upscale_plan,
                    now_stamp(),
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    /// Apply a partial update to one queue item.
    ///
    /// Status changes keep the terminal-stamp invariant: moving into
    /// `completed`/`failed` stamps `completed_at` (and pins progress
    /// to 100 for `completed`); moving anywhere else clears it.
    pub fn update_queue_item(&self, id: i64, patch: &QueueItemPatch) -> StorageResult<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        let mut push = |sets: &mut Vec<String>, column: &str, value: Value| {
            sets.push(format!("{column} = ?{}", values.len() + 1));
            values.push(value);
        };

        if let Some(status) = patch.status {
            push(&mut sets, "status", Value::Text(status.as_str().to_string()));
            if status.is_terminal() {
                push(&mut sets, "completed_at", Value::Text(now_stamp()));
                if status == QueueStatus::Completed {
                    push(&mut sets, "progress", Value::Real(100.0));
                }
            } else {
                push(&mut sets, "completed_at", Value::Null);
            }
        }
        if let Some(priority) = patch.priority {
            push(&mut sets, "priority", Value::Integer(priority));
        }
        if let Some(progress) = patch.progress {
            // A coalesced progress write must never override the
            // completed pin above.
            if patch.status != Some(QueueStatus::Completed) {
                push(&mut sets, "progress", Value::Real(progress.clamp(0.0, 100.0)));
            }
        }
        if let Some(cpu) = patch.current_cpu_percent {
            push(&mut sets, "current_cpu_percent", Value::Real(cpu));
        }
        if let Some(mem) = patch.current_memory_mb {
            push(&mut sets, "current_memory_mb", Value::Real(mem));
        }
        if let Some(reason) = &patch.paused_reason {
            let value = reason
                .clone()
                .map(Value::Text)
                .unwrap_or(Value::Null);
            push(&mut sets, "paused_reason", value);
        }
        if let Some(message) = &patch.error_message {
            let value = message
                .clone()
                .map(Value::Text)
                .unwrap_or(Value::Null);
            push(&mut sets, "error_message", value);
        }

        if sets.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE queue SET {} WHERE id = ?{}",
            sets.join(", "),
            values.len() + 1
        );
        values.push(Value::Integer(id));

        self.with_conn(|conn| {
            let changed = conn.execute(&sql, params_from_iter(values.iter()))?;
            if changed == 0 {
                return Err(StorageError::NotFound {
                    entity: "queue item",
                    id,
                });
            }
            Ok(())
        })
    }

    /// Atomically claim the next runnable item: the highest-priority
    /// `pending` row flips to `processing` with `started_at` stamped.
    /// Under concurrent callers each item is observed by exactly one.
    pub fn claim_next_pending(&self) -> StorageResult<Option<QueueItem>> {
        self.with_tx(|tx| {
            let id: Option<i64> = tx
                .query_row(
                    "SELECT id FROM queue WHERE status = 'pending' \
                     ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1",
                    [],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(id) = id else { return Ok(None) };

            let changed = tx.execute(
                "UPDATE queue SET status = 'processing', started_at = ?1 \
                 WHERE id = ?2 AND status = 'pending'",
                params![now_stamp(), id],
            )?;
            if changed != 1 {
                return Ok(None);
            }

            let raw = tx.query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM queue WHERE id = ?1"),
                params![id],
                raw_from_row,
            )?;
            Ok(Some(QueueItem::try_from(raw)?))
        })
    }

    pub fn queue_items(&self, status: Option<QueueStatus>) -> StorageResult<Vec<QueueItem>> {
        self.with_conn(|conn| {
            let raws: Vec<RawQueueRow> = match status {
                Some(status) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {QUEUE_COLUMNS} FROM queue WHERE status = ?1 \
                         ORDER BY priority DESC, created_at ASC, id ASC"
                    ))?;
                    let rows = stmt.query_map(params![status.as_str()], raw_from_row)?;
                    rows.collect::<Result<_, _>>()?
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {QUEUE_COLUMNS} FROM queue \
                         ORDER BY priority DESC, created_at ASC, id ASC"
                    ))?;
                    let rows = stmt.query_map([], raw_from_row)?;
                    rows.collect::<Result<_, _>>()?
                }
            };
            raws.into_iter().map(QueueItem::try_from).collect()
        })
    }

    pub fn queue_item(&self, id: i64) -> StorageResult<Option<QueueItem>> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {QUEUE_COLUMNS} FROM queue WHERE id = ?1"),
                    params![id],
                    raw_from_row,
                )
                .optional()?;
            raw.map(QueueItem::try_from).transpose()
        })
    }

    pub fn pending_count(&self) -> StorageResult<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM queue WHERE status = 'pending'",
                [],
                |r| r.get(0),
            )?)
        })
    }

    /// Whether a non-terminal item exists for this exact path.
    pub fn has_active_item(&self, file_path: &str) -> StorageResult<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM queue WHERE file_path = ?1 \
                 AND status NOT IN ('completed', 'failed')",
                params![file_path],
                |r| r.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub fn delete_queue_item(&self, id: i64) -> StorageResult<()> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM queue WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(StorageError::NotFound {
                    entity: "queue item",
                    id,
                });
            }
            Ok(())
        })
    }

    /// Delete queue items, optionally only those in one status.
    pub fn clear_queue(&self, status: Option<QueueStatus>) -> StorageResult<usize> {
        self.with_conn(|conn| {
            let removed = match status {
                Some(status) => conn.execute(
                    "DELETE FROM queue WHERE status = ?1",
                    params![status.as_str()],
                )?,
                None => conn.execute("DELETE FROM queue", [])?,
            };
            Ok(removed)
        })
    }

    /// Put a failed or permission-blocked item back into `pending`,
    /// clearing the error bookkeeping.
    pub fn requeue_item(&self, id: i64) -> StorageResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE queue SET status = 'pending', progress = 0.0, error_message = NULL, \
                 paused_reason = NULL, started_at = NULL, completed_at = NULL \
                 WHERE id = ?1 AND status IN ('failed', 'permission_error')",
                params![id],
            )?;
            if changed == 0 {
                return Err(StorageError::ConstraintViolation(format!(
                    "queue item {id} is not in a requeueable status"
                )));
            }
            Ok(())
        })
    }

    /// Rewrite the priorities of all pending items so that bigger
    /// expected wins run first. Runs as a single statement inside one
    /// transaction; concurrent inserts serialise behind it and keep
    /// the default priority until the operation is re-run.
    pub fn prioritize_pending_by_size(&self) -> StorageResult<usize> {
        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE queue SET priority = CASE \
                 WHEN estimated_savings_bytes >= 5368709120 THEN 90 \
                 WHEN estimated_savings_bytes >= 1073741824 THEN 70 \
                 WHEN estimated_savings_bytes >= 268435456 THEN 60 \
                 ELSE 50 END \
                 WHERE status = 'pending'",
                [],
            )?;
            Ok(changed)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::domain::ProfileDraft;

    fn db_with_profile() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let profile_id = db.create_profile(&ProfileDraft::av1_default("p")).unwrap();
        (db, profile_id)
    }

    #[test]
    fn insert_refuses_duplicate_active_paths() {
        let (db, profile_id) = db_with_profile();
        db.insert_queue_item(&NewQueueItem::pending("/m/a.mkv", profile_id, None))
            .unwrap();
        let err = db
            .insert_queue_item(&NewQueueItem::pending("/m/a.mkv", profile_id, None))
            .unwrap_err();
        assert!(matches!(err, StorageError::ConstraintViolation(_)));
    }

    #[test]
    fn terminal_items_unblock_the_path() {
        let (db, profile_id) = db_with_profile();
        let id = db
            .insert_queue_item(&NewQueueItem::pending("/m/a.mkv", profile_id, None))
            .unwrap();
        db.update_queue_item(id, &QueueItemPatch::failed("boom")).unwrap();
        // A failed row no longer blocks re-queueing the same path.
        db.insert_queue_item(&NewQueueItem::pending("/m/a.mkv", profile_id, None))
            .unwrap();
        assert!(db.has_active_item("/m/a.mkv").unwrap());
    }

    #[test]
    fn completed_at_is_set_iff_terminal() {
        let (db, profile_id) = db_with_profile();
        let id = db
            .insert_queue_item(&NewQueueItem::pending("/m/a.mkv", profile_id, None))
            .unwrap();

        let item = db.queue_item(id).unwrap().unwrap();
        assert!(item.completed_at.is_none());

        db.update_queue_item(id, &QueueItemPatch::status(QueueStatus::Processing))
            .unwrap();
        assert!(db.queue_item(id).unwrap().unwrap().completed_at.is_none());

        db.update_queue_item(id, &QueueItemPatch::status(QueueStatus::Completed))
            .unwrap();
        let item = db.queue_item(id).unwrap().unwrap();
        assert!(item.completed_at.is_some());
        assert_eq!(item.progress, 100.0);

        // Requeue clears the stamp again.
        db.update_queue_item(id, &QueueItemPatch::failed("x")).unwrap();
        db.requeue_item(id).unwrap();
        let item = db.queue_item(id).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert!(item.completed_at.is_none());
        assert!(item.error_message.is_none());
    }

    #[test]
    fn claim_orders_by_priority_then_age() {
        let (db, profile_id) = db_with_profile();
        let low = db
            .insert_queue_item(&NewQueueItem {
                priority: 10,
                ..NewQueueItem::pending("/m/low.mkv", profile_id, None)
            })
            .unwrap();
        let high = db
            .insert_queue_item(&NewQueueItem {
                priority: 90,
                ..NewQueueItem::pending("/m/high.mkv", profile_id, None)
            })
            .unwrap();

        let first = db.claim_next_pending().unwrap().unwrap();
        assert_eq!(first.id, high);
        assert_eq!(first.status, QueueStatus::Processing);
        assert!(first.started_at.is_some());

        let second = db.claim_next_pending().unwrap().unwrap();
        assert_eq!(second.id, low);
        assert!(db.claim_next_pending().unwrap().is_none());
    }

    #[test]
    fn concurrent_claims_return_distinct_items() {
        let (db, profile_id) = db_with_profile();
        let db = Arc::new(db);
        for i in 0..8 {
            db.insert_queue_item(&NewQueueItem::pending(
                format!("/m/{i}.mkv"),
                profile_id,
                None,
            ))
            .unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || db.claim_next_pending().unwrap().map(|i| i.id))
            })
            .collect();
        let mut ids: Vec<i64> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        let before = ids.len();
        ids.dedup();
        assert_eq!(before, 8, "all claims should succeed");
        assert_eq!(ids.len(), 8, "claims must be distinct");
    }

    #[test]
    fn specs_round_trip_through_json_columns() {
        let (db, profile_id) = db_with_profile();
        let mut specs = MediaSpecs::unknown();
        specs.codec = "h264".to_string();
        specs.resolution = "1920x1080".to_string();
        specs.framerate = 23.976;

        let id = db
            .insert_queue_item(&NewQueueItem {
                current_specs: Some(specs.clone()),
                ..NewQueueItem::pending("/m/a.mkv", profile_id, None)
            })
            .unwrap();

        let item = db.queue_item(id).unwrap().unwrap();
        assert_eq!(item.current_specs.unwrap(), specs);
    }

    #[test]
    fn corrupt_status_is_a_decode_error() {
        let (db, profile_id) = db_with_profile();
        let id = db
            .insert_queue_item(&NewQueueItem::pending("/m/a.mkv", profile_id, None))
            .unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE queue SET status = 'exploded' WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
        .unwrap();
        let err = db.queue_item(id).unwrap_err();
        assert!(matches!(err, StorageError::InvalidValue { column: "status", .. }));
    }

    #[test]
    fn prioritize_by_size_tiers_pending_rows() {
        let (db, profile_id) = db_with_profile();
        let big = db
            .insert_queue_item(&NewQueueItem {
                estimated_savings_bytes: 6 * 1024 * 1024 * 1024,
                ..NewQueueItem::pending("/m/big.mkv", profile_id, None)
            })
            .unwrap();
        let small = db
            .insert_queue_item(&NewQueueItem {
                estimated_savings_bytes: 10 * 1024 * 1024,
                ..NewQueueItem::pending("/m/small.mkv", profile_id, None)
            })
            .unwrap();

        db.prioritize_pending_by_size().unwrap();
        assert_eq!(db.queue_item(big).unwrap().unwrap().priority, 90);
        assert_eq!(db.queue_item(small).unwrap().unwrap().priority, 50);
        // The big win is claimed first.
        assert_eq!(db.claim_next_pending().unwrap().unwrap().id, big);
    }
}
