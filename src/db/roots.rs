use rusqlite::{OptionalExtension, Row, params};

use super::Database;
use crate::domain::{ScanRoot, UpscalePolicy};
use crate::error::{StorageError, StorageResult};

const ROOT_COLUMNS: &str = "id, path, profile_id, library_type, enabled, recursive, \
     upscale_enabled, upscale_trigger_below_height, upscale_target_height, \
     upscale_upscaler, upscale_model, upscale_factor";

/// Field set for creating or updating a scan root.
#[derive(Debug, Clone)]
pub struct ScanRootDraft {
    pub path: String,
    pub profile_id: Option<i64>,
    pub library_type: String,
    pub enabled: bool,
    pub recursive: bool,
    pub upscale: Option<UpscalePolicy>,
}

impl ScanRootDraft {
    pub fn new(path: impl Into<String>, profile_id: i64) -> Self {
        Self {
            path: path.into(),
            profile_id: Some(profile_id),
            library_type: "custom".to_string(),
            enabled: true,
            recursive: true,
            upscale: None,
        }
    }
}

fn root_from_row(row: &Row<'_>) -> rusqlite::Result<ScanRoot> {
    let upscale_enabled: bool = row.get(6)?;
    let trigger: Option<i64> = row.get(7)?;
    let target: Option<i64> = row.get(8)?;
    let upscaler: Option<String> = row.get(9)?;
    let model: Option<String> = row.get(10)?;
    let factor: Option<i64> = row.get(11)?;

    let upscale = match (trigger, target, upscaler, model, factor) {
        (Some(trigger), Some(target), Some(upscaler), Some(model), Some(factor)) => {
            Some(UpscalePolicy {
                enabled: upscale_enabled,
                trigger_below_height: trigger.max(0) as u32,
                target_height: target.max(0) as u32,
                upscaler,
                model,
                factor: factor.max(1) as u32,
            })
        }
        _ => None,
    };

    Ok(ScanRoot {
        id: row.get(0)?,
        path: row.get(1)?,
        profile_id: row.get(2)?,
        library_type: row.get(3)?,
        enabled: row.get(4)?,
        recursive: row.get(5)?,
        upscale,
    })
}

impl Database {
    pub fn create_scan_root(&self, draft: &ScanRootDraft) -> StorageResult<i64> {
        self.with_conn(|conn| {
            let policy = draft.upscale.as_ref();
            conn.execute(
                "INSERT INTO scan_roots (path, profile_id, library_type, enabled, recursive, \
                 upscale_enabled, upscale_trigger_below_height, upscale_target_height, \
                 upscale_upscaler, upscale_model, upscale_factor) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    draft.path,
                    draft.profile_id,
                    draft.library_type,
                    draft.enabled,
                    draft.recursive,
                    policy.map(|p| p.enabled).unwrap_or(false),
                    policy.map(|p| i64::from(p.trigger_below_height)),
                    policy.map(|p| i64::from(p.target_height)),
                    policy.map(|p| p.upscaler.clone()),
                    policy.map(|p| p.model.clone()),
                    policy.map(|p| i64::from(p.factor)),
                ],
            )
            .map_err(|e| super::map_constraint(e, "scan root path must be unique"))?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn update_scan_root(&self, id: i64, draft: &ScanRootDraft) -> StorageResult<()> {
        self.with_conn(|conn| {
            let policy = draft.upscale.as_ref();
            let changed = conn
                .execute(
                    "UPDATE scan_roots SET path = ?1, profile_id = ?2, library_type = ?3, \
                     enabled = ?4, recursive = ?5, upscale_enabled = ?6, \
                     upscale_trigger_below_height = ?7, upscale_target_height = ?8, \
                     upscale_upscaler = ?9, upscale_model = ?10, upscale_factor = ?11 \
                     WHERE id = ?12",
                    params![
                        draft.path,
                        draft.profile_id,
                        draft.library_type,
                        draft.enabled,
                        draft.recursive,
                        policy.map(|p| p.enabled).unwrap_or(false),
                        policy.map(|p| i64::from(p.trigger_below_height)),
                        policy.map(|p| i64::from(p.target_height)),
                        policy.map(|p| p.upscaler.clone()),
                        policy.map(|p| p.model.clone()),
                        policy.map(|p| i64::from(p.factor)),
                        id,
                    ],
                )
                .map_err(|e| super::map_constraint(e, "scan root path must be unique"))?;
            if changed == 0 {
                return Err(StorageError::NotFound {
                    entity: "scan root",
                    id,
                });
            }
            Ok(())
        })
    }

    /// Delete a root, NULLing the `root_id` of queue items that came
    /// from it. Queued work survives root removal.
    pub fn delete_scan_root(&self, id: i64) -> StorageResult<()> {
        self.with_tx(|tx| {
            tx.execute("UPDATE queue SET root_id = NULL WHERE root_id = ?1", params![id])?;
            let deleted = tx.execute("DELETE FROM scan_roots WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(StorageError::NotFound {
                    entity: "scan root",
                    id,
                });
            }
            Ok(())
        })
    }

    pub fn scan_roots(&self, enabled_only: bool) -> StorageResult<Vec<ScanRoot>> {
        self.with_conn(|conn| {
            let sql = if enabled_only {
                format!("SELECT {ROOT_COLUMNS} FROM scan_roots WHERE enabled = 1 ORDER BY id")
            } else {
                format!("SELECT {ROOT_COLUMNS} FROM scan_roots ORDER BY id")
            };
            let mut stmt = conn.prepare(&sql)?;
            let roots = stmt
                .query_map([], root_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(roots)
        })
    }

    pub fn scan_root(&self, id: i64) -> StorageResult<Option<ScanRoot>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {ROOT_COLUMNS} FROM scan_roots WHERE id = ?1"),
                    params![id],
                    root_from_row,
                )
                .optional()?)
        })
    }
}
