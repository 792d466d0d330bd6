use std::collections::BTreeSet;

use rusqlite::{OptionalExtension, Row, params};

use super::Database;
use crate::domain::FolderWatch;
use crate::error::{StorageError, StorageResult};

const WATCH_COLUMNS: &str =
    "id, path, profile_id, enabled, recursive, auto_queue, extensions, last_check";

/// Field set for creating or updating a folder watch.
#[derive(Debug, Clone)]
pub struct FolderWatchDraft {
    pub path: String,
    pub profile_id: i64,
    pub enabled: bool,
    pub recursive: bool,
    pub auto_queue: bool,
    pub extensions: BTreeSet<String>,
}

impl FolderWatchDraft {
    pub fn new(path: impl Into<String>, profile_id: i64) -> Self {
        Self {
            path: path.into(),
            profile_id,
            enabled: true,
            recursive: true,
            auto_queue: true,
            extensions: BTreeSet::new(),
        }
    }

    fn extensions_csv(&self) -> String {
        self.extensions.iter().cloned().collect::<Vec<_>>().join(",")
    }
}

fn watch_from_row(row: &Row<'_>) -> rusqlite::Result<FolderWatch> {
    let csv: String = row.get(6)?;
    Ok(FolderWatch {
        id: row.get(0)?,
        path: row.get(1)?,
        profile_id: row.get(2)?,
        enabled: row.get(3)?,
        recursive: row.get(4)?,
        auto_queue: row.get(5)?,
        extensions: FolderWatch::extensions_from_csv(&csv),
        last_check: row.get(7)?,
    })
}

impl Database {
    pub fn create_folder_watch(&self, draft: &FolderWatchDraft) -> StorageResult<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO folder_watches (path, profile_id, enabled, recursive, auto_queue, \
                 extensions) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    draft.path,
                    draft.profile_id,
                    draft.enabled,
                    draft.recursive,
                    draft.auto_queue,
                    draft.extensions_csv(),
                ],
            )
            .map_err(|e| super::map_constraint(e, "watch path must be unique"))?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn update_folder_watch(&self, id: i64, draft: &FolderWatchDraft) -> StorageResult<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE folder_watches SET path = ?1, profile_id = ?2, enabled = ?3, \
                     recursive = ?4, auto_queue = ?5, extensions = ?6 WHERE id = ?7",
                    params![
                        draft.path,
                        draft.profile_id,
                        draft.enabled,
                        draft.recursive,
                        draft.auto_queue,
                        draft.extensions_csv(),
                        id,
                    ],
                )
                .map_err(|e| super::map_constraint(e, "watch path must be unique"))?;
            if changed == 0 {
                return Err(StorageError::NotFound {
                    entity: "folder watch",
                    id,
                });
            }
            Ok(())
        })
    }

    pub fn touch_folder_watch(&self, id: i64, stamp: &str) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE folder_watches SET last_check = ?1 WHERE id = ?2",
                params![stamp, id],
            )?;
            Ok(())
        })
    }

    pub fn delete_folder_watch(&self, id: i64) -> StorageResult<()> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM folder_watches WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(StorageError::NotFound {
                    entity: "folder watch",
                    id,
                });
            }
            Ok(())
        })
    }

    pub fn folder_watches(&self, enabled_only: bool) -> StorageResult<Vec<FolderWatch>> {
        self.with_conn(|conn| {
            let sql = if enabled_only {
                format!("SELECT {WATCH_COLUMNS} FROM folder_watches WHERE enabled = 1 ORDER BY id")
            } else {
                format!("SELECT {WATCH_COLUMNS} FROM folder_watches ORDER BY id")
            };
            let mut stmt = conn.prepare(&sql)?;
            let watches = stmt
                .query_map([], watch_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(watches)
        })
    }

    pub fn folder_watch(&self, id: i64) -> StorageResult<Option<FolderWatch>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {WATCH_COLUMNS} FROM folder_watches WHERE id = ?1"),
                    params![id],
                    watch_from_row,
                )
                .optional()?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProfileDraft;

    #[test]
    fn watch_crud_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let profile_id = db.create_profile(&ProfileDraft::av1_default("p")).unwrap();

        let mut draft = FolderWatchDraft::new("/downloads", profile_id);
        draft.extensions = [".mkv".to_string(), ".mp4".to_string()].into_iter().collect();
        let id = db.create_folder_watch(&draft).unwrap();

        let watch = db.folder_watch(id).unwrap().unwrap();
        assert_eq!(watch.path, "/downloads");
        assert!(watch.extensions.contains(".mkv"));
        assert!(watch.last_check.is_none());

        db.touch_folder_watch(id, "2026-08-01 12:00:00").unwrap();
        let watch = db.folder_watch(id).unwrap().unwrap();
        assert_eq!(watch.last_check.as_deref(), Some("2026-08-01 12:00:00"));
    }

    #[test]
    fn empty_extension_list_defaults_to_video_allowlist() {
        let db = Database::open_in_memory().unwrap();
        let profile_id = db.create_profile(&ProfileDraft::av1_default("p")).unwrap();
        let id = db
            .create_folder_watch(&FolderWatchDraft::new("/downloads", profile_id))
            .unwrap();
        let watch = db.folder_watch(id).unwrap().unwrap();
        assert!(watch.extensions.contains(".mkv"));
        assert!(watch.extensions.contains(".webm"));
    }
}
