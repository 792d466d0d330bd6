use rusqlite::{OptionalExtension, params};

use super::{Database, now_stamp};
use crate::error::StorageResult;

impl Database {
    pub fn set_setting(&self, key: &str, value: &str) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value, now_stamp()],
            )?;
            Ok(())
        })
    }

    pub fn setting(&self, key: &str) -> StorageResult<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |r| r.get(0),
                )
                .optional()?)
        })
    }

    /// All settings whose key starts with `prefix`.
    pub fn settings_with_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM settings WHERE key LIKE ?1 || '%' ORDER BY key",
            )?;
            let rows = stmt
                .query_map(params![prefix], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<(String, Option<String>)>, _>>()?;
            Ok(rows
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, v)))
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_upsert_and_prefix_query() {
        let db = Database::open_in_memory().unwrap();
        db.set_setting("resource_cpu_threshold", "90.0").unwrap();
        db.set_setting("resource_cpu_threshold", "85.0").unwrap();
        db.set_setting("resource_nice_level", "10").unwrap();
        db.set_setting("other", "x").unwrap();

        assert_eq!(db.setting("resource_cpu_threshold").unwrap().as_deref(), Some("85.0"));
        assert_eq!(db.setting("missing").unwrap(), None);

        let resource = db.settings_with_prefix("resource_").unwrap();
        assert_eq!(resource.len(), 2);
        assert_eq!(resource[0].0, "resource_cpu_threshold");
    }
}
