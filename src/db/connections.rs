use rusqlite::{OptionalExtension, Row, params};

use super::{Database, now_stamp};
use crate::domain::{ConnectionKind, ExternalConnection};
use crate::error::{StorageError, StorageResult};

const CONNECTION_COLUMNS: &str =
    "id, name, kind, base_url, api_key_encrypted, enabled, last_tested, last_synced";

struct RawConnection {
    id: i64,
    name: String,
    kind: String,
    base_url: String,
    api_key_encrypted: String,
    enabled: bool,
    last_tested: Option<String>,
    last_synced: Option<String>,
}

fn connection_from_row(row: &Row<'_>) -> rusqlite::Result<RawConnection> {
    Ok(RawConnection {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
        base_url: row.get(3)?,
        api_key_encrypted: row.get(4)?,
        enabled: row.get(5)?,
        last_tested: row.get(6)?,
        last_synced: row.get(7)?,
    })
}

impl TryFrom<RawConnection> for ExternalConnection {
    type Error = StorageError;

    fn try_from(raw: RawConnection) -> Result<Self, StorageError> {
        Ok(ExternalConnection {
            id: raw.id,
            name: raw.name,
            kind: ConnectionKind::parse(&raw.kind)?,
            base_url: raw.base_url,
            api_key_encrypted: raw.api_key_encrypted,
            enabled: raw.enabled,
            last_tested: raw.last_tested,
            last_synced: raw.last_synced,
        })
    }
}

impl Database {
    pub fn create_connection(
        &self,
        name: &str,
        kind: ConnectionKind,
        base_url: &str,
        api_key_encrypted: &str,
        enabled: bool,
    ) -> StorageResult<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO connections (name, kind, base_url, api_key_encrypted, enabled) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![name, kind.as_str(), base_url, api_key_encrypted, enabled],
            )
            .map_err(|e| super::map_constraint(e, "connection name must be unique"))?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Update a connection; a `None` key keeps the stored ciphertext.
    pub fn update_connection(
        &self,
        id: i64,
        base_url: &str,
        api_key_encrypted: Option<&str>,
        enabled: bool,
    ) -> StorageResult<()> {
        self.with_conn(|conn| {
            let changed = match api_key_encrypted {
                Some(key) => conn.execute(
                    "UPDATE connections SET base_url = ?1, api_key_encrypted = ?2, \
                     enabled = ?3 WHERE id = ?4",
                    params![base_url, key, enabled, id],
                )?,
                None => conn.execute(
                    "UPDATE connections SET base_url = ?1, enabled = ?2 WHERE id = ?3",
                    params![base_url, enabled, id],
                )?,
            };
            if changed == 0 {
                return Err(StorageError::NotFound {
                    entity: "connection",
                    id,
                });
            }
            Ok(())
        })
    }

    pub fn delete_connection(&self, id: i64) -> StorageResult<()> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM connections WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(StorageError::NotFound {
                    entity: "connection",
                    id,
                });
            }
            Ok(())
        })
    }

    pub fn mark_connection_tested(&self, id: i64) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE connections SET last_tested = ?1 WHERE id = ?2",
                params![now_stamp(), id],
            )?;
            Ok(())
        })
    }

    pub fn mark_connection_synced(&self, id: i64) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE connections SET last_synced = ?1 WHERE id = ?2",
                params![now_stamp(), id],
            )?;
            Ok(())
        })
    }

    pub fn connections(&self, enabled_only: bool) -> StorageResult<Vec<ExternalConnection>> {
        self.with_conn(|conn| {
            let sql = if enabled_only {
                format!("SELECT {CONNECTION_COLUMNS} FROM connections WHERE enabled = 1 ORDER BY id")
            } else {
                format!("SELECT {CONNECTION_COLUMNS} FROM connections ORDER BY id")
            };
            let mut stmt = conn.prepare(&sql)?;
            let raws: Vec<RawConnection> = stmt
                .query_map([], connection_from_row)?
                .collect::<Result<_, _>>()?;
            raws.into_iter().map(ExternalConnection::try_from).collect()
        })
    }

    pub fn connection(&self, id: i64) -> StorageResult<Option<ExternalConnection>> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {CONNECTION_COLUMNS} FROM connections WHERE id = ?1"),
                    params![id],
                    connection_from_row,
                )
                .optional()?;
            raw.map(ExternalConnection::try_from).transpose()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_crud_round_trips() {
        let db = Database::open_in_memory().unwrap();
        let id = db
            .create_connection(
                "movies",
                ConnectionKind::CatalogMovie,
                "http://localhost:7878",
                "sealed-key",
                true,
            )
            .unwrap();

        let conn = db.connection(id).unwrap().unwrap();
        assert_eq!(conn.kind, ConnectionKind::CatalogMovie);
        assert_eq!(conn.api_key_encrypted, "sealed-key");
        assert!(conn.last_tested.is_none());

        db.mark_connection_tested(id).unwrap();
        db.update_connection(id, "http://localhost:7878", None, false).unwrap();
        let conn = db.connection(id).unwrap().unwrap();
        assert!(!conn.enabled);
        assert_eq!(conn.api_key_encrypted, "sealed-key");
        assert!(conn.last_tested.is_some());
    }
}
