use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Kind of external media-catalog service a connection points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    /// Movie catalog exposing `/api/v3/movie` inventories.
    CatalogMovie,
    /// Series catalog exposing `/api/v3/series` + `/api/v3/episodefile`.
    CatalogSeries,
    /// Scene library exposing a GraphQL `findScenes` query.
    SceneLibrary,
}

impl ConnectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionKind::CatalogMovie => "catalog-movie",
            ConnectionKind::CatalogSeries => "catalog-series",
            ConnectionKind::SceneLibrary => "scene-library",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StorageError> {
        match value {
            "catalog-movie" => Ok(ConnectionKind::CatalogMovie),
            "catalog-series" => Ok(ConnectionKind::CatalogSeries),
            "scene-library" => Ok(ConnectionKind::SceneLibrary),
            other => Err(StorageError::InvalidValue {
                column: "kind",
                value: other.to_string(),
            }),
        }
    }
}

/// A configured external catalog service.
///
/// `api_key_encrypted` holds the AEAD-sealed key; the cleartext never
/// leaves the process.
#[derive(Debug, Clone)]
pub struct ExternalConnection {
    pub id: i64,
    pub name: String,
    pub kind: ConnectionKind,
    pub base_url: String,
    pub api_key_encrypted: String,
    pub enabled: bool,
    pub last_tested: Option<String>,
    pub last_synced: Option<String>,
}

/// The externally visible view of a connection: the key is reduced to
/// a `****last4` preview.
#[derive(Debug, Clone, Serialize)]
pub struct PublicConnection {
    pub id: i64,
    pub name: String,
    pub kind: ConnectionKind,
    pub base_url: String,
    pub api_key_masked: String,
    pub enabled: bool,
    pub last_tested: Option<String>,
    pub last_synced: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips() {
        for kind in [
            ConnectionKind::CatalogMovie,
            ConnectionKind::CatalogSeries,
            ConnectionKind::SceneLibrary,
        ] {
            assert_eq!(ConnectionKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(ConnectionKind::parse("sonarr").is_err());
    }
}
