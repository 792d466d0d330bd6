//! External catalog sync: connection testing, inventory pulls and
//! webhook-style push events.
//!
//! Everything funnels through `ScanPipeline::process_candidate`, so
//! catalog items obey exactly the same dedup / permission /
//! needs-encoding / estimate rules as locally scanned files. API keys
//! are sealed with AES-256-GCM at rest and only ever surface as a
//! `****last4` preview.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::db::Database;
use crate::domain::{
    ConnectionKind, ExternalConnection, MediaSpecs, PublicConnection,
};
use crate::error::SyncError;
use crate::scanner::{CandidateOutcome, KnownSpecs, ScanPipeline};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SCENE_PAGE_SIZE: u64 = 200;

/// Map catalog-reported codec names onto the prober's closed set.
fn map_catalog_codec(raw: &str) -> String {
    let raw = raw.trim().to_ascii_lowercase();
    match raw.as_str() {
        "x264" | "avc" | "h264" | "h.264" => "h264".to_string(),
        "x265" | "hevc" | "h265" | "h.265" => "h265".to_string(),
        "av1" => "av1".to_string(),
        "vp9" | "vp09" => "vp9".to_string(),
        "xvid" | "divx" | "mpeg4" | "mpeg4video" | "msmpeg4v3" => "mpeg4".to_string(),
        "mpeg2" | "mpeg-2" | "mpeg2video" => "mpeg2".to_string(),
        "wmv" | "wmv3" => "wmv".to_string(),
        "" => "unknown".to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Key sealing
// ---------------------------------------------------------------------------

/// Symmetric AEAD for API keys, keyed from the process secret.
/// Ciphertext layout: `base64(nonce || sealed)`.
#[derive(Clone)]
pub struct KeyCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for KeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCipher").finish_non_exhaustive()
    }
}

impl KeyCipher {
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, SyncError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| SyncError::Crypto("encryption failed".to_string()))?;
        let mut blob = nonce.to_vec();
        blob.extend_from_slice(&sealed);
        Ok(BASE64.encode(blob))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String, SyncError> {
        let blob = BASE64
            .decode(encrypted)
            .map_err(|_| SyncError::Crypto("invalid ciphertext encoding".to_string()))?;
        if blob.len() < 12 {
            return Err(SyncError::Crypto("ciphertext too short".to_string()));
        }
        let (nonce, sealed) = blob.split_at(12);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| SyncError::Crypto("decryption failed".to_string()))?;
        String::from_utf8(plain).map_err(|_| SyncError::Crypto("key is not UTF-8".to_string()))
    }
}

/// `****last4` preview; short keys collapse to `****`.
pub fn mask_key(plaintext: &str) -> String {
    if plaintext.len() <= 4 {
        "****".to_string()
    } else {
        format!("****{}", &plaintext[plaintext.len() - 4..])
    }
}

// ---------------------------------------------------------------------------
// Inventory parsing (pure, HTTP-free)
// ---------------------------------------------------------------------------

/// One file reported by a catalog service.
#[derive(Debug, Clone)]
pub struct CatalogCandidate {
    pub file_path: String,
    pub file_size_bytes: i64,
    pub specs: MediaSpecs,
}

fn specs_from_media_info(
    media_info: &Value,
    source: &str,
    extra_tags: &[(&str, Value)],
) -> MediaSpecs {
    let mut specs = MediaSpecs::unknown();
    specs.codec = map_catalog_codec(
        media_info
            .get("videoCodec")
            .and_then(Value::as_str)
            .unwrap_or(""),
    );
    if let Some(resolution) = media_info
        .get("videoResolution")
        .or_else(|| media_info.get("resolution"))
        .and_then(Value::as_str)
    {
        if !resolution.is_empty() {
            specs.resolution = resolution.to_string();
        }
    }
    specs.bit_rate = media_info
        .get("videoBitrate")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    specs.tags.insert("source".to_string(), json!(source));
    for (key, value) in extra_tags {
        specs.tags.insert((*key).to_string(), value.clone());
    }
    specs
}

fn parse_movie_inventory(movies: &Value) -> Vec<CatalogCandidate> {
    let Some(movies) = movies.as_array() else {
        return Vec::new();
    };
    let mut candidates = Vec::new();
    for movie in movies {
        let Some(movie_file) = movie.get("movieFile") else {
            continue;
        };
        let Some(path) = movie_file.get("path").and_then(Value::as_str) else {
            continue;
        };
        if path.is_empty() {
            continue;
        }
        let media_info = movie_file.get("mediaInfo").cloned().unwrap_or(Value::Null);
        let specs = specs_from_media_info(
            &media_info,
            "catalog-movie",
            &[
                ("movie_id", movie.get("id").cloned().unwrap_or(Value::Null)),
                ("title", movie.get("title").cloned().unwrap_or(Value::Null)),
            ],
        );
        candidates.push(CatalogCandidate {
            file_path: path.to_string(),
            file_size_bytes: movie_file.get("size").and_then(Value::as_i64).unwrap_or(0),
            specs,
        });
    }
    candidates
}

fn parse_episode_files(series: &Value, episode_files: &Value) -> Vec<CatalogCandidate> {
    let Some(files) = episode_files.as_array() else {
        return Vec::new();
    };
    let mut candidates = Vec::new();
    for file in files {
        let Some(path) = file.get("path").and_then(Value::as_str) else {
            continue;
        };
        if path.is_empty() {
            continue;
        }
        let media_info = file.get("mediaInfo").cloned().unwrap_or(Value::Null);
        let specs = specs_from_media_info(
            &media_info,
            "catalog-series",
            &[
                ("series_id", series.get("id").cloned().unwrap_or(Value::Null)),
                (
                    "series_title",
                    series.get("title").cloned().unwrap_or(Value::Null),
                ),
            ],
        );
        candidates.push(CatalogCandidate {
            file_path: path.to_string(),
            file_size_bytes: file.get("size").and_then(Value::as_i64).unwrap_or(0),
            specs,
        });
    }
    candidates
}

/// One page of a scene-library GraphQL response. Returns the parsed
/// candidates plus the server's total scene count.
fn parse_scene_page(data: &Value) -> (Vec<CatalogCandidate>, u64, usize) {
    let result = &data["findScenes"];
    let total = result["count"].as_u64().unwrap_or(0);
    let scenes = result["scenes"].as_array().cloned().unwrap_or_default();
    let scene_count = scenes.len();

    let mut candidates = Vec::new();
    for scene in &scenes {
        let files = scene["files"].as_array().cloned().unwrap_or_default();
        for file in files {
            let Some(path) = file.get("path").and_then(Value::as_str) else {
                continue;
            };
            if path.is_empty() {
                continue;
            }
            let mut specs = MediaSpecs::unknown();
            specs.codec = map_catalog_codec(
                file.get("video_codec").and_then(Value::as_str).unwrap_or(""),
            );
            let width = file.get("width").and_then(Value::as_u64).unwrap_or(0);
            let height = file.get("height").and_then(Value::as_u64).unwrap_or(0);
            if width > 0 && height > 0 {
                specs.resolution = format!("{width}x{height}");
            }
            specs.framerate = file
                .get("frame_rate")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            specs.bit_rate = file.get("bit_rate").and_then(Value::as_u64).unwrap_or(0);
            specs
                .tags
                .insert("source".to_string(), json!("scene-library"));
            specs.tags.insert(
                "scene_id".to_string(),
                scene.get("id").cloned().unwrap_or(Value::Null),
            );
            candidates.push(CatalogCandidate {
                file_path: path.to_string(),
                file_size_bytes: file.get("size").and_then(Value::as_i64).unwrap_or(0),
                specs,
            });
        }
    }
    (candidates, total, scene_count)
}

const SCENE_VERSION_QUERY: &str = "query Version { version { version } }";

const SCENE_FILES_QUERY: &str = "\
query FindScenes($filter: FindFilterType) {
  findScenes(filter: $filter) {
    count
    scenes {
      id
      files { path size video_codec width height frame_rate bit_rate }
    }
  }
}";

// ---------------------------------------------------------------------------
// The sync manager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    pub app_name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Queued(usize),
    Ignored(&'static str),
}

pub struct ExternalSync {
    db: Arc<Database>,
    pipeline: Arc<ScanPipeline>,
    cipher: KeyCipher,
    client: reqwest::blocking::Client,
}

impl std::fmt::Debug for ExternalSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalSync").finish_non_exhaustive()
    }
}

impl ExternalSync {
    pub fn new(db: Arc<Database>, pipeline: Arc<ScanPipeline>, secret: &str) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            db,
            pipeline,
            cipher: KeyCipher::from_secret(secret),
            client,
        }
    }

    /// Create a connection, sealing the key before it is stored.
    pub fn store_connection(
        &self,
        name: &str,
        kind: ConnectionKind,
        base_url: &str,
        api_key: &str,
        enabled: bool,
    ) -> Result<i64, SyncError> {
        let sealed = self.cipher.encrypt(api_key)?;
        Ok(self
            .db
            .create_connection(name, kind, base_url.trim_end_matches('/'), &sealed, enabled)?)
    }

    /// Connection list for external consumption: keys masked, never
    /// decrypted ciphertext.
    pub fn public_connections(&self) -> Result<Vec<PublicConnection>, SyncError> {
        let connections = self.db.connections(false)?;
        Ok(connections
            .into_iter()
            .map(|conn| {
                let masked = self
                    .cipher
                    .decrypt(&conn.api_key_encrypted)
                    .map(|plain| mask_key(&plain))
                    .unwrap_or_else(|_| "****".to_string());
                PublicConnection {
                    id: conn.id,
                    name: conn.name,
                    kind: conn.kind,
                    base_url: conn.base_url,
                    api_key_masked: masked,
                    enabled: conn.enabled,
                    last_tested: conn.last_tested,
                    last_synced: conn.last_synced,
                }
            })
            .collect())
    }

    fn api_key(&self, conn: &ExternalConnection) -> Result<String, SyncError> {
        self.cipher.decrypt(&conn.api_key_encrypted)
    }

    fn base(conn: &ExternalConnection) -> String {
        conn.base_url.trim_end_matches('/').to_string()
    }

    fn get_json(&self, conn: &ExternalConnection, path: &str) -> Result<Value, SyncError> {
        let url = format!("{}/api/v3{path}", Self::base(conn));
        let response = self
            .client
            .get(&url)
            .header("X-Api-Key", self.api_key(conn)?)
            .header("Accept", "application/json")
            .send()
            .map_err(|e| SyncError::from_transport(e, &conn.base_url))?;
        match response.status().as_u16() {
            200..=299 => Ok(response.json()?),
            401 => Err(SyncError::Unauthorized),
            code => Err(SyncError::Http(code)),
        }
    }

    fn graphql(&self, conn: &ExternalConnection, query: &str, variables: Value) -> Result<Value, SyncError> {
        let url = format!("{}/graphql", Self::base(conn));
        let response = self
            .client
            .post(&url)
            .header("ApiKey", self.api_key(conn)?)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .map_err(|e| SyncError::from_transport(e, &conn.base_url))?;
        match response.status().as_u16() {
            200..=299 => {}
            401 | 403 => return Err(SyncError::Unauthorized),
            code => return Err(SyncError::Http(code)),
        }
        let body: Value = response.json()?;
        if let Some(errors) = body.get("errors").and_then(Value::as_array) {
            let message = errors
                .first()
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown GraphQL error");
            return Err(SyncError::BadResponse(message.to_string()));
        }
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }

    /// Probe a connection's health endpoint and stamp `last_tested`.
    pub fn test(&self, conn: &ExternalConnection) -> Result<ConnectionHealth, SyncError> {
        let health = match conn.kind {
            ConnectionKind::CatalogMovie | ConnectionKind::CatalogSeries => {
                let status = self.get_json(conn, "/system/status")?;
                ConnectionHealth {
                    app_name: status
                        .get("appName")
                        .and_then(Value::as_str)
                        .unwrap_or(conn.kind.as_str())
                        .to_string(),
                    version: status
                        .get("version")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                }
            }
            ConnectionKind::SceneLibrary => {
                let data = self.graphql(conn, SCENE_VERSION_QUERY, Value::Null)?;
                ConnectionHealth {
                    app_name: "scene library".to_string(),
                    version: data["version"]["version"]
                        .as_str()
                        .unwrap_or("unknown")
                        .to_string(),
                }
            }
        };
        self.db.mark_connection_tested(conn.id)?;
        Ok(health)
    }

    /// Pull the full file inventory of one connection.
    pub fn pull(&self, conn: &ExternalConnection) -> Result<Vec<CatalogCandidate>, SyncError> {
        match conn.kind {
            ConnectionKind::CatalogMovie => {
                let movies = self.get_json(conn, "/movie")?;
                Ok(parse_movie_inventory(&movies))
            }
            ConnectionKind::CatalogSeries => {
                let series_list = self.get_json(conn, "/series")?;
                let mut candidates = Vec::new();
                for series in series_list.as_array().cloned().unwrap_or_default() {
                    let Some(series_id) = series.get("id").and_then(Value::as_i64) else {
                        continue;
                    };
                    match self.get_json(conn, &format!("/episodefile?seriesId={series_id}")) {
                        Ok(files) => candidates.extend(parse_episode_files(&series, &files)),
                        Err(err) => {
                            warn!(series_id, error = %err, "episode file fetch failed");
                        }
                    }
                }
                Ok(candidates)
            }
            ConnectionKind::SceneLibrary => {
                let mut candidates = Vec::new();
                let mut page = 1u64;
                loop {
                    let variables = json!({
                        "filter": {
                            "page": page,
                            "per_page": SCENE_PAGE_SIZE,
                            "sort": "id",
                            "direction": "ASC",
                        }
                    });
                    let data = self.graphql(conn, SCENE_FILES_QUERY, variables)?;
                    let (mut parsed, total, scene_count) = parse_scene_page(&data);
                    candidates.append(&mut parsed);
                    let fetched = (page - 1) * SCENE_PAGE_SIZE + scene_count as u64;
                    if scene_count == 0 || fetched >= total {
                        break;
                    }
                    page += 1;
                }
                Ok(candidates)
            }
        }
    }

    /// Pull a connection and feed every candidate through the scan
    /// pipeline against the default profile. Returns the number of
    /// items queued.
    pub fn sync_connection(&self, connection_id: i64) -> Result<usize, SyncError> {
        let Some(conn) = self.db.connection(connection_id)? else {
            return Err(SyncError::Storage(crate::error::StorageError::NotFound {
                entity: "connection",
                id: connection_id,
            }));
        };
        let candidates = self.pull(&conn)?;
        let queued = self.queue_candidates(&candidates)?;
        self.db.mark_connection_synced(conn.id)?;
        info!(
            connection = %conn.name,
            candidates = candidates.len(),
            queued,
            "catalog sync complete"
        );
        Ok(queued)
    }

    fn queue_candidates(&self, candidates: &[CatalogCandidate]) -> Result<usize, SyncError> {
        let Some(profile) = self.db.default_profile()? else {
            warn!("no default profile configured; catalog candidates not queued");
            return Ok(0);
        };
        let mut queued = 0usize;
        for candidate in candidates {
            let known = KnownSpecs {
                specs: candidate.specs.clone(),
                file_size_bytes: candidate.file_size_bytes,
            };
            match self.pipeline.process_candidate(
                Path::new(&candidate.file_path),
                &profile,
                None,
                Some(known),
                None,
            ) {
                Ok(CandidateOutcome::Inserted(_)) => queued += 1,
                Ok(CandidateOutcome::Skipped(_)) => {}
                Err(err) => {
                    warn!(path = %candidate.file_path, error = %err, "candidate rejected");
                }
            }
        }
        Ok(queued)
    }

    /// Handle one push event. Only `Download` and `Upgrade` event
    /// types are actionable; everything else is acknowledged and
    /// dropped.
    pub fn handle_push(&self, kind: ConnectionKind, payload: &Value) -> Result<PushOutcome, SyncError> {
        let event_type = payload
            .get("eventType")
            .and_then(Value::as_str)
            .unwrap_or("");
        if !matches!(event_type, "Download" | "Upgrade") {
            return Ok(PushOutcome::Ignored("event type not actionable"));
        }

        let file = match kind {
            ConnectionKind::CatalogMovie => payload.get("movieFile"),
            ConnectionKind::CatalogSeries => payload
                .get("episodeFile")
                .or_else(|| payload.get("episodeFiles").and_then(|f| f.get(0))),
            ConnectionKind::SceneLibrary => None,
        };
        let Some(file) = file else {
            return Ok(PushOutcome::Ignored("no file payload"));
        };
        let Some(path) = file.get("path").and_then(Value::as_str).filter(|p| !p.is_empty())
        else {
            return Ok(PushOutcome::Ignored("no file path in payload"));
        };

        let media_info = file.get("mediaInfo").cloned().unwrap_or(Value::Null);
        let specs = specs_from_media_info(&media_info, kind.as_str(), &[]);
        let candidate = CatalogCandidate {
            file_path: path.to_string(),
            file_size_bytes: file.get("size").and_then(Value::as_i64).unwrap_or(0),
            specs,
        };

        let queued = self.queue_candidates(std::slice::from_ref(&candidate))?;
        if queued > 0 {
            Ok(PushOutcome::Queued(queued))
        } else {
            Ok(PushOutcome::Ignored("candidate skipped by scan pipeline"))
        }
    }
}
