//! Scan pipeline: turns filesystem paths into queued work items.
//!
//! The per-file logic lives in [`ScanPipeline::process_candidate`] and
//! is shared verbatim by the folder watcher and external sync so the
//! dedup / permission / needs-encoding / estimate rules cannot drift
//! apart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::db::{Database, NewQueueItem};
use crate::domain::{
    MediaSpecs, PermissionStatus, Profile, QueueStatus, TargetSpecs, UpscalePolicy,
};
use crate::error::{StorageError, StorageResult};
use crate::logging::{StatsEvent, StatsLog};
use crate::probe::MediaProber;

/// Extensions (without dot) accepted as video candidates.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "m4v", "ts", "mpg", "mpeg", "wmv", "flv", "webm", "m2ts", "vob",
];

/// Suffix marking our own in-flight transcoder output.
pub const OPTIMIZED_SUFFIX: &str = "_optimized";

/// Why a candidate did not become a queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// A non-terminal queue item already exists for this path.
    AlreadyQueued,
    /// The needs-encoding predicate said no.
    NotNeeded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    Inserted(i64),
    Skipped(SkipReason),
}

/// A candidate arriving from outside the filesystem walk (external
/// sync, webhook push) with specs already known.
#[derive(Debug, Clone)]
pub struct KnownSpecs {
    pub specs: MediaSpecs,
    pub file_size_bytes: i64,
}

pub struct ScanPipeline {
    db: Arc<Database>,
    prober: Arc<MediaProber>,
    stats: Arc<StatsLog>,
}

impl std::fmt::Debug for ScanPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanPipeline").finish_non_exhaustive()
    }
}

impl ScanPipeline {
    pub fn new(db: Arc<Database>, prober: Arc<MediaProber>, stats: Arc<StatsLog>) -> Self {
        Self { db, prober, stats }
    }

    /// Scan one root. Returns the number of queue items added.
    pub fn scan_root(&self, root_id: i64) -> StorageResult<usize> {
        let Some(root) = self.db.scan_root(root_id)? else {
            return Err(StorageError::NotFound {
                entity: "scan root",
                id: root_id,
            });
        };
        if !root.enabled {
            info!(root = %root.path, "scan root disabled, skipping");
            return Ok(0);
        }
        let Some(profile_id) = root.profile_id else {
            warn!(root = %root.path, "scan root has no profile, skipping");
            return Ok(0);
        };
        let Some(profile) = self.db.profile(profile_id)? else {
            warn!(root = %root.path, profile_id, "scan root profile missing, skipping");
            return Ok(0);
        };

        let started = Instant::now();
        let files = discover_files(Path::new(&root.path), root.recursive);
        info!(root = %root.path, files = files.len(), "scanning library");

        let mut added = 0usize;
        for file in &files {
            match self.process_candidate(file, &profile, Some(root_id), None, root.upscale.as_ref())
            {
                Ok(CandidateOutcome::Inserted(_)) => added += 1,
                Ok(CandidateOutcome::Skipped(reason)) => {
                    debug!(path = %file.display(), ?reason, "candidate skipped");
                }
                Err(err) => {
                    error!(path = %file.display(), error = %err, "failed to process candidate");
                }
            }
        }

        let duration = started.elapsed().as_secs_f64();
        self.stats.record(StatsEvent::ScanComplete {
            path: root.path.clone(),
            files_found: files.len() as u64,
            duration_seconds: duration,
        });
        info!(root = %root.path, added, duration_s = format!("{duration:.1}"), "scan complete");
        Ok(added)
    }

    /// Scan every enabled root. Per-root failures are logged and never
    /// abort the outer loop.
    pub fn scan_all_roots(&self) -> StorageResult<usize> {
        let roots = self.db.scan_roots(true)?;
        if roots.is_empty() {
            warn!("no enabled scan roots configured");
            return Ok(0);
        }
        let mut total = 0usize;
        for root in roots {
            match self.scan_root(root.id) {
                Ok(added) => total += added,
                Err(err) => error!(root = %root.path, error = %err, "scan failed"),
            }
        }
        Ok(total)
    }

    /// The single shared per-candidate procedure.
    ///
    /// Steps: dedup against the queue, permission probe, specs (probe
    /// or caller-provided), target derivation, needs-encoding
    /// predicate, savings estimate, upscale plan, insert.
    pub fn process_candidate(
        &self,
        path: &Path,
        profile: &Profile,
        root_id: Option<i64>,
        known: Option<KnownSpecs>,
        upscale: Option<&UpscalePolicy>,
    ) -> StorageResult<CandidateOutcome> {
        let path_str = path.to_string_lossy().to_string();

        if self.db.has_active_item(&path_str)? {
            return Ok(CandidateOutcome::Skipped(SkipReason::AlreadyQueued));
        }

        let (permission, permission_message) = check_permissions(path);

        let (current_specs, known_size) = match known {
            Some(known) => (known.specs, Some(known.file_size_bytes)),
            None => (self.prober.probe(path), None),
        };
        let target_specs = TargetSpecs::from_profile(profile);

        if !needs_encoding(&current_specs, &target_specs) {
            debug!(path = %path_str, codec = %current_specs.codec, "already at target");
            return Ok(CandidateOutcome::Skipped(SkipReason::NotNeeded));
        }

        let file_size_bytes = std::fs::metadata(path)
            .map(|m| m.len() as i64)
            .ok()
            .or(known_size)
            .unwrap_or(0);
        let estimated_savings_bytes = estimate_savings(
            file_size_bytes,
            &current_specs.codec,
            profile.codec.as_str(),
        );
        let upscale_plan = upscale.and_then(|policy| policy.plan_for(&current_specs));

        let status = if permission.is_ok() {
            QueueStatus::Pending
        } else {
            QueueStatus::PermissionError
        };

        let new_item = NewQueueItem {
            file_path: path_str.clone(),
            root_id,
            profile_id: profile.id,
            status,
            priority: 50,
            current_specs: Some(current_specs),
            target_specs: Some(target_specs),
            file_size_bytes,
            estimated_savings_bytes,
            permission_status: Some(permission),
            permission_message: if permission.is_ok() {
                None
            } else {
                Some(permission_message)
            },
            upscale_plan,
        };

        match self.db.insert_queue_item(&new_item) {
            Ok(id) => {
                info!(path = %path_str, status = status.as_str(), "queued");
                Ok(CandidateOutcome::Inserted(id))
            }
            // A concurrent scanner got there first; same outcome as
            // the dedup check at the top.
            Err(StorageError::ConstraintViolation(_)) => {
                Ok(CandidateOutcome::Skipped(SkipReason::AlreadyQueued))
            }
            Err(err) => Err(err),
        }
    }
}

/// Enumerate video candidates under a root, sorted for deterministic
/// queueing order. Unreadable subtrees are logged and skipped.
pub fn discover_files(root: &Path, recursive: bool) -> Vec<PathBuf> {
    if !root.is_dir() {
        warn!(path = %root.display(), "scan path is not a directory");
        return Vec::new();
    }
    let walker = if recursive {
        WalkDir::new(root)
    } else {
        WalkDir::new(root).max_depth(1)
    };

    let mut files: Vec<PathBuf> = walker
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_video_candidate(path))
        .collect();
    files.sort();
    files
}

/// A file is a candidate iff its extension is on the video allowlist
/// and it is not our own transcoder output.
pub fn is_video_candidate(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    if !VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
        return false;
    }
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    !stem.contains(OPTIMIZED_SUFFIX)
}

/// The needs-encoding predicate.
///
/// 1. Unknown current codec ⇒ encode (re-probe-and-encode beats a
///    silent skip).
/// 2. Codec differs from the target ⇒ encode.
/// 3. Target resolution pinned, current known and different ⇒ encode.
/// 4. Otherwise ⇒ no.
pub fn needs_encoding(current: &MediaSpecs, target: &TargetSpecs) -> bool {
    if current.codec_is_unknown() {
        return true;
    }
    if !target.codec.is_empty() && current.codec != target.codec {
        return true;
    }
    if let Some(target_res) = target.resolution.as_deref() {
        if !target_res.is_empty()
            && current.resolution != "unknown"
            && current.resolution != target_res
        {
            return true;
        }
    }
    false
}

/// Expected savings as a fraction of the current size, per the
/// codec-transition table. Transitions outside the table estimate 0.
pub fn savings_fraction(current_codec: &str, target_codec: &str) -> f64 {
    let legacy = matches!(current_codec, "mpeg2" | "mpeg4" | "xvid" | "wmv");
    match target_codec {
        "av1" => match current_codec {
            "av1" => 0.0,
            "h265" | "h264" | "unknown" => 0.50,
            _ if legacy => 0.50,
            _ => 0.0,
        },
        "h265" => match current_codec {
            "h265" => 0.0,
            "h264" | "unknown" => 0.40,
            _ if legacy => 0.40,
            _ => 0.0,
        },
        "h264" => match current_codec {
            "h264" => 0.0,
            "unknown" => 0.30,
            _ if legacy => 0.30,
            _ => 0.0,
        },
        _ => 0.0,
    }
}

pub fn estimate_savings(file_size_bytes: i64, current_codec: &str, target_codec: &str) -> i64 {
    (file_size_bytes as f64 * savings_fraction(current_codec, target_codec)) as i64
}

/// Probe filesystem permissions for a candidate: the file must be
/// readable and its directory writable for the finalise rename.
pub fn check_permissions(path: &Path) -> (PermissionStatus, String) {
    if !path.exists() {
        return (
            PermissionStatus::NotFound,
            format!("File does not exist: {}", path.display()),
        );
    }
    if !access_readable(path) {
        return (
            PermissionStatus::NoRead,
            format!("No read permission: {}", path.display()),
        );
    }
    let parent = path.parent().unwrap_or(Path::new("."));
    if !access_writable(parent) {
        return (
            PermissionStatus::NoWrite,
            format!("No write permission on directory: {}", parent.display()),
        );
    }
    (PermissionStatus::Ok, "File permissions OK".to_string())
}

#[cfg(unix)]
fn access(path: &Path, mode: libc::c_int) -> bool {
    use std::os::unix::ffi::OsStrExt;
    let Ok(cstr) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(cstr.as_ptr(), mode) == 0 }
}

#[cfg(unix)]
fn access_readable(path: &Path) -> bool {
    access(path, libc::R_OK)
}

#[cfg(unix)]
fn access_writable(path: &Path) -> bool {
    access(path, libc::W_OK)
}

#[cfg(not(unix))]
fn access_readable(path: &Path) -> bool {
    std::fs::File::open(path).is_ok()
}

#[cfg(not(unix))]
fn access_writable(path: &Path) -> bool {
    !std::fs::metadata(path)
        .map(|m| m.permissions().readonly())
        .unwrap_or(true)
}
