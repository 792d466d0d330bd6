//! Folder watcher: periodic incremental diffing of watched roots.
//!
//! The first pass of every watch only *seeds* its `known_files` set —
//! files already present at startup are never queued. Only files
//! appearing on a later pass go through the scan pipeline.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::db::{Database, now_stamp};
use crate::domain::FolderWatch;
use crate::scanner::{CandidateOutcome, OPTIMIZED_SUFFIX, ScanPipeline};
use crate::sync_ext::MutexExt;

#[derive(Debug, Clone, Serialize)]
pub struct WatcherStatus {
    pub running: bool,
    pub poll_interval_secs: u64,
    pub total_watches: usize,
    pub active_watches: usize,
    /// watch id → number of currently known files.
    pub known_files: HashMap<i64, usize>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ForceCheckResult {
    pub checked: usize,
    pub new_files: usize,
}

pub struct FolderWatcher {
    db: Arc<Database>,
    pipeline: Arc<ScanPipeline>,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    known_files: Arc<Mutex<HashMap<i64, HashSet<PathBuf>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FolderWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderWatcher")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl FolderWatcher {
    pub fn new(db: Arc<Database>, pipeline: Arc<ScanPipeline>, poll_interval: Duration) -> Self {
        Self {
            db,
            pipeline,
            poll_interval,
            running: Arc::new(AtomicBool::new(false)),
            known_files: Arc::new(Mutex::new(HashMap::new())),
            handle: Mutex::new(None),
        }
    }

    /// Start the polling daemon. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let watcher = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("recodarr-watcher".to_string())
            .spawn(move || watcher.poll_loop())
            .ok();
        *self.handle.lock_unpoisoned() = handle;
        info!(interval_s = self.poll_interval.as_secs(), "folder watcher started");
    }

    /// Stop the daemon. Observed within one second.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock_unpoisoned().take() {
            let _ = handle.join();
        }
        info!("folder watcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn poll_loop(&self) {
        self.seed_known_files();
        while self.running.load(Ordering::SeqCst) {
            if let Err(err) = self.check_watches() {
                error!(error = %err, "watch poll failed");
            }
            // Sleep in one-second slices so stop() is prompt.
            let seconds = self.poll_interval.as_secs().max(1);
            for _ in 0..seconds {
                if !self.running.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }

    /// First pass: record what already exists without queueing any of
    /// it. This is what makes restarts quiet.
    fn seed_known_files(&self) {
        let watches = match self.db.folder_watches(true) {
            Ok(watches) => watches,
            Err(err) => {
                error!(error = %err, "could not load folder watches for seeding");
                return;
            }
        };
        for watch in watches {
            let files = enumerate_watch(&watch);
            info!(
                path = %watch.path,
                existing = files.len(),
                "watcher initialised"
            );
            self.known_files.lock_unpoisoned().insert(watch.id, files);
        }
    }

    fn check_watches(&self) -> crate::error::StorageResult<usize> {
        let watches = self.db.folder_watches(true)?;
        let mut queued_total = 0usize;
        for watch in watches {
            queued_total += self.check_one(&watch)?;
            self.db.touch_folder_watch(watch.id, &now_stamp())?;
        }
        Ok(queued_total)
    }

    fn check_one(&self, watch: &FolderWatch) -> crate::error::StorageResult<usize> {
        let current = enumerate_watch(watch);

        let new_files: Vec<PathBuf> = {
            let known = self.known_files.lock_unpoisoned();
            match known.get(&watch.id) {
                Some(known) => {
                    let mut fresh: Vec<PathBuf> =
                        current.difference(known).cloned().collect();
                    fresh.sort();
                    fresh
                }
                // A watch added mid-flight gets a seeding pass instead
                // of a diff, exactly like startup.
                None => Vec::new(),
            }
        };

        let seeded = self
            .known_files
            .lock_unpoisoned()
            .insert(watch.id, current)
            .is_some();
        if !seeded {
            info!(path = %watch.path, "watcher initialised (new watch)");
            return Ok(0);
        }

        if !watch.auto_queue || new_files.is_empty() {
            return Ok(0);
        }

        let Some(profile) = self.db.profile(watch.profile_id)? else {
            warn!(path = %watch.path, profile_id = watch.profile_id, "watch profile missing");
            return Ok(0);
        };

        let mut queued = 0usize;
        for path in new_files {
            match self
                .pipeline
                .process_candidate(&path, &profile, None, None, None)
            {
                Ok(CandidateOutcome::Inserted(_)) => queued += 1,
                Ok(CandidateOutcome::Skipped(reason)) => {
                    debug!(path = %path.display(), ?reason, "new file skipped");
                }
                Err(err) => {
                    error!(path = %path.display(), error = %err, "failed to queue new file");
                }
            }
        }
        if queued > 0 {
            info!(path = %watch.path, queued, "watcher auto-queued new files");
        }
        Ok(queued)
    }

    /// Run one pass immediately over one watch (or all of them).
    pub fn force_check(&self, watch_id: Option<i64>) -> crate::error::StorageResult<ForceCheckResult> {
        let watches = self.db.folder_watches(true)?;
        let mut checked = 0usize;
        let mut new_files = 0usize;
        for watch in watches {
            if watch_id.is_some_and(|id| id != watch.id) {
                continue;
            }
            checked += 1;
            new_files += self.check_one(&watch)?;
            self.db.touch_folder_watch(watch.id, &now_stamp())?;
        }
        Ok(ForceCheckResult { checked, new_files })
    }

    pub fn status(&self) -> crate::error::StorageResult<WatcherStatus> {
        let watches = self.db.folder_watches(false)?;
        let known = self.known_files.lock_unpoisoned();
        Ok(WatcherStatus {
            running: self.is_running(),
            poll_interval_secs: self.poll_interval.as_secs(),
            total_watches: watches.len(),
            active_watches: watches.iter().filter(|w| w.enabled).count(),
            known_files: known.iter().map(|(id, set)| (*id, set.len())).collect(),
        })
    }
}

/// Enumerate a watch directory under its own extension set and
/// recursion flag, with the same own-output skip rule as the scanner.
fn enumerate_watch(watch: &FolderWatch) -> HashSet<PathBuf> {
    let root = Path::new(&watch.path);
    if !root.is_dir() {
        return HashSet::new();
    }
    let walker = if watch.recursive {
        WalkDir::new(root)
    } else {
        WalkDir::new(root).max_depth(1)
    };
    walker
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| format!(".{}", e.to_ascii_lowercase()))
                .unwrap_or_default();
            if !watch.extensions.contains(&ext) {
                return false;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            !stem.contains(OPTIMIZED_SUFFIX)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FolderWatchDraft;
    use crate::domain::ProfileDraft;
    use crate::logging::StatsLog;
    use crate::probe::MediaProber;

    fn watcher_fixture(
        poll: Duration,
    ) -> (tempfile::TempDir, Arc<Database>, Arc<FolderWatcher>, i64) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let profile_id = db.create_profile(&ProfileDraft::av1_default("p")).unwrap();
        let prober = Arc::new(MediaProber::new(PathBuf::from("/no/such/prober")));
        let stats = Arc::new(StatsLog::new(dir.path().join("stats.jsonl")));
        let pipeline = Arc::new(ScanPipeline::new(db.clone(), prober, stats));
        let watcher = Arc::new(FolderWatcher::new(db.clone(), pipeline, poll));
        (dir, db, watcher, profile_id)
    }

    #[test]
    fn seeding_pass_never_queues_existing_files() {
        let (dir, db, watcher, profile_id) = watcher_fixture(Duration::from_secs(60));
        let root = dir.path().join("watched");
        std::fs::create_dir(&root).unwrap();
        for i in 0..10 {
            std::fs::write(root.join(format!("old{i}.mkv")), b"x").unwrap();
        }
        db.create_folder_watch(&FolderWatchDraft::new(
            root.to_string_lossy().to_string(),
            profile_id,
        ))
        .unwrap();

        watcher.seed_known_files();
        // Ten files known, zero queued.
        let status = watcher.status().unwrap();
        assert_eq!(status.known_files.values().sum::<usize>(), 10);
        assert_eq!(db.queue_items(None).unwrap().len(), 0);

        // A new file arrives; the next pass queues exactly that one.
        std::fs::write(root.join("new.mkv"), b"x").unwrap();
        let result = watcher.force_check(None).unwrap();
        assert_eq!(result.checked, 1);
        assert_eq!(result.new_files, 1);

        let items = db.queue_items(None).unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].file_path.ends_with("new.mkv"));
    }

    #[test]
    fn deleted_files_drop_out_of_known_set() {
        let (dir, db, watcher, profile_id) = watcher_fixture(Duration::from_secs(60));
        let root = dir.path().join("watched");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("a.mkv"), b"x").unwrap();
        db.create_folder_watch(&FolderWatchDraft::new(
            root.to_string_lossy().to_string(),
            profile_id,
        ))
        .unwrap();

        watcher.seed_known_files();
        std::fs::remove_file(root.join("a.mkv")).unwrap();
        watcher.force_check(None).unwrap();
        let status = watcher.status().unwrap();
        assert_eq!(status.known_files.values().sum::<usize>(), 0);

        // Re-creating the file counts as new again.
        std::fs::write(root.join("a.mkv"), b"x").unwrap();
        let result = watcher.force_check(None).unwrap();
        assert_eq!(result.new_files, 1);
    }

    #[test]
    fn own_output_and_foreign_extensions_ignored() {
        let (dir, db, watcher, profile_id) = watcher_fixture(Duration::from_secs(60));
        let root = dir.path().join("watched");
        std::fs::create_dir(&root).unwrap();
        db.create_folder_watch(&FolderWatchDraft::new(
            root.to_string_lossy().to_string(),
            profile_id,
        ))
        .unwrap();
        watcher.seed_known_files();

        std::fs::write(root.join("movie_optimized.mkv"), b"x").unwrap();
        std::fs::write(root.join("notes.txt"), b"x").unwrap();
        let result = watcher.force_check(None).unwrap();
        assert_eq!(result.new_files, 0);
        assert_eq!(db.queue_items(None).unwrap().len(), 0);
    }

    #[test]
    fn daemon_stops_within_a_poll_slice() {
        let (_dir, _db, watcher, _profile_id) = watcher_fixture(Duration::from_secs(3600));
        watcher.start();
        assert!(watcher.is_running());
        let started = std::time::Instant::now();
        watcher.stop();
        assert!(!watcher.is_running());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn last_check_is_stamped() {
        let (dir, db, watcher, profile_id) = watcher_fixture(Duration::from_secs(60));
        let root = dir.path().join("watched");
        std::fs::create_dir(&root).unwrap();
        let watch_id = db
            .create_folder_watch(&FolderWatchDraft::new(
                root.to_string_lossy().to_string(),
                profile_id,
            ))
            .unwrap();
        watcher.seed_known_files();
        watcher.force_check(Some(watch_id)).unwrap();
        let watch = db.folder_watch(watch_id).unwrap().unwrap();
        assert!(watch.last_check.is_some());
    }
}
