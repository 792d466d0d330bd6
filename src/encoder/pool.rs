//! Encoder pool: claims pending items and runs one supervisor per
//! claim, up to the configured concurrency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::{error, info, warn};

use super::command::HardwareSupport;
use super::supervisor::{self, SupervisorContext, SupervisorHandle};
use crate::config::Config;
use crate::db::Database;
use crate::domain::QueueItemPatch;
use crate::logging::StatsLog;
use crate::monitor::{ResourceLimits, ResourceMonitor};
use crate::probe::MediaProber;
use crate::sync_ext::MutexExt;

pub struct EncoderPool {
    db: Arc<Database>,
    monitor: Arc<ResourceMonitor>,
    prober: Arc<MediaProber>,
    stats: Arc<StatsLog>,
    config: Arc<Config>,
    running: Arc<AtomicBool>,
    active: Arc<Mutex<Vec<Arc<SupervisorHandle>>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    hw: OnceCell<HardwareSupport>,
}

impl std::fmt::Debug for EncoderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncoderPool")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl EncoderPool {
    pub fn new(
        db: Arc<Database>,
        monitor: Arc<ResourceMonitor>,
        prober: Arc<MediaProber>,
        stats: Arc<StatsLog>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            monitor,
            prober,
            stats,
            config,
            running: Arc::new(AtomicBool::new(false)),
            active: Arc::new(Mutex::new(Vec::new())),
            loop_handle: Mutex::new(None),
            hw: OnceCell::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        let mut active = self.active.lock_unpoisoned();
        active.retain(|handle| !handle.is_finished());
        active.len()
    }

    /// Hardware detection runs once per process, lazily, so a missing
    /// transcoder binary degrades to software planning instead of
    /// blocking startup.
    fn hardware(&self) -> HardwareSupport {
        *self
            .hw
            .get_or_init(|| HardwareSupport::detect(&self.config.transcoder_bin))
    }

    /// Start the claim loop. Idempotent: a running pool stays as-is.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("recodarr-encoder-pool".to_string())
            .spawn(move || pool.claim_loop())
            .ok();
        *self.loop_handle.lock_unpoisoned() = handle;
        info!("encoder pool started");
    }

    fn claim_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            let max_concurrent = self
                .db
                .schedule()
                .map(|s| s.max_concurrent_jobs as usize)
                .unwrap_or(1)
                .max(1);

            let active_count = self.active_count();
            if active_count >= max_concurrent {
                std::thread::sleep(Duration::from_secs(1));
                continue;
            }

            match self.db.claim_next_pending() {
                Ok(Some(item)) => {
                    let profile = match self.db.profile(item.profile_id) {
                        Ok(Some(profile)) => profile,
                        Ok(None) => {
                            warn!(item_id = item.id, profile_id = item.profile_id, "profile missing");
                            let _ = self.db.update_queue_item(
                                item.id,
                                &QueueItemPatch::failed(format!(
                                    "planning failed: profile {} no longer exists",
                                    item.profile_id
                                )),
                            );
                            continue;
                        }
                        Err(err) => {
                            error!(error = %err, "profile lookup failed");
                            std::thread::sleep(Duration::from_secs(1));
                            continue;
                        }
                    };

                    let ctx = SupervisorContext {
                        db: Arc::clone(&self.db),
                        monitor: Arc::clone(&self.monitor),
                        prober: Arc::clone(&self.prober),
                        stats: Arc::clone(&self.stats),
                        transcoder_bin: self.config.transcoder_bin.clone(),
                        frame_tool_bin: self.config.frame_tool_bin.clone(),
                        upscaler_cache_dir: self.config.upscaler_cache_dir(),
                        limits: ResourceLimits::from_settings(&self.db),
                        hw: self.hardware(),
                    };
                    info!(item_id = item.id, file = %item.file_path, "dispatching job");
                    let handle = Arc::new(supervisor::spawn(ctx, item, profile));
                    self.active.lock_unpoisoned().push(handle);
                }
                Ok(None) => {
                    if self.active_count() == 0 {
                        // Queue drained; go idle until the scheduler or
                        // an operator starts us again.
                        info!("queue empty, encoder pool going idle");
                        break;
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
                Err(err) => {
                    error!(error = %err, "claim failed");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop the loop and every active supervisor, then wait for them.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);

        let handles: Vec<Arc<SupervisorHandle>> = {
            let mut active = self.active.lock_unpoisoned();
            active.drain(..).collect()
        };
        for handle in &handles {
            handle.request_stop();
        }
        for handle in &handles {
            handle.join();
        }

        if let Some(handle) = self.loop_handle.lock_unpoisoned().take() {
            let _ = handle.join();
        }
        info!("encoder pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewQueueItem;
    use crate::domain::{ProfileDraft, QueueStatus};
    use std::path::PathBuf;

    fn pool_fixture(dir: &std::path::Path) -> (Arc<EncoderPool>, Arc<Database>, i64) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let profile_id = db.create_profile(&ProfileDraft::av1_default("p")).unwrap();
        let monitor = Arc::new(ResourceMonitor::new());
        let prober = Arc::new(MediaProber::new(PathBuf::from("/no/such/prober")));
        let stats = Arc::new(StatsLog::new(dir.join("stats.jsonl")));
        let config = Arc::new(Config {
            data_dir: dir.to_path_buf(),
            logs_dir: dir.to_path_buf(),
            // A transcoder that cannot be spawned: jobs fail fast.
            transcoder_bin: PathBuf::from("/no/such/transcoder"),
            prober_bin: PathBuf::from("/no/such/prober"),
            frame_tool_bin: PathBuf::from("/no/such/frametool"),
            secret_key: "test".to_string(),
            watcher_poll_secs: 60,
            scheduler_tick_secs: 60,
            log_level: "info".to_string(),
        });
        let pool = Arc::new(EncoderPool::new(db.clone(), monitor, prober, stats, config));
        (pool, db, profile_id)
    }

    #[test]
    fn pool_drains_queue_and_goes_idle() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, db, profile_id) = pool_fixture(dir.path());
        for i in 0..3 {
            db.insert_queue_item(&NewQueueItem::pending(
                dir.path().join(format!("{i}.mkv")).to_string_lossy().to_string(),
                profile_id,
                None,
            ))
            .unwrap();
        }

        pool.start();
        // Unspawnable transcoder: every job fails quickly and the pool
        // idles itself once the queue is empty.
        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        while pool.is_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }
        assert!(!pool.is_running(), "pool should go idle after draining");

        let items = db.queue_items(None).unwrap();
        assert_eq!(items.len(), 3);
        for item in items {
            assert_eq!(item.status, QueueStatus::Failed);
            assert!(item.completed_at.is_some());
            assert!(item.error_message.is_some());
        }
    }

    #[test]
    fn pool_never_exceeds_max_concurrent() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, db, _profile_id) = pool_fixture(dir.path());
        let mut schedule = db.schedule().unwrap();
        schedule.max_concurrent_jobs = 1;
        db.save_schedule(&schedule).unwrap();

        pool.start();
        for _ in 0..20 {
            assert!(pool.active_count() <= 1);
            std::thread::sleep(Duration::from_millis(10));
        }
        pool.stop();
    }

    #[test]
    fn missing_profile_fails_the_item_not_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, db, _profile_id) = pool_fixture(dir.path());
        // Reference a profile id that does not exist.
        db.insert_queue_item(&NewQueueItem::pending(
            dir.path().join("orphan.mkv").to_string_lossy().to_string(),
            424242,
            None,
        ))
        .unwrap();

        pool.start();
        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        while pool.is_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }

        let items = db.queue_items(Some(QueueStatus::Failed)).unwrap();
        assert_eq!(items.len(), 1);
        assert!(
            items[0]
                .error_message
                .as_deref()
                .unwrap()
                .contains("planning failed")
        );
    }

    #[test]
    fn stop_is_idempotent_and_fast_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, _db, _profile_id) = pool_fixture(dir.path());
        pool.start();
        let started = std::time::Instant::now();
        pool.stop();
        pool.stop();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!pool.is_running());
    }
}
