//! The process object graph.
//!
//! Components are constructed once, in dependency order — persistence
//! → resource monitor → prober → scan pipeline → watcher → encoder
//! pool → scheduler → external sync → update checker — and torn down
//! in reverse. Nothing initialises itself lazily from a hot path.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::encoder::EncoderPool;
use crate::external::ExternalSync;
use crate::logging::StatsLog;
use crate::monitor::ResourceMonitor;
use crate::probe::MediaProber;
use crate::scanner::ScanPipeline;
use crate::scheduler::Scheduler;
use crate::upscale::UpdateChecker;
use crate::watcher::FolderWatcher;

pub struct App {
    pub config: Arc<Config>,
    pub stats: Arc<StatsLog>,
    pub db: Arc<Database>,
    pub monitor: Arc<ResourceMonitor>,
    pub prober: Arc<MediaProber>,
    pub pipeline: Arc<ScanPipeline>,
    pub watcher: Arc<FolderWatcher>,
    pub pool: Arc<EncoderPool>,
    pub scheduler: Arc<Scheduler>,
    pub sync: Arc<ExternalSync>,
    pub updates: Arc<UpdateChecker>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").finish_non_exhaustive()
    }
}

impl App {
    /// Build the full object graph. Nothing is running yet afterwards;
    /// call [`App::start_daemons`] for that.
    pub fn bootstrap(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        if config.secret_is_default() {
            warn!("RECODARR_SECRET_KEY is the insecure default; stored API keys are weakly protected");
        }

        let stats = Arc::new(StatsLog::new(config.stats_path()));
        let db = Arc::new(Database::open(&config.db_path())?);
        let monitor = Arc::new(ResourceMonitor::new());
        let prober = Arc::new(
            MediaProber::new(config.prober_bin.clone())
                .with_scan_fallback(config.transcoder_bin.clone()),
        );
        let pipeline = Arc::new(ScanPipeline::new(
            Arc::clone(&db),
            Arc::clone(&prober),
            Arc::clone(&stats),
        ));
        let watcher = Arc::new(FolderWatcher::new(
            Arc::clone(&db),
            Arc::clone(&pipeline),
            Duration::from_secs(config.watcher_poll_secs),
        ));
        let pool = Arc::new(EncoderPool::new(
            Arc::clone(&db),
            Arc::clone(&monitor),
            Arc::clone(&prober),
            Arc::clone(&stats),
            Arc::clone(&config),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&db),
            Arc::clone(&pool),
            Duration::from_secs(config.scheduler_tick_secs),
        ));
        let sync = Arc::new(ExternalSync::new(
            Arc::clone(&db),
            Arc::clone(&pipeline),
            &config.secret_key,
        ));
        let updates = Arc::new(UpdateChecker::new(config.upscaler_cache_dir()));

        info!(data_dir = %config.data_dir.display(), "recodarr bootstrapped");
        Ok(Self {
            config,
            stats,
            db,
            monitor,
            prober,
            pipeline,
            watcher,
            pool,
            scheduler,
            sync,
            updates,
        })
    }

    /// Start the background daemons. The encoder pool itself is
    /// started by the scheduler tick (or an operator's manual start).
    pub fn start_daemons(&self) {
        self.watcher.start();
        self.scheduler.start();
        self.updates.start();
        info!("daemons running");
    }

    /// Stop everything, reverse of construction order. Blocks until
    /// every daemon thread has joined.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.updates.stop();
        self.scheduler.stop();
        self.pool.stop();
        self.watcher.stop();
        info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            data_dir: dir.join("data"),
            logs_dir: dir.join("logs"),
            transcoder_bin: PathBuf::from("/no/such/transcoder"),
            prober_bin: PathBuf::from("/no/such/prober"),
            frame_tool_bin: PathBuf::from("/no/such/frametool"),
            secret_key: "test-secret".to_string(),
            watcher_poll_secs: 60,
            scheduler_tick_secs: 60,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn bootstrap_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::bootstrap(test_config(dir.path())).unwrap();
        assert!(dir.path().join("data/recodarr.db").exists());

        app.start_daemons();
        assert!(app.watcher.is_running());

        let started = std::time::Instant::now();
        app.shutdown();
        assert!(!app.watcher.is_running());
        assert!(!app.pool.is_running());
        // Every daemon observes stop within its one-second slice.
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::bootstrap(test_config(dir.path())).unwrap();
        app.shutdown();
        app.shutdown();
    }
}
