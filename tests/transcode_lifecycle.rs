//! End-to-end job lifecycle against a fake transcoder binary that
//! speaks the real progress grammar and writes the expected output
//! file.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use recodarr::config::Config;
use recodarr::db::{Database, NewQueueItem};
use recodarr::domain::{ProfileDraft, QueueStatus};
use recodarr::encoder::command::HardwareSupport;
use recodarr::encoder::supervisor::{self, SupervisorContext};
use recodarr::encoder::EncoderPool;
use recodarr::logging::StatsLog;
use recodarr::monitor::{ResourceLimits, ResourceMonitor};
use recodarr::probe::MediaProber;

/// Write an executable fake transcoder script.
fn fake_transcoder(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-transcoder.sh");
    let script = format!("#!/bin/sh\n{body}\n");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Script body locating the `-o` argument like the real CLI would.
const FIND_OUTPUT: &str = r#"
out=""
prev=""
for a in "$@"; do
  if [ "$prev" = "-o" ]; then out="$a"; fi
  prev="$a"
done
"#;

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    db: Arc<Database>,
    stats: Arc<StatsLog>,
    profile_id: i64,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let db = Arc::new(Database::open_in_memory().unwrap());
    let profile_id = db.create_profile(&ProfileDraft::av1_default("movies")).unwrap();
    let stats = Arc::new(StatsLog::new(root.join("statistics.jsonl")));
    Fixture {
        _dir: dir,
        root,
        db,
        stats,
        profile_id,
    }
}

fn context(fx: &Fixture, transcoder: PathBuf) -> SupervisorContext {
    SupervisorContext {
        db: Arc::clone(&fx.db),
        monitor: Arc::new(ResourceMonitor::new()),
        prober: Arc::new(MediaProber::new(PathBuf::from("/no/such/prober"))),
        stats: Arc::clone(&fx.stats),
        transcoder_bin: transcoder,
        frame_tool_bin: PathBuf::from("/no/such/frametool"),
        upscaler_cache_dir: fx.root.join("upscalers"),
        limits: ResourceLimits {
            enable_throttling: false,
            ..ResourceLimits::default()
        },
        hw: HardwareSupport::none(),
    }
}

fn queue_and_claim(fx: &Fixture, name: &str) -> recodarr::domain::QueueItem {
    let file = fx.root.join(name);
    std::fs::write(&file, vec![0u8; 4096]).unwrap();
    fx.db
        .insert_queue_item(&NewQueueItem::pending(
            file.to_string_lossy().to_string(),
            fx.profile_id,
            None,
        ))
        .unwrap();
    fx.db.claim_next_pending().unwrap().unwrap()
}

#[test]
fn happy_path_replaces_original_and_records_history() {
    let fx = fixture();
    let transcoder = fake_transcoder(
        &fx.root,
        &format!(
            "{FIND_OUTPUT}\
             echo 'Encoding: task 1 of 1, 10.00 %'\n\
             echo 'Encoding: task 1 of 1, 50.00 %'\n\
             echo 'Encoding: task 1 of 1, 100.00 %'\n\
             printf 'transcoded-bytes' > \"$out\"\n\
             exit 0"
        ),
    );

    let item = queue_and_claim(&fx, "m.mkv");
    let original = PathBuf::from(&item.file_path);
    let profile = fx.db.profile(fx.profile_id).unwrap().unwrap();

    let handle = supervisor::spawn(context(&fx, transcoder), item.clone(), profile);
    handle.join();

    let finished = fx.db.queue_item(item.id).unwrap().unwrap();
    assert_eq!(finished.status, QueueStatus::Completed);
    assert_eq!(finished.progress, 100.0);
    assert!(finished.completed_at.is_some());
    assert!(finished.error_message.is_none());

    // Atomic replace: same stem, new bytes, no temp file left behind.
    assert_eq!(std::fs::read(&original).unwrap(), b"transcoded-bytes");
    assert!(!fx.root.join("m_optimized.mkv").exists());

    let history = fx.db.history(10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].original_size_bytes, 4096);
    assert_eq!(history[0].new_size_bytes, b"transcoded-bytes".len() as i64);
    assert_eq!(history[0].file_path, original.to_string_lossy().to_string());
    assert_eq!(history[0].codec, "av1");
}

#[test]
fn crashing_transcoder_fails_job_and_keeps_original() {
    let fx = fixture();
    let transcoder = fake_transcoder(
        &fx.root,
        "echo 'Encoding: task 1 of 1, 5.00 %'\nexit 3",
    );

    let item = queue_and_claim(&fx, "broken.mkv");
    let original = PathBuf::from(&item.file_path);
    let profile = fx.db.profile(fx.profile_id).unwrap().unwrap();

    let handle = supervisor::spawn(context(&fx, transcoder), item.clone(), profile);
    handle.join();

    let finished = fx.db.queue_item(item.id).unwrap().unwrap();
    assert_eq!(finished.status, QueueStatus::Failed);
    assert!(finished.completed_at.is_some());
    assert!(
        finished
            .error_message
            .as_deref()
            .unwrap()
            .contains("exited with code 3")
    );

    assert!(original.exists(), "failed jobs must leave the source intact");
    assert_eq!(std::fs::metadata(&original).unwrap().len(), 4096);
    assert_eq!(fx.db.history(10).unwrap().len(), 0);
}

#[test]
fn missing_output_is_a_failure_not_a_replace() {
    let fx = fixture();
    // Exits cleanly without ever writing the output file.
    let transcoder = fake_transcoder(
        &fx.root,
        "echo 'Encoding: task 1 of 1, 100.00 %'\nexit 0",
    );

    let item = queue_and_claim(&fx, "phantom.mkv");
    let original = PathBuf::from(&item.file_path);
    let profile = fx.db.profile(fx.profile_id).unwrap().unwrap();

    let handle = supervisor::spawn(context(&fx, transcoder), item.clone(), profile);
    handle.join();

    let finished = fx.db.queue_item(item.id).unwrap().unwrap();
    assert_eq!(finished.status, QueueStatus::Failed);
    assert!(original.exists());
    assert_eq!(fx.db.history(10).unwrap().len(), 0);
}

#[test]
fn stop_request_terminates_and_marks_manually_stopped() {
    let fx = fixture();
    let transcoder = fake_transcoder(
        &fx.root,
        "echo 'Encoding: task 1 of 1, 1.00 %'\nexec sleep 30",
    );

    let item = queue_and_claim(&fx, "longrun.mkv");
    let original = PathBuf::from(&item.file_path);
    let profile = fx.db.profile(fx.profile_id).unwrap().unwrap();

    let started = Instant::now();
    let handle = supervisor::spawn(context(&fx, transcoder), item.clone(), profile);
    std::thread::sleep(Duration::from_millis(500));
    handle.request_stop();
    handle.join();

    assert!(
        started.elapsed() < Duration::from_secs(20),
        "stop must not wait for the full transcode"
    );
    let finished = fx.db.queue_item(item.id).unwrap().unwrap();
    assert_eq!(finished.status, QueueStatus::Failed);
    assert_eq!(finished.error_message.as_deref(), Some("Manually stopped"));
    assert!(original.exists());
    assert_eq!(fx.db.history(10).unwrap().len(), 0);
}

#[test]
fn pool_drains_queue_through_fake_transcoder() {
    let fx = fixture();
    let transcoder = fake_transcoder(
        &fx.root,
        &format!(
            "{FIND_OUTPUT}\
             echo 'Encoding: task 1 of 1, 100.00 %'\n\
             printf 'pool-output' > \"$out\"\n\
             exit 0"
        ),
    );
    fx.db
        .set_setting("resource_enable_throttling", "false")
        .unwrap();

    for name in ["a.mkv", "b.mkv"] {
        let file = fx.root.join(name);
        std::fs::write(&file, vec![0u8; 1000]).unwrap();
        fx.db
            .insert_queue_item(&NewQueueItem::pending(
                file.to_string_lossy().to_string(),
                fx.profile_id,
                None,
            ))
            .unwrap();
    }

    let config = Arc::new(Config {
        data_dir: fx.root.clone(),
        logs_dir: fx.root.clone(),
        transcoder_bin: transcoder,
        prober_bin: PathBuf::from("/no/such/prober"),
        frame_tool_bin: PathBuf::from("/no/such/frametool"),
        secret_key: "test".to_string(),
        watcher_poll_secs: 60,
        scheduler_tick_secs: 60,
        log_level: "info".to_string(),
    });
    let pool = Arc::new(EncoderPool::new(
        Arc::clone(&fx.db),
        Arc::new(ResourceMonitor::new()),
        Arc::new(MediaProber::new(PathBuf::from("/no/such/prober"))),
        Arc::clone(&fx.stats),
        config,
    ));

    pool.start();
    let deadline = Instant::now() + Duration::from_secs(60);
    while pool.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(100));
    }
    assert!(!pool.is_running(), "pool should idle after draining");

    let completed = fx.db.queue_items(Some(QueueStatus::Completed)).unwrap();
    assert_eq!(completed.len(), 2);
    assert_eq!(fx.db.history(10).unwrap().len(), 2);
    assert_eq!(std::fs::read(fx.root.join("a.mkv")).unwrap(), b"pool-output");
}
