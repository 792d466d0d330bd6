//! One queue item's lifetime: plan the command, run the optional
//! upscale pre-stage, spawn the transcoder, pump progress, throttle on
//! resource pressure, and finalise with an atomic file replace.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info, warn};

use super::command::{CommandPlan, HardwareSupport, plan_transcode};
use super::pause;
use crate::db::{Database, now_stamp, parse_stamp};
use crate::domain::{Profile, QueueItem, QueueItemPatch, QueueStatus};
use crate::error::EncodeError;
use crate::logging::{StatsEvent, StatsLog, TRANSCODER_TARGET};
use crate::monitor::{ResourceLimits, ResourceMonitor};
use crate::probe::MediaProber;
use crate::sync_ext::MutexExt;
use crate::upscale::{self, UpscaleContext, UpscaleOutput};

/// Transcoder progress lines look like `... task 1 of 2, 45.3 % ...`.
static PROGRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"task \d+ of \d+, ([\d.]+) %").expect("static regex"));

/// How long a stop request waits for a graceful exit before the child
/// is killed outright.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Resource-monitor cadence while a job runs.
const MONITOR_INTERVAL_SECS: u64 = 5;

/// Everything a supervisor needs besides its item and profile.
#[derive(Clone)]
pub struct SupervisorContext {
    pub db: Arc<Database>,
    pub monitor: Arc<ResourceMonitor>,
    pub prober: Arc<MediaProber>,
    pub stats: Arc<StatsLog>,
    pub transcoder_bin: PathBuf,
    pub frame_tool_bin: PathBuf,
    pub upscaler_cache_dir: PathBuf,
    pub limits: ResourceLimits,
    pub hw: HardwareSupport,
}

impl std::fmt::Debug for SupervisorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorContext").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Shared {
    pid: AtomicU32,
    stop_requested: AtomicBool,
    monitor_stop: AtomicBool,
    paused: AtomicBool,
}

/// Control handle held by the pool while the supervisor thread runs.
pub struct SupervisorHandle {
    item_id: i64,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("item_id", &self.item_id)
            .finish_non_exhaustive()
    }
}

impl SupervisorHandle {
    pub fn item_id(&self) -> i64 {
        self.item_id
    }

    /// Ask the job to stop. The supervisor terminates the child, waits
    /// up to ten seconds, and marks the item failed.
    pub fn request_stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .lock_unpoisoned()
            .as_ref()
            .map(|h| h.is_finished())
            .unwrap_or(true)
    }

    pub fn join(&self) {
        if let Some(handle) = self.handle.lock_unpoisoned().take() {
            let _ = handle.join();
        }
    }
}

/// Spawn a supervisor thread for one claimed item.
pub fn spawn(ctx: SupervisorContext, item: QueueItem, profile: Profile) -> SupervisorHandle {
    let shared = Arc::new(Shared::default());
    let item_id = item.id;
    let thread_shared = Arc::clone(&shared);

    let handle = std::thread::Builder::new()
        .name(format!("recodarr-job-{item_id}"))
        .spawn(move || run_guarded(ctx, item, profile, thread_shared));

    let handle = match handle {
        Ok(handle) => Some(handle),
        Err(err) => {
            error!(item_id, error = %err, "could not spawn supervisor thread");
            None
        }
    };

    SupervisorHandle {
        item_id,
        shared,
        handle: Mutex::new(handle),
    }
}

fn run_guarded(ctx: SupervisorContext, item: QueueItem, profile: Profile, shared: Arc<Shared>) {
    let item_id = item.id;
    let db = Arc::clone(&ctx.db);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        execute(&ctx, &item, &profile, &shared)
    }));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            // The failing branch has already recorded the item state.
            error!(item_id, error = %err, "job failed");
        }
        Err(_) => {
            error!(item_id, "job panicked");
            let _ = db.update_queue_item(
                item_id,
                &QueueItemPatch::failed("internal error while transcoding"),
            );
        }
    }
}

/// Coalesces progress persistence to at most one write per second per
/// job, and keeps live progress strictly below 100 so the completed
/// pin stays meaningful.
struct ProgressWriter<'a> {
    db: &'a Database,
    item_id: i64,
    last_write: Option<Instant>,
}

impl<'a> ProgressWriter<'a> {
    fn new(db: &'a Database, item_id: i64) -> Self {
        Self {
            db,
            item_id,
            last_write: None,
        }
    }

    fn write(&mut self, percent: f64) {
        let due = self
            .last_write
            .map(|at| at.elapsed() >= Duration::from_secs(1))
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_write = Some(Instant::now());
        let clamped = percent.clamp(0.0, 99.9);
        if let Err(err) = self
            .db
            .update_queue_item(self.item_id, &QueueItemPatch::progress(clamped))
        {
            debug!(item_id = self.item_id, error = %err, "progress write failed");
        }
    }
}

fn execute(
    ctx: &SupervisorContext,
    item: &QueueItem,
    profile: &Profile,
    shared: &Arc<Shared>,
) -> Result<(), EncodeError> {
    let original = PathBuf::from(&item.file_path);
    let mut transcode_input = original.clone();

    // Optional upscale pre-stage. Failure here never fails the job:
    // the transcoder simply gets the original source.
    let mut upscale_output: Option<UpscaleOutput> = None;
    if let Some(plan) = &item.upscale_plan {
        let upscale_ctx = UpscaleContext {
            prober: Arc::clone(&ctx.prober),
            frame_tool: ctx.frame_tool_bin.clone(),
            cache_dir: ctx.upscaler_cache_dir.clone(),
        };
        let mut writer = ProgressWriter::new(&ctx.db, item.id);
        match upscale::run_pipeline(&upscale_ctx, &original, plan, &mut |pct| writer.write(pct)) {
            Ok(output) => {
                info!(item_id = item.id, intermediate = %output.intermediate.display(), "pre-stage done");
                transcode_input = output.intermediate.clone();
                upscale_output = Some(output);
            }
            Err(err) => {
                warn!(item_id = item.id, error = %err, "upscale pre-stage failed; using original source");
            }
        }
    }

    let result = transcode(ctx, item, profile, shared, &original, &transcode_input);

    // The pre-stage working directory goes away regardless of how the
    // transcode ended.
    if let Some(output) = upscale_output {
        output.cleanup();
    }
    result
}

fn fail_item(ctx: &SupervisorContext, item: &QueueItem, message: &str) {
    if let Err(err) = ctx
        .db
        .update_queue_item(item.id, &QueueItemPatch::failed(message))
    {
        error!(item_id = item.id, error = %err, "could not record job failure");
    }
    ctx.stats.record(StatsEvent::TranscodeError {
        file: file_name_of(&item.file_path),
        error: message.to_string(),
    });
}

fn file_name_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn transcode(
    ctx: &SupervisorContext,
    item: &QueueItem,
    profile: &Profile,
    shared: &Arc<Shared>,
    original: &Path,
    input: &Path,
) -> Result<(), EncodeError> {
    let plan = match plan_transcode(&ctx.transcoder_bin, input, original, profile, &ctx.hw) {
        Ok(plan) => plan,
        Err(err) => {
            fail_item(ctx, item, &err.to_string());
            return Err(err);
        }
    };

    info!(
        target: TRANSCODER_TARGET,
        file = %file_name_of(&item.file_path),
        "starting transcode"
    );
    debug!(
        target: TRANSCODER_TARGET,
        command = format!("{} {}", plan.program.display(), plan.args.join(" "))
    );

    let mut child = match Command::new(&plan.program)
        .args(&plan.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            let encode_err = if err.kind() == std::io::ErrorKind::PermissionDenied {
                EncodeError::PermissionDenied(plan.program.display().to_string())
            } else {
                EncodeError::Io(err)
            };
            fail_item(ctx, item, &format!("could not start transcoder: {encode_err}"));
            return Err(encode_err);
        }
    };

    let pid = child.id();
    shared.pid.store(pid, Ordering::SeqCst);
    pause::set_background_priority(pid, ctx.limits.nice_level);

    let (line_tx, line_rx) = std::sync::mpsc::channel::<String>();
    let stdout = child.stdout.take();
    let stdout_pump = std::thread::spawn(move || {
        use std::io::BufRead;
        let Some(stdout) = stdout else { return };
        for line in std::io::BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });
    let stderr = child.stderr.take();
    let stderr_pump = std::thread::spawn(move || {
        use std::io::BufRead;
        let Some(stderr) = stderr else { return };
        for line in std::io::BufReader::new(stderr).lines() {
            let Ok(line) = line else { break };
            debug!(target: TRANSCODER_TARGET, "{line}");
        }
    });

    let monitor_handle = spawn_monitor_thread(ctx, shared, item.id);

    let wait_result = pump_until_exit(ctx, item, shared, &mut child, &line_rx);

    shared.monitor_stop.store(true, Ordering::SeqCst);
    let _ = monitor_handle.map(|h| h.join());
    let _ = stdout_pump.join();
    let _ = stderr_pump.join();

    let status = match wait_result {
        Ok(status) => status,
        Err(err) => {
            fail_item(ctx, item, &format!("transcoder I/O failure: {err}"));
            let _ = std::fs::remove_file(&plan.temp_output);
            return Err(err);
        }
    };

    if shared.stop_requested.load(Ordering::SeqCst) {
        info!(item_id = item.id, "transcode stopped on request");
        fail_item(ctx, item, "Manually stopped");
        let _ = std::fs::remove_file(&plan.temp_output);
        return Ok(());
    }

    if !status.success() {
        let code_desc = status
            .code()
            .map(|code| format!("code {code}"))
            .unwrap_or_else(|| "a signal".to_string());
        let message = format!("transcoder exited with {code_desc}");
        fail_item(ctx, item, &message);
        let _ = std::fs::remove_file(&plan.temp_output);
        return Err(EncodeError::TranscoderCrashed(code_desc));
    }

    finalise(&ctx.db, &ctx.stats, item.id, original, &plan, profile)
}

fn pump_until_exit(
    ctx: &SupervisorContext,
    item: &QueueItem,
    shared: &Arc<Shared>,
    child: &mut std::process::Child,
    lines: &Receiver<String>,
) -> Result<std::process::ExitStatus, EncodeError> {
    let mut writer = ProgressWriter::new(&ctx.db, item.id);
    let mut kill_deadline: Option<Instant> = None;

    let handle_line = |writer: &mut ProgressWriter<'_>, line: &str| {
        if let Some(caps) = PROGRESS_RE.captures(line) {
            if let Ok(percent) = caps[1].parse::<f64>() {
                writer.write(percent);
            }
        }
    };

    loop {
        if shared.stop_requested.load(Ordering::SeqCst) && kill_deadline.is_none() {
            pause::request_terminate(child.id());
            kill_deadline = Some(Instant::now() + STOP_GRACE);
        }
        if let Some(deadline) = kill_deadline {
            if Instant::now() >= deadline {
                let _ = child.kill();
            }
        }

        match lines.recv_timeout(Duration::from_millis(100)) {
            Ok(line) => handle_line(&mut writer, &line),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }

        if let Some(status) = child.try_wait()? {
            // Pick up anything emitted right before exit.
            while let Ok(line) = lines.try_recv() {
                handle_line(&mut writer, &line);
            }
            return Ok(status);
        }
    }
}

fn spawn_monitor_thread(
    ctx: &SupervisorContext,
    shared: &Arc<Shared>,
    item_id: i64,
) -> Option<JoinHandle<()>> {
    let db = Arc::clone(&ctx.db);
    let monitor = Arc::clone(&ctx.monitor);
    let limits = ctx.limits.clone();
    let shared = Arc::clone(shared);

    std::thread::Builder::new()
        .name(format!("recodarr-monitor-{item_id}"))
        .spawn(move || {
            let mut strategy = pause::platform_strategy();
            loop {
                for _ in 0..MONITOR_INTERVAL_SECS {
                    if shared.monitor_stop.load(Ordering::SeqCst) {
                        return;
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }

                let pid = shared.pid.load(Ordering::SeqCst);
                if pid == 0 {
                    continue;
                }

                if limits.enable_throttling && !shared.stop_requested.load(Ordering::SeqCst) {
                    let report = monitor.threshold_check(&limits);
                    let paused = shared.paused.load(Ordering::SeqCst);
                    if report.should_pause && !paused {
                        match strategy.pause(pid) {
                            Ok(()) => {
                                shared.paused.store(true, Ordering::SeqCst);
                                info!(item_id, reason = %report.reason, "transcode paused");
                                let _ = db.update_queue_item(
                                    item_id,
                                    &QueueItemPatch::paused(report.reason.clone()),
                                );
                            }
                            Err(err) => {
                                warn!(item_id, error = %err, "pause failed");
                            }
                        }
                    } else if !report.should_pause && paused {
                        match strategy.resume(pid) {
                            Ok(()) => {
                                shared.paused.store(false, Ordering::SeqCst);
                                info!(item_id, "transcode resumed");
                                let _ =
                                    db.update_queue_item(item_id, &QueueItemPatch::resumed());
                            }
                            Err(err) => {
                                warn!(item_id, error = %err, "resume failed");
                            }
                        }
                    }
                }

                if let Some(snapshot) = monitor.process_snapshot(pid) {
                    let _ = db.update_queue_item(
                        item_id,
                        &QueueItemPatch {
                            current_cpu_percent: Some(snapshot.cpu_percent as f64),
                            current_memory_mb: Some(snapshot.memory_mb),
                            ..QueueItemPatch::default()
                        },
                    );
                }
            }
        })
        .ok()
}

/// Finalise one successfully transcoded item: verify the output,
/// atomically replace the original, mark completed and write history.
///
/// Calling this for an item that is already `completed` returns
/// [`EncodeError::AlreadyFinalised`] without touching the filesystem.
pub(crate) fn finalise(
    db: &Database,
    stats: &StatsLog,
    item_id: i64,
    original: &Path,
    plan: &CommandPlan,
    profile: &Profile,
) -> Result<(), EncodeError> {
    let Some(current) = db.queue_item(item_id)? else {
        return Err(EncodeError::Storage(crate::error::StorageError::NotFound {
            entity: "queue item",
            id: item_id,
        }));
    };
    if current.status == QueueStatus::Completed {
        return Err(EncodeError::AlreadyFinalised);
    }

    let new_size = std::fs::metadata(&plan.temp_output)
        .map(|m| m.len())
        .unwrap_or(0);
    if new_size == 0 {
        let message = "output file missing or empty after transcode";
        db.update_queue_item(item_id, &QueueItemPatch::failed(message))?;
        stats.record(StatsEvent::TranscodeError {
            file: file_name_of(&current.file_path),
            error: message.to_string(),
        });
        return Err(EncodeError::OutputMissing(plan.temp_output.clone()));
    }

    let original_size = std::fs::metadata(original)
        .map(|m| m.len() as i64)
        .unwrap_or(current.file_size_bytes);

    // The replace: drop the original, then move the temp output onto
    // the original's stem with the (possibly new) extension.
    if let Err(err) = std::fs::remove_file(original) {
        let message = format!("could not remove original: {err}");
        db.update_queue_item(item_id, &QueueItemPatch::failed(&message))?;
        stats.record(StatsEvent::TranscodeError {
            file: file_name_of(&current.file_path),
            error: message.clone(),
        });
        return Err(EncodeError::FinaliseFailed(message));
    }
    if let Err(err) = std::fs::rename(&plan.temp_output, &plan.final_output) {
        let message = format!(
            "could not rename {} -> {}: {err}",
            plan.temp_output.display(),
            plan.final_output.display()
        );
        db.update_queue_item(item_id, &QueueItemPatch::failed(&message))?;
        stats.record(StatsEvent::TranscodeError {
            file: file_name_of(&current.file_path),
            error: message.clone(),
        });
        return Err(EncodeError::FinaliseFailed(message));
    }

    db.update_queue_item(item_id, &QueueItemPatch::status(QueueStatus::Completed))?;

    let encoding_time_seconds = current
        .started_at
        .as_deref()
        .and_then(parse_stamp)
        .map(|started| {
            (chrono::Local::now().naive_local() - started)
                .num_seconds()
                .max(0)
        })
        .unwrap_or(0);

    let savings = original_size - new_size as i64;
    db.record_history(&crate::domain::HistoryRecord {
        id: 0,
        file_path: plan.final_output.to_string_lossy().into_owned(),
        profile_name: profile.name.clone(),
        original_size_bytes: original_size,
        new_size_bytes: new_size as i64,
        savings_bytes: savings,
        encoding_time_seconds,
        codec: profile.codec.as_str().to_string(),
        container: plan.container.as_str().to_string(),
        completed_at: now_stamp(),
    })?;

    let original_mb = original_size as f64 / (1024.0 * 1024.0);
    let new_mb = new_size as f64 / (1024.0 * 1024.0);
    let savings_percent = if original_size > 0 {
        savings as f64 / original_size as f64 * 100.0
    } else {
        0.0
    };
    stats.record(StatsEvent::TranscodeComplete {
        file: file_name_of(&current.file_path),
        original_size_mb: original_mb,
        new_size_mb: new_mb,
        savings_percent,
        duration_seconds: encoding_time_seconds as f64,
    });
    info!(
        target: TRANSCODER_TARGET,
        file = %file_name_of(&current.file_path),
        original_mb = format!("{original_mb:.0}"),
        new_mb = format!("{new_mb:.0}"),
        savings_percent = format!("{savings_percent:.1}"),
        "transcode complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewQueueItem;
    use crate::domain::{Container, ProfileDraft};

    fn fixture() -> (tempfile::TempDir, Arc<Database>, Arc<StatsLog>, Profile, i64) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let profile_id = db.create_profile(&ProfileDraft::av1_default("p")).unwrap();
        let profile = db.profile(profile_id).unwrap().unwrap();
        let stats = Arc::new(StatsLog::new(dir.path().join("stats.jsonl")));
        let item_id = db
            .insert_queue_item(&NewQueueItem::pending(
                dir.path().join("m.mkv").to_string_lossy().to_string(),
                profile_id,
                None,
            ))
            .unwrap();
        // Mirror the pool path: the item is claimed before a
        // supervisor ever runs.
        let claimed = db.claim_next_pending().unwrap().unwrap();
        assert_eq!(claimed.id, item_id);
        (dir, db, stats, profile, item_id)
    }

    fn plan_in(dir: &Path) -> CommandPlan {
        CommandPlan {
            program: PathBuf::from("HandBrakeCLI"),
            args: Vec::new(),
            temp_output: dir.join("m_optimized.mkv"),
            final_output: dir.join("m.mkv"),
            container: Container::Mkv,
        }
    }

    #[test]
    fn finalise_replaces_original_and_writes_history() {
        let (dir, db, stats, profile, item_id) = fixture();
        let original = dir.path().join("m.mkv");
        std::fs::write(&original, vec![0u8; 4000]).unwrap();
        let plan = plan_in(dir.path());
        std::fs::write(&plan.temp_output, vec![0u8; 1500]).unwrap();

        finalise(&db, &stats, item_id, &original, &plan, &profile).unwrap();

        // Original replaced in one logical step: same stem, new bytes.
        assert!(plan.final_output.exists());
        assert!(!plan.temp_output.exists());
        assert_eq!(std::fs::metadata(&plan.final_output).unwrap().len(), 1500);

        let item = db.queue_item(item_id).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Completed);
        assert_eq!(item.progress, 100.0);
        assert!(item.completed_at.is_some());

        let history = db.history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].original_size_bytes, 4000);
        assert_eq!(history[0].new_size_bytes, 1500);
        assert_eq!(history[0].savings_bytes, 2500);
        assert_eq!(history[0].codec, "av1");
        assert_eq!(
            history[0].file_path,
            plan.final_output.to_string_lossy().to_string()
        );
    }

    #[test]
    fn finalise_with_container_change_renames_extension() {
        let (dir, db, stats, mut profile, item_id) = fixture();
        profile.container = Container::Mp4;
        let original = dir.path().join("m.mkv");
        std::fs::write(&original, vec![0u8; 100]).unwrap();
        let plan = CommandPlan {
            program: PathBuf::from("HandBrakeCLI"),
            args: Vec::new(),
            temp_output: dir.path().join("m_optimized.mp4"),
            final_output: dir.path().join("m.mp4"),
            container: Container::Mp4,
        };
        std::fs::write(&plan.temp_output, vec![0u8; 50]).unwrap();

        finalise(&db, &stats, item_id, &original, &plan, &profile).unwrap();
        assert!(!original.exists());
        assert!(dir.path().join("m.mp4").exists());
        assert_eq!(db.history(1).unwrap()[0].container, "mp4");
    }

    #[test]
    fn missing_output_fails_and_keeps_original() {
        let (dir, db, stats, profile, item_id) = fixture();
        let original = dir.path().join("m.mkv");
        std::fs::write(&original, vec![0u8; 4000]).unwrap();
        let plan = plan_in(dir.path());
        // No temp output written.

        let err = finalise(&db, &stats, item_id, &original, &plan, &profile).unwrap_err();
        assert!(matches!(err, EncodeError::OutputMissing(_)));
        assert!(original.exists(), "original must survive a failed finalise");

        let item = db.queue_item(item_id).unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert!(item.completed_at.is_some());
        assert_eq!(db.history(10).unwrap().len(), 0);
    }

    #[test]
    fn finalising_twice_is_rejected_without_fs_access() {
        let (dir, db, stats, profile, item_id) = fixture();
        let original = dir.path().join("m.mkv");
        std::fs::write(&original, vec![0u8; 100]).unwrap();
        let plan = plan_in(dir.path());
        std::fs::write(&plan.temp_output, vec![0u8; 60]).unwrap();

        finalise(&db, &stats, item_id, &original, &plan, &profile).unwrap();

        // Plant a sentinel where the temp output was; a second attempt
        // must not consume it.
        std::fs::write(&plan.temp_output, vec![0u8; 33]).unwrap();
        let err = finalise(&db, &stats, item_id, &original, &plan, &profile).unwrap_err();
        assert!(matches!(err, EncodeError::AlreadyFinalised));
        assert_eq!(std::fs::metadata(&plan.temp_output).unwrap().len(), 33);
        assert_eq!(db.history(10).unwrap().len(), 1);
    }

    #[test]
    fn history_exists_iff_completed() {
        let (dir, db, stats, profile, item_id) = fixture();
        let original = dir.path().join("m.mkv");
        std::fs::write(&original, vec![0u8; 100]).unwrap();
        let plan = plan_in(dir.path());

        // Failed finalise: no history.
        let _ = finalise(&db, &stats, item_id, &original, &plan, &profile);
        assert_eq!(db.history(10).unwrap().len(), 0);

        // Re-run to completion: exactly one history row.
        db.requeue_item(item_id).unwrap();
        db.claim_next_pending().unwrap().unwrap();
        std::fs::write(&plan.temp_output, vec![0u8; 60]).unwrap();
        finalise(&db, &stats, item_id, &original, &plan, &profile).unwrap();
        assert_eq!(db.history(10).unwrap().len(), 1);
        assert_eq!(
            db.queue_item(item_id).unwrap().unwrap().status,
            QueueStatus::Completed
        );
    }
}
