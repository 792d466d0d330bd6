//! Optional AI upscale pre-stage.
//!
//! Produces a lossless intermediate (upscaled video + the original's
//! audio/subtitle streams) that the transcoder then re-encodes. Any
//! failure here aborts the pre-stage only; the supervisor proceeds
//! with the original source.
//!
//! The module also owns the upscaler registry: binary detection,
//! version probing and the 24 h release-update checker. Downloading
//! and installing binaries is out of scope.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::UpscalePlan;
use crate::error::UpscaleError;
use crate::probe::MediaProber;
use crate::process_ext::run_with_timeout;
use crate::sync_ext::MutexExt;

/// One supported upscaler family.
#[derive(Debug, Clone)]
pub struct UpscalerDef {
    pub key: &'static str,
    pub name: &'static str,
    binary_unix: &'static str,
    binary_windows: &'static str,
    pub models: &'static [&'static str],
    pub default_model: &'static str,
    pub scale_options: &'static [u32],
    pub github_owner: &'static str,
    pub github_repo: &'static str,
}

pub const UPSCALERS: &[UpscalerDef] = &[
    UpscalerDef {
        key: "realesrgan",
        name: "Real-ESRGAN",
        binary_unix: "realesrgan-ncnn-vulkan",
        binary_windows: "realesrgan-ncnn-vulkan.exe",
        models: &[
            "realesrgan-x4plus",
            "realesrgan-x4plus-anime",
            "realesr-animevideov3",
        ],
        default_model: "realesrgan-x4plus",
        scale_options: &[2, 3, 4],
        github_owner: "xinntao",
        github_repo: "Real-ESRGAN",
    },
    UpscalerDef {
        key: "realcugan",
        name: "Real-CUGAN",
        binary_unix: "realcugan-ncnn-vulkan",
        binary_windows: "realcugan-ncnn-vulkan.exe",
        models: &["models-se", "models-pro", "models-nose"],
        default_model: "models-se",
        scale_options: &[2, 3, 4],
        github_owner: "nihui",
        github_repo: "realcugan-ncnn-vulkan",
    },
    UpscalerDef {
        key: "waifu2x",
        name: "Waifu2x NCNN Vulkan",
        binary_unix: "waifu2x-ncnn-vulkan",
        binary_windows: "waifu2x-ncnn-vulkan.exe",
        models: &["models-cunet", "models-upconv_7_anime_style_art_rgb"],
        default_model: "models-cunet",
        scale_options: &[1, 2],
        github_owner: "nihui",
        github_repo: "waifu2x-ncnn-vulkan",
    },
];

pub fn upscaler_def(key: &str) -> Option<&'static UpscalerDef> {
    UPSCALERS.iter().find(|u| u.key == key)
}

fn binary_name(def: &UpscalerDef) -> &'static str {
    if cfg!(windows) {
        def.binary_windows
    } else {
        def.binary_unix
    }
}

/// Resolve an upscaler binary: system PATH first, then the local
/// cache directory.
pub fn find_binary(key: &str, cache_dir: &Path) -> Option<PathBuf> {
    let def = upscaler_def(key)?;
    let binary = binary_name(def);
    if let Some(found) = which(binary) {
        return Some(found);
    }
    let local = cache_dir.join(binary);
    local.exists().then_some(local)
}

fn which(binary: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&paths) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Best-effort version string from the binary's help text.
pub fn binary_version(binary: &Path) -> String {
    static VERSION_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"v?\d+\.\d+").expect("static regex"));

    let mut cmd = Command::new(binary);
    cmd.arg("--help");
    let Ok(run) = run_with_timeout(cmd, Duration::from_secs(5)) else {
        return "installed".to_string();
    };
    let mut text = String::from_utf8_lossy(&run.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&run.stderr));
    for line in text.lines().take(8) {
        if VERSION_RE.is_match(line) {
            return line.trim().to_string();
        }
    }
    "installed".to_string()
}

/// Installed-state inventory entry for one upscaler.
#[derive(Debug, Clone, Serialize)]
pub struct UpscalerInventory {
    pub key: String,
    pub name: String,
    pub installed: bool,
    pub path: Option<String>,
    pub version: Option<String>,
    pub models: Vec<String>,
    pub scale_options: Vec<u32>,
}

pub fn detect_upscalers(cache_dir: &Path) -> Vec<UpscalerInventory> {
    UPSCALERS
        .iter()
        .map(|def| {
            let found = find_binary(def.key, cache_dir);
            UpscalerInventory {
                key: def.key.to_string(),
                name: def.name.to_string(),
                installed: found.is_some(),
                version: found.as_deref().map(binary_version),
                path: found.map(|p| p.to_string_lossy().into_owned()),
                models: def.models.iter().map(|m| m.to_string()).collect(),
                scale_options: def.scale_options.to_vec(),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Release update checking (24 h TTL, checked on read)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(default)]
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseInfo {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateStatus {
    pub key: String,
    pub name: String,
    pub current_version: String,
    pub latest_version: String,
    pub update_available: bool,
    pub release_url: String,
}

struct CachedRelease {
    fetched_at: Instant,
    release: ReleaseInfo,
}

const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct UpdateChecker {
    client: reqwest::blocking::Client,
    cache: Mutex<HashMap<String, CachedRelease>>,
    ttl: Duration,
    cache_dir: PathBuf,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for UpdateChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateChecker").finish_non_exhaustive()
    }
}

impl UpdateChecker {
    pub fn new(cache_dir: PathBuf) -> Self {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("recodarr/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
            ttl: UPDATE_CHECK_INTERVAL,
            cache_dir,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Latest release carrying binary assets, via the TTL cache.
    /// Walks the release list when the `latest` tag is source-only.
    pub fn fetch_latest_release(&self, owner: &str, repo: &str) -> anyhow::Result<ReleaseInfo> {
        let cache_key = format!("{owner}/{repo}");
        {
            let cache = self.cache.lock_unpoisoned();
            if let Some(entry) = cache.get(&cache_key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.release.clone());
                }
            }
        }

        let release = self.fetch_uncached(owner, repo)?;
        self.cache.lock_unpoisoned().insert(
            cache_key,
            CachedRelease {
                fetched_at: Instant::now(),
                release: release.clone(),
            },
        );
        Ok(release)
    }

    fn fetch_uncached(&self, owner: &str, repo: &str) -> anyhow::Result<ReleaseInfo> {
        let latest_url = format!("https://api.github.com/repos/{owner}/{repo}/releases/latest");
        let response = self
            .client
            .get(&latest_url)
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    anyhow::anyhow!("release API request timed out; check your connection")
                } else {
                    anyhow::anyhow!("release API request failed: {e}")
                }
            })?;

        if response.status().as_u16() == 403 {
            let remaining = response
                .headers()
                .get("X-RateLimit-Remaining")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("?")
                .to_string();
            anyhow::bail!("release API rate limit exceeded (remaining: {remaining}); try again later");
        }

        if response.status().is_success() {
            let release: ReleaseInfo = response.json()?;
            if !release.assets.is_empty() {
                return Ok(release);
            }
            // Latest tag has no binaries; fall through to the list.
        } else if response.status().as_u16() != 404 {
            anyhow::bail!("release API returned HTTP {}", response.status().as_u16());
        }

        let list_url =
            format!("https://api.github.com/repos/{owner}/{repo}/releases?per_page=10");
        let releases: Vec<ReleaseInfo> = self
            .client
            .get(&list_url)
            .header("Accept", "application/vnd.github.v3+json")
            .send()?
            .error_for_status()?
            .json()?;
        releases
            .into_iter()
            .find(|release| !release.assets.is_empty())
            .ok_or_else(|| anyhow::anyhow!("no releases with binary assets for {owner}/{repo}"))
    }

    /// Compare installed binaries against their latest releases.
    pub fn check_for_updates(&self) -> Vec<UpdateStatus> {
        let mut statuses = Vec::new();
        for def in UPSCALERS {
            let Some(binary) = find_binary(def.key, &self.cache_dir) else {
                continue;
            };
            let release = match self.fetch_latest_release(def.github_owner, def.github_repo) {
                Ok(release) => release,
                Err(err) => {
                    warn!(upscaler = def.key, error = %err, "update check failed");
                    continue;
                }
            };
            let current = binary_version(&binary);
            let latest = release.tag_name.clone();
            statuses.push(UpdateStatus {
                key: def.key.to_string(),
                name: def.name.to_string(),
                update_available: !latest.is_empty() && !current.contains(latest.as_str()),
                current_version: current,
                latest_version: latest,
                release_url: release.html_url,
            });
        }
        statuses
    }

    /// Start the daily update-check daemon. Sleeps first, then checks.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let checker = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("recodarr-upscaler-updates".to_string())
            .spawn(move || {
                while checker.running.load(Ordering::SeqCst) {
                    for _ in 0..UPDATE_CHECK_INTERVAL.as_secs() {
                        if !checker.running.load(Ordering::SeqCst) {
                            return;
                        }
                        std::thread::sleep(Duration::from_secs(1));
                    }
                    for status in checker.check_for_updates() {
                        if status.update_available {
                            info!(
                                upscaler = %status.key,
                                latest = %status.latest_version,
                                "upscaler update available"
                            );
                        }
                    }
                }
            })
            .ok();
        *self.handle.lock_unpoisoned() = handle;
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock_unpoisoned().take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// The frame pipeline
// ---------------------------------------------------------------------------

const STAGE_TIMEOUT: Duration = Duration::from_secs(3600);
const DISK_HEADROOM_BYTES: u64 = 500 * 1024 * 1024;
/// Sources at or above this fraction of the target height skip the
/// pre-stage entirely.
const CLOSE_ENOUGH_RATIO: f64 = 0.85;

#[derive(Debug, Clone)]
pub struct UpscaleContext {
    pub prober: Arc<MediaProber>,
    pub frame_tool: PathBuf,
    pub cache_dir: PathBuf,
}

/// Successful pre-stage result. The caller feeds `intermediate` to the
/// transcoder and must call [`UpscaleOutput::cleanup`] afterwards,
/// success or failure.
#[derive(Debug)]
pub struct UpscaleOutput {
    pub intermediate: PathBuf,
    workdir: PathBuf,
}

impl UpscaleOutput {
    pub fn cleanup(self) {
        if let Err(err) = std::fs::remove_dir_all(&self.workdir) {
            warn!(workdir = %self.workdir.display(), error = %err, "workdir cleanup failed");
        }
    }
}

/// Run the full pre-stage: probe → disk guard → extract → upscale →
/// reassemble. `progress` receives 0–100 across the whole pipeline
/// (extraction ends at 10, upscaling spans 10–90).
pub fn run_pipeline(
    ctx: &UpscaleContext,
    input: &Path,
    plan: &UpscalePlan,
    progress: &mut dyn FnMut(f64),
) -> Result<UpscaleOutput, UpscaleError> {
    let def = upscaler_def(&plan.upscaler)
        .ok_or_else(|| UpscaleError::UnknownUpscaler(plan.upscaler.clone()))?;
    let binary = find_binary(def.key, &ctx.cache_dir)
        .ok_or_else(|| UpscaleError::BinaryNotFound(def.key.to_string()))?;

    // Stage 1: probe fresh dimensions; the queue-time plan may be
    // stale if the file changed underneath us.
    let specs = ctx.prober.probe(input);
    let (Some(width), Some(height)) = (specs.width(), specs.height()) else {
        return Err(UpscaleError::UnknownDimensions(input.to_path_buf()));
    };
    if (height as f64) >= (plan.target_height as f64) * CLOSE_ENOUGH_RATIO {
        return Err(UpscaleError::AlreadyCloseEnough {
            source_height: height,
            target: plan.target_height,
        });
    }
    let fps = if specs.framerate > 0.0 { specs.framerate } else { 24.0 };

    // Stage 2: disk guard in the OS temp area.
    let out_w = width as u64 * plan.factor as u64;
    let out_h = height as u64 * plan.factor as u64;
    let frames_estimate = if specs.duration_s > 0.0 {
        (fps * specs.duration_s) as u64
    } else {
        2000
    };
    let bytes_per_frame = (out_w * out_h * 3) / 2;
    let need_bytes = frames_estimate
        .saturating_mul(bytes_per_frame)
        .saturating_mul(2)
        .saturating_add(DISK_HEADROOM_BYTES);
    let tmp_base = std::env::temp_dir();
    let free_bytes = fs2::available_space(&tmp_base).unwrap_or(u64::MAX);
    if free_bytes < need_bytes {
        return Err(UpscaleError::InsufficientDiskSpace {
            need_bytes,
            free_bytes,
        });
    }

    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("input");
    let unique = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let workdir = tmp_base.join(format!("recodarr_upscale_{stem}_{unique}"));

    info!(
        input = %input.display(),
        from = format!("{width}x{height}"),
        to = format!("{out_w}x{out_h}"),
        factor = plan.factor,
        frames = frames_estimate,
        "upscale pre-stage starting"
    );
    progress(2.0);

    let result = run_stages(ctx, &binary, input, plan, &workdir, stem, fps, progress);
    if result.is_err() {
        let _ = std::fs::remove_dir_all(&workdir);
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn run_stages(
    ctx: &UpscaleContext,
    binary: &Path,
    input: &Path,
    plan: &UpscalePlan,
    workdir: &Path,
    stem: &str,
    fps: f64,
    progress: &mut dyn FnMut(f64),
) -> Result<UpscaleOutput, UpscaleError> {
    let frames_in = workdir.join("frames_in");
    let frames_out = workdir.join("frames_out");
    std::fs::create_dir_all(&frames_in)?;
    std::fs::create_dir_all(&frames_out)?;
    let intermediate = workdir.join(format!("{stem}_upscaled.mkv"));

    // Stage 3: one lossless still per input frame.
    progress(3.0);
    let mut extract = Command::new(&ctx.frame_tool);
    extract
        .arg("-i")
        .arg(input.as_os_str())
        .arg("-vsync")
        .arg("0")
        .arg(frames_in.join("%08d.png").as_os_str())
        .arg("-y");
    let run = run_with_timeout(extract, STAGE_TIMEOUT)?;
    if run.timed_out || !run.status.success() {
        return Err(UpscaleError::ExtractFailed(tail_of(&run.stderr)));
    }
    let extracted = count_pngs(&frames_in)?;
    if extracted == 0 {
        return Err(UpscaleError::ExtractFailed("no frames extracted".to_string()));
    }
    info!(frames = extracted, "frames extracted");
    progress(10.0);

    // Stage 4: batch upscale, per-frame N/M progress on stderr mapped
    // into the 10–90 band.
    run_upscaler(binary, &frames_in, &frames_out, plan, progress)?;
    let upscaled = count_pngs(&frames_out)?;
    if upscaled == 0 {
        return Err(UpscaleError::UpscalerFailed(
            "no upscaled frames produced".to_string(),
        ));
    }
    progress(90.0);

    // Stage 5: reassemble with the original's audio/subtitle streams
    // into a lossless intermediate; the transcoder re-encodes it.
    let mut assemble = Command::new(&ctx.frame_tool);
    assemble
        .arg("-framerate")
        .arg(format!("{fps:.6}"))
        .arg("-i")
        .arg(frames_out.join("%08d.png").as_os_str())
        .arg("-i")
        .arg(input.as_os_str())
        .arg("-map")
        .arg("0:v:0")
        .arg("-map")
        .arg("1:a?")
        .arg("-map")
        .arg("1:s?")
        .arg("-c:v")
        .arg("ffv1")
        .arg("-c:a")
        .arg("copy")
        .arg("-c:s")
        .arg("copy")
        .arg("-shortest")
        .arg(intermediate.as_os_str())
        .arg("-y");
    let run = run_with_timeout(assemble, STAGE_TIMEOUT)?;
    if run.timed_out || !run.status.success() {
        return Err(UpscaleError::ReassembleFailed(tail_of(&run.stderr)));
    }
    let size = std::fs::metadata(&intermediate).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        return Err(UpscaleError::ReassembleFailed(
            "reassembled file is missing or empty".to_string(),
        ));
    }

    // The stills are no longer needed; drop them now so the workdir
    // only holds the intermediate until cleanup.
    let _ = std::fs::remove_dir_all(&frames_in);
    let _ = std::fs::remove_dir_all(&frames_out);

    progress(100.0);
    info!(intermediate = %intermediate.display(), size, "upscale pre-stage complete");
    Ok(UpscaleOutput {
        intermediate,
        workdir: workdir.to_path_buf(),
    })
}

fn run_upscaler(
    binary: &Path,
    frames_in: &Path,
    frames_out: &Path,
    plan: &UpscalePlan,
    progress: &mut dyn FnMut(f64),
) -> Result<(), UpscaleError> {
    static FRAME_PROGRESS_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(\d+)/(\d+)").expect("static regex"));

    let mut child = Command::new(binary)
        .arg("-i")
        .arg(frames_in.as_os_str())
        .arg("-o")
        .arg(frames_out.as_os_str())
        .arg("-n")
        .arg(&plan.model)
        .arg("-s")
        .arg(plan.factor.to_string())
        .arg("-f")
        .arg("png")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(stderr) = child.stderr.take() {
        for line in std::io::BufReader::new(stderr).lines() {
            let Ok(line) = line else { break };
            if let Some(caps) = FRAME_PROGRESS_RE.captures(&line) {
                let done: f64 = caps[1].parse().unwrap_or(0.0);
                let total: f64 = caps[2].parse().unwrap_or(0.0);
                if total > 0.0 {
                    progress(10.0 + (done / total) * 80.0);
                }
            }
        }
    }

    let status = child.wait()?;
    if !status.success() {
        return Err(UpscaleError::UpscalerFailed(status.to_string()));
    }
    Ok(())
}

fn count_pngs(dir: &Path) -> Result<usize, UpscaleError> {
    let mut count = 0usize;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.path().extension().is_some_and(|e| e == "png") {
            count += 1;
        }
    }
    Ok(count)
}

fn tail_of(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let tail: String = text
        .chars()
        .rev()
        .take(500)
        .collect::<String>()
        .chars()
        .rev()
        .collect();
    tail.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MediaSpecs;

    fn plan(upscaler: &str) -> UpscalePlan {
        UpscalePlan {
            version: 1,
            upscaler: upscaler.to_string(),
            model: "realesrgan-x4plus".to_string(),
            factor: 2,
            source_height: 480,
            target_height: 1080,
        }
    }

    #[test]
    fn registry_lookup() {
        assert!(upscaler_def("realesrgan").is_some());
        assert!(upscaler_def("realcugan").is_some());
        assert!(upscaler_def("waifu2x").is_some());
        assert!(upscaler_def("other").is_none());
    }

    #[test]
    fn unknown_upscaler_aborts_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = UpscaleContext {
            prober: Arc::new(MediaProber::new(PathBuf::from("/no/such/prober"))),
            frame_tool: PathBuf::from("ffmpeg"),
            cache_dir: dir.path().to_path_buf(),
        };
        let err = run_pipeline(
            &ctx,
            Path::new("/m/a.mkv"),
            &plan("does-not-exist"),
            &mut |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, UpscaleError::UnknownUpscaler(_)));
    }

    #[test]
    fn missing_binary_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = UpscaleContext {
            prober: Arc::new(MediaProber::new(PathBuf::from("/no/such/prober"))),
            frame_tool: PathBuf::from("ffmpeg"),
            cache_dir: dir.path().to_path_buf(),
        };
        // No realesrgan binary in an empty cache dir (and presumably
        // none on the test host's PATH).
        if which("realesrgan-ncnn-vulkan").is_some() {
            return;
        }
        let err = run_pipeline(&ctx, Path::new("/m/a.mkv"), &plan("realesrgan"), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, UpscaleError::BinaryNotFound(_)));
    }

    #[test]
    fn close_enough_sources_are_rejected() {
        // 0.85 × 1080 = 918: a 1000-line source skips the pre-stage.
        let specs_height = 1000u32;
        let target = 1080u32;
        assert!((specs_height as f64) >= (target as f64) * CLOSE_ENOUGH_RATIO);

        let mut specs = MediaSpecs::unknown();
        specs.resolution = format!("1500x{specs_height}");
        assert_eq!(specs.height(), Some(specs_height));
    }

    #[test]
    fn find_binary_prefers_path_then_cache() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_binary("realesrgan", dir.path()), None);

        let cached = dir.path().join(binary_name(upscaler_def("realesrgan").unwrap()));
        std::fs::write(&cached, b"#!/bin/sh\n").unwrap();
        assert_eq!(find_binary("realesrgan", dir.path()), Some(cached));
    }
}
