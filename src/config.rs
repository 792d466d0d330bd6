use std::path::PathBuf;

/// Ambient configuration read from `RECODARR_*` environment variables.
///
/// Only the knobs the daemons themselves need live here; richer
/// configuration surfaces (profiles, roots, schedule, thresholds) are
/// persisted rows owned by [`crate::db::Database`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the SQLite database and upscaler cache.
    pub data_dir: PathBuf,
    /// Directory receiving the rolling log files and `statistics.jsonl`.
    pub logs_dir: PathBuf,
    /// External transcoder binary (HandBrakeCLI-compatible CLI).
    pub transcoder_bin: PathBuf,
    /// Media prober binary (ffprobe-compatible CLI).
    pub prober_bin: PathBuf,
    /// Frame extractor / lossless reassembler binary (ffmpeg-compatible).
    pub frame_tool_bin: PathBuf,
    /// Process secret used to derive the API-key cipher.
    pub secret_key: String,
    /// Folder watcher poll interval in seconds.
    pub watcher_poll_secs: u64,
    /// Scheduler tick interval in seconds.
    pub scheduler_tick_secs: u64,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

const INSECURE_DEFAULT_SECRET: &str = "insecure-default-key-change-in-production";

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_path(name: &str, default: &str) -> PathBuf {
    PathBuf::from(env_string(name, default))
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(value) => value.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = env_path("RECODARR_DATA_DIR", "data");
        Self {
            logs_dir: env_path("RECODARR_LOGS_DIR", "logs"),
            transcoder_bin: env_path("RECODARR_TRANSCODER", "HandBrakeCLI"),
            prober_bin: env_path("RECODARR_PROBER", "ffprobe"),
            frame_tool_bin: env_path("RECODARR_FRAME_TOOL", "ffmpeg"),
            secret_key: env_string("RECODARR_SECRET_KEY", INSECURE_DEFAULT_SECRET),
            watcher_poll_secs: env_u64("RECODARR_WATCHER_POLL_SECS", 60).max(1),
            scheduler_tick_secs: env_u64("RECODARR_SCHEDULER_TICK_SECS", 60).max(1),
            log_level: env_string("RECODARR_LOG_LEVEL", "info"),
            data_dir,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("recodarr.db")
    }

    pub fn upscaler_cache_dir(&self) -> PathBuf {
        self.data_dir.join("upscalers")
    }

    pub fn stats_path(&self) -> PathBuf {
        self.logs_dir.join("statistics.jsonl")
    }

    pub fn secret_is_default(&self) -> bool {
        self.secret_key == INSECURE_DEFAULT_SECRET
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_env() {
        let cfg = Config {
            data_dir: PathBuf::from("data"),
            logs_dir: PathBuf::from("logs"),
            transcoder_bin: PathBuf::from("HandBrakeCLI"),
            prober_bin: PathBuf::from("ffprobe"),
            frame_tool_bin: PathBuf::from("ffmpeg"),
            secret_key: INSECURE_DEFAULT_SECRET.to_string(),
            watcher_poll_secs: 60,
            scheduler_tick_secs: 60,
            log_level: "info".to_string(),
        };
        assert!(cfg.secret_is_default());
        assert_eq!(cfg.db_path(), PathBuf::from("data/recodarr.db"));
        assert_eq!(cfg.upscaler_cache_dir(), PathBuf::from("data/upscalers"));
    }

    #[test]
    fn env_u64_falls_back_when_unset() {
        assert_eq!(env_u64("RECODARR_THIS_VAR_IS_NEVER_SET", 42), 42);
    }
}
