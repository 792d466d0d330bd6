use serde::{Deserialize, Serialize};

/// Immutable record of one successfully finished transcode, written
/// exactly once after the atomic file replace. `file_path` is the
/// post-rename path, so history never names a file that does not
/// exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub file_path: String,
    pub profile_name: String,
    pub original_size_bytes: i64,
    pub new_size_bytes: i64,
    /// original − new; negative when the transcode grew the file.
    pub savings_bytes: i64,
    pub encoding_time_seconds: i64,
    pub codec: String,
    pub container: String,
    pub completed_at: String,
}
