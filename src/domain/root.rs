use serde::{Deserialize, Serialize};

use super::specs::UpscalePolicy;

/// A library directory the scan pipeline is allowed to enumerate.
///
/// Deleting a root NULLs the `root_id` of queue items that came from
/// it; queued work is never cascade-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRoot {
    pub id: i64,
    pub path: String,
    pub profile_id: Option<i64>,
    /// Free-form library tag, e.g. `movies`, `tv`, `custom`.
    pub library_type: String,
    pub enabled: bool,
    pub recursive: bool,
    /// Optional upscale pre-stage policy for files found under this
    /// root.
    pub upscale: Option<UpscalePolicy>,
}
