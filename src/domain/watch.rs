use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A directory watched for newly appearing media files.
///
/// The watcher owns the in-memory `known_files` sets; this record only
/// carries the persisted configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderWatch {
    pub id: i64,
    pub path: String,
    pub profile_id: i64,
    pub enabled: bool,
    pub recursive: bool,
    /// When false the watch tracks files but never queues them.
    pub auto_queue: bool,
    /// Lowercased extensions including the leading dot.
    pub extensions: BTreeSet<String>,
    pub last_check: Option<String>,
}

impl FolderWatch {
    /// Persisted CSV form of the extension set.
    pub fn extensions_csv(&self) -> String {
        self.extensions.iter().cloned().collect::<Vec<_>>().join(",")
    }

    /// Parse the persisted CSV extension list, normalising to
    /// lowercase with a leading dot. An empty list falls back to the
    /// scanner's video allowlist.
    pub fn extensions_from_csv(csv: &str) -> BTreeSet<String> {
        let set: BTreeSet<String> = csv
            .split(',')
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .map(|e| if e.starts_with('.') { e } else { format!(".{e}") })
            .collect();
        if set.is_empty() {
            crate::scanner::VIDEO_EXTENSIONS
                .iter()
                .map(|e| format!(".{e}"))
                .collect()
        } else {
            set
        }
    }
}
