use serde::{Deserialize, Serialize};

use super::specs::{MediaSpecs, TargetSpecs, UpscalePlan};
use crate::error::StorageError;

/// Lifecycle state of a queue item.
///
/// `pending` and `permission_error` are written only by the scan
/// pipeline; the remaining transitions belong to the supervisor that
/// owns the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
    PermissionError,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Paused => "paused",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::PermissionError => "permission_error",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StorageError> {
        match value {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "paused" => Ok(QueueStatus::Paused),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            "permission_error" => Ok(QueueStatus::PermissionError),
            other => Err(StorageError::InvalidValue {
                column: "status",
                value: other.to_string(),
            }),
        }
    }

    /// Terminal states carry a `completed_at` stamp and no longer
    /// block re-queueing of the same path.
    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }
}

/// Result of the scan-time permission probe for a candidate file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Ok,
    NoRead,
    NoWrite,
    NotFound,
}

impl PermissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionStatus::Ok => "ok",
            PermissionStatus::NoRead => "no_read",
            PermissionStatus::NoWrite => "no_write",
            PermissionStatus::NotFound => "not_found",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StorageError> {
        match value {
            "ok" => Ok(PermissionStatus::Ok),
            "no_read" => Ok(PermissionStatus::NoRead),
            "no_write" => Ok(PermissionStatus::NoWrite),
            "not_found" => Ok(PermissionStatus::NotFound),
            other => Err(StorageError::InvalidValue {
                column: "permission_status",
                value: other.to_string(),
            }),
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, PermissionStatus::Ok)
    }
}

/// One (file, profile) unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub file_path: String,
    pub root_id: Option<i64>,
    pub profile_id: i64,
    pub status: QueueStatus,
    /// Higher runs first; ties break on insertion order.
    pub priority: i64,
    pub current_specs: Option<MediaSpecs>,
    pub target_specs: Option<TargetSpecs>,
    pub file_size_bytes: i64,
    pub estimated_savings_bytes: i64,
    pub progress: f64,
    pub current_cpu_percent: f64,
    pub current_memory_mb: f64,
    pub permission_status: Option<PermissionStatus>,
    pub permission_message: Option<String>,
    pub paused_reason: Option<String>,
    pub error_message: Option<String>,
    pub upscale_plan: Option<UpscalePlan>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// Partial update applied to a queue item through
/// `Database::update_queue_item`. `None` fields are left untouched;
/// the nested options clear a nullable column when `Some(None)`.
#[derive(Debug, Clone, Default)]
pub struct QueueItemPatch {
    pub status: Option<QueueStatus>,
    pub priority: Option<i64>,
    pub progress: Option<f64>,
    pub current_cpu_percent: Option<f64>,
    pub current_memory_mb: Option<f64>,
    pub paused_reason: Option<Option<String>>,
    pub error_message: Option<Option<String>>,
}

impl QueueItemPatch {
    pub fn status(status: QueueStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(progress: f64) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(QueueStatus::Failed),
            error_message: Some(Some(message.into())),
            ..Self::default()
        }
    }

    pub fn paused(reason: impl Into<String>) -> Self {
        Self {
            status: Some(QueueStatus::Paused),
            paused_reason: Some(Some(reason.into())),
            ..Self::default()
        }
    }

    pub fn resumed() -> Self {
        Self {
            status: Some(QueueStatus::Processing),
            paused_reason: Some(None),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.priority.is_none()
            && self.progress.is_none()
            && self.current_cpu_percent.is_none()
            && self.current_memory_mb.is_none()
            && self.paused_reason.is_none()
            && self.error_message.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_and_rejects_strays() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Paused,
            QueueStatus::Completed,
            QueueStatus::Failed,
            QueueStatus::PermissionError,
        ] {
            assert_eq!(QueueStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(QueueStatus::parse("queued").is_err());
        assert!(QueueStatus::parse("").is_err());
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(QueueStatus::Completed.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
        assert!(!QueueStatus::Pending.is_terminal());
        assert!(!QueueStatus::Processing.is_terminal());
        assert!(!QueueStatus::Paused.is_terminal());
        assert!(!QueueStatus::PermissionError.is_terminal());
    }

    #[test]
    fn patch_constructors_set_the_right_fields() {
        let patch = QueueItemPatch::failed("boom");
        assert_eq!(patch.status, Some(QueueStatus::Failed));
        assert_eq!(patch.error_message, Some(Some("boom".to_string())));

        let patch = QueueItemPatch::resumed();
        assert_eq!(patch.status, Some(QueueStatus::Processing));
        assert_eq!(patch.paused_reason, Some(None));
        assert!(!patch.is_empty());
        assert!(QueueItemPatch::default().is_empty());
    }
}
