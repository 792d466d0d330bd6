//! Core data model: closed enums and versioned records persisted by
//! the database layer. Every persisted string value decodes back into
//! one of these types; anything outside the closed sets is rejected at
//! the persistence boundary.

mod connection;
mod history;
mod profile;
mod queue;
mod root;
mod schedule;
mod specs;
mod watch;

pub use connection::{ConnectionKind, ExternalConnection, PublicConnection};
pub use history::HistoryRecord;
pub use profile::{AudioStrategy, Container, Profile, ProfileDraft, SubtitleStrategy, VideoCodec};
pub use queue::{PermissionStatus, QueueItem, QueueItemPatch, QueueStatus};
pub use root::ScanRoot;
pub use schedule::{ScheduleConfig, parse_hhmm};
pub use specs::{AudioTrack, MediaSpecs, TargetSpecs, UpscalePlan, UpscalePolicy};
pub use watch::FolderWatch;
