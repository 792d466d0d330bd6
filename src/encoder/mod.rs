//! The encoding engine: command planning, the per-job supervisor, the
//! pause/resume seam and the claim-loop pool.

pub mod command;
pub mod pause;
pub mod pool;
pub mod supervisor;

pub use command::{CommandPlan, HardwareSupport, plan_transcode};
pub use pool::EncoderPool;
pub use supervisor::{SupervisorContext, SupervisorHandle};
