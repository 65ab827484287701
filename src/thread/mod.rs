//! thread: реестр потоков, заморозка/возобновление, телепорт и пересоздание.

pub mod clone;
pub mod context;
pub mod freeze;
pub mod registry;
pub mod repair;
pub mod state;

pub use context::SavedContext;
pub use freeze::{freeze_all, resume_all, FreezeParams};
pub use registry::{AltStacks, Registry, ThreadControl, ThreadSlot};
pub use repair::{plan_thread_repair, RepairError, RepairLimits, RepairStep, RepairSummary};
pub use state::{ResumeAction, ThreadState};
