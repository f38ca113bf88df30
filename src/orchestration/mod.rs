//! Coordination of workers and sessions.
//!
//! The [`Orchestrator`] owns the worker pool and the [`SessionManager`];
//! each session execution runs its own [`Scheduler`].

mod health;
mod orchestrator;
mod pool;
pub mod scheduler;
mod sessions;

pub use health::{ComponentHealth, HealthReport};
pub use orchestrator::{CleanupReport, Orchestrator, RunReport, TaskSpec, WorkerOptions};
pub use pool::{PoolGuard, WorkerPool};
pub use scheduler::{Scheduler, SchedulerEvent, CANCELLED_REASON};
pub use sessions::SessionManager;
