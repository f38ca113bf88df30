//! Workers: pooled execution units, each bound to one workspace.

mod claude;
mod executor;
mod instance;

pub use claude::ClaudeExecutor;
pub use executor::{ExecError, ExecOptions, ExecResponse, Executor};
pub use instance::{
    build_prompt, ExecutionOutcome, Worker, WorkerConfig, WorkerDeps, WorkerHealth, WorkerId,
    WorkerInfo, WorkerLease, WorkerStatus,
};
