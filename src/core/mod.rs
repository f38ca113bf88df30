//! Core domain models: tasks, sessions and the dependency graph.

pub mod graph;
pub mod session;
pub mod task;

pub use graph::DependencyGraph;
pub use session::{Metadata, Session, SessionId, SessionStatus, StatusSnapshot, TaskCounts};
pub use task::{Context, NewTask, Task, TaskId, TaskResult, TaskStatus};
