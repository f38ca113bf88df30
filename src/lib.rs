//! Arbor runs coding-agent workers in isolated git worktrees and schedules
//! dependency-ordered tasks across them.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod store;
pub mod util;
pub mod worker;
pub mod workspace;


pub use error::{Error, Result};
