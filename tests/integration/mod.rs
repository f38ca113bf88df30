//! Integration test suite for arbor.
//!
//! These tests drive the public API end to end: sessions, the scheduler,
//! the worker pool and the orchestration facade working together.
//!
//! # Test Categories
//!
//! - `scheduling`: Dependency order, priority and concurrency bounds
//! - `sessions`: Session lifecycle and persistence round-trips
//! - `orchestrator`: Worker pool, batch runs, cleanup and health over git worktrees
//! - `recovery`: Timeouts, retries, panics, shutdown and rehydration
//!
//! # CI Compatibility
//!
//! Executors are scripted and never call a real endpoint, so the suite is
//! safe to run in CI environments.

mod fixtures;

mod orchestrator;
mod sessions;
