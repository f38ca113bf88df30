//! Execution endpoint contract.
//!
//! An `Executor` turns a prompt into a structured response. Workers own the
//! retry and timeout policy around it; implementations only report what
//! happened on a single attempt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Per-call options forwarded to the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOptions {
    pub system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub permission_mode: String,
    pub working_directory: PathBuf,
}

/// What the endpoint returned for one prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecResponse {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

impl ExecResponse {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("execution endpoint not found: {0}")]
    EndpointMissing(String),

    #[error("{0}")]
    Other(String),
}

impl ExecError {
    /// Transient errors are retried with backoff; the rest fail immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExecError::Timeout(_) | ExecError::Connection(_) | ExecError::Other(_)
        )
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Run one prompt to completion.
    async fn execute(
        &self,
        prompt: &str,
        options: &ExecOptions,
    ) -> std::result::Result<ExecResponse, ExecError>;

    /// Lightweight connectivity check used when a worker starts.
    async fn probe(&self, options: &ExecOptions) -> bool {
        matches!(self.execute("Hello", options).await, Ok(r) if r.success)
    }
}
