//! Claude Code headless executor.
//!
//! Runs the `claude` CLI in non-interactive mode (`-p`) with JSON output
//! and maps the outcome onto the `Executor` contract.

use crate::worker::executor::{ExecError, ExecOptions, ExecResponse, Executor};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, trace};

/// Internal struct for deserializing Claude JSON response.
#[derive(Debug, Deserialize)]
struct RawClaudeResponse {
    subtype: Option<String>,
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClaudeExecutor {
    command: String,
}

impl ClaudeExecutor {
    /// The binary is resolved on every call so a missing CLI surfaces as
    /// `EndpointMissing` rather than failing construction.
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn resolve(&self) -> std::result::Result<PathBuf, ExecError> {
        which::which(&self.command).map_err(|_| ExecError::EndpointMissing(self.command.clone()))
    }

    /// Command-line arguments for one headless run.
    pub fn args(prompt: &str, options: &ExecOptions) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if let Some(system_prompt) = &options.system_prompt {
            args.push("--system-prompt".to_string());
            args.push(system_prompt.clone());
        }
        if !options.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(options.allowed_tools.join(","));
        }
        if !options.permission_mode.is_empty() {
            args.push("--permission-mode".to_string());
            args.push(options.permission_mode.clone());
        }
        args
    }

    /// Parse the JSON document printed by `claude --output-format json`.
    pub fn parse_json_response(json_str: &str) -> serde_json::Result<ExecResponse> {
        let value: serde_json::Value = serde_json::from_str(json_str)?;
        let raw: RawClaudeResponse = serde_json::from_value(value.clone())?;

        let response = match raw.subtype.as_deref() {
            Some("success") if !raw.is_error => ExecResponse::ok(raw.result.unwrap_or_default()),
            Some(_) => ExecResponse::failed(
                raw.error
                    .or(raw.result)
                    .unwrap_or_else(|| "Unknown error".to_string()),
            ),
            None => match (raw.error, raw.result) {
                (Some(error), _) => ExecResponse::failed(error),
                (None, Some(result)) => ExecResponse::ok(result),
                (None, None) => ExecResponse::failed("Unknown response format"),
            },
        };

        Ok(ExecResponse {
            messages: vec![value],
            ..response
        })
    }
}

impl Default for ClaudeExecutor {
    fn default() -> Self {
        Self::new("claude")
    }
}

#[async_trait]
impl Executor for ClaudeExecutor {
    async fn execute(
        &self,
        prompt: &str,
        options: &ExecOptions,
    ) -> std::result::Result<ExecResponse, ExecError> {
        let binary = self.resolve()?;
        debug!(binary = %binary.display(), cwd = %options.working_directory.display(), "claude execute");
        trace!(prompt, "claude prompt");

        let mut command = Command::new(&binary);
        command.args(Self::args(prompt, options)).kill_on_drop(true);
        if !options.working_directory.as_os_str().is_empty() {
            command.current_dir(&options.working_directory);
        }

        let output = command.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecError::EndpointMissing(binary.display().to_string())
            } else {
                ExecError::Connection(e.to_string())
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        match Self::parse_json_response(stdout.trim()) {
            Ok(response) => Ok(response),
            Err(_) if !output.status.success() => {
                let message = if stderr.trim().is_empty() {
                    format!(
                        "claude exited with code {}",
                        output.status.code().unwrap_or(-1)
                    )
                } else {
                    stderr.trim().to_string()
                };
                Err(ExecError::Connection(message))
            }
            Err(e) => Err(ExecError::MalformedResponse(e.to_string())),
        }
    }
}
