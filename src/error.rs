use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Workspace does not exist: {0}")]
    WorkspaceMissing(String),

    #[error("Worker pool is full (max: {max})")]
    PoolFull { max: usize },

    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Execution cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Capacity and precondition errors are the caller's to handle; retrying
    /// them without a change in state cannot succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Io(_) | Error::Persistence(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
