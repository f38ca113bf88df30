//! Shared utility functions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run filesystem or libgit2 work off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Exponential backoff before retry `attempt` (0-based): 1s, 2s, 4s, ...
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt.min(16))
}

/// Seconds elapsed since `start`, clamped at zero.
pub fn elapsed_secs(start: DateTime<Utc>) -> f64 {
    let millis = (Utc::now() - start).num_milliseconds().max(0);
    millis as f64 / 1000.0
}

/// Short random suffix used for generated workspace and branch names.
pub fn short_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}
