//! Aggregated health reporting.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::worker::{WorkerHealth, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub error: Option<String>,
}

impl ComponentHealth {
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self {
                healthy: true,
                error: None,
            },
            Err(e) => Self {
                healthy: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// One boolean plus the detail behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub store: ComponentHealth,
    pub workspaces: ComponentHealth,
    pub workers: BTreeMap<WorkerId, WorkerHealth>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(
        store: ComponentHealth,
        workspaces: ComponentHealth,
        workers: BTreeMap<WorkerId, WorkerHealth>,
    ) -> Self {
        let healthy =
            store.healthy && workspaces.healthy && workers.values().all(|w| w.healthy);
        Self {
            healthy,
            store,
            workspaces,
            workers,
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy_workers(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|(_, h)| !h.healthy)
            .map(|(id, _)| *id)
            .collect()
    }
}
