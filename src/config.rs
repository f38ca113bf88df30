use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::worker::WorkerConfig;
use crate::{Error, Result};

const ENV_PREFIX: &str = "ARBOR_";

fn default_max_concurrent_instances() -> usize {
    3
}

fn default_instance_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_allowed_tools() -> Vec<String> {
    ["Read", "Write", "Bash", "Edit", "Glob", "Grep"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_permission_mode() -> String {
    "acceptEdits".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hard cap on live workers in the pool.
    #[serde(default = "default_max_concurrent_instances")]
    pub max_concurrent_instances: usize,
    /// Per-attempt execution timeout.
    #[serde(default = "default_instance_timeout_secs")]
    pub instance_timeout_secs: u64,
    /// Retries for transient execution errors.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    pub worktree_dir: Option<String>,
    pub state_dir: Option<String>,
    pub system_prompt: Option<String>,
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
    /// Executor binary, `claude` when unset.
    pub command: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_instances: default_max_concurrent_instances(),
            instance_timeout_secs: default_instance_timeout_secs(),
            max_retries: default_max_retries(),
            default_branch: default_branch(),
            worktree_dir: None,
            state_dir: None,
            system_prompt: None,
            allowed_tools: default_allowed_tools(),
            permission_mode: default_permission_mode(),
            command: None,
        }
    }
}

impl Config {
    pub fn arbor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".arbor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::arbor_dir()?.join("arbor.toml"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::arbor_dir()?.join("worktrees")),
        }
    }

    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::arbor_dir()?.join("state")),
        }
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or("claude")
    }

    pub fn instance_timeout(&self) -> Duration {
        Duration::from_secs(self.instance_timeout_secs)
    }

    /// Default configuration handed to newly created workers.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            system_prompt: self.system_prompt.clone(),
            allowed_tools: self.allowed_tools.clone(),
            permission_mode: self.permission_mode.clone(),
            timeout: self.instance_timeout(),
            max_retries: self.max_retries,
            working_directory: None,
        }
    }

    /// Load `~/.arbor/arbor.toml`, then apply `ARBOR_*` environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        debug!(path = %path.display(), "Config::load");
        let mut config = if path.exists() {
            toml::from_str(&fs::read_to_string(&path)?)?
        } else {
            debug!("Config file not found, using defaults");
            Self::default()
        };
        config.apply_env(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())?;
        config.validate()?;
        debug!(
            max_concurrent_instances = config.max_concurrent_instances,
            instance_timeout_secs = config.instance_timeout_secs,
            max_retries = config.max_retries,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let arbor_dir = Self::arbor_dir()?;
        if !arbor_dir.exists() {
            debug!(dir = %arbor_dir.display(), "Creating arbor directory");
            fs::create_dir_all(&arbor_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.worktrees_dir()?, self.state_path()?] {
            if !dir.exists() {
                debug!(dir = %dir.display(), "Creating directory");
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_instances == 0 {
            return Err(Error::Validation(
                "max_concurrent_instances must be at least 1".to_string(),
            ));
        }
        if self.instance_timeout_secs == 0 {
            return Err(Error::Validation(
                "instance_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MAX_CONCURRENT_INSTANCES") {
            self.max_concurrent_instances = parse_env("MAX_CONCURRENT_INSTANCES", &v)?;
        }
        if let Some(v) = lookup("INSTANCE_TIMEOUT") {
            self.instance_timeout_secs = parse_env("INSTANCE_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("MAX_RETRIES") {
            self.max_retries = parse_env("MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("DEFAULT_BRANCH") {
            self.default_branch = v;
        }
        if let Some(v) = lookup("WORKTREE_DIR") {
            self.worktree_dir = Some(v);
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::Validation(format!("{ENV_PREFIX}{key} has invalid value '{value}'"))
    })
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
