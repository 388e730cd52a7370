use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SIMLAB_BASE_PORT_ENV: &str = "SIMLAB_BASE_PORT";
pub const SIMLAB_SERVER_ROOT_ENV: &str = "SIMLAB_SERVER_ROOT";
pub const SIMLAB_POLL_INTERVAL_MS_ENV: &str = "SIMLAB_POLL_INTERVAL_MS";
pub const SIMLAB_WORKER_STAGGER_MS_ENV: &str = "SIMLAB_WORKER_STAGGER_MS";
pub const SIMLAB_TRIAL_TIMEOUT_MS_ENV: &str = "SIMLAB_TRIAL_TIMEOUT_MS";
pub const SIMLAB_COPY_MAX_ATTEMPTS_ENV: &str = "SIMLAB_COPY_MAX_ATTEMPTS";
pub const SIMLAB_READINESS_MAX_ATTEMPTS_ENV: &str = "SIMLAB_READINESS_MAX_ATTEMPTS";
pub const SIMLAB_BOOTSTRAP_MAX_ATTEMPTS_ENV: &str = "SIMLAB_BOOTSTRAP_MAX_ATTEMPTS";
pub const SIMLAB_UPLOAD_ENDPOINT_ENV: &str = "SIMLAB_UPLOAD_ENDPOINT";

pub const DEFAULT_BASE_PORT: u16 = 55916;
pub const DEFAULT_MINDSERVER_BASE_PORT: u16 = 8080;

/// Server start-up probing. `max_attempts` counts process starts; 0 means
/// keep restarting until the server answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    pub poll_interval_ms: u64,
    pub polls_per_attempt: usize,
    pub connect_timeout_ms: u64,
    pub max_attempts: usize,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            polls_per_attempt: 24,
            connect_timeout_ms: 1_000,
            max_attempts: 3,
        }
    }
}

impl ReadinessPolicy {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapPolicy {
    /// Task file holding the `debug_<n>_agent_timeout` tasks.
    pub task_file: PathBuf,
    pub settle_ms: u64,
    pub elevation_command: String,
    pub registry_poll_interval_ms: u64,
    pub registry_wait_ms: u64,
    /// How long the bootstrap runtime may keep running once the registry
    /// has converged before it is killed.
    pub exit_wait_ms: u64,
    pub max_attempts: usize,
}

impl Default for BootstrapPolicy {
    fn default() -> Self {
        Self {
            task_file: PathBuf::from("tasks/example_tasks.json"),
            settle_ms: 30_000,
            elevation_command: "/op @a".to_string(),
            registry_poll_interval_ms: 5_000,
            registry_wait_ms: 60_000,
            exit_wait_ms: 60_000,
            max_attempts: 3,
        }
    }
}

impl BootstrapPolicy {
    pub fn exit_wait(&self) -> Duration {
        Duration::from_millis(self.exit_wait_ms)
    }

    pub fn bootstrap_task_id(agent_count: usize) -> String {
        format!("debug_{}_agent_timeout", agent_count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub copy_max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            copy_max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub endpoint: Option<String>,
    pub bucket: String,
    pub token_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub server_template: PathBuf,
    pub server_root: PathBuf,
    pub base_port: u16,
    pub mindserver_base_port: u16,
    pub server_start_command: String,
    pub shutdown_grace_ms: u64,
    /// Working directory of the agent runtime; agent commands and log
    /// templates are resolved against it.
    pub agent_runtime_dir: PathBuf,
    pub agent_command: String,
    pub agent_log_template: String,
    pub experiments_root: PathBuf,
    pub poll_interval_ms: u64,
    pub worker_stagger_ms: u64,
    pub trial_settle_ms: u64,
    pub trial_timeout_ms: Option<u64>,
    pub max_messages: u32,
    pub num_examples: u32,
    pub insecure_coding: bool,
    pub readiness: ReadinessPolicy,
    pub bootstrap: BootstrapPolicy,
    pub retry: RetryPolicy,
    pub upload: UploadConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            server_template: PathBuf::from("../server_data"),
            server_root: PathBuf::from("../server_instances"),
            base_port: DEFAULT_BASE_PORT,
            mindserver_base_port: DEFAULT_MINDSERVER_BASE_PORT,
            server_start_command: "java -jar server.jar nogui".to_string(),
            shutdown_grace_ms: 5_000,
            agent_runtime_dir: PathBuf::from("."),
            agent_command: "node main.js".to_string(),
            agent_log_template: "bots/{agent}/memory.json".to_string(),
            experiments_root: PathBuf::from("experiments"),
            poll_interval_ms: 60_000,
            worker_stagger_ms: 5_000,
            trial_settle_ms: 2_000,
            trial_timeout_ms: None,
            max_messages: 15,
            num_examples: 2,
            insecure_coding: false,
            readiness: ReadinessPolicy::default(),
            bootstrap: BootstrapPolicy::default(),
            retry: RetryPolicy::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Defaults, then the optional JSON file, then `SIMLAB_*` env overrides.
    /// CLI flags are applied by the caller on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid harness config {}", path.display()))
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(port) = parse_optional_positive_u64_env(SIMLAB_BASE_PORT_ENV)? {
            self.base_port = u16::try_from(port)
                .map_err(|_| anyhow!("{} must fit in a TCP port (got: {})", SIMLAB_BASE_PORT_ENV, port))?;
        }
        if let Some(root) = parse_optional_path_env(SIMLAB_SERVER_ROOT_ENV) {
            self.server_root = root;
        }
        if let Some(ms) = parse_optional_positive_u64_env(SIMLAB_POLL_INTERVAL_MS_ENV)? {
            self.poll_interval_ms = ms;
        }
        if let Some(ms) = parse_optional_positive_u64_env(SIMLAB_WORKER_STAGGER_MS_ENV)? {
            self.worker_stagger_ms = ms;
        }
        if let Some(ms) = parse_optional_positive_u64_env(SIMLAB_TRIAL_TIMEOUT_MS_ENV)? {
            self.trial_timeout_ms = Some(ms);
        }
        if let Some(n) = parse_optional_positive_usize_env(SIMLAB_COPY_MAX_ATTEMPTS_ENV)? {
            self.retry.copy_max_attempts = n;
        }
        if let Some(n) = parse_optional_positive_usize_env(SIMLAB_READINESS_MAX_ATTEMPTS_ENV)? {
            self.readiness.max_attempts = n;
        }
        if let Some(n) = parse_optional_positive_usize_env(SIMLAB_BOOTSTRAP_MAX_ATTEMPTS_ENV)? {
            self.bootstrap.max_attempts = n;
        }
        if let Some(endpoint) = env::var(SIMLAB_UPLOAD_ENDPOINT_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            self.upload.endpoint = Some(endpoint);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent_command.split_whitespace().next().is_none() {
            return Err(anyhow!("agent_command must not be empty"));
        }
        if !self.agent_log_template.contains("{agent}") {
            return Err(anyhow!(
                "agent_log_template must contain the {{agent}} placeholder (got: {})",
                self.agent_log_template
            ));
        }
        if self.server_start_command.trim().is_empty() {
            return Err(anyhow!("server_start_command must not be empty"));
        }
        if self.retry.copy_max_attempts == 0 {
            return Err(anyhow!("retry.copy_max_attempts must be > 0"));
        }
        if self.readiness.polls_per_attempt == 0 {
            return Err(anyhow!("readiness.polls_per_attempt must be > 0"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn worker_stagger(&self) -> Duration {
        Duration::from_millis(self.worker_stagger_ms)
    }

    pub fn trial_settle(&self) -> Duration {
        Duration::from_millis(self.trial_settle_ms)
    }

    pub fn trial_timeout(&self) -> Option<Duration> {
        self.trial_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Mindserver port of instance `index`.
    pub fn mindserver_port(&self, index: usize) -> Result<u16> {
        u16::try_from(self.mindserver_base_port as usize + index)
            .map_err(|_| anyhow!("mindserver port for instance {} overflows", index))
    }
}

fn parse_optional_path_env(name: &str) -> Option<PathBuf> {
    env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
}

pub fn parse_optional_positive_usize_env(name: &str) -> Result<Option<usize>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed.parse::<usize>().map_err(|_| {
                anyhow!(
                    "{} must be a positive integer when set (got: {})",
                    name,
                    raw
                )
            })?;
            if parsed == 0 {
                return Err(anyhow!("{} must be > 0 when set", name));
            }
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

pub fn parse_optional_positive_u64_env(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed.parse::<u64>().map_err(|_| {
                anyhow!(
                    "{} must be a positive integer when set (got: {})",
                    name,
                    raw
                )
            })?;
            if parsed == 0 {
                return Err(anyhow!("{} must be > 0 when set", name));
            }
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}
