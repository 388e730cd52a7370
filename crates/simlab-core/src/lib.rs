use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub mod task;
pub mod trial;

pub use task::{TaskDefinition, TaskSet};
pub use trial::{parse_trial_dir_name, trial_dir_name, TrialName, TRIAL_TIMESTAMP_FORMAT};

pub const SERVER_PROPERTIES_FILE: &str = "server.properties";
pub const PRIVILEGE_REGISTRY_FILE: &str = "ops.json";
pub const SERVER_PORT_KEY: &str = "server-port";
pub const LEVEL_NAME_KEY: &str = "level-name";

pub const AGENT_LOG_EXTENSION: &str = "json";
pub const TRIAL_COMPLETE_MARKER: &str = ".complete";

pub const RESULTS_CSV_FILE: &str = "results.csv";
pub const RESULTS_JSON_FILE: &str = "results.json";
pub const SUMMARY_FILE: &str = "summary.json";
pub const RUN_MANIFEST_FILE: &str = "run_manifest.json";
pub const JOURNAL_DIR: &str = "_journal";

pub const SIMLAB_ENV_MINECRAFT_PORT: &str = "MINECRAFT_PORT";
pub const SIMLAB_ENV_MINDSERVER_PORT: &str = "MINDSERVER_PORT";
pub const SIMLAB_ENV_PROFILES: &str = "PROFILES";
pub const SIMLAB_ENV_MAX_MESSAGES: &str = "MAX_MESSAGES";
pub const SIMLAB_ENV_NUM_EXAMPLES: &str = "NUM_EXAMPLES";
pub const SIMLAB_ENV_LOG_ALL: &str = "LOG_ALL";
pub const SIMLAB_ENV_INSECURE_CODING: &str = "INSECURE_CODING";

/// One provisioned server working directory, owned by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInstance {
    pub index: usize,
    pub dir: PathBuf,
    pub port: u16,
    pub session: String,
}

impl ServerInstance {
    pub fn server_session(&self) -> String {
        format!("server_{}", self.session)
    }

    pub fn properties_path(&self) -> PathBuf {
        self.dir.join(SERVER_PROPERTIES_FILE)
    }

    pub fn privilege_registry_path(&self) -> PathBuf {
        self.dir.join(PRIVILEGE_REGISTRY_FILE)
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes through a hidden sibling temp file and renames it into place, so
/// concurrent readers never observe a half-written file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = chrono::Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.')
}
