use crate::config::HarnessConfig;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentExit {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl AgentExit {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// How the agent runtime is launched and where each agent leaves its log:
/// `<command> --task_path <file> --task_id <id>` run from `runtime_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRuntime {
    pub command: String,
    pub runtime_dir: PathBuf,
    pub log_template: String,
}

impl AgentRuntime {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            command: config.agent_command.clone(),
            runtime_dir: config.agent_runtime_dir.clone(),
            log_template: config.agent_log_template.clone(),
        }
    }

    pub fn log_source(&self, agent: &str) -> PathBuf {
        self.runtime_dir
            .join(self.log_template.replace("{agent}", agent))
    }

    /// Removes each agent's private log so the next run starts without one.
    pub fn clear_logs(&self, agents: &[String]) {
        for agent in agents {
            let path = self.log_source(agent);
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), agent = %agent, "cleared stale agent log"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), agent = %agent, error = %err, "failed to clear agent log")
                }
            }
        }
    }

    /// Starts the runtime for `task_id`; stdout and stderr go to `output_path`.
    pub fn spawn(
        &self,
        task_path: &Path,
        task_id: &str,
        env: &[(String, String)],
        output_path: &Path,
    ) -> Result<Child> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("agent_command must not be empty"))?;
        let output = fs::File::create(output_path)
            .with_context(|| format!("failed to create {}", output_path.display()))?;
        Command::new(program)
            .args(parts)
            .arg("--task_path")
            .arg(task_path)
            .arg("--task_id")
            .arg(task_id)
            .current_dir(&self.runtime_dir)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(output.try_clone()?))
            .stderr(Stdio::from(output))
            .spawn()
            .with_context(|| format!("failed to spawn agent runtime '{}'", self.command))
    }
}

/// Waits for `child` to exit, killing it once `timeout` elapses.
pub fn wait_for_exit(child: &mut Child, timeout: Option<Duration>, task_id: &str) -> Result<AgentExit> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(AgentExit {
                exit_code: status.code(),
                timed_out: false,
            });
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            warn!(task_id, "agent runtime exceeded its time limit; killing");
            return Ok(AgentExit {
                exit_code: kill_and_reap(child)?,
                timed_out: true,
            });
        }
        thread::sleep(CHILD_POLL_INTERVAL);
    }
}

pub fn kill_and_reap(child: &mut Child) -> Result<Option<i32>> {
    let _ = child.kill();
    Ok(child.wait()?.code())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempDirGuard {
        path: PathBuf,
    }

    impl TempDirGuard {
        fn new(prefix: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "{}_{}_{}",
                prefix,
                std::process::id(),
                chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
            ));
            fs::create_dir_all(&path).expect("temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    fn runtime(dir: &Path, script: &str) -> AgentRuntime {
        fs::write(dir.join("agent.sh"), script).expect("agent script");
        AgentRuntime {
            command: "sh agent.sh".to_string(),
            runtime_dir: dir.to_path_buf(),
            log_template: "bots/{agent}/memory.json".to_string(),
        }
    }

    #[test]
    fn spawned_runtime_receives_task_arguments_and_environment() {
        let dir = TempDirGuard::new("simlab_runtime_args");
        let runtime = runtime(&dir.path, "echo \"$MINECRAFT_PORT $2 $4\"\nexit 3\n");
        let output = dir.path.join("out.log");
        let mut child = runtime
            .spawn(
                Path::new("tasks.json"),
                "cake",
                &[("MINECRAFT_PORT".to_string(), "55916".to_string())],
                &output,
            )
            .expect("spawn");
        let exit = wait_for_exit(&mut child, None, "cake").expect("wait");
        assert_eq!(exit.exit_code, Some(3));
        assert!(!exit.succeeded());
        assert_eq!(
            fs::read_to_string(&output).expect("output").trim(),
            "55916 tasks.json cake"
        );
    }

    #[test]
    fn time_limit_kills_the_runtime() {
        let dir = TempDirGuard::new("simlab_runtime_timeout");
        let runtime = runtime(&dir.path, "sleep 5\n");
        let started = Instant::now();
        let mut child = runtime
            .spawn(Path::new("tasks.json"), "cake", &[], &dir.path.join("out.log"))
            .expect("spawn");
        let exit = wait_for_exit(&mut child, Some(Duration::from_millis(100)), "cake").expect("wait");
        assert!(exit.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn clear_logs_removes_only_existing_sources() {
        let dir = TempDirGuard::new("simlab_runtime_clear");
        let runtime = runtime(&dir.path, "");
        let log = runtime.log_source("Andy_0");
        fs::create_dir_all(log.parent().expect("parent")).expect("bots dir");
        fs::write(&log, "[]").expect("log");
        runtime.clear_logs(&["Andy_0".to_string(), "Jill_0".to_string()]);
        assert!(!log.exists());
        assert_eq!(log, dir.path.join("bots").join("Andy_0").join("memory.json"));
    }
}
