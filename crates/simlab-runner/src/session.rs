use anyhow::{anyhow, Result};
use std::path::Path;
use std::process::Command;

/// Named terminal sessions that outlive the commands typed into them.
pub trait SessionManager: Send + Sync {
    fn new_session(&self, name: &str, cwd: &Path) -> Result<()>;
    /// Types `keys` into the session followed by Enter.
    fn send_keys(&self, name: &str, keys: &str) -> Result<()>;
    fn kill_session(&self, name: &str) -> Result<()>;
}

pub struct TmuxSessionManager {
    binary: String,
}

impl Default for TmuxSessionManager {
    fn default() -> Self {
        Self {
            binary: "tmux".to_string(),
        }
    }
}

impl TmuxSessionManager {
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }
}

impl SessionManager for TmuxSessionManager {
    fn new_session(&self, name: &str, cwd: &Path) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["new-session", "-d", "-s", name, "-c"]).arg(cwd);
        run_checked_command(cmd, &format!("tmux new-session {}", name))?;
        Ok(())
    }

    fn send_keys(&self, name: &str, keys: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["send-keys", "-t", name, keys, "C-m"]);
        run_checked_command(cmd, &format!("tmux send-keys {}", name))?;
        Ok(())
    }

    fn kill_session(&self, name: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["kill-session", "-t", name]);
        run_checked_command(cmd, &format!("tmux kill-session {}", name))?;
        Ok(())
    }
}

pub fn run_checked_command(mut cmd: Command, step: &str) -> Result<std::process::Output> {
    let out = cmd.output()?;
    if out.status.success() {
        return Ok(out);
    }
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    let detail = if !stderr.is_empty() {
        stderr
    } else if !stdout.is_empty() {
        stdout
    } else {
        "command exited non-zero".to_string()
    };
    Err(anyhow!("{}: {}", step, detail))
}
