use crate::config::{BootstrapPolicy, HarnessConfig, ReadinessPolicy};
use crate::error::{LifecycleError, LifecycleStage};
use crate::runtime::{kill_and_reap, wait_for_exit, AgentRuntime};
use crate::session::SessionManager;
use crate::sleep_unless_stopped;
use serde::Deserialize;
use simlab_core::ServerInstance;
use std::collections::HashSet;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const BOOTSTRAP_OUTPUT_FILE: &str = ".bootstrap_runtime.log";

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub start_command: String,
    pub readiness: ReadinessPolicy,
    pub bootstrap: BootstrapPolicy,
    pub shutdown_grace: Duration,
    pub runtime: AgentRuntime,
}

impl LifecycleSettings {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            start_command: config.server_start_command.clone(),
            readiness: config.readiness.clone(),
            bootstrap: config.bootstrap.clone(),
            shutdown_grace: config.shutdown_grace(),
            runtime: AgentRuntime::from_config(config),
        }
    }
}

/// Attempt numbers starting at 1; `max == 0` never ends.
fn attempt_numbers(max: usize) -> impl Iterator<Item = usize> {
    (1..).take_while(move |attempt| max == 0 || *attempt <= max)
}

pub fn port_accepts_connections(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, timeout).is_ok()
}

#[derive(Debug, Deserialize)]
struct RegistryRecord {
    name: String,
}

/// True when the privilege registry lists every name in `expected`. A
/// missing or malformed registry is simply not converged yet.
pub fn registry_contains_all(path: &Path, expected: &[String]) -> bool {
    let Ok(raw) = fs::read(path) else {
        return false;
    };
    let Ok(records) = serde_json::from_slice::<Vec<RegistryRecord>>(&raw) else {
        debug!(path = %path.display(), "privilege registry not parseable yet");
        return false;
    };
    let present: HashSet<&str> = records.iter().map(|r| r.name.as_str()).collect();
    expected.iter().all(|name| present.contains(name.as_str()))
}

/// Drives one server instance through start-up, bootstrap and shutdown.
pub struct ServerLifecycle {
    instance: ServerInstance,
    sessions: Arc<dyn SessionManager>,
    settings: LifecycleSettings,
    stop: Arc<AtomicBool>,
}

impl ServerLifecycle {
    pub fn new(
        instance: ServerInstance,
        sessions: Arc<dyn SessionManager>,
        settings: LifecycleSettings,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            instance,
            sessions,
            settings,
            stop,
        }
    }

    pub fn instance(&self) -> &ServerInstance {
        &self.instance
    }

    fn session_error(stage: LifecycleStage, err: anyhow::Error) -> LifecycleError {
        LifecycleError::Session {
            stage,
            message: err.to_string(),
        }
    }

    /// Starts the server and waits until its port accepts connections. A
    /// server that never answers is killed and started again.
    pub fn start_server(&self) -> Result<usize, LifecycleError> {
        let stage = LifecycleStage::Readiness;
        let policy = &self.settings.readiness;
        let session = self.instance.server_session();
        let mut last_attempt = 0;
        for attempt in attempt_numbers(policy.max_attempts) {
            last_attempt = attempt;
            if attempt > 1 {
                if let Err(err) = self.sessions.kill_session(&session) {
                    debug!(session = %session, error = %err, "kill before restart failed");
                }
            }
            self.sessions
                .new_session(&session, &self.instance.dir)
                .map_err(|e| Self::session_error(stage, e))?;
            self.sessions
                .send_keys(&session, &self.settings.start_command)
                .map_err(|e| Self::session_error(stage, e))?;
            info!(port = self.instance.port, attempt, "server start issued");

            for _ in 0..policy.polls_per_attempt {
                if port_accepts_connections(self.instance.port, policy.connect_timeout()) {
                    info!(port = self.instance.port, attempt, "server is accepting connections");
                    return Ok(attempt);
                }
                if !sleep_unless_stopped(policy.poll_interval(), &self.stop) {
                    return Err(LifecycleError::Interrupted(stage));
                }
            }
            warn!(
                port = self.instance.port,
                attempt,
                polls = policy.polls_per_attempt,
                "server did not become reachable; restarting"
            );
        }
        Err(LifecycleError::RetriesExhausted {
            stage,
            attempts: last_attempt,
        })
    }

    /// Runs the bootstrap task so every agent joins the world, elevates
    /// privileges and waits for the registry to list all agents. The
    /// bootstrap runtime has exited and its agent logs are gone by the time
    /// this returns.
    pub fn bootstrap(
        &self,
        agent_names: &[String],
        env: &[(String, String)],
    ) -> Result<usize, LifecycleError> {
        let stage = LifecycleStage::Bootstrap;
        let policy = &self.settings.bootstrap;
        let runtime = &self.settings.runtime;
        let task_id = BootstrapPolicy::bootstrap_task_id(agent_names.len());
        let output = self.instance.dir.join(BOOTSTRAP_OUTPUT_FILE);
        let mut last_attempt = 0;
        for attempt in attempt_numbers(policy.max_attempts) {
            last_attempt = attempt;
            runtime.clear_logs(agent_names);
            let mut child = runtime
                .spawn(&policy.task_file, &task_id, env, &output)
                .map_err(|e| LifecycleError::Runtime {
                    stage,
                    message: e.to_string(),
                })?;
            info!(port = self.instance.port, attempt, task_id = %task_id, "bootstrap runtime started");

            let converged = self.await_privileges(agent_names);
            let finished = match &converged {
                Ok(true) => wait_for_exit(&mut child, Some(policy.exit_wait()), &task_id).map(|_| ()),
                _ => kill_and_reap(&mut child).map(|_| ()),
            };
            if let Err(err) = finished {
                warn!(port = self.instance.port, attempt, error = %err, "failed to reap bootstrap runtime");
            }
            runtime.clear_logs(agent_names);

            if converged? {
                info!(port = self.instance.port, attempt, agents = agent_names.len(), "privileges granted");
                return Ok(attempt);
            }
            warn!(
                path = %self.instance.privilege_registry_path().display(),
                attempt,
                "privilege registry did not list every agent; retrying bootstrap"
            );
        }
        Err(LifecycleError::RetriesExhausted {
            stage,
            attempts: last_attempt,
        })
    }

    /// Settles, sends the elevation command and polls the registry. `Ok(false)`
    /// when the registry never lists every agent within the wait.
    fn await_privileges(&self, agent_names: &[String]) -> Result<bool, LifecycleError> {
        let stage = LifecycleStage::Bootstrap;
        let policy = &self.settings.bootstrap;
        let registry = self.instance.privilege_registry_path();
        if !sleep_unless_stopped(Duration::from_millis(policy.settle_ms), &self.stop) {
            return Err(LifecycleError::Interrupted(stage));
        }
        self.sessions
            .send_keys(&self.instance.server_session(), &policy.elevation_command)
            .map_err(|e| Self::session_error(stage, e))?;

        let deadline = Instant::now() + Duration::from_millis(policy.registry_wait_ms);
        loop {
            if registry_contains_all(&registry, agent_names) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let wait = Duration::from_millis(policy.registry_poll_interval_ms).min(deadline - now);
            if !sleep_unless_stopped(wait, &self.stop) {
                return Err(LifecycleError::Interrupted(stage));
            }
        }
    }

    /// Stops the server, then kills its session. Failures are logged only.
    pub fn shutdown(&self) {
        let server = self.instance.server_session();
        if let Err(err) = self.sessions.send_keys(&server, "stop") {
            warn!(session = %server, error = %err, "failed to send stop to server");
        }
        std::thread::sleep(self.settings.shutdown_grace);
        if let Err(err) = self.sessions.kill_session(&server) {
            debug!(session = %server, error = %err, "kill session failed");
        }
        info!(port = self.instance.port, "server instance shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{RecordingSessions, SessionCall};
    use std::net::TcpListener;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "simlab_lifecycle_{}_{}_{}",
            label,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    /// Runtime rooted at `<dir>/runtime` that runs `script` with `sh`.
    fn runtime(dir: &Path, script: &str) -> AgentRuntime {
        let runtime_dir = dir.join("runtime");
        fs::create_dir_all(&runtime_dir).expect("runtime dir");
        fs::write(runtime_dir.join("agent.sh"), script).expect("agent script");
        AgentRuntime {
            command: "sh agent.sh".to_string(),
            runtime_dir,
            log_template: "bots/{agent}/memory.json".to_string(),
        }
    }

    fn settings(max_attempts: usize, runtime: AgentRuntime) -> LifecycleSettings {
        LifecycleSettings {
            start_command: "java -jar server.jar nogui".to_string(),
            readiness: ReadinessPolicy {
                poll_interval_ms: 1,
                polls_per_attempt: 3,
                connect_timeout_ms: 50,
                max_attempts,
            },
            bootstrap: BootstrapPolicy {
                settle_ms: 0,
                registry_poll_interval_ms: 5,
                registry_wait_ms: 30,
                exit_wait_ms: 3_000,
                max_attempts,
                ..BootstrapPolicy::default()
            },
            shutdown_grace: Duration::from_millis(0),
            runtime,
        }
    }

    fn instance(dir: &Path, port: u16) -> ServerInstance {
        ServerInstance {
            index: 0,
            dir: dir.to_path_buf(),
            port,
            session: "0".to_string(),
        }
    }

    fn lifecycle(
        sessions: Arc<RecordingSessions>,
        dir: &Path,
        port: u16,
        attempts: usize,
        script: &str,
    ) -> ServerLifecycle {
        ServerLifecycle::new(
            instance(dir, port),
            sessions,
            settings(attempts, runtime(dir, script)),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn names() -> Vec<String> {
        vec!["Andy_0".to_string(), "Jill_0".to_string()]
    }

    #[test]
    fn readiness_succeeds_when_port_is_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let dir = temp_dir("ready");
        let sessions = Arc::new(RecordingSessions::default());
        let attempts = lifecycle(sessions.clone(), &dir, port, 3, "")
            .start_server()
            .expect("server should be ready");
        assert_eq!(attempts, 1);
        assert_eq!(
            sessions.calls(),
            vec![
                SessionCall::New {
                    name: "server_0".to_string(),
                    cwd: dir.clone()
                },
                SessionCall::Keys {
                    name: "server_0".to_string(),
                    keys: "java -jar server.jar nogui".to_string()
                },
            ]
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn readiness_restarts_then_gives_up() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let dir = temp_dir("not_ready");
        let sessions = Arc::new(RecordingSessions::default());
        let err = lifecycle(sessions.clone(), &dir, port, 2, "")
            .start_server()
            .expect_err("closed port should exhaust retries");
        assert!(matches!(
            err,
            LifecycleError::RetriesExhausted {
                stage: LifecycleStage::Readiness,
                attempts: 2
            }
        ));
        let calls = sessions.calls();
        let starts = calls
            .iter()
            .filter(|c| matches!(c, SessionCall::New { .. }))
            .count();
        let kills = calls
            .iter()
            .filter(|c| matches!(c, SessionCall::Kill { .. }))
            .count();
        assert_eq!((starts, kills), (2, 1));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn bootstrap_converges_and_leaves_no_agent_logs_behind() {
        let dir = temp_dir("bootstrap_ok");
        let registry = dir.join("ops.json");
        let sessions = Arc::new(RecordingSessions {
            on_keys: Some(Box::new(move |_session: &str, keys: &str| {
                if keys == "/op @a" {
                    fs::write(
                        &registry,
                        r#"[{"uuid":"1","name":"Andy_0","level":4},{"uuid":"2","name":"Jill_0","level":4}]"#,
                    )
                    .expect("write registry");
                }
            })),
            ..RecordingSessions::default()
        });
        let script = "echo \"$2 $4\" >> invocations.txt\n\
                      mkdir -p bots/Andy_0\n\
                      printf '[{\"role\":\"system\",\"content\":\"Task timeout reached\"}]' > bots/Andy_0/memory.json\n";
        let lifecycle = lifecycle(sessions.clone(), &dir, 1, 3, script);
        let attempts = lifecycle
            .bootstrap(&names(), &[])
            .expect("bootstrap converges");
        assert_eq!(attempts, 1);

        let runtime = &lifecycle.settings.runtime;
        let invocations =
            fs::read_to_string(runtime.runtime_dir.join("invocations.txt")).expect("runtime ran");
        assert_eq!(
            invocations.trim(),
            "tasks/example_tasks.json debug_2_agent_timeout"
        );
        assert!(!runtime.log_source("Andy_0").exists());
        assert_eq!(sessions.keys_sent_to("server_0"), vec!["/op @a".to_string()]);
        assert!(sessions.keys_sent_to("0").is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn bootstrap_waits_for_the_runtime_to_exit() {
        let dir = temp_dir("bootstrap_wait");
        fs::write(dir.join("ops.json"), r#"[{"name":"Andy_0"},{"name":"Jill_0"}]"#).expect("registry");
        let lifecycle = lifecycle(
            Arc::new(RecordingSessions::default()),
            &dir,
            1,
            1,
            "sleep 0.3\ntouch finished\n",
        );
        lifecycle.bootstrap(&names(), &[]).expect("bootstrap converges");
        assert!(lifecycle.settings.runtime.runtime_dir.join("finished").is_file());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn bootstrap_kills_a_runtime_that_outlives_the_exit_wait() {
        let dir = temp_dir("bootstrap_kill");
        fs::write(dir.join("ops.json"), r#"[{"name":"Andy_0"},{"name":"Jill_0"}]"#).expect("registry");
        let mut settings = settings(1, runtime(&dir, "sleep 5\n"));
        settings.bootstrap.exit_wait_ms = 100;
        let lifecycle = ServerLifecycle::new(
            instance(&dir, 1),
            Arc::new(RecordingSessions::default()),
            settings,
            Arc::new(AtomicBool::new(false)),
        );
        let started = Instant::now();
        lifecycle.bootstrap(&names(), &[]).expect("bootstrap converges");
        assert!(started.elapsed() < Duration::from_secs(4));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn bootstrap_retries_and_exhausts_when_an_agent_is_missing() {
        let dir = temp_dir("bootstrap_missing");
        fs::write(dir.join("ops.json"), r#"[{"name":"Andy_0"}]"#).expect("registry");
        let sessions = Arc::new(RecordingSessions::default());
        let mut settings = settings(2, runtime(&dir, "echo run >> invocations.txt\n"));
        settings.bootstrap.registry_wait_ms = 300;
        let lifecycle = ServerLifecycle::new(
            instance(&dir, 1),
            sessions.clone(),
            settings,
            Arc::new(AtomicBool::new(false)),
        );
        let err = lifecycle
            .bootstrap(&names(), &[])
            .expect_err("missing agent never converges");
        assert!(matches!(
            err,
            LifecycleError::RetriesExhausted {
                stage: LifecycleStage::Bootstrap,
                attempts: 2
            }
        ));
        assert_eq!(sessions.keys_sent_to("server_0").len(), 2);
        let invocations = fs::read_to_string(lifecycle.settings.runtime.runtime_dir.join("invocations.txt"))
            .expect("runtime ran");
        assert_eq!(invocations.lines().count(), 2);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn bootstrap_spawn_failure_is_a_runtime_error() {
        let dir = temp_dir("bootstrap_spawn");
        let mut settings = settings(1, runtime(&dir, ""));
        settings.runtime.command = "simlab-definitely-not-a-binary".to_string();
        let lifecycle = ServerLifecycle::new(
            instance(&dir, 1),
            Arc::new(RecordingSessions::default()),
            settings,
            Arc::new(AtomicBool::new(false)),
        );
        let err = lifecycle.bootstrap(&names(), &[]).expect_err("spawn should fail");
        assert!(matches!(
            err,
            LifecycleError::Runtime {
                stage: LifecycleStage::Bootstrap,
                ..
            }
        ));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn malformed_registry_is_not_converged() {
        let dir = temp_dir("registry");
        let path = dir.join("ops.json");
        let names = vec!["Andy_0".to_string()];
        assert!(!registry_contains_all(&path, &names));
        fs::write(&path, "{not json").expect("write");
        assert!(!registry_contains_all(&path, &names));
        fs::write(&path, r#"[{"name":"Andy_0"},{"name":"Bob_0"}]"#).expect("write");
        assert!(registry_contains_all(&path, &names));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn stop_flag_interrupts_readiness_and_bootstrap() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let dir = temp_dir("interrupt");
        let stop = Arc::new(AtomicBool::new(false));
        let mut settings = settings(0, runtime(&dir, "sleep 5\n"));
        settings.bootstrap.settle_ms = 60_000;
        let lifecycle = ServerLifecycle::new(
            instance(&dir, port),
            Arc::new(RecordingSessions::default()),
            settings,
            stop.clone(),
        );
        stop.store(true, Ordering::SeqCst);
        let err = lifecycle.start_server().expect_err("stop flag set");
        assert!(matches!(err, LifecycleError::Interrupted(LifecycleStage::Readiness)));

        let started = Instant::now();
        let err = lifecycle.bootstrap(&names(), &[]).expect_err("stop flag set");
        assert!(matches!(err, LifecycleError::Interrupted(LifecycleStage::Bootstrap)));
        assert!(started.elapsed() < Duration::from_secs(4));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn shutdown_stops_server_and_kills_its_session() {
        let dir = temp_dir("shutdown");
        let sessions = Arc::new(RecordingSessions::default());
        lifecycle(sessions.clone(), &dir, 1, 1, "").shutdown();
        assert_eq!(
            sessions.calls(),
            vec![
                SessionCall::Keys {
                    name: "server_0".to_string(),
                    keys: "stop".to_string()
                },
                SessionCall::Kill {
                    name: "server_0".to_string()
                },
            ]
        );
        let _ = fs::remove_dir_all(dir);
    }
}
