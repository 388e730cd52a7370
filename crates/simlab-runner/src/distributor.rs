use crate::config::HarnessConfig;
use crate::lifecycle::ServerLifecycle;
use crate::runtime::{wait_for_exit, AgentExit, AgentRuntime};
use crate::sink::{JsonlTrialJournal, TrialRecord, TrialSink};
use anyhow::Result;
use chrono::{Local, Utc};
use serde_json::json;
use simlab_core::{
    atomic_write_bytes, ensure_dir, trial_dir_name, ServerInstance, SIMLAB_ENV_INSECURE_CODING,
    SIMLAB_ENV_LOG_ALL, SIMLAB_ENV_MAX_MESSAGES, SIMLAB_ENV_MINDSERVER_PORT,
    SIMLAB_ENV_MINECRAFT_PORT, SIMLAB_ENV_NUM_EXAMPLES, SIMLAB_ENV_PROFILES,
    TRIAL_COMPLETE_MARKER,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

const RUNTIME_OUTPUT_FILE: &str = ".runtime.log";

/// Splits `items` into `parts` disjoint lists, item `i` going to list
/// `i % parts`. Lists may be empty when there are more parts than items.
pub fn partition_round_robin<T: Clone>(items: &[T], parts: usize) -> Vec<Vec<T>> {
    let parts = parts.max(1);
    let mut out: Vec<Vec<T>> = (0..parts).map(|_| Vec::new()).collect();
    for (idx, item) in items.iter().enumerate() {
        out[idx % parts].push(item.clone());
    }
    out
}

/// Variables passed to every agent process a worker starts.
pub fn worker_environment(
    config: &HarnessConfig,
    instance: &ServerInstance,
    profile_paths: &[PathBuf],
) -> Result<Vec<(String, String)>> {
    let profiles: Vec<String> = profile_paths
        .iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect();
    let mut env = vec![
        (SIMLAB_ENV_MINECRAFT_PORT.to_string(), instance.port.to_string()),
        (
            SIMLAB_ENV_MINDSERVER_PORT.to_string(),
            config.mindserver_port(instance.index)?.to_string(),
        ),
        (SIMLAB_ENV_PROFILES.to_string(), serde_json::to_string(&profiles)?),
        (SIMLAB_ENV_MAX_MESSAGES.to_string(), config.max_messages.to_string()),
        (SIMLAB_ENV_NUM_EXAMPLES.to_string(), config.num_examples.to_string()),
        (SIMLAB_ENV_LOG_ALL.to_string(), "true".to_string()),
    ];
    if config.insecure_coding {
        env.push((SIMLAB_ENV_INSECURE_CODING.to_string(), "true".to_string()));
    }
    Ok(env)
}

/// Run-wide settings every worker shares.
#[derive(Debug, Clone)]
pub struct TrialSettings {
    pub exp_name: String,
    pub task_path: PathBuf,
    pub results_root: PathBuf,
    pub repeats: usize,
    pub runtime: AgentRuntime,
    pub trial_settle: Duration,
    pub trial_timeout: Option<Duration>,
}

impl TrialSettings {
    pub fn from_config(
        config: &HarnessConfig,
        exp_name: &str,
        task_path: &Path,
        results_root: &Path,
        repeats: usize,
    ) -> Self {
        Self {
            exp_name: exp_name.to_string(),
            task_path: task_path.to_path_buf(),
            results_root: results_root.to_path_buf(),
            repeats,
            runtime: AgentRuntime::from_config(config),
            trial_settle: config.trial_settle(),
            trial_timeout: config.trial_timeout(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPlan {
    pub worker: usize,
    pub task_ids: Vec<String>,
    pub agent_names: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker: usize,
    pub port: u16,
    pub trials_run: usize,
    pub trials_failed: usize,
    pub halted: Option<String>,
    pub interrupted: bool,
}

/// Runs the agent runtime for one task and waits for it, killing it when
/// `trial_timeout` elapses. Output goes to `output_path`.
pub fn run_agent_process(
    settings: &TrialSettings,
    task_id: &str,
    env: &[(String, String)],
    output_path: &Path,
) -> Result<AgentExit> {
    let mut child = settings
        .runtime
        .spawn(&settings.task_path, task_id, env, output_path)?;
    wait_for_exit(&mut child, settings.trial_timeout, task_id)
}

/// Moves each agent's private log into the trial directory as
/// `<agent>_<repeat>.json`. Returns (relocated file names, agents with no log).
pub fn relocate_agent_logs(
    settings: &TrialSettings,
    agent_names: &[String],
    trial_dir: &Path,
    repeat_index: usize,
    task_id: &str,
) -> (Vec<String>, Vec<String>) {
    let mut relocated = Vec::new();
    let mut missing = Vec::new();
    for agent in agent_names {
        let source = settings.runtime.log_source(agent);
        let file_name = format!("{}_{}.json", agent, repeat_index);
        let bytes = match fs::read(&source) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %source.display(), task_id, agent = %agent, error = %err, "agent log missing; skipping");
                missing.push(agent.clone());
                continue;
            }
        };
        if let Err(err) = atomic_write_bytes(&trial_dir.join(&file_name), &bytes) {
            warn!(path = %trial_dir.display(), task_id, agent = %agent, error = %err, "failed to relocate agent log");
            missing.push(agent.clone());
            continue;
        }
        if let Err(err) = fs::remove_file(&source) {
            warn!(path = %source.display(), error = %err, "failed to remove relocated agent log");
        }
        relocated.push(file_name);
    }
    (relocated, missing)
}

/// One trial: fresh directory, agent run, settle, log relocation, marker.
pub fn execute_trial(
    settings: &TrialSettings,
    plan: &WorkerPlan,
    task_id: &str,
    repeat_index: usize,
) -> Result<TrialRecord> {
    let started = Utc::now();
    let dir_name = trial_dir_name(task_id, repeat_index, &Local::now());
    let trial_dir = settings.results_root.join(&dir_name);
    ensure_dir(&trial_dir)?;
    info!(worker = plan.worker, task_id, repeat_index, path = %trial_dir.display(), "trial started");

    settings.runtime.clear_logs(&plan.agent_names);

    let (exit, error) = match run_agent_process(
        settings,
        task_id,
        &plan.env,
        &trial_dir.join(RUNTIME_OUTPUT_FILE),
    ) {
        Ok(exit) => (Some(exit), None),
        Err(err) => {
            error!(worker = plan.worker, task_id, error = %err, "agent runtime failed");
            (None, Some(err.to_string()))
        }
    };
    thread::sleep(settings.trial_settle);
    let (agent_logs, missing_agent_logs) =
        relocate_agent_logs(settings, &plan.agent_names, &trial_dir, repeat_index, task_id);

    let record = TrialRecord {
        exp_name: settings.exp_name.clone(),
        worker: plan.worker,
        task_id: task_id.to_string(),
        repeat_index,
        trial_dir: dir_name,
        started_at: started.to_rfc3339(),
        finished_at: Utc::now().to_rfc3339(),
        exit_code: exit.and_then(|e| e.exit_code),
        timed_out: exit.map(|e| e.timed_out).unwrap_or(false),
        agent_logs,
        missing_agent_logs,
        error,
    };
    let marker = json!({
        "task_id": record.task_id,
        "repeat_index": record.repeat_index,
        "exit_code": record.exit_code,
        "timed_out": record.timed_out,
        "finished_at": record.finished_at,
    });
    atomic_write_bytes(
        &trial_dir.join(TRIAL_COMPLETE_MARKER),
        &serde_json::to_vec(&marker)?,
    )?;
    info!(
        worker = plan.worker,
        task_id,
        repeat_index,
        logs = record.agent_logs.len(),
        "trial complete"
    );
    Ok(record)
}

/// Brings the worker's server up, then runs its trials repeat-major:
/// every task once, then every task again, `repeats` times.
pub fn run_worker(
    plan: WorkerPlan,
    settings: Arc<TrialSettings>,
    lifecycle: ServerLifecycle,
    stop: Arc<AtomicBool>,
) -> WorkerReport {
    let mut report = WorkerReport {
        worker: plan.worker,
        port: lifecycle.instance().port,
        ..WorkerReport::default()
    };
    if plan.task_ids.is_empty() {
        info!(worker = plan.worker, "no tasks assigned; worker idle");
        return report;
    }
    let mut journal = match JsonlTrialJournal::new(&settings.results_root, plan.worker) {
        Ok(journal) => journal,
        Err(err) => {
            error!(worker = plan.worker, error = %err, "failed to open trial journal");
            report.halted = Some(format!("trial journal: {}", err));
            return report;
        }
    };

    let ready = lifecycle
        .start_server()
        .and_then(|_| lifecycle.bootstrap(&plan.agent_names, &plan.env));
    if let Err(err) = ready {
        error!(worker = plan.worker, port = report.port, error = %err, "worker halted before running trials");
        report.interrupted = matches!(err, crate::error::LifecycleError::Interrupted(_));
        report.halted = Some(err.to_string());
        lifecycle.shutdown();
        return report;
    }

    'repeats: for repeat_index in 0..settings.repeats {
        for task_id in &plan.task_ids {
            if stop.load(Ordering::SeqCst) {
                info!(worker = plan.worker, "stop requested; not starting further trials");
                report.interrupted = true;
                break 'repeats;
            }
            match execute_trial(&settings, &plan, task_id, repeat_index) {
                Ok(record) => {
                    report.trials_run += 1;
                    if record.failed() {
                        report.trials_failed += 1;
                    }
                    if let Err(err) = journal.append_trial_record(&record) {
                        warn!(worker = plan.worker, error = %err, "failed to journal trial");
                    }
                }
                Err(err) => {
                    report.trials_run += 1;
                    report.trials_failed += 1;
                    error!(worker = plan.worker, task_id = %task_id, repeat_index, error = %err, "trial failed");
                }
            }
        }
    }
    if let Err(err) = journal.flush() {
        warn!(worker = plan.worker, error = %err, "failed to flush trial journal");
    }
    lifecycle.shutdown();
    report
}
