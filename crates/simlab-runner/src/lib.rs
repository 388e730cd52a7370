use anyhow::{anyhow, Context, Result};
use chrono::{Local, Utc};
use serde_json::{json, Map, Value};
use simlab_analysis::{
    remote_prefix, resolve_bearer_token, ArtifactUploader, HttpArtifactUploader,
    MaterializeOptions, ResultSummary,
};
use simlab_core::{ensure_dir, TaskSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub mod config;
pub mod distributor;
pub mod error;
pub mod lifecycle;
pub mod monitor;
pub mod profiles;
pub mod provision;
pub mod runtime;
pub mod session;
pub mod sink;

pub use config::HarnessConfig;
pub use distributor::{partition_round_robin, WorkerReport};
pub use error::{LifecycleError, LifecycleStage, ProvisionError};
pub use monitor::{monitor_results, MonitorExit};
pub use runtime::{AgentExit, AgentRuntime};
pub use session::{SessionManager, TmuxSessionManager};

const STOP_POLL_SLICE: Duration = Duration::from_millis(100);
const PROFILES_DIR: &str = "_profiles";
const EXPERIMENT_FOLDER_TIME_FORMAT: &str = "%m-%d_%H-%M";

/// Sleeps for `duration` in short slices. Returns false as soon as `stop`
/// is observed set, true once the full duration has passed.
pub fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(STOP_POLL_SLICE.min(deadline - now));
    }
}

#[derive(Debug, Clone)]
pub struct ExperimentRequest {
    pub task_path: PathBuf,
    pub task_ids: Vec<String>,
    pub repeats: usize,
    pub workers: usize,
    /// Agents per worker; defaults to the largest `agent_count` in the task set.
    pub num_agents: Option<usize>,
    pub model: String,
    pub api: String,
    pub url: Option<String>,
    pub template_profile: PathBuf,
    pub exp_name: String,
    pub upload: bool,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub exp_name: String,
    pub results_root: PathBuf,
    pub expected_trials: usize,
    pub workers: Vec<WorkerReport>,
    pub monitor_exit: MonitorExit,
    pub summary: Option<ResultSummary>,
}

impl RunReport {
    pub fn to_json(&self) -> Value {
        json!({
            "exp_name": self.exp_name,
            "results_root": self.results_root.display().to_string(),
            "expected_trials": self.expected_trials,
            "monitor_exit": format!("{:?}", self.monitor_exit),
            "workers": self.workers.iter().map(|w| json!({
                "worker": w.worker,
                "port": w.port,
                "trials_run": w.trials_run,
                "trials_failed": w.trials_failed,
                "halted": w.halted,
                "interrupted": w.interrupted,
            })).collect::<Vec<_>>(),
            "summary": self.summary,
        })
    }
}

pub fn experiment_folder(experiments_root: &Path, exp_name: &str) -> PathBuf {
    experiments_root.join(format!(
        "{}_{}",
        exp_name,
        Local::now().format(EXPERIMENT_FOLDER_TIME_FORMAT)
    ))
}

/// Summary metadata describing the run.
pub fn run_metadata(
    request: &ExperimentRequest,
    config: &HarnessConfig,
    task_type: &str,
    num_agents: usize,
) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("exp_name".to_string(), json!(request.exp_name));
    meta.insert("model".to_string(), json!(request.model));
    meta.insert("api".to_string(), json!(request.api));
    meta.insert("num_agents".to_string(), json!(num_agents));
    meta.insert("task_path".to_string(), json!(request.task_path.display().to_string()));
    meta.insert("task_type".to_string(), json!(task_type));
    meta.insert("max_messages".to_string(), json!(config.max_messages));
    meta.insert("num_examples".to_string(), json!(config.num_examples));
    meta.insert(
        "template_profile".to_string(),
        json!(request.template_profile.display().to_string()),
    );
    meta
}

fn build_uploader(
    config: &HarnessConfig,
    request: &ExperimentRequest,
) -> Result<Option<Box<dyn ArtifactUploader>>> {
    if !request.upload {
        return Ok(None);
    }
    let endpoint = config
        .upload
        .endpoint
        .as_deref()
        .ok_or_else(|| anyhow!("upload requested but no upload endpoint is configured"))?;
    let token = resolve_bearer_token(config.upload.token_env.as_deref())?;
    Ok(Some(Box::new(HttpArtifactUploader::new(endpoint, token)?)))
}

/// Provisions one server per worker, runs every selected task `repeats`
/// times across the workers and monitors the results tree until done.
pub fn run_experiment(
    config: &HarnessConfig,
    request: &ExperimentRequest,
    sessions: Arc<dyn SessionManager>,
    stop: Arc<AtomicBool>,
) -> Result<RunReport> {
    if request.workers == 0 {
        return Err(anyhow!("workers must be > 0"));
    }
    if request.repeats == 0 {
        return Err(anyhow!("repeats must be > 0"));
    }
    let task_path = request
        .task_path
        .canonicalize()
        .with_context(|| format!("task file {} not found", request.task_path.display()))?;
    let all_tasks = TaskSet::load(&task_path)?;
    let tasks = if request.task_ids.is_empty() {
        all_tasks
    } else {
        all_tasks.select(&request.task_ids)?
    };
    if tasks.is_empty() {
        return Err(anyhow!("no tasks to run in {}", task_path.display()));
    }
    let task_type = tasks.primary_task_type().unwrap_or_default().to_string();
    let num_agents = request
        .num_agents
        .or_else(|| tasks.iter().map(|t| t.agent_count).max())
        .unwrap_or(1)
        .max(1);
    let mut expected_trials = tasks.len() * request.repeats;

    let results_root = experiment_folder(&config.experiments_root, &request.exp_name);
    ensure_dir(&results_root)?;
    let exp_name = results_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| request.exp_name.clone());
    let metadata = run_metadata(request, config, &task_type, num_agents);
    sink::write_run_manifest(
        &results_root,
        &sink::RunManifestRecord {
            schema_version: "simlab_run_manifest_v1".to_string(),
            exp_name: exp_name.clone(),
            created_at: Utc::now().to_rfc3339(),
            task_path: task_path.display().to_string(),
            task_type: task_type.clone(),
            task_ids: tasks.ids(),
            repeats: request.repeats,
            workers: request.workers,
            num_agents,
            model: request.model.clone(),
            api: request.api.clone(),
            metadata: metadata.clone(),
        },
    )?;
    info!(
        exp_name = %exp_name,
        tasks = tasks.len(),
        repeats = request.repeats,
        workers = request.workers,
        results_root = %results_root.display(),
        "experiment starting"
    );

    // Leftovers from an earlier run with the same worker count.
    for index in 0..request.workers {
        let _ = sessions.kill_session(&format!("server_{}", index));
    }
    provision::clean_up_instances(&config.server_root, request.workers)?;
    let provision_request = provision::ProvisionRequest {
        template: config.server_template.clone(),
        server_root: config.server_root.clone(),
        count: request.workers,
        base_port: config.base_port,
        world_name: Some(provision::world_for_task_type(&task_type).to_string()),
        copy_max_attempts: config.retry.copy_max_attempts,
    };

    let settings = Arc::new(distributor::TrialSettings::from_config(
        config,
        &exp_name,
        &task_path,
        &results_root,
        request.repeats,
    ));
    let partitions = partition_round_robin(&tasks.ids(), request.workers);
    let name_pool = profiles::AgentNamePool::default();
    let finished = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::with_capacity(request.workers);
    let mut halted = Vec::new();
    for (index, task_ids) in partitions.into_iter().enumerate() {
        let instance = match provision::provision_instance(&provision_request, index) {
            Ok(instance) => instance,
            Err(err) => {
                error!(worker = index, error = %err, "provisioning failed; worker halted");
                expected_trials -= task_ids.len() * request.repeats;
                halted.push(WorkerReport {
                    worker: index,
                    port: config.base_port.saturating_add(u16::try_from(index).unwrap_or(u16::MAX)),
                    halted: Some(err.to_string()),
                    ..WorkerReport::default()
                });
                continue;
            }
        };
        let agent_names = name_pool.allocate(num_agents, &instance.session);
        let profile_paths = profiles::write_agent_profiles(
            &request.template_profile,
            &agent_names,
            &request.model,
            &request.api,
            request.url.as_deref(),
            &results_root
                .join(PROFILES_DIR)
                .join(format!("worker_{}", instance.index)),
        )?;
        let plan = distributor::WorkerPlan {
            worker: instance.index,
            env: distributor::worker_environment(config, &instance, &profile_paths)?,
            task_ids,
            agent_names,
        };
        let lifecycle = lifecycle::ServerLifecycle::new(
            instance,
            sessions.clone(),
            lifecycle::LifecycleSettings::from_config(config),
            stop.clone(),
        );
        let worker_settings = settings.clone();
        let worker_stop = stop.clone();
        let worker_finished = finished.clone();
        let worker = plan.worker;
        let handle = thread::Builder::new()
            .name(format!("simlab-worker-{}", worker))
            .spawn(move || {
                let report = distributor::run_worker(plan, worker_settings, lifecycle, worker_stop);
                worker_finished.fetch_add(1, Ordering::SeqCst);
                report
            })
            .with_context(|| format!("failed to spawn worker {}", worker))?;
        handles.push(handle);
        if !sleep_unless_stopped(config.worker_stagger(), &stop) {
            warn!("stop requested while dispatching workers");
            break;
        }
    }

    let uploader = build_uploader(config, request).unwrap_or_else(|err| {
        error!(error = %err, "uploads disabled");
        None
    });
    let options = MaterializeOptions {
        model_name: request.model.clone(),
        expected_trials: Some(expected_trials),
        run_metadata: metadata,
        upload_prefix: Some(remote_prefix(
            &config.upload.bucket,
            &task_type,
            &request.model,
            &request.task_path,
            &exp_name,
        )),
    };
    let worker_count = handles.len();
    let outcome = monitor_results(
        &results_root,
        &tasks,
        &options,
        uploader.as_deref(),
        config.poll_interval(),
        &stop,
        || finished.load(Ordering::SeqCst) >= worker_count,
    );

    let mut workers = halted;
    for handle in handles {
        match handle.join() {
            Ok(report) => workers.push(report),
            Err(_) => error!("worker thread panicked"),
        }
    }
    workers.sort_by_key(|report| report.worker);
    info!(exp_name = %exp_name, exit = ?outcome.exit, "experiment finished");
    Ok(RunReport {
        exp_name,
        results_root,
        expected_trials,
        workers,
        monitor_exit: outcome.exit,
        summary: outcome.last.map(|m| m.summary),
    })
}
