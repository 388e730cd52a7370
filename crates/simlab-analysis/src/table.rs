use crate::aggregate::{aggregate_trial, TaskRunOutcome};
use crate::outcome::CompletionStatus;
use crate::upload::ArtifactUploader;
use serde::Serialize;
use serde_json::{json, Map, Value};
use simlab_core::{
    atomic_write_bytes, is_hidden_name, parse_trial_dir_name, TaskSet, TrialName,
    RESULTS_CSV_FILE, RESULTS_JSON_FILE, SUMMARY_FILE,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const METRIC_COLUMN_PREFIX: &str = "metric_";

const BASE_COLUMNS: &[&str] = &[
    "task_id",
    "trial_dir",
    "repeat_index",
    "trial_timestamp",
    "model_name",
    "agent_count",
    "task_type",
    "overall_raw_score",
    "overall_is_successful",
    "overall_completion_status",
    "total_agent_logs_found",
    "trial_complete",
];

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("results root {0} does not exist")]
    ResultsRootMissing(PathBuf),
    #[error("failed to list results root {path}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Persist(#[from] anyhow::Error),
}

/// One row per trial. Rebuilt from disk on every pass, never patched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultTable {
    pub fn from_outcomes(outcomes: &[TaskRunOutcome]) -> Self {
        let flattened: Vec<BTreeMap<String, Value>> = outcomes
            .iter()
            .map(|outcome| {
                let mut metrics = BTreeMap::new();
                flatten_metrics(METRIC_COLUMN_PREFIX, &outcome.task_definition_metrics, &mut metrics);
                metrics
            })
            .collect();
        let metric_columns: BTreeSet<&String> =
            flattened.iter().flat_map(|metrics| metrics.keys()).collect();

        let mut columns: Vec<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
        columns.extend(metric_columns.iter().map(|c| c.to_string()));

        let rows = outcomes
            .iter()
            .zip(flattened.iter())
            .map(|(outcome, metrics)| {
                let mut row = vec![
                    json!(outcome.task_id),
                    json!(outcome.trial_dir),
                    json!(outcome.repeat_index),
                    json!(outcome.trial_timestamp),
                    json!(outcome.model_name),
                    json!(outcome.agent_count),
                    json!(outcome.task_type),
                    json!(outcome.overall_raw_score),
                    json!(outcome.overall_is_successful),
                    json!(outcome.overall_completion_status.as_str()),
                    json!(outcome.total_agent_logs_found),
                    json!(outcome.trial_complete),
                ];
                row.extend(
                    metric_columns
                        .iter()
                        .map(|column| metrics.get(*column).cloned().unwrap_or(Value::Null)),
                );
                row
            })
            .collect();
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        out.push_str(
            &self
                .columns
                .iter()
                .map(|c| csv_escape(c))
                .collect::<Vec<_>>()
                .join(","),
        );
        out.push('\n');
        for row in &self.rows {
            out.push_str(
                &row.iter()
                    .map(|v| csv_escape(&render_cell(v)))
                    .collect::<Vec<_>>()
                    .join(","),
            );
            out.push('\n');
        }
        out
    }

    /// Rows as objects keyed by column name.
    pub fn to_records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let record: Map<String, Value> = self
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();
                Value::Object(record)
            })
            .collect()
    }
}

fn flatten_metrics(prefix: &str, metrics: &Map<String, Value>, out: &mut BTreeMap<String, Value>) {
    for (key, value) in metrics {
        let column = format!("{}{}", prefix, key);
        match value {
            Value::Object(nested) => flatten_metrics(&format!("{}_", column), nested, out),
            other => {
                out.insert(column, other.clone());
            }
        }
    }
}

pub fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') || value.contains('\r') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(v) => v.to_string(),
        Value::Number(v) => v.to_string(),
        Value::String(v) => v.clone(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupStats {
    pub trials: usize,
    pub successes: usize,
    pub success_rate: f64,
}

impl GroupStats {
    fn record(&mut self, success: bool) {
        self.trials += 1;
        if success {
            self.successes += 1;
        }
        self.success_rate = ratio(self.successes, self.trials);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSummary {
    pub total_trials: usize,
    pub successful_trials: usize,
    pub success_rate: f64,
    pub mean_raw_score: f64,
    pub by_task_type: BTreeMap<String, GroupStats>,
    pub by_agent_count: BTreeMap<String, GroupStats>,
    pub status_distribution: BTreeMap<String, usize>,
    pub expected_trials: Option<usize>,
    pub observed_trials: usize,
    pub complete_trials: usize,
    pub run_metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct MaterializeOptions {
    pub model_name: String,
    pub expected_trials: Option<usize>,
    pub run_metadata: Map<String, Value>,
    /// Remote name prefix handed to the uploader, e.g. `bucket/cooking/model/tasks/exp`.
    pub upload_prefix: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Materialized {
    pub outcomes: Vec<TaskRunOutcome>,
    pub table: ResultTable,
    pub summary: ResultSummary,
    pub skipped_dirs: Vec<String>,
    pub written: Vec<PathBuf>,
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Maps a results subdirectory to its task: by exact id first, then by
/// parsing it as a trial directory name.
pub fn resolve_task_id(dir_name: &str, tasks: &TaskSet) -> Option<(String, Option<TrialName>)> {
    if tasks.contains(dir_name) {
        return Some((dir_name.to_string(), parse_trial_dir_name(dir_name)));
    }
    let parsed = parse_trial_dir_name(dir_name)?;
    if tasks.contains(&parsed.task_id) {
        return Some((parsed.task_id.clone(), Some(parsed)));
    }
    None
}

fn is_service_dir(name: &str) -> bool {
    is_hidden_name(name) || name.starts_with('_')
}

/// Aggregates every resolvable trial directory under `results_root`, sorted
/// by directory name. Returns the outcomes and the names of skipped dirs.
pub fn scan_results(
    results_root: &Path,
    tasks: &TaskSet,
    model_name: &str,
) -> Result<(Vec<TaskRunOutcome>, Vec<String>), MaterializeError> {
    if !results_root.is_dir() {
        return Err(MaterializeError::ResultsRootMissing(results_root.to_path_buf()));
    }
    let entries = fs::read_dir(results_root).map_err(|source| MaterializeError::Scan {
        path: results_root.to_path_buf(),
        source,
    })?;
    let mut dirs: Vec<(String, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| (entry.file_name().to_string_lossy().to_string(), entry.path()))
        .filter(|(name, _)| !is_service_dir(name))
        .collect();
    dirs.sort();

    let mut outcomes = Vec::with_capacity(dirs.len());
    let mut skipped = Vec::new();
    for (name, path) in dirs {
        let Some((task_id, trial_name)) = resolve_task_id(&name, tasks) else {
            warn!(path = %path.display(), "results directory does not match any task definition; skipping");
            skipped.push(name);
            continue;
        };
        let Some(task) = tasks.get(&task_id) else {
            skipped.push(name);
            continue;
        };
        outcomes.push(aggregate_trial(&path, task, trial_name.as_ref(), model_name));
    }
    Ok((outcomes, skipped))
}

pub fn summarize(outcomes: &[TaskRunOutcome], options: &MaterializeOptions) -> ResultSummary {
    let mut summary = ResultSummary {
        expected_trials: options.expected_trials,
        run_metadata: options.run_metadata.clone(),
        ..ResultSummary::default()
    };
    for status in CompletionStatus::ALL {
        summary.status_distribution.insert(status.as_str().to_string(), 0);
    }
    let mut score_total = 0.0;
    for outcome in outcomes {
        let success = outcome.overall_is_successful;
        summary.total_trials += 1;
        if success {
            summary.successful_trials += 1;
        }
        if outcome.trial_complete {
            summary.complete_trials += 1;
        }
        score_total += outcome.overall_raw_score;
        summary
            .by_task_type
            .entry(outcome.task_type.clone())
            .or_default()
            .record(success);
        summary
            .by_agent_count
            .entry(outcome.agent_count.to_string())
            .or_default()
            .record(success);
        *summary
            .status_distribution
            .entry(outcome.overall_completion_status.as_str().to_string())
            .or_insert(0) += 1;
    }
    summary.observed_trials = summary.total_trials;
    summary.success_rate = ratio(summary.successful_trials, summary.total_trials);
    summary.mean_raw_score = if outcomes.is_empty() {
        0.0
    } else {
        score_total / outcomes.len() as f64
    };
    summary
}

/// One materialization pass: scan, aggregate, persist, optionally upload.
///
/// Safe to run while workers are still writing trials; partially written
/// logs surface as `LOG_FILE_ERROR` for this pass and are re-read next pass.
pub fn materialize(
    results_root: &Path,
    tasks: &TaskSet,
    options: &MaterializeOptions,
    uploader: Option<&dyn ArtifactUploader>,
) -> Result<Materialized, MaterializeError> {
    let (outcomes, skipped_dirs) = scan_results(results_root, tasks, &options.model_name)?;
    let table = ResultTable::from_outcomes(&outcomes);
    let summary = summarize(&outcomes, options);

    let csv_path = results_root.join(RESULTS_CSV_FILE);
    let json_path = results_root.join(RESULTS_JSON_FILE);
    let summary_path = results_root.join(SUMMARY_FILE);
    atomic_write_bytes(&csv_path, table.to_csv().as_bytes())?;
    atomic_write_bytes(&json_path, &serde_json::to_vec_pretty(&outcomes).map_err(anyhow::Error::from)?)?;
    atomic_write_bytes(&summary_path, &serde_json::to_vec_pretty(&summary).map_err(anyhow::Error::from)?)?;
    let written = vec![csv_path, json_path, summary_path];

    info!(
        results_root = %results_root.display(),
        trials = summary.total_trials,
        successes = summary.successful_trials,
        skipped = skipped_dirs.len(),
        "materialized results"
    );

    if let Some(uploader) = uploader {
        let prefix = options.upload_prefix.as_deref().unwrap_or_default();
        for path in &written {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let remote = if prefix.is_empty() {
                file_name.to_string()
            } else {
                format!("{}/{}", prefix.trim_end_matches('/'), file_name)
            };
            match uploader.upload(path, &remote) {
                Ok(()) => debug!(path = %path.display(), remote = %remote, "uploaded artifact"),
                Err(err) => warn!(path = %path.display(), remote = %remote, error = %err, "artifact upload failed"),
            }
        }
    }

    Ok(Materialized {
        outcomes,
        table,
        summary,
        skipped_dirs,
        written,
    })
}
