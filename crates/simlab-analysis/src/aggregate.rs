use crate::outcome::{extract_agent_outcome, AgentOutcome, CompletionStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use simlab_core::{is_hidden_name, TaskDefinition, TrialName, AGENT_LOG_EXTENSION, TRIAL_COMPLETE_MARKER};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRunOutcome {
    pub task_id: String,
    pub trial_dir: String,
    pub repeat_index: Option<usize>,
    pub trial_timestamp: Option<String>,
    pub model_name: String,
    pub agent_count: usize,
    pub task_type: String,
    pub overall_raw_score: f64,
    pub overall_is_successful: bool,
    pub overall_completion_status: CompletionStatus,
    pub total_agent_logs_found: usize,
    pub trial_complete: bool,
    pub agent_outcomes: Vec<AgentOutcome>,
    pub task_definition_metrics: Map<String, Value>,
}

/// Agent logs of one trial: visible `*.json` files, sorted by name so the
/// "first outcome" fallback is stable across scans.
pub fn discover_agent_logs(trial_dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(trial_dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(path = %trial_dir.display(), error = %err, "trial directory not readable");
            return Vec::new();
        }
    };
    let mut logs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|path| {
            let visible = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| !is_hidden_name(n))
                .unwrap_or(false);
            visible && path.extension().and_then(|e| e.to_str()) == Some(AGENT_LOG_EXTENSION)
        })
        .collect();
    logs.sort();
    logs
}

/// Reduces per-agent outcomes to `(status, max raw score)`.
///
/// Precedence: no outcomes → `NO_SCORE_LOGGED`; any timeout → `TIMED_OUT`;
/// any success → `SUCCESS`; all partial → `FAILED_PARTIAL_SCORE`; otherwise
/// the first outcome's status.
pub fn combine_outcomes(outcomes: &[AgentOutcome]) -> (CompletionStatus, f64) {
    let Some(first) = outcomes.first() else {
        return (CompletionStatus::NoScoreLogged, 0.0);
    };
    let raw_score = outcomes
        .iter()
        .map(|outcome| outcome.raw_score)
        .fold(0.0_f64, f64::max);
    let status = if outcomes
        .iter()
        .any(|o| o.timed_out || o.status == CompletionStatus::TimedOut)
    {
        CompletionStatus::TimedOut
    } else if outcomes.iter().any(|o| o.status == CompletionStatus::Success) {
        CompletionStatus::Success
    } else if outcomes
        .iter()
        .all(|o| o.status == CompletionStatus::FailedPartialScore)
    {
        CompletionStatus::FailedPartialScore
    } else {
        first.status
    };
    (status, raw_score)
}

pub fn aggregate_trial(
    trial_dir: &Path,
    task: &TaskDefinition,
    trial_name: Option<&TrialName>,
    model_name: &str,
) -> TaskRunOutcome {
    let logs = discover_agent_logs(trial_dir);
    let agent_outcomes: Vec<AgentOutcome> = logs.iter().map(|p| extract_agent_outcome(p)).collect();
    if agent_outcomes.is_empty() {
        warn!(
            path = %trial_dir.display(),
            task_id = %task.id,
            "no agent logs found in trial directory"
        );
    }
    let (status, raw_score) = combine_outcomes(&agent_outcomes);
    TaskRunOutcome {
        task_id: task.id.clone(),
        trial_dir: trial_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        repeat_index: trial_name.map(|name| name.repeat_index),
        trial_timestamp: trial_name.map(|name| name.timestamp.clone()),
        model_name: model_name.to_string(),
        agent_count: task.agent_count,
        task_type: task.task_type.clone(),
        overall_raw_score: raw_score,
        overall_is_successful: status == CompletionStatus::Success,
        overall_completion_status: status,
        total_agent_logs_found: agent_outcomes.len(),
        trial_complete: trial_dir.join(TRIAL_COMPLETE_MARKER).exists(),
        agent_outcomes,
        task_definition_metrics: task.difficulty_metrics(),
    }
}
