use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use simlab_core::{atomic_write_bytes, JOURNAL_DIR, RUN_MANIFEST_FILE};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifestRecord {
    pub schema_version: String,
    pub exp_name: String,
    pub created_at: String,
    pub task_path: String,
    pub task_type: String,
    pub task_ids: Vec<String>,
    pub repeats: usize,
    pub workers: usize,
    pub num_agents: usize,
    pub model: String,
    pub api: String,
    pub metadata: Map<String, Value>,
}

/// One finished trial as seen by the worker that ran it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialRecord {
    pub exp_name: String,
    pub worker: usize,
    pub task_id: String,
    pub repeat_index: usize,
    pub trial_dir: String,
    pub started_at: String,
    pub finished_at: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub agent_logs: Vec<String>,
    pub missing_agent_logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TrialRecord {
    /// A trial failed when the runtime could not start, timed out or exited
    /// with anything but zero.
    pub fn failed(&self) -> bool {
        self.error.is_some() || self.timed_out || self.exit_code != Some(0)
    }
}

pub trait TrialSink {
    fn append_trial_record(&mut self, row: &TrialRecord) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Per-worker append-only journal at `<results_root>/_journal/worker_<i>.jsonl`.
pub struct JsonlTrialJournal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlTrialJournal {
    pub fn new(results_root: &Path, worker: usize) -> Result<Self> {
        let journal_dir = results_root.join(JOURNAL_DIR);
        fs::create_dir_all(&journal_dir)?;
        let path = journal_dir.join(format!("worker_{}.jsonl", worker));
        Ok(Self {
            writer: open_append(path.clone())?,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TrialSink for JsonlTrialJournal {
    fn append_trial_record(&mut self, row: &TrialRecord) -> Result<()> {
        append_row(&mut self.writer, row)?;
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

pub fn write_run_manifest(results_root: &Path, run: &RunManifestRecord) -> Result<PathBuf> {
    let path = results_root.join(RUN_MANIFEST_FILE);
    atomic_write_bytes(&path, &serde_json::to_vec_pretty(run)?)?;
    Ok(path)
}

pub fn read_journal(path: &Path) -> Result<Vec<TrialRecord>> {
    let raw = fs::read_to_string(path)?;
    let mut rows = Vec::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        rows.push(serde_json::from_str(line)?);
    }
    Ok(rows)
}

fn open_append(path: PathBuf) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn append_row<T: Serialize>(writer: &mut BufWriter<File>, row: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, row)?;
    writer.write_all(b"\n")?;
    Ok(())
}
