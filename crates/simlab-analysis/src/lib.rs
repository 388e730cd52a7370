pub mod aggregate;
pub mod outcome;
pub mod table;
pub mod upload;

pub use aggregate::{aggregate_trial, combine_outcomes, discover_agent_logs, TaskRunOutcome};
pub use outcome::{
    extract_agent_outcome, extract_agent_outcome_from_bytes, AgentOutcome, CompletionStatus,
};
pub use table::{
    csv_escape, materialize, render_cell, resolve_task_id, scan_results, summarize,
    MaterializeError, MaterializeOptions, Materialized, ResultSummary, ResultTable,
};
pub use upload::{remote_prefix, resolve_bearer_token, ArtifactUploader, HttpArtifactUploader};
