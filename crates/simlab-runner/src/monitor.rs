use crate::sleep_unless_stopped;
use simlab_analysis::{materialize, ArtifactUploader, MaterializeOptions, Materialized};
use simlab_core::TaskSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    AllTrialsObserved,
    WorkersFinished,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct MonitorOutcome {
    pub exit: MonitorExit,
    pub passes: usize,
    pub last: Option<Materialized>,
}

/// Re-materializes the results tree every `poll_interval` until every
/// expected trial is complete, all workers have returned, or `stop` is set.
/// A final pass always runs before returning.
pub fn monitor_results(
    results_root: &Path,
    tasks: &TaskSet,
    options: &MaterializeOptions,
    uploader: Option<&dyn ArtifactUploader>,
    poll_interval: Duration,
    stop: &AtomicBool,
    workers_done: impl Fn() -> bool,
) -> MonitorOutcome {
    let expected = options.expected_trials.unwrap_or(0);
    let mut passes = 0;
    let exit = loop {
        if !sleep_unless_stopped(poll_interval, stop) {
            break MonitorExit::Interrupted;
        }
        // Sampled before the pass so trials finished by the last worker are
        // included in the pass that observes it.
        let finished = workers_done();
        passes += 1;
        match materialize(results_root, tasks, options, uploader) {
            Ok(out) => {
                info!(
                    complete = out.summary.complete_trials,
                    observed = out.summary.observed_trials,
                    expected,
                    success_rate = out.summary.success_rate,
                    "monitor pass"
                );
                if out.summary.complete_trials >= expected {
                    break MonitorExit::AllTrialsObserved;
                }
            }
            Err(err) => warn!(results_root = %results_root.display(), error = %err, "monitor pass failed"),
        }
        if finished {
            break MonitorExit::WorkersFinished;
        }
        if stop.load(Ordering::SeqCst) {
            break MonitorExit::Interrupted;
        }
    };

    passes += 1;
    let last = match materialize(results_root, tasks, options, uploader) {
        Ok(out) => Some(out),
        Err(err) => {
            warn!(results_root = %results_root.display(), error = %err, "final materialization failed");
            None
        }
    };
    info!(?exit, passes, "monitoring finished");
    MonitorOutcome { exit, passes, last }
}
