use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use simlab_analysis::{materialize, render_cell, MaterializeOptions, ResultSummary, ResultTable};
use simlab_core::{TaskSet, RUN_MANIFEST_FILE};
use simlab_runner::sink::RunManifestRecord;
use simlab_runner::{ExperimentRequest, HarnessConfig, RunReport, TmuxSessionManager};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "simlab", version = "0.3.0", about = "Multi-agent simulation experiment harness")]
struct Cli {
    /// Tracing filter, e.g. `info` or `simlab_runner=debug`. `RUST_LOG` wins when set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Provision servers, run every selected task and materialize results")]
    Run {
        #[arg(long)]
        task_path: PathBuf,
        #[arg(long, value_delimiter = ',')]
        task_ids: Vec<String>,
        #[arg(long, default_value_t = 1)]
        repeats: usize,
        #[arg(long, default_value_t = 1)]
        workers: usize,
        #[arg(long)]
        num_agents: Option<usize>,
        #[arg(long, default_value = "gpt-4o-mini")]
        model: String,
        #[arg(long, default_value = "openai")]
        api: String,
        #[arg(long)]
        url: Option<String>,
        #[arg(long, default_value = "profiles/tasks/collab_profile.json")]
        template_profile: PathBuf,
        #[arg(long, default_value = "exp")]
        exp_name: String,
        #[arg(long)]
        upload: bool,
        #[arg(long)]
        upload_endpoint: Option<String>,
        #[arg(long)]
        bucket: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        insecure_coding: bool,
        #[arg(long)]
        json: bool,
    },
    #[command(about = "Materialize an existing results tree without running anything")]
    Check {
        results_root: PathBuf,
        /// Defaults to the task file recorded in the run manifest.
        #[arg(long)]
        task_path: Option<PathBuf>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        expected: Option<usize>,
        #[arg(long)]
        json: bool,
        #[arg(long, conflicts_with = "json")]
        csv: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            error!(error = %format!("{:#}", err), "command failed");
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
            }
            std::process::exit(1);
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            task_path,
            task_ids,
            repeats,
            workers,
            num_agents,
            model,
            api,
            url,
            template_profile,
            exp_name,
            upload,
            upload_endpoint,
            bucket,
            config,
            insecure_coding,
            json,
        } => {
            let mut harness = HarnessConfig::load(config.as_deref())?;
            if let Some(endpoint) = upload_endpoint {
                harness.upload.endpoint = Some(endpoint);
            }
            if let Some(bucket) = bucket {
                harness.upload.bucket = bucket;
            }
            if insecure_coding {
                harness.insecure_coding = true;
            }
            let request = ExperimentRequest {
                task_path,
                task_ids,
                repeats,
                workers,
                num_agents,
                model,
                api,
                url,
                template_profile,
                exp_name,
                upload,
            };
            let stop = install_stop_handler()?;
            let sessions = Arc::new(TmuxSessionManager::default());
            let report = simlab_runner::run_experiment(&harness, &request, sessions, stop)?;
            if json {
                let mut payload = report.to_json();
                if let Some(obj) = payload.as_object_mut() {
                    obj.insert("ok".to_string(), json!(true));
                }
                return Ok(Some(payload));
            }
            print_run_report(&report);
            Ok(None)
        }
        Commands::Check {
            results_root,
            task_path,
            model,
            expected,
            json,
            csv,
        } => {
            let manifest = read_manifest(&results_root);
            let task_path = task_path
                .or_else(|| manifest.as_ref().map(|m| PathBuf::from(&m.task_path)))
                .ok_or_else(|| {
                    anyhow!(
                        "no --task-path given and no {} in {}",
                        RUN_MANIFEST_FILE,
                        results_root.display()
                    )
                });
            let task_path = match task_path {
                Ok(path) => path,
                Err(err) => return Err(empty_check_result(err, json, csv)),
            };
            let tasks = match TaskSet::load(&task_path) {
                Ok(tasks) => tasks,
                Err(err) => return Err(empty_check_result(err, json, csv)),
            };
            let options = MaterializeOptions {
                model_name: model
                    .or_else(|| manifest.as_ref().map(|m| m.model.clone()))
                    .unwrap_or_default(),
                expected_trials: expected
                    .or_else(|| manifest.as_ref().map(|m| m.task_ids.len() * m.repeats)),
                run_metadata: manifest.map(|m| m.metadata).unwrap_or_default(),
                upload_prefix: None,
            };
            let materialized = match materialize(&results_root, &tasks, &options, None) {
                Ok(out) => out,
                Err(err) => return Err(empty_check_result(err.into(), json, csv)),
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "results_root": results_root.display().to_string(),
                    "table": {
                        "columns": materialized.table.columns,
                        "rows": materialized.table.rows,
                    },
                    "summary": materialized.summary,
                    "skipped_dirs": materialized.skipped_dirs,
                })));
            }
            if csv {
                print_result_table_csv(&materialized.table);
            } else {
                print_result_table(&materialized.table);
                println!();
                print_summary(&materialized.summary);
            }
            Ok(None)
        }
    }
}

fn install_stop_handler() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    ctrlc::set_handler(move || {
        if !flag.swap(true, Ordering::SeqCst) {
            warn!("interrupt received; finishing the current pass");
        }
    })
    .context("failed to install interrupt handler")?;
    Ok(stop)
}

fn read_manifest(results_root: &Path) -> Option<RunManifestRecord> {
    let path = results_root.join(RUN_MANIFEST_FILE);
    let raw = fs::read(&path).ok()?;
    match serde_json::from_slice(&raw) {
        Ok(manifest) => Some(manifest),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable run manifest");
            None
        }
    }
}

/// Prints the empty table for a `check` that could not run and hands the
/// error back for the exit path.
fn empty_check_result(err: anyhow::Error, json: bool, csv: bool) -> anyhow::Error {
    if !json {
        let empty = ResultTable::default();
        if csv {
            print_result_table_csv(&empty);
        } else {
            print_result_table(&empty);
        }
    }
    err
}

fn print_run_report(report: &RunReport) {
    println!("experiment: {}", report.exp_name);
    println!("results_root: {}", report.results_root.display());
    println!("expected_trials: {}", report.expected_trials);
    println!("monitor_exit: {:?}", report.monitor_exit);
    for worker in &report.workers {
        let status = match (&worker.halted, worker.interrupted) {
            (Some(reason), _) => format!("halted: {}", reason),
            (None, true) => "interrupted".to_string(),
            (None, false) => "ok".to_string(),
        };
        println!(
            "worker {} (port {}): {} trials, {} failed, {}",
            worker.worker, worker.port, worker.trials_run, worker.trials_failed, status
        );
    }
    match &report.summary {
        Some(summary) => {
            println!();
            print_summary(summary);
        }
        None => println!("(no summary)"),
    }
    info!(results_root = %report.results_root.display(), "run complete");
}

fn print_summary(summary: &ResultSummary) {
    println!(
        "trials: {} ({} complete), successes: {}, success_rate: {:.3}, mean_raw_score: {:.3}",
        summary.total_trials,
        summary.complete_trials,
        summary.successful_trials,
        summary.success_rate,
        summary.mean_raw_score
    );
    if let Some(expected) = summary.expected_trials {
        println!("expected trials: {}", expected);
    }
    for (task_type, stats) in &summary.by_task_type {
        println!(
            "  type {}: {}/{} ({:.3})",
            task_type, stats.successes, stats.trials, stats.success_rate
        );
    }
    for (agents, stats) in &summary.by_agent_count {
        println!(
            "  agents {}: {}/{} ({:.3})",
            agents, stats.successes, stats.trials, stats.success_rate
        );
    }
    let statuses = summary
        .status_distribution
        .iter()
        .filter(|(_, count)| **count > 0)
        .map(|(status, count)| format!("{}={}", status, count))
        .collect::<Vec<_>>();
    if !statuses.is_empty() {
        println!("  status: {}", statuses.join(", "));
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Check { json, .. } => *json,
    }
}

fn print_result_table(table: &ResultTable) {
    if table.rows.is_empty() {
        println!("(no results)");
        return;
    }

    let rendered_rows: Vec<Vec<String>> = table
        .rows
        .iter()
        .map(|row| row.iter().map(render_cell).collect::<Vec<String>>())
        .collect();

    let numeric_cols: Vec<bool> = (0..table.columns.len())
        .map(|col_idx| {
            let mut has_number = false;
            for row in &table.rows {
                match row.get(col_idx) {
                    Some(Value::Number(_)) => has_number = true,
                    Some(Value::Null) => {}
                    _ => return false,
                }
            }
            has_number
        })
        .collect();

    let mut widths: Vec<usize> = table.columns.iter().map(|c| c.chars().count()).collect();
    for row in &rendered_rows {
        for (idx, cell) in row.iter().enumerate() {
            if idx < widths.len() {
                widths[idx] = widths[idx].max(cell.chars().count()).min(60);
            }
        }
    }

    let header = table
        .columns
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            pad_cell(
                &truncate_cell(col, widths[idx]),
                widths[idx],
                numeric_cols.get(idx).copied().unwrap_or(false),
            )
        })
        .collect::<Vec<_>>()
        .join(" | ");
    println!("{}", header);
    let separator = widths
        .iter()
        .map(|w| "-".repeat(*w))
        .collect::<Vec<_>>()
        .join("-+-");
    println!("{}", separator);

    for row in rendered_rows {
        let line = row
            .iter()
            .enumerate()
            .map(|(idx, cell)| {
                let ra = numeric_cols.get(idx).copied().unwrap_or(false);
                if idx < widths.len() {
                    pad_cell(&truncate_cell(cell, widths[idx]), widths[idx], ra)
                } else {
                    cell.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" | ");
        println!("{}", line);
    }
    println!("({} rows)", table.rows.len());
}

fn print_result_table_csv(table: &ResultTable) {
    print!("{}", table.to_csv());
}

fn truncate_cell(value: &str, width: usize) -> String {
    let value_len = value.chars().count();
    if value_len <= width {
        return value.to_string();
    }
    if width <= 1 {
        return ".".to_string();
    }
    let mut out: String = value.chars().take(width - 1).collect();
    out.push('.');
    out
}

fn pad_cell(value: &str, width: usize, right_align: bool) -> String {
    let value_len = value.chars().count();
    if value_len >= width {
        value.to_string()
    } else if right_align {
        format!("{:padding$}{value}", "", padding = width - value_len)
    } else {
        format!("{value}{:padding$}", "", padding = width - value_len)
    }
}
