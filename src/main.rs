use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use conductor::backlog::{self, BacklogItem};
use conductor::config::OrchestratorConfig;
use conductor::coordinator::ParallelExecutionCoordinator;
use conductor::error::{OrchestratorError, OrchestratorResult};
use conductor::phase::PhaseStateMachine;
use conductor::probe::GitHubProbe;
use conductor::quality::QualityGateValidator;
use conductor::report::ReportAggregator;
use conductor::resume::ResumptionAnalyzer;
use conductor::state::{
    FailureKind, Phase, RunMode, StateStore, UnitRecord, WorkflowState,
};
use conductor::worker::{CommandWorker, WorkerRegistry};
use conductor::BatchPlanner;

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Workflow orchestration with environment-based resumption"
)]
struct Cli {
    /// Config file stem (default: conductor, reading conductor.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Drive one unit through the phase pipeline.
    Single,
    /// Plan a backlog into batches and execute them in order.
    Batch,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new orchestration run.
    Run {
        #[arg(long, value_enum, default_value = "single")]
        mode: Mode,

        /// Unit id to process (single mode).
        #[arg(long, required_if_eq("mode", "single"))]
        unit: Option<String>,

        /// Backlog JSON file (batch mode).
        #[arg(long, required_if_eq("mode", "batch"))]
        backlog: Option<PathBuf>,

        /// Only schedule backlog items carrying one of these labels.
        #[arg(long)]
        filter: Vec<String>,

        /// Override the configured batch size.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Run identifier; generated from the current time when omitted.
        #[arg(long)]
        run_id: Option<String>,

        /// Command invoked as the phase worker: `<cmd> <phase> <unit-id>`.
        #[arg(long)]
        worker_cmd: String,
    },

    /// Resume an interrupted run from environment ground truth.
    Resume {
        #[arg(long)]
        run_id: String,

        /// Continue executing after reconciliation; omit to only print
        /// the computed resume points.
        #[arg(long)]
        worker_cmd: Option<String>,
    },

    /// Print the report for a saved run.
    Report {
        #[arg(long)]
        run_id: String,

        /// Emit the report as JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match load_config(cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            std::process::exit(1);
        }
    };

    let code = match dispatch(cli.command, config).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "run failed");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn load_config(stem: Option<PathBuf>) -> OrchestratorResult<OrchestratorConfig> {
    match stem {
        Some(stem) => OrchestratorConfig::load_from(stem),
        None => OrchestratorConfig::load(),
    }
}

fn exit_code_for(err: &OrchestratorError) -> i32 {
    match err {
        OrchestratorError::AmbiguousResumption { .. } => 2,
        _ => 1,
    }
}

async fn dispatch(command: Command, config: OrchestratorConfig) -> OrchestratorResult<i32> {
    match command {
        Command::Run {
            mode: Mode::Single,
            unit,
            run_id,
            worker_cmd,
            ..
        } => {
            // `unit` is enforced by clap in single mode.
            let unit = unit.expect("clap enforces --unit");
            run_single(&config, generate_run_id(run_id), &unit, &worker_cmd).await
        }
        Command::Run {
            mode: Mode::Batch,
            backlog,
            filter,
            batch_size,
            run_id,
            worker_cmd,
            ..
        } => {
            let backlog = backlog.expect("clap enforces --backlog");
            let config = match batch_size {
                Some(size) => config.with_batch_size(size).validated()?,
                None => config,
            };
            run_batch(&config, generate_run_id(run_id), &backlog, &filter, &worker_cmd).await
        }
        Command::Resume { run_id, worker_cmd } => {
            resume_run(&config, &run_id, worker_cmd.as_deref()).await
        }
        Command::Report { run_id, json } => report_run(&config, &run_id, json),
    }
}

fn generate_run_id(explicit: Option<String>) -> String {
    explicit.unwrap_or_else(|| format!("run-{}", Utc::now().format("%Y%m%d-%H%M%S")))
}

/// Cancellation signal wired to ctrl-c.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight work");
            let _ = tx.send(true);
        }
    });
    rx
}

fn build_registry(worker_cmd: &str) -> WorkerRegistry {
    let worker = Arc::new(CommandWorker::new(worker_cmd));
    WorkerRegistry::new().register_all(&Phase::default_pipeline(), worker)
}

async fn run_single(
    config: &OrchestratorConfig,
    run_id: String,
    unit_id: &str,
    worker_cmd: &str,
) -> OrchestratorResult<i32> {
    let store = StateStore::new(&config.state_dir)?;
    let mut state = WorkflowState::new(&run_id, RunMode::SingleTask, Phase::default_pipeline());
    let unit = UnitRecord::new(unit_id, Phase::Planning);
    state.upsert_unit(unit.clone());
    store.save(&mut state)?;
    info!(run_id = %run_id, unit_id, "starting single-unit run");

    let machine = PhaseStateMachine::new(state.phase_definition.clone());
    let registry = build_registry(worker_cmd);
    let gate = QualityGateValidator::new();
    let cancel = cancel_on_ctrl_c();

    drive_unit(
        config, &store, &mut state, &machine, &registry, &gate, unit, cancel,
    )
    .await?;

    finish(&store, &mut state)
}

/// Run one unit through the pipeline with per-phase checkpoint saves
/// and the per-unit timeout applied to the whole traversal.
#[allow(clippy::too_many_arguments)]
async fn drive_unit(
    config: &OrchestratorConfig,
    store: &StateStore,
    state: &mut WorkflowState,
    machine: &PhaseStateMachine,
    registry: &WorkerRegistry,
    gate: &QualityGateValidator,
    unit: UnitRecord,
    cancel: watch::Receiver<bool>,
) -> OrchestratorResult<()> {
    let mut fallback = unit.clone();

    let pipeline = state.phase_definition.clone();
    let run = machine.run_unit(unit, registry, gate, config.retry_limit, cancel, |u| {
        if let Some(index) = pipeline.iter().position(|p| *p == u.current_phase) {
            state.advance_phase_cursor(index);
        }
        state.upsert_unit(u.clone());
        store.save(state)
    });

    let outcome = timeout(config.timeouts.unit_timeout(), run).await;
    match outcome {
        Ok(Ok(record)) => {
            state.upsert_unit(record);
        }
        Ok(Err(err)) => return Err(err),
        Err(_) => {
            fallback.mark_failed(
                FailureKind::Timeout,
                format!(
                    "timed out after {}s",
                    config.timeouts.unit_timeout().as_secs()
                ),
            );
            state.upsert_unit(fallback);
        }
    }
    store.save(state)?;
    Ok(())
}

async fn run_batch(
    config: &OrchestratorConfig,
    run_id: String,
    backlog_path: &std::path::Path,
    filter: &[String],
    worker_cmd: &str,
) -> OrchestratorResult<i32> {
    let items: Vec<BacklogItem> = backlog::load_backlog(backlog_path)?
        .into_iter()
        .filter(|item| item.matches_filter(filter))
        .collect();
    if items.is_empty() {
        return Err(OrchestratorError::Planning(format!(
            "no backlog items in {} match the filter",
            backlog_path.display()
        )));
    }

    let pipeline = Phase::default_pipeline();
    let units: Vec<UnitRecord> = items
        .into_iter()
        .map(|item| item.into_unit(pipeline[0]))
        .collect();
    let batches = BatchPlanner::new(config.batch_size).plan(&units)?;
    info!(
        run_id = %run_id,
        units = units.len(),
        batches = batches.len(),
        "backlog planned"
    );

    let store = StateStore::new(&config.state_dir)?;
    let mut state = WorkflowState::new(&run_id, RunMode::MultiBatch, pipeline.clone());
    for unit in units {
        state.upsert_unit(unit);
    }
    state.batches = batches;
    store.save(&mut state)?;

    let coordinator = ParallelExecutionCoordinator::new(
        Arc::new(PhaseStateMachine::new(pipeline)),
        build_registry(worker_cmd),
        Arc::new(QualityGateValidator::new()),
        config,
    );
    coordinator
        .run_from(&mut state, &store, cancel_on_ctrl_c())
        .await?;

    finish(&store, &mut state)
}

async fn resume_run(
    config: &OrchestratorConfig,
    run_id: &str,
    worker_cmd: Option<&str>,
) -> OrchestratorResult<i32> {
    let store = StateStore::new(&config.state_dir)?;
    let mut state = store.load(run_id)?.ok_or_else(|| {
        OrchestratorError::Planning(format!(
            "no saved state for run {} under {}",
            run_id,
            config.state_dir.display()
        ))
    })?;

    let probe = GitHubProbe::new(&config.repo.owner, &config.repo.repo, ".");
    let analyzer = ResumptionAnalyzer::new(&probe, &config.repo.base_branch);

    let pending: Vec<String> = state
        .units
        .values()
        .filter(|u| !u.status.is_terminal())
        .map(|u| u.unit_id.clone())
        .collect();
    for unit_id in &pending {
        let unit = state.units[unit_id].clone();
        let analysis = timeout(
            config.timeouts.probe_timeout(),
            analyzer.analyze_unit(Some(&unit), unit_id, &unit.expected_branch()),
        )
        .await;
        let decision = match analysis {
            Ok(decision) => decision?,
            Err(_) => {
                return Err(OrchestratorError::EnvironmentQuery(format!(
                    "probe timed out after {}s for unit {}",
                    config.timeouts.probe_timeout().as_secs(),
                    unit_id
                )))
            }
        };
        println!(
            "{}: resume at {} ({}){}",
            unit_id,
            decision.phase,
            decision.rule,
            if decision.overrode_saved {
                " [environment overrode saved state]"
            } else {
                ""
            }
        );
        let record = state.units.get_mut(unit_id).expect("unit present");
        record.current_phase = decision.phase;
    }
    store.save(&mut state)?;

    let Some(worker_cmd) = worker_cmd else {
        // Reconciliation only.
        return Ok(0);
    };

    let pipeline = state.phase_definition.clone();
    let machine = PhaseStateMachine::new(pipeline.clone());
    let registry = build_registry(worker_cmd);
    let gate = QualityGateValidator::new();
    let cancel = cancel_on_ctrl_c();

    match state.mode {
        RunMode::SingleTask => {
            for unit_id in pending {
                let unit = state.units[&unit_id].clone();
                drive_unit(
                    config,
                    &store,
                    &mut state,
                    &machine,
                    &registry,
                    &gate,
                    unit,
                    cancel.clone(),
                )
                .await?;
            }
        }
        RunMode::MultiBatch => {
            let coordinator = ParallelExecutionCoordinator::new(
                Arc::new(machine),
                registry,
                Arc::new(gate),
                config,
            );
            coordinator.run_from(&mut state, &store, cancel).await?;
        }
    }

    finish(&store, &mut state)
}

fn report_run(config: &OrchestratorConfig, run_id: &str, json: bool) -> OrchestratorResult<i32> {
    let store = StateStore::new(&config.state_dir)?;
    // Successful runs have been moved to the archive.
    let state = match store.load(run_id)? {
        Some(state) => state,
        None => store.load_archived(run_id)?.ok_or_else(|| {
            OrchestratorError::Planning(format!(
                "no saved state for run {} under {}",
                run_id,
                config.state_dir.display()
            ))
        })?,
    };

    let report = ReportAggregator::new().aggregate(&state);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(if report.is_clean() { 0 } else { 1 })
}

/// Persist the final state, print the report, and compute the exit code.
/// Fully successful runs are archived; failed runs stay in the live
/// state directory for forensic resume.
fn finish(store: &StateStore, state: &mut WorkflowState) -> OrchestratorResult<i32> {
    store.save(state)?;
    let report = ReportAggregator::new().aggregate(state);
    print!("{}", report.render_text());
    if state.is_terminal_success() {
        store.archive(&state.run_id)?;
    }
    Ok(if report.is_clean() { 0 } else { 1 })
}
