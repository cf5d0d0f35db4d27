// src/main.rs
//
// Command-line entrypoint for arcade_replay.
//
// Commands:
// - record --run-config <path>: record a run, with the telemetry collector in
//   the background unless ARCADE_REPLAY_TELEMETRY_MODE=off; Ctrl-C cancels
//   between steps
// - replay --run-id <id> [--episode <id>]: verify recorded episodes
// - inspect-telemetry --run-id <id> [--raw]: summarise or dump telemetry
// - list-envs, list-policies
//
// Replay exit codes: 0 MATCH, 2 DIVERGED, 3 ERROR, 4 incomplete episode,
// 1 any other failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use arcade_replay::config::{RunConfig, Settings};
use arcade_replay::env::{get_env_spec, list_envs, BuiltinEnvs};
use arcade_replay::logging::init_tracing;
use arcade_replay::metrics::TelemetrySummary;
use arcade_replay::policy::list_policies;
use arcade_replay::replay::{ReplayEngine, ReplayError, RunVerification, VerdictResult};
use arcade_replay::runner::{CancelFlag, Runner};
use arcade_replay::store::{RunStatus, TelemetryStore};
use arcade_replay::telemetry::{CollectorConfig, ProgressSender, TelemetryCollector};
use arcade_replay::types::{EpisodeId, RunId};

const EXIT_DIVERGED: u8 = 2;
const EXIT_ERROR: u8 = 3;
const EXIT_INCOMPLETE: u8 = 4;

#[derive(Debug, Parser)]
#[command(
    name = "arcade_replay",
    about = "Deterministic record/replay and telemetry for Atari-style RL environments",
    version
)]
struct Cli {
    /// Store root (overrides ARCADE_REPLAY_RUNS_DIR).
    #[arg(long, global = true)]
    runs_dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record a run described by a YAML/JSON run config.
    Record {
        #[arg(long)]
        run_config: PathBuf,
    },
    /// Replay recorded episodes and report MATCH / DIVERGED / ERROR.
    Replay {
        #[arg(long)]
        run_id: RunId,
        /// Replay a single episode instead of the whole run.
        #[arg(long)]
        episode: Option<EpisodeId>,
    },
    /// Summarise a run's telemetry.
    InspectTelemetry {
        #[arg(long)]
        run_id: RunId,
        /// Print raw JSONL records instead of a summary.
        #[arg(long)]
        raw: bool,
    },
    /// List registered environments.
    ListEnvs,
    /// List built-in policies.
    ListPolicies,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut settings = Settings::from_env();
    if let Some(dir) = cli.runs_dir {
        settings.runs_dir = dir;
    }

    let result = match cli.command {
        Command::Record { run_config } => cmd_record(&settings, run_config),
        Command::Replay { run_id, episode } => cmd_replay(&settings, &run_id, episode),
        Command::InspectTelemetry { run_id, raw } => cmd_inspect(&settings, &run_id, raw),
        Command::ListEnvs => {
            cmd_list_envs();
            Ok(ExitCode::SUCCESS)
        }
        Command::ListPolicies => {
            for name in list_policies() {
                println!("{name}");
            }
            Ok(ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn open_store(settings: &Settings) -> Result<Arc<TelemetryStore>> {
    let store = TelemetryStore::from_settings(settings)
        .with_context(|| format!("opening store at {}", settings.runs_dir.display()))?;
    Ok(Arc::new(store))
}

fn cmd_record(settings: &Settings, run_config: PathBuf) -> Result<ExitCode> {
    let config = RunConfig::from_file(&run_config)?;
    get_env_spec(&config.env_id)?;
    let store = open_store(settings)?;
    let run_id = config.resolve_run_id();
    if store.run_exists(&run_id) {
        bail!("run '{run_id}' already exists under {}", store.root().display());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting tokio runtime")?;
    let telemetry_enabled = settings.telemetry_enabled;

    runtime.block_on(async move {
        let cancel = CancelFlag::new();
        let (progress, collector) = if telemetry_enabled {
            let (progress, handle) = TelemetryCollector::new(
                run_id.clone(),
                Arc::clone(&store),
                CollectorConfig::from(&config),
            )
            .with_default_sources()
            .spawn();
            (progress, Some(handle))
        } else {
            (ProgressSender::disabled(), None)
        };

        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling after the current step");
                    cancel.cancel();
                }
            })
        };

        let runner = Runner::new(Arc::clone(&store), BuiltinEnvs)
            .with_cancel(cancel)
            .with_progress(progress);
        let (task_run_id, task_config) = (run_id.clone(), config.clone());
        let recorded =
            tokio::task::spawn_blocking(move || runner.record_run(&task_run_id, &task_config))
                .await;
        interrupt.abort();

        let telemetry = match collector {
            Some(handle) => Some(handle.shutdown().await),
            None => None,
        };
        let summary = recorded
            .context("record task failed")?
            .with_context(|| format!("recording run '{run_id}'"))?;
        // A write can still fail in the final drain, after the manifest was
        // written as finished.
        let stats = match telemetry {
            Some(Err(e)) => {
                store
                    .set_run_status(&run_id, RunStatus::Aborted)
                    .with_context(|| format!("marking run '{run_id}' aborted"))?;
                return Err(anyhow::Error::new(e).context(format!("recording run '{run_id}'")));
            }
            Some(Ok(stats)) => Some(stats),
            None => None,
        };

        let returns = summary.return_stats();
        println!("run_id={}", summary.run_id);
        println!("status={}", summary.status.as_str());
        println!(
            "episodes={} completed={} truncated={} failed={}",
            summary.counts.total(),
            summary.counts.completed,
            summary.counts.truncated,
            summary.counts.failed
        );
        println!("steps={}", summary.total_steps());
        if !returns.is_empty() {
            println!(
                "return_mean={:.4} return_min={:.4} return_max={:.4}",
                returns.mean(),
                returns.min(),
                returns.max()
            );
        }
        if let Some(stats) = stats {
            println!(
                "telemetry_records={} unavailable={} write_errors={}",
                stats.records_written, stats.unavailable, stats.write_errors
            );
        }

        Ok::<_, anyhow::Error>(match summary.status {
            RunStatus::Completed => ExitCode::SUCCESS,
            _ => ExitCode::FAILURE,
        })
    })
}

fn cmd_replay(settings: &Settings, run_id: &RunId, episode: Option<EpisodeId>) -> Result<ExitCode> {
    let store = open_store(settings)?;
    let engine = ReplayEngine::new(store, BuiltinEnvs);

    let verification = match episode {
        Some(episode_id) => match engine.verify_episode(run_id, episode_id) {
            Ok(verdict) => RunVerification {
                verdicts: vec![verdict],
                incomplete: Vec::new(),
            },
            Err(e @ ReplayError::IncompleteEpisode { .. }) => {
                eprintln!("error: {e}");
                return Ok(ExitCode::from(EXIT_INCOMPLETE));
            }
            Err(e) => return Err(e.into()),
        },
        None => engine.verify_run(run_id)?,
    };

    for verdict in &verification.verdicts {
        println!("{verdict}");
    }
    for episode_id in &verification.incomplete {
        println!("run={run_id} episode={episode_id} result=INCOMPLETE");
    }
    println!(
        "match={} diverged={} error={} incomplete={}",
        verification.count(VerdictResult::Match),
        verification.count(VerdictResult::Diverged),
        verification.count(VerdictResult::Error),
        verification.incomplete.len()
    );

    Ok(exit_code_for(&verification))
}

fn exit_code_for(verification: &RunVerification) -> ExitCode {
    if verification.count(VerdictResult::Diverged) > 0 {
        ExitCode::from(EXIT_DIVERGED)
    } else if verification.count(VerdictResult::Error) > 0 {
        ExitCode::from(EXIT_ERROR)
    } else if !verification.incomplete.is_empty() {
        ExitCode::from(EXIT_INCOMPLETE)
    } else {
        ExitCode::SUCCESS
    }
}

fn cmd_inspect(settings: &Settings, run_id: &RunId, raw: bool) -> Result<ExitCode> {
    let store = open_store(settings)?;
    let records = store.read_telemetry(run_id)?;

    if raw {
        for record in records {
            let record =
                record.with_context(|| format!("reading telemetry of run '{run_id}'"))?;
            println!("{}", serde_json::to_string(&record)?);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let manifest = store.load_manifest(run_id)?;
    let summary = TelemetrySummary::from_stream(records)
        .with_context(|| format!("reading telemetry of run '{run_id}'"))?;
    println!("run_id={}", manifest.run_id);
    println!("status={}", manifest.status.as_str());
    println!("env_id={}", manifest.config.env_id);
    println!("records={}", summary.records());
    println!();
    println!(
        "{:<24} {:>8} {:>14} {:>14} {:>14} {:>14}",
        "metric", "count", "mean", "min", "max", "last"
    );
    for m in summary.metrics() {
        println!(
            "{:<24} {:>8} {:>14.4} {:>14.4} {:>14.4} {:>14.4}",
            m.metric_name, m.count, m.mean, m.min, m.max, m.last
        );
    }
    if !summary.unavailable().is_empty() {
        println!();
        println!("unavailable:");
        for (metric, count) in summary.unavailable() {
            println!("  {metric:<22} {count:>8}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_list_envs() {
    for spec in list_envs() {
        println!(
            "{:<16} {:<18} {:<8} {}",
            spec.key,
            spec.env_id,
            spec.obs_type.as_str(),
            spec.description
        );
    }
}
