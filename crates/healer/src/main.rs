//! Healer CLI
//!
//! Runs the Healer's pure checks from the command line: stuck sweeps over
//! task snapshots, error pattern detection on raw output, and scenario
//! classification of a single orchestrator event.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::io::Read as _;
use std::path::PathBuf;
use tracing::debug;

use healer::config::ProjectConfig;
use healer::events::OrchestratorEvent;
use healer::patterns::build_heuristics;
use healer::spells::{plan_spells, PlanOptions};
use healer::stuck::{summarize_stuck_detection, StuckOptions};
use healer::sweep::{load_json, SweepInputs};
use healer::types::{Scenario, SpellId};
use healer::{classify, detect_error_patterns, render_guidance};

/// Self-healing checks for coding-agent sessions
#[derive(Parser)]
#[command(name = "healer")]
#[command(about = "Self-healing checks for coding-agent sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (json or text)
    #[arg(long, default_value = "json", global = true)]
    format: OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan task and subtask snapshots for stuck work
    Stuck {
        /// JSON array of tasks
        #[arg(long)]
        tasks: Option<PathBuf>,

        /// JSON array of subtasks, each with its taskId
        #[arg(long)]
        subtasks: Option<PathBuf>,

        /// Trajectory JSON array, or a directory of trajectory files
        #[arg(long)]
        trajectories: Option<PathBuf>,

        /// Project config; its stuckThresholdHours sets the subtask threshold
        #[arg(long)]
        config: Option<PathBuf>,

        /// Hours before an in-progress task counts as stuck
        #[arg(long)]
        task_hours: Option<f64>,

        /// Hours before a started subtask counts as stuck
        #[arg(long)]
        subtask_hours: Option<f64>,

        /// Consecutive failures before a subtask counts as stuck
        #[arg(long)]
        min_failures: Option<u32>,

        /// Skip mining trajectories for recurring failures
        #[arg(long)]
        no_trajectories: bool,
    },
    /// Detect known error categories in tool output
    Patterns {
        /// File to scan (reads stdin when omitted)
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Classify an orchestrator event and plan its spells
    Classify {
        /// Orchestrator event JSON
        #[arg(long)]
        event: PathBuf,

        /// Project config JSON (defaults apply when omitted)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Plan as if a code agent were available
        #[arg(long)]
        with_agent: bool,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PatternReport {
    patterns: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClassifyReport {
    event: &'static str,
    scenario: Option<Scenario>,
    repeated: bool,
    spells: Vec<SpellId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    guidance: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("healer=debug")
            .init();
    }

    match cli.command {
        Commands::Stuck {
            tasks,
            subtasks,
            trajectories,
            config,
            task_hours,
            subtask_hours,
            min_failures,
            no_trajectories,
        } => {
            let mut opts = match config {
                Some(path) => StuckOptions::for_config(
                    &ProjectConfig::load(&path)
                        .with_context(|| format!("Failed to load config {}", path.display()))?
                        .healer,
                ),
                None => StuckOptions::default(),
            };
            if let Some(hours) = task_hours {
                opts.stuck_task_threshold_hours = hours;
            }
            if let Some(hours) = subtask_hours {
                opts.stuck_subtask_threshold_hours = hours;
            }
            if let Some(min) = min_failures {
                opts.min_consecutive_failures = min;
            }
            opts.scan_trajectories = !no_trajectories;

            let inputs = SweepInputs::load(
                tasks.as_deref(),
                subtasks.as_deref(),
                trajectories.as_deref(),
            )
            .context("Failed to load sweep inputs")?;
            debug!(
                tasks = inputs.tasks.len(),
                subtasks = inputs.subtasks.len(),
                trajectories = inputs.trajectories.len(),
                "Running stuck sweep"
            );

            let detection = inputs.detect(&opts);
            match cli.format {
                OutputFormat::Json => output_json(&detection)?,
                OutputFormat::Text => {
                    let summary = summarize_stuck_detection(&detection);
                    if detection.is_empty() {
                        println!("{}", summary.green());
                    } else {
                        println!("{}", summary.yellow());
                    }
                }
            }
        }
        Commands::Patterns { input } => {
            let output = match input {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("Failed to read stdin")?;
                    buf
                }
            };

            let report = PatternReport {
                patterns: detect_error_patterns(Some(&output)),
            };
            match cli.format {
                OutputFormat::Json => output_json(&report)?,
                OutputFormat::Text if report.patterns.is_empty() => {
                    println!("{}", "No known error patterns".green());
                }
                OutputFormat::Text => {
                    for pattern in &report.patterns {
                        println!("  {} {pattern}", "✗".red());
                    }
                }
            }
        }
        Commands::Classify {
            event,
            config,
            with_agent,
        } => {
            let parsed: OrchestratorEvent = load_json(&event)
                .with_context(|| format!("Failed to read event {}", event.display()))?;
            let project = match config {
                Some(path) => ProjectConfig::load(&path)
                    .with_context(|| format!("Failed to load config {}", path.display()))?,
                None => ProjectConfig::default(),
            };
            let healer_config = &project.healer;

            let report = match classify(&parsed, healer_config) {
                Some(matched) => {
                    let spells = plan_spells(
                        matched,
                        healer_config,
                        PlanOptions::for_executor(with_agent, healer_config),
                    )?;
                    let mut heuristics = build_heuristics(
                        matched.scenario,
                        parsed.failure_output(),
                        parsed.failure_count(),
                    );
                    heuristics.repeated = matched.repeated;
                    ClassifyReport {
                        event: parsed.kind(),
                        scenario: Some(matched.scenario),
                        repeated: matched.repeated,
                        spells,
                        guidance: Some(render_guidance(&heuristics)),
                    }
                }
                None => ClassifyReport {
                    event: parsed.kind(),
                    scenario: None,
                    repeated: false,
                    spells: Vec::new(),
                    guidance: None,
                },
            };

            match cli.format {
                OutputFormat::Json => output_json(&report)?,
                OutputFormat::Text => print_classify_text(&report),
            }
        }
    }

    Ok(())
}

fn print_classify_text(report: &ClassifyReport) {
    let Some(scenario) = report.scenario else {
        println!(
            "{}",
            format!("No healer scenario for '{}'", report.event).green()
        );
        return;
    };

    let label = if report.repeated {
        format!("{scenario} (repeated)")
    } else {
        scenario.to_string()
    };
    println!("{} {}", "Scenario:".bold(), label.yellow());
    for (i, spell) in report.spells.iter().enumerate() {
        println!("  {}. {spell}", i + 1);
    }
    if let Some(guidance) = &report.guidance {
        println!();
        println!("{guidance}");
    }
}

fn output_json<T: Serialize>(result: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(result)?;
    println!("{json}");
    Ok(())
}
