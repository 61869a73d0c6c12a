use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod aggregate;
mod charts;
mod config;
mod engine;
mod error;
mod llm;
mod models;
mod narrative;
mod output;
mod planner;
mod rater;
mod report;
mod retry;

use crate::aggregate::{discover_eval_dirs, load_eval_dir};
use crate::config::{Config, RaterMode};
use crate::engine::EvaluationEngine;
use crate::llm::{ModelClient, OpenAiClient};
use crate::output::OutputFormat;
use crate::rater::Rater;

/// Semantic drift evaluation: rate generation loops and report on the results
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output - log every request and retry
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Rate every planned comparison of an experiment
    Evaluate {
        /// Experiment folder containing metadata.json
        exp_root: PathBuf,

        /// Override the configured rater mode
        #[arg(short, long)]
        mode: Option<RaterMode>,

        /// Output format: plain or json
        #[arg(short, long, default_value = "plain")]
        output: OutputFormat,
    },
    /// Render SVG charts for every eval folder under a path
    Charts { path: PathBuf },
    /// Render the HTML report for every eval folder under a path
    Report {
        path: PathBuf,

        /// File name of the report inside each eval folder
        #[arg(long)]
        output_name: Option<String>,
    },
    /// Write a qualitative narrative for every eval folder under a path
    Summary { eval_dir: PathBuf },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => {
            info!("No config file given, using defaults");
            Ok(Config::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Evaluate {
            exp_root,
            mode,
            output,
        } => {
            if let Some(mode) = mode {
                config.evaluation.mode = mode;
            }
            let loop_type = config.loop_config.loop_type()?;
            if let Some(n) = config.loop_config.num_iterations {
                info!("Loop configured for {} iterations", n);
            }
            let rater = Rater::from_config(&config.evaluation)?;
            let mut engine = EvaluationEngine::new(exp_root, loop_type, rater);
            let summary = engine.run().await?;
            output::print_summary(&summary, output);
        }
        Command::Charts { path } => {
            for eval_dir in discover_eval_dirs(&path)? {
                let table = load_eval_dir(&eval_dir)?;
                let written = charts::generate_charts(&table)?;
                if written.is_empty() {
                    warn!("No charts generated for {}", eval_dir.display());
                }
            }
        }
        Command::Report { path, output_name } => {
            let name = output_name.unwrap_or_else(|| config.reporting.report_name.clone());
            for eval_dir in discover_eval_dirs(&path)? {
                let table = load_eval_dir(&eval_dir)?;
                if let Some(written) =
                    report::generate_report(&table, config.reporting.top_drops, &name)?
                {
                    println!("{}", written.html.display());
                }
            }
        }
        Command::Summary { eval_dir } => {
            let settings = &config.evaluation;
            let client = OpenAiClient::from_env(
                &settings.env_var_api_key,
                &settings.api_endpoint,
                &config.reporting.narrative_model,
                config.reporting.narrative_temperature,
                settings.request_timeout(),
            )?;
            for dir in discover_eval_dirs(&eval_dir)? {
                let table = load_eval_dir(&dir)?;
                let (_, text) =
                    narrative::write_summary(&table, client.as_ref().map(|c| c as &dyn ModelClient))
                        .await
                        .with_context(|| {
                            format!(
                                "Failed to summarize {} (is {} set?)",
                                dir.display(),
                                settings.env_var_api_key
                            )
                        })?;
                println!("{}", output::preview(&text));
            }
        }
    }

    Ok(())
}
