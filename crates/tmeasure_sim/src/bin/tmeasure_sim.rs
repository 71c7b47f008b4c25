use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tmeasure_core::{ExecutorConfig, TransformationSet};
use tmeasure_sim::{run_experiment, ExperimentConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "tmeasure-sim")]
#[command(about = "Transformation-invariance measures on a synthetic network")]
struct Cli {
    #[command(flatten)]
    executor: ExecutorConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate every measure of an experiment
    Run {
        /// Experiment TOML; built-in defaults when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the transformations of an experiment's set
    Transformations {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the default experiment as TOML
    InitConfig,
}

fn load(path: Option<&PathBuf>) -> Result<ExperimentConfig> {
    match path {
        Some(path) => ExperimentConfig::load(path),
        None => Ok(ExperimentConfig::default()),
    }
}

fn main() -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, json } => {
            let experiment = load(config.as_ref())?;
            info!(measures = experiment.measures.len(), "starting experiment");
            let report = run_experiment(&experiment, cli.executor)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{} ({} transformations, digest {})",
                    report.transformations, report.transformation_count, report.digest
                );
                for result in &report.results {
                    println!("{}", result);
                }
            }
        }
        Commands::Transformations { config } => {
            let experiment = load(config.as_ref())?;
            let set = TransformationSet::from_sizes(experiment.transformations);
            println!("{}", set.id());
            for (i, t) in set.iter().enumerate() {
                println!("{:>4} {}", i, t);
            }
        }
        Commands::InitConfig => {
            println!("{}", toml::to_string_pretty(&ExperimentConfig::default())?);
        }
    }
    Ok(())
}
