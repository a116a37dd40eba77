//! End-to-End Test Runner for the Mesh

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use mesh_e2e::{all_scenarios, run_scenario, TestResult};
use tracing::{info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scenario to run, or "all"
    #[arg(short, long, default_value = "all")]
    scenario: String,

    /// Write results as JSON to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive(format!("mesh_e2e={level}").parse()?)
                .add_directive(format!("mesh_network={level}").parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting mesh E2E suite v{}", env!("CARGO_PKG_VERSION"));

    let scenarios: Vec<_> = all_scenarios()
        .into_iter()
        .filter(|scenario| args.scenario == "all" || scenario.name() == args.scenario)
        .collect();
    if scenarios.is_empty() {
        bail!("Unknown scenario: {}", args.scenario);
    }

    let mut results: Vec<TestResult> = Vec::with_capacity(scenarios.len());
    for scenario in &scenarios {
        results.push(run_scenario(scenario.as_ref()).await);
    }

    let passed = results.iter().filter(|result| result.success).count();
    info!("📊 {passed}/{} scenarios passed", results.len());

    if let Some(path) = &args.output {
        let json = serde_json::to_string_pretty(&results)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write results to {}", path.display()))?;
        info!("Results written to {}", path.display());
    }

    if passed != results.len() {
        bail!("{} scenario(s) failed", results.len() - passed);
    }
    Ok(())
}
