use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use linkorder_kernel::chain::ChainConfig;
use linkorder_kernel::invariants::InvariantViolation;
use linkorder_kernel::simulate::{declared_partitions, simulate, PartitionOrder, ScriptOp};

/// Linkorder chain simulator CLI
#[derive(Parser, Debug)]
#[command(name = "linkorder")]
#[command(about = "Replay chain operations and print the resulting order", long_about = None)]
struct Cli {
    /// Path to the operation script JSON
    #[arg(long)]
    script: String,

    /// Path to chain config JSON
    #[arg(long)]
    config: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log_level: String,
}

/// Wrapper for JSON output
#[derive(Debug, Serialize)]
struct CliOutput {
    steps_applied: usize,
    declared: BTreeMap<String, usize>,
    partitions: Vec<PartitionOrder>,
    violations: Vec<InvariantViolation>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // ----------------------------
    // Load script
    // ----------------------------
    let script_data = fs::read_to_string(&cli.script)
        .with_context(|| format!("reading script {}", cli.script))?;
    let script: Vec<ScriptOp> = serde_json::from_str(&script_data)?;

    // ----------------------------
    // Load config
    // ----------------------------
    let config = if let Some(path) = cli.config {
        let data = fs::read_to_string(&path).with_context(|| format!("reading config {path}"))?;
        serde_json::from_str::<ChainConfig>(&data)?
    } else {
        ChainConfig::default_config()
    };
    tracing::info!(steps = script.len(), ?config, "running script");

    // ----------------------------
    // Run simulation
    // ----------------------------
    let result = simulate(&script, &config)?;
    if !result.is_sound() {
        tracing::warn!(violations = result.violations.len(), "chain invariants violated");
    }

    // ----------------------------
    // Output
    // ----------------------------
    let output = CliOutput {
        steps_applied: result.steps_applied,
        declared: declared_partitions(&script),
        partitions: result.partitions,
        violations: result.violations,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
