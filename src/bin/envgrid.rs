//! Batch harmonization of environmental rasters onto a shared multi-resolution grid.

use anyhow::{Context, Result};
use clap::Parser;
use envgrid::config::Config;
use envgrid::pipeline::BatchProcessor;
use envgrid::types::Measure;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "envgrid")]
#[command(about = "Harmonize environmental rasters onto a common equal-area grid")]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "ENVGRID_CONFIG")]
    config: std::path::PathBuf,

    /// Only process these measures (name or code), repeatable
    #[arg(short, long = "measure")]
    measures: Vec<String>,

    /// Concurrent measure pipelines (default: from config, else number of CPU cores)
    #[arg(long)]
    workers: Option<usize>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.log_level.as_str()))
        .format_timestamp_millis()
        .init();

    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every selected measure succeeded
fn run(args: Args) -> Result<bool> {
    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(workers) = args.workers {
        config.workers = Some(workers);
    }
    config.validate()?;

    let mut specs = config.measure_specs();
    if !args.measures.is_empty() {
        let selects = |wanted: &str, spec: &envgrid::types::MeasureSpec| {
            spec.code == wanted || wanted.parse::<Measure>().map_or(false, |m| m == spec.measure)
        };
        if let Some(unknown) = args.measures.iter().find(|w| !specs.iter().any(|s| selects(w.as_str(), s))) {
            anyhow::bail!("measure {:?} is not configured", unknown);
        }
        specs.retain(|spec| args.measures.iter().any(|w| selects(w.as_str(), spec)));
    }

    let batch = BatchProcessor::from_config(&config)?;
    let report = batch.run(&specs)?;

    println!("{:<15} {:<8} {:<10} {:>7} {:>9}  status", "measure", "code", "kind", "sources", "outputs");
    for m in &report.measures {
        let status = match (&m.error, m.failed_outputs.as_slice()) {
            (Some(e), _) => format!("FAILED: {}", e),
            (None, []) => "ok".to_string(),
            (None, failed) => {
                let sizes: Vec<String> = failed.iter().map(|f| f.cell_size.to_string()).collect();
                format!("PARTIAL: failed at {}", sizes.join(", "))
            }
        };
        println!(
            "{:<15} {:<8} {:<10} {:>7} {:>9}  {}",
            m.measure.name(),
            m.code,
            m.kind.to_string(),
            m.source_count,
            m.outputs.len(),
            status
        );
    }

    std::fs::create_dir_all(&config.output_dir)?;
    let report_path = config.output_dir.join("run_report.json");
    report.write_json(&report_path)?;
    log::info!("Run report written to {}", report_path.display());

    Ok(report.is_success())
}
