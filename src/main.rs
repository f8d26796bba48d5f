use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use formatter_core::{ScenarioProcessor, ScenarioReport};
use log::{error, info};
use std::path::PathBuf;

mod config;

use config::{load_mappings, load_properties, FormatterSettings};

#[derive(Parser)]
#[command(name = "marmot_formatter")]
#[command(about = "Format production-cost model results into per-scenario stores")]
struct Args {
    /// Settings file (YAML)
    #[arg(short, long, default_value = "formatter.yml")]
    config: PathBuf,

    /// Scenario to format; repeat for several. Defaults to the settings list
    #[arg(short, long)]
    scenario: Vec<String>,

    /// Process only this 1-based row of the properties table
    #[arg(long)]
    row: Option<usize>,

    /// Write the default settings to --config and exit
    #[arg(long)]
    init_config: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "summary")]
    output: OutputFormat,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Json,
    Summary,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.init_config {
        FormatterSettings::write_default(&args.config)?;
        println!("Wrote default settings to {}", args.config.display());
        return Ok(());
    }

    let settings = FormatterSettings::load(&args.config)?;
    let scenarios = if args.scenario.is_empty() {
        settings.scenarios.clone()
    } else {
        args.scenario.clone()
    };
    if scenarios.is_empty() {
        bail!("No scenarios given on the command line or in {}", args.config.display());
    }

    let properties = load_properties(&settings.properties_file, args.row)?;
    let mappings = load_mappings(&settings)?;
    let processor = ScenarioProcessor::new(settings.pipeline_options(), mappings, properties);

    let mut reports = Vec::new();
    let mut failed = Vec::new();
    for scenario in &scenarios {
        info!("Formatting scenario {}", scenario);
        match processor.process_scenario(scenario) {
            Ok(report) => reports.push(report),
            Err(e) => {
                error!("Scenario {} failed: {}", scenario, e);
                failed.push(scenario.clone());
            }
        }
    }

    match args.output {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&reports)?;
            println!("{}", json);
        }
        OutputFormat::Summary => print_summary(&processor, &reports),
    }

    if !failed.is_empty() {
        bail!("{} of {} scenarios failed: {}", failed.len(), scenarios.len(), failed.join(", "));
    }
    Ok(())
}

fn print_summary(processor: &ScenarioProcessor, reports: &[ScenarioReport]) {
    println!("Formatting Summary");
    println!("==================");
    for report in reports {
        println!();
        println!("{} ({} partitions)", report.scenario, report.partitions);
        println!("  Store: {}", processor.store_path(&report.scenario).display());
        println!("  Written: {}", report.written.len());
        if !report.derived.is_empty() {
            println!("  Derived: {}", report.derived.join(", "));
        }
        if !report.skipped_existing.is_empty() {
            println!("  Already stored: {}", report.skipped_existing.len());
        }
        if !report.failed_writes.is_empty() {
            println!("  Failed writes: {}", report.failed_writes.join(", "));
        }
        if !report.failed_properties.is_empty() {
            println!("  Failed properties: {}", report.failed_properties.join(", "));
        }
        if !report.diagnostics.is_empty() {
            println!("  Diagnostics:");
            for diagnostic in &report.diagnostics {
                println!("    - {}", diagnostic);
            }
        }
    }
}
