//! patientdb: the pipeline CLI
//!
//! # Usage
//!
//! ```bash
//! # Everything: prefix raw files, split by patient, merge, write load script
//! patientdb --input-dir data/raw --output-dir data run --prefix
//!
//! # Query every merged table and report
//! patientdb --output-dir data stress
//!
//! # Materialize the load script into a SQLite file, then query it
//! patientdb --output-dir data --database-url 'sqlite://patients.db?mode=rwc' load
//! patientdb --output-dir data --database-url 'sqlite://patients.db' stress --preloaded
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use patientdb::harness::{QualityBand, SpeedBand};
use patientdb::pipeline::{self, PipelineSummary};
use patientdb::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "patientdb")]
#[command(version)]
#[command(about = "Patient-centric SQL tables from per-resource clinical CSV files", long_about = None)]
#[command(after_help = "EXAMPLES:
    patientdb --input-dir raw --output-dir out run --prefix --clean
    patientdb --output-dir out stress --format json
    patientdb --output-dir out --database-url 'sqlite://p.db?mode=rwc' load")]
struct Cli {
    /// Config file (default: ./patientdb.toml, then the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the raw resource CSV files
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Destination root for patient folders and the load script
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Roster file name
    #[arg(long)]
    roster: Option<String>,

    /// Database connection URL
    #[arg(long, env = "PATIENTDB_DATABASE_URL")]
    database_url: Option<String>,

    /// Output format for reports
    #[arg(short, long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Prefix every resource file's columns in place (not idempotent)
    Prefix,
    /// Split resource files into per-patient folders
    Segregate,
    /// Merge each patient folder into one wide table
    Merge,
    /// Collapse doubled prefixes in merged tables
    Normalize,
    /// Delete resource subsets, keeping merged tables
    Clean,
    /// Generate the load script
    Schema {
        /// Write the script here instead of the configured location
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Apply a load script to the database in one transaction
    Load {
        /// Script to apply (default: the configured load script)
        #[arg(short, long)]
        script: Option<PathBuf>,
    },
    /// Run the query harness against every patient
    Stress {
        /// Query tables already in the database instead of staging merged files
        #[arg(long)]
        preloaded: bool,
    },
    /// Run all file stages
    Run {
        /// Prefix raw files first
        #[arg(long)]
        prefix: bool,
        /// Delete resource subsets after merging
        #[arg(long)]
        clean: bool,
        /// Run the query harness afterwards
        #[arg(long)]
        stress: bool,
    },
    /// Show the harness queries
    Queries,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = dispatch(&cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "patientdb=debug" } else { "patientdb=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(dir) = &cli.input_dir {
        config.input_dir = dir.clone();
    }
    if let Some(dir) = &cli.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(roster) = &cli.roster {
        config.roster_name = roster.clone();
    }
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }
    Ok(config)
}

async fn dispatch(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    if cli.verbose {
        println!("{} {}", "Input:".dimmed(), config.input_dir.display());
        println!("{} {}", "Output:".dimmed(), config.output_dir.display());
    }

    match &cli.command {
        Commands::Prefix => {
            let report = patientdb::prefix::prefix_directory(&config.input_dir, &config.id_aliases)?;
            for (file, renames) in &report.files {
                println!("{} {} ({} columns)", "✓".green(), file, renames.len());
            }
            for (file, err) in &report.failures {
                println!("{} {}: {}", "✗".red(), file, err);
            }
        }
        Commands::Segregate => match patientdb::segregate::segregate(&config) {
            Ok(report) => {
                println!(
                    "{} Created {} patient folders ({} files) keyed on '{}'",
                    "✓".green(),
                    report.patients.len(),
                    report.files_written(),
                    report.roster_column.cyan()
                );
                if !report.resources_without_id.is_empty() {
                    println!(
                        "  {} {}",
                        "No identifier column:".dimmed(),
                        report.resources_without_id.join(", ")
                    );
                }
            }
            Err(e) if e.is_roster_condition() => {
                println!("{} {}", "⚠".yellow(), e.to_string().yellow());
            }
            Err(e) => return Err(e.into()),
        },
        Commands::Merge => {
            let report = patientdb::merge::merge_all(&config.patients_root(), &config.merged_file_name)?;
            println!("{} Merged {} patients", "✓".green(), report.merged.len());
            for (patient, err) in &report.failures {
                println!("{} {}: {}", "✗".red(), patient, err);
            }
        }
        Commands::Normalize => {
            let changed =
                patientdb::normalize::normalize_all(&config.patients_root(), &config.merged_file_name)?;
            for (patient, report) in &changed {
                println!("{} {}: {} renamed", "✓".green(), patient, report.count());
                for r in &report.renamed {
                    println!("    {} → {}", r.from.dimmed(), r.to.white());
                }
                for r in &report.conflicts {
                    println!("    {} {} (target exists)", "skipped".yellow(), r.from);
                }
            }
            if changed.is_empty() {
                println!("{}", "(nothing to normalize)".dimmed());
            }
        }
        Commands::Clean => {
            let report = patientdb::clean::clean_all_patient_folders(
                &config.patients_root(),
                &config.merged_file_name,
            )?;
            println!("{} Deleted {} files", "✓".green(), report.deleted.len());
            for (path, err) in &report.failures {
                println!("{} {}: {}", "✗".red(), path.display(), err);
            }
        }
        Commands::Schema { output } => {
            let generated =
                patientdb::schema::generate_load_script(
                &config.patients_root(),
                &config.merged_file_name,
                config.dialect(),
            )?;
            let path = output.clone().unwrap_or_else(|| config.load_script_path());
            generated.script.write(&path)?;
            println!(
                "{} Wrote {} statements for {} patients to {}",
                "✓".green(),
                generated.script.statement_count(),
                generated.script.patient_count(),
                path.display().to_string().cyan()
            );
            for (path, err) in &generated.failures {
                println!("{} {}: {}", "✗".red(), path.display(), err);
            }
        }
        Commands::Load { script } => {
            let path = script.clone().unwrap_or_else(|| config.load_script_path());
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let statements = LoadScript::split_statements(&text);
            let db = SqlEngine::connect(&config.database_url).await?;
            let applied = db.execute_script(&statements).await;
            db.close().await;
            let count = applied?;
            println!("{} Executed {} statements against {}", "✓".green(), count, config.database_url.cyan());
        }
        Commands::Stress { preloaded } => {
            let mode = if *preloaded { StageMode::Preloaded } else { StageMode::Stage };
            run_stress(&config, mode, &cli.format).await?;
        }
        Commands::Run { prefix, clean, stress } => {
            let options = RunOptions {
                prefix: *prefix,
                clean: *clean,
            };
            match pipeline::run(&config, options) {
                Ok(summary) => print_pipeline_summary(&summary),
                Err(e) if e.is_roster_condition() => {
                    println!("{} {}", "⚠".yellow(), e.to_string().yellow());
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            if *stress {
                run_stress(&config, StageMode::Stage, &cli.format).await?;
            }
        }
        Commands::Queries => show_queries(&config.harness_queries()),
    }

    Ok(())
}

fn print_pipeline_summary(summary: &PipelineSummary) {
    if let Some(prefix) = &summary.prefix {
        println!("{} Prefixed {} resource files", "✓".green(), prefix.files.len());
    }
    println!(
        "{} Segregated {} patients ({} files)",
        "✓".green(),
        summary.segregation.patients.len(),
        summary.segregation.files_written()
    );
    if !summary.segregation.skipped_ids.is_empty() {
        println!(
            "  {} {}",
            "Skipped identifiers:".yellow(),
            summary.segregation.skipped_ids.join(", ")
        );
    }
    println!("{} Merged {} patients", "✓".green(), summary.merge.merged.len());
    if !summary.normalized.is_empty() {
        println!("{} Normalized labels in {} tables", "✓".green(), summary.normalized.len());
    }
    if let Some(clean) = &summary.clean {
        println!("{} Deleted {} resource subsets", "✓".green(), clean.deleted.len());
    }
    println!(
        "{} Load script: {} patients, {} statements → {}",
        "✓".green(),
        summary.script_patients,
        summary.script_statements,
        summary.load_script.display().to_string().cyan()
    );
    for (path, err) in &summary.script_failures {
        println!("{} {}: {}", "✗".red(), path.display(), err);
    }
}

async fn run_stress(config: &PipelineConfig, mode: StageMode, format: &OutputFormat) -> Result<()> {
    let targets = discover_patients(&config.patients_root(), &config.merged_file_name)?;
    if targets.is_empty() {
        println!("{}", "(no merged patient tables found)".dimmed());
        return Ok(());
    }

    let engine = SqlEngine::connect(&config.database_url).await?;
    let harness = StressHarness::new(engine.clone(), config.harness_queries()).mode(mode);
    let report = harness.run(&targets).await;
    engine.close().await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => print_stress_report(&report),
    }
    Ok(())
}

fn print_stress_report(report: &StressReport) {
    let total = report.total_patients;
    println!();
    println!("{}", "═".repeat(70).dimmed());
    println!("{}", "STRESS TEST COMPLETE".cyan().bold());
    println!("{}", "═".repeat(70).dimmed());

    println!("{}", "Overall:".white().bold());
    println!(
        "  Successful patients: {}/{} ({:.1}%)",
        report.successful_patients.to_string().green(),
        total,
        report.success_rate() * 100.0
    );
    println!("  Failed patients:     {}", report.failed_patients.to_string().red());
    println!("  Total time:          {:.2}s", report.wall_time.as_secs_f64());
    if let Some(avg) = report.average_patient_time() {
        println!("  Avg per patient:     {:.3}s", avg.as_secs_f64());
    }

    println!();
    println!("{}", "Performance:".white().bold());
    println!("  Queries executed:    {}", report.queries_executed());
    match report.queries_per_second() {
        Some(qps) => println!("  Queries per second:  {:.1}", qps),
        None => println!("  Queries per second:  {}", "n/a".dimmed()),
    }
    println!("  Pure query time:     {:.2}s", report.total_query_time.as_secs_f64());
    if let (Some(fast), Some(slow)) = (report.fastest_patient, report.slowest_patient) {
        println!("  Fastest patient:     {:.3}s", fast.as_secs_f64());
        println!("  Slowest patient:     {:.3}s", slow.as_secs_f64());
    }

    println!();
    println!(
        "{:24} {:>10} {:>10} {:>10}",
        "Query".white().bold(),
        "Runs".white().bold(),
        "Failures".white().bold(),
        "Time".white().bold()
    );
    println!("{}", "─".repeat(58).dimmed());
    for q in &report.per_query {
        println!(
            "{:24} {:>10} {:>10} {:>9.3}s",
            q.name,
            q.executions,
            q.failures,
            q.total_time.as_secs_f64()
        );
    }

    let samples = report.sample_successes(3);
    if !samples.is_empty() {
        println!();
        println!("{}", "Sample results:".white().bold());
        for (i, patient) in samples.iter().enumerate() {
            println!("  {} {}", format!("Patient {}:", i + 1).cyan(), truncate(&patient.patient_id, 16));
            for q in &patient.queries {
                let sample = q
                    .result
                    .as_ref()
                    .map(|r| serde_json::Value::Object(r.clone()).to_string())
                    .unwrap_or_default();
                println!("    {}: {}", q.name.dimmed(), truncate(&sample, 60));
            }
        }
    }

    if !report.errors.is_empty() {
        println!();
        println!(
            "{}",
            format!("Error analysis ({} total errors):", report.errors.len()).yellow().bold()
        );
        for (prefix, count) in report.error_breakdown(5) {
            println!("  • {}…: {} occurrences", prefix, count);
        }
    }

    let verdict = report.verdict();
    println!();
    println!("{}", "Verdict:".white().bold());
    let quality = verdict.quality.describe();
    match verdict.quality {
        QualityBand::Excellent => println!("  {}", quality.green()),
        QualityBand::Good => println!("  {}", quality.cyan()),
        QualityBand::NeedsWork => println!("  {}", quality.yellow()),
    }
    match verdict.speed {
        Some(speed @ SpeedBand::Fast) => println!("  {}", speed.describe().green()),
        Some(speed @ SpeedBand::Decent) => println!("  {}", speed.describe().cyan()),
        Some(speed @ SpeedBand::Slow) => println!("  {}", speed.describe().yellow()),
        None => {}
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}…", s.chars().take(max).collect::<String>())
    }
}

fn show_queries(queries: &[HarnessQuery]) {
    println!("{}", "Harness queries".cyan().bold());
    println!();
    for q in queries {
        println!("{} {}", "•".cyan(), q.name.white().bold());
        if !q.description.is_empty() {
            println!("  {}", q.description.dimmed());
        }
        println!("  {}", q.sql.yellow());
        println!();
    }
}
