mod pipeline;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use curate::{CurateConfig, RunSummary};
use metadata::PipelineConfig;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pipeline", version, about = "Customer incremental load pipeline CLI")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Pipeline configuration (TOML)
    #[arg(long, default_value = "./config/customer_info.toml")]
    config: PathBuf,
    /// Abort on the first rejected record
    #[arg(long)]
    strict: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Export -> staging -> curated table
    Run {
        #[command(flatten)]
        args: RunArgs,
        #[arg(long)]
        source: PathBuf,
        /// Overrides the configured run date; defaults to today
        #[arg(long, value_name = "YYYY-MM-DD")]
        run_date: Option<String>,
    },
    /// Export -> validated, enriched staging area
    Stage {
        #[command(flatten)]
        args: RunArgs,
        #[arg(long)]
        source: PathBuf,
        #[arg(long, value_name = "YYYY-MM-DD")]
        run_date: Option<String>,
    },
    /// Staging area -> curated table, under the run date recorded at staging
    Reconcile {
        #[command(flatten)]
        args: RunArgs,
    },
    /// Create the curated partitions of every configured country
    Provision {
        #[arg(long, default_value = "./config/customer_info.toml")]
        config: PathBuf,
    },
}

fn parse_run_date(s: &str) -> Result<Date> {
    Date::parse(s, format_description!("[year]-[month]-[day]"))
        .with_context(|| format!("invalid run date '{s}', expected YYYY-MM-DD"))
}

fn load(args: &RunArgs, run_date: Option<&str>) -> Result<(PipelineConfig, Date)> {
    let mut cfg = metadata::load_config(&args.config)
        .with_context(|| format!("load config {}", args.config.display()))?;
    cfg.rules.strict |= args.strict;
    let run_date = match run_date {
        Some(s) => parse_run_date(s)?,
        None => cfg
            .run_date
            .unwrap_or_else(|| OffsetDateTime::now_utc().date()),
    };
    Ok((cfg, run_date))
}

async fn stage_cmd(cfg: &PipelineConfig, source: &Path, summary: &mut RunSummary) -> Result<()> {
    let run = pipeline::extract_and_stage(cfg, source, summary.run_date, summary).await?;
    println!(
        "EXTRACT OK rows_in={} bytes_in={} skipped={} checksum={}",
        run.ingest.rows_in, run.ingest.bytes_in, run.ingest.lines_skipped, run.ingest.source_checksum
    );
    println!(
        "VALIDATE OK rows_out={} rejects={} invalid_dates={} warnings={}",
        run.validation.rows_out,
        run.validation.rejects,
        run.validation.invalid_dates,
        run.validation.warnings
    );
    println!(
        "STAGE OK rows={} staging={}",
        run.stage.rows_written,
        cfg.staging_path().display()
    );
    Ok(())
}

async fn reconcile_cmd(cfg: &PipelineConfig, summary: &mut RunSummary) -> Result<()> {
    let report = pipeline::reconcile_staged(cfg, summary).await?;
    for p in &report.partitions {
        println!(
            "  {} inserted={} updated={} unchanged={} duplicates={} status={:?}",
            p.partition, p.inserted, p.updated, p.unchanged, p.rejected_duplicates, p.status
        );
    }
    println!(
        "RECONCILE OK inserted={} updated={} unchanged={} rejected={}",
        report.inserted(),
        report.updated(),
        report.unchanged(),
        report.rejects.len()
    );
    Ok(())
}

fn finish(cfg: &PipelineConfig, summary: &RunSummary) -> Result<()> {
    let path = pipeline::write_summary(cfg, summary)?;
    println!("SUMMARY {}", path.display());
    if summary.has_failures() {
        let failed: Vec<&str> = summary
            .partitions
            .iter()
            .filter(|p| p.is_failed())
            .map(|p| p.partition.as_str())
            .collect();
        tracing::error!(run_date = %summary.run_date, failed = failed.len(), "run finished with failed partitions");
        bail!("{} partition(s) failed to write: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let start = std::time::Instant::now();
    match cli.cmd {
        Commands::Run {
            args,
            source,
            run_date,
        } => {
            let (cfg, run_date) = load(&args, run_date.as_deref())?;
            tracing::info!(source = %source.display(), run_date = %run_date, strict = cfg.rules.strict, "run started");
            let mut summary = RunSummary::new(&cfg.dataset.slug, run_date);
            stage_cmd(&cfg, &source, &mut summary).await?;
            reconcile_cmd(&cfg, &mut summary).await?;
            finish(&cfg, &summary)?;
        }
        Commands::Stage {
            args,
            source,
            run_date,
        } => {
            let (cfg, run_date) = load(&args, run_date.as_deref())?;
            tracing::info!(source = %source.display(), run_date = %run_date, "stage started");
            let mut summary = RunSummary::new(&cfg.dataset.slug, run_date);
            stage_cmd(&cfg, &source, &mut summary).await?;
        }
        Commands::Reconcile { args } => {
            let (cfg, run_date) = load(&args, None)?;
            tracing::info!(staging = %cfg.staging_path().display(), "reconcile started");
            let mut summary = RunSummary::new(&cfg.dataset.slug, run_date);
            reconcile_cmd(&cfg, &mut summary).await?;
            finish(&cfg, &summary)?;
        }
        Commands::Provision { config } => {
            let cfg = metadata::load_config(&config)
                .with_context(|| format!("load config {}", config.display()))?;
            for (partition, created) in curate::provision_partitions(&CurateConfig::from_pipeline(&cfg))? {
                println!(
                    "PARTITION {} {}",
                    partition,
                    if created { "created" } else { "exists" }
                );
            }
        }
    }
    let duration_pretty = humantime::format_duration(start.elapsed());
    println!("DONE in {}", duration_pretty);
    Ok(())
}
