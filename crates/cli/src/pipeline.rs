//! Stage sequencing shared by the subcommands.
use anyhow::{anyhow, Context, Result};
use curate::{CurateConfig, ReconcileReport, RunSummary};
use ingest::{IngestConfig, IngestStats};
use metadata::PipelineConfig;
use stage::{IpcStaging, StageStats, StagingArea};
use std::path::{Path, PathBuf};
use time::Date;
use validate::{ValidateConfig, ValidationStats, Validator};

pub struct StageRun {
    pub ingest: IngestStats,
    pub validation: ValidationStats,
    pub stage: StageStats,
}

/// Extract, validate, enrich and replace the staging area.
pub async fn extract_and_stage(
    cfg: &PipelineConfig,
    source: &Path,
    run_date: Date,
    summary: &mut RunSummary,
) -> Result<StageRun> {
    let delimiter = u8::try_from(cfg.dataset.delimiter)
        .map_err(|_| anyhow!("delimiter '{}' is not a single byte", cfg.dataset.delimiter))?;
    let extract = ingest::extract_file(
        &IngestConfig {
            delimiter,
            run_date,
            bronze_out: Some(cfg.bronze_path(run_date)),
        },
        source,
    )
    .await?;
    summary.source_file = Some(source.display().to_string());
    summary.source_checksum = Some(extract.stats.source_checksum.clone());
    summary.records_read = extract.stats.rows_in;

    let validator = Validator::new(cfg.columns.clone(), &cfg.rules)?;
    let vcfg = ValidateConfig {
        rules: cfg.rules.clone(),
        run_date,
        rejects_out: Some(cfg.rejects_path(run_date)),
    };
    let outcome = validate::validate_rows(&validator, &extract.header, &extract.rows, &vcfg)?;
    for r in &outcome.rejects {
        summary.record_reject(&r.error, Some(r.row.line), None);
    }
    summary.records_validated = outcome.stats.rows_out;
    summary.warnings = outcome.stats.warnings;

    let staging = IpcStaging::new(cfg.staging_path()).with_run_date(run_date);
    let stage = staging.replace(&outcome.records)?;
    summary.staged = stage.rows_written;

    Ok(StageRun {
        ingest: extract.stats,
        validation: outcome.stats,
        stage,
    })
}

/// Merge the current staging content into the durable table.
///
/// The summary is reported under the run date the staged fields were derived on.
pub async fn reconcile_staged(cfg: &PipelineConfig, summary: &mut RunSummary) -> Result<ReconcileReport> {
    let staging = IpcStaging::new(cfg.staging_path());
    if let Some(staged_on) = staging.staged_run_date()? {
        if staged_on != summary.run_date {
            tracing::warn!(
                staged_on = %staged_on,
                requested = %summary.run_date,
                "staging was derived on another run date, reporting under the staging date"
            );
            summary.run_date = staged_on;
        }
    }
    let staged = staging
        .read()
        .with_context(|| format!("read staging {}", staging.path().display()))?;
    if summary.staged == 0 {
        summary.staged = staged.len() as u64;
    }
    let report = curate::reconcile_into_parquet(&CurateConfig::from_pipeline(cfg), staged).await?;
    summary.absorb(&report);
    Ok(report)
}

pub fn write_summary(cfg: &PipelineConfig, summary: &RunSummary) -> Result<PathBuf> {
    curate::write_run_manifest(&cfg.manifests_dir(), summary)
}
