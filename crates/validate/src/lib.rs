pub mod derive;
pub mod validator;

pub use derive::{derive, DataQualityWarning, Enriched};
pub use validator::Validator;

use anyhow::{bail, Context, Result};
use arrow::array::{ArrayRef, Int64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::writer::FileWriter as IpcWriter;
use arrow::record_batch::RecordBatch;
use metadata::{CustomerRecord, RawRow, RecordError, Rules};
use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::Date;

#[derive(Debug, Clone)]
pub struct ValidateConfig {
    pub rules: Rules,
    pub run_date: Date,
    /// Rejects file; `None` keeps rejects in memory only.
    pub rejects_out: Option<PathBuf>,
}

#[derive(Debug, Default, Clone)]
pub struct ValidationStats {
    pub rows_in: u64,
    pub rows_out: u64,
    pub rejects: u64,
    pub invalid_dates: u64,
    pub warnings: u64,
    pub rejects_out: Option<PathBuf>,
}

/// A row excluded from staging, with the reason.
#[derive(Debug, Clone)]
pub struct Reject {
    pub row: RawRow,
    pub error: RecordError,
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub records: Vec<CustomerRecord>,
    pub rejects: Vec<Reject>,
    pub stats: ValidationStats,
}

/// Validates and enriches every raw row.
///
/// Bad rows are collected as rejects. The run fails only when strict mode is on and
/// at least one row was rejected, or when the reject share exceeds the configured ratio.
pub fn validate_rows(
    validator: &Validator,
    header: &[String],
    rows: &[RawRow],
    cfg: &ValidateConfig,
) -> Result<ValidationOutcome> {
    let mut records = Vec::with_capacity(rows.len());
    let mut rejects = Vec::new();
    let mut stats = ValidationStats {
        rows_in: rows.len() as u64,
        ..ValidationStats::default()
    };

    for row in rows {
        let enriched = validator
            .validate_row(row)
            .and_then(|r| derive(r, cfg.run_date, cfg.rules.freshness_threshold_days));
        match enriched {
            Ok(Enriched { record, warnings }) => {
                for w in &warnings {
                    tracing::warn!(line = row.line, customer_id = %record.customer_id, "{w}");
                }
                stats.warnings += warnings.len() as u64;
                stats.rows_out += 1;
                records.push(record);
            }
            Err(error) => {
                tracing::debug!(line = row.line, code = error.code(), "{error}");
                if matches!(error, RecordError::InvalidDate { .. }) {
                    stats.invalid_dates += 1;
                }
                stats.rejects += 1;
                rejects.push(Reject {
                    row: row.clone(),
                    error,
                });
            }
        }
    }

    if let Some(path) = &cfg.rejects_out {
        write_rejects(path, header, &rejects)?;
        stats.rejects_out = Some(path.clone());
    }

    tracing::info!(
        rows_in = stats.rows_in,
        rows_out = stats.rows_out,
        rejects = stats.rejects,
        invalid_dates = stats.invalid_dates,
        warnings = stats.warnings,
        "validated records"
    );

    if cfg.rules.strict && stats.rejects > 0 {
        let first = &rejects[0];
        bail!(
            "strict mode: {} row(s) rejected, first at line {}: {}",
            stats.rejects,
            first.row.line,
            first.error
        );
    }
    if stats.rows_in > 0 {
        let ratio = stats.rejects as f64 / stats.rows_in as f64;
        if ratio > cfg.rules.max_reject_ratio {
            bail!(
                "reject ratio {:.4} exceeds configured maximum {:.4} ({} of {} rows)",
                ratio,
                cfg.rules.max_reject_ratio,
                stats.rejects,
                stats.rows_in
            );
        }
    }

    Ok(ValidationOutcome {
        records,
        rejects,
        stats,
    })
}

fn rejects_schema(header: &[String]) -> Schema {
    // Raw columns as read, then lineage and error fields.
    let mut fields: Vec<Field> = header
        .iter()
        .map(|name| Field::new(name, DataType::Utf8, true))
        .collect();
    fields.push(Field::new("row_number", DataType::Int64, false));
    fields.push(Field::new("error_code", DataType::Utf8, false));
    fields.push(Field::new("error_detail", DataType::Utf8, false));
    fields.push(Field::new("validation_stage", DataType::Utf8, false));
    Schema::new(fields)
}

pub fn write_rejects(out_path: &Path, header: &[String], rejects: &[Reject]) -> Result<()> {
    if let Some(dir) = out_path.parent() {
        create_dir_all(dir).with_context(|| format!("mkdir -p {}", dir.display()))?;
    }
    let schema = Arc::new(rejects_schema(header));
    let file = File::create(out_path).with_context(|| format!("create {}", out_path.display()))?;
    let mut writer = IpcWriter::try_new(file, &schema)?;

    if !rejects.is_empty() {
        let cap = rejects.len();
        let mut cols: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
        for name in header {
            let mut b = StringBuilder::with_capacity(cap, cap * 16);
            for r in rejects {
                b.append_option(r.row.raw(name));
            }
            cols.push(Arc::new(b.finish()) as ArrayRef);
        }
        let mut row_number = Int64Builder::with_capacity(cap);
        let mut error_code = StringBuilder::with_capacity(cap, cap * 16);
        let mut error_detail = StringBuilder::with_capacity(cap, cap * 32);
        let mut stage = StringBuilder::with_capacity(cap, cap * 8);
        for r in rejects {
            row_number.append_value(r.row.line as i64);
            error_code.append_value(r.error.code());
            error_detail.append_value(r.error.to_string());
            stage.append_value("validate");
        }
        cols.push(Arc::new(row_number.finish()) as ArrayRef);
        cols.push(Arc::new(error_code.finish()) as ArrayRef);
        cols.push(Arc::new(error_detail.finish()) as ArrayRef);
        cols.push(Arc::new(stage.finish()) as ArrayRef);
        writer.write(&RecordBatch::try_new(schema.clone(), cols)?)?;
    }

    writer.finish()?;
    Ok(())
}
