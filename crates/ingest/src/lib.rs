use anyhow::{anyhow, Context, Result};
use arrow::array::{ArrayRef, Int64Builder, RecordBatch, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::writer::FileWriter;
use csv_async::{AsyncReaderBuilder, StringRecord};
use futures::StreamExt;
use metadata::RawRow;
use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::Date;

const HEADER_TAG: &str = "H";
const DATA_TAG: &str = "D";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub delimiter: u8,
    pub run_date: Date,
    /// Where to keep the Bronze copy; `None` skips it.
    pub bronze_out: Option<PathBuf>,
}

#[derive(Debug, Default, Clone)]
pub struct IngestStats {
    pub rows_in: u64,
    pub bytes_in: u64,
    /// Lines that are neither header nor data (trailers, blanks).
    pub lines_skipped: u64,
    /// blake3 of the source file, hex encoded.
    pub source_checksum: String,
    pub out_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Extract {
    pub header: Vec<String>,
    pub rows: Vec<RawRow>,
    pub stats: IngestStats,
}

/// Reads a pipe-delimited export where `H|` lines carry column names and `D|`
/// lines carry data. Every other line is skipped.
pub async fn extract_file(cfg: &IngestConfig, source_path: &Path) -> Result<Extract> {
    if !source_path.exists() {
        return Err(anyhow!("source file not found: {}", source_path.display()));
    }
    let bytes = tokio::fs::read(source_path)
        .await
        .with_context(|| format!("read {}", source_path.display()))?;
    let source_checksum = blake3::hash(&bytes).to_hex().to_string();

    let mut rdr = AsyncReaderBuilder::new()
        .has_headers(false)
        .delimiter(cfg.delimiter)
        .quoting(false)
        .flexible(true)
        .create_reader(&bytes[..]);

    let mut header: Option<Vec<String>> = None;
    let mut data: Vec<StringRecord> = Vec::new();
    let mut lines_skipped: u64 = 0;

    let mut records = rdr.records();
    while let Some(rec_res) = records.next().await {
        let rec = rec_res?;
        match rec.get(0).map(str::trim) {
            Some(HEADER_TAG) => {
                if header.is_some() {
                    tracing::warn!(file = %source_path.display(), "repeated header line, keeping the first");
                    lines_skipped += 1;
                    continue;
                }
                header = Some(rec.iter().skip(1).map(|h| h.trim().to_string()).collect());
            }
            Some(DATA_TAG) => data.push(rec),
            _ => lines_skipped += 1,
        }
    }

    let header = header
        .filter(|h| !h.is_empty())
        .ok_or_else(|| anyhow!("no header found in {}", source_path.display()))?;

    let rows: Vec<RawRow> = data
        .iter()
        .enumerate()
        .map(|(i, rec)| {
            let mut row = RawRow::new(i as u64 + 1);
            let mut values = rec.iter().skip(1);
            for (name, value) in header.iter().zip(values.by_ref()) {
                row.insert(name.clone(), value);
            }
            // Surplus values; the validator rejects any row carrying them.
            for extra in values {
                row.push_overflow(extra);
            }
            row
        })
        .collect();

    let out_path = match &cfg.bronze_out {
        Some(path) => {
            write_bronze(path, &header, &rows, &source_path.display().to_string(), cfg.run_date)?;
            Some(path.clone())
        }
        None => None,
    };

    tracing::info!(
        file = %source_path.display(),
        rows = rows.len(),
        skipped = lines_skipped,
        "extracted records"
    );

    Ok(Extract {
        stats: IngestStats {
            rows_in: rows.len() as u64,
            bytes_in: bytes.len() as u64,
            lines_skipped,
            source_checksum,
            out_path,
        },
        header,
        rows,
    })
}

const BATCH_SIZE: usize = 65_536;

/// Writes the raw rows as all-Utf8 columns plus lineage (run date, source, row number).
pub fn write_bronze(
    out_path: &Path,
    header: &[String],
    rows: &[RawRow],
    source_file: &str,
    run_date: Date,
) -> Result<()> {
    if let Some(dir) = out_path.parent() {
        create_dir_all(dir).with_context(|| format!("mkdir -p {}", dir.display()))?;
    }

    let mut fields: Vec<Field> = header
        .iter()
        .map(|name| Field::new(name, DataType::Utf8, true))
        .collect();
    fields.push(Field::new("run_date", DataType::Utf8, false));
    fields.push(Field::new("source_file", DataType::Utf8, false));
    fields.push(Field::new("row_number", DataType::Int64, false));
    let schema = Arc::new(Schema::new(fields));

    let out_file =
        File::create(out_path).with_context(|| format!("create {}", out_path.display()))?;
    let mut writer = FileWriter::try_new(out_file, &schema)?;
    let run_date = run_date.to_string();

    for chunk in rows.chunks(BATCH_SIZE) {
        let mut cols: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
        for name in header {
            let mut b = StringBuilder::with_capacity(chunk.len(), chunk.len() * 8);
            for row in chunk {
                b.append_option(row.raw(name));
            }
            cols.push(Arc::new(b.finish()) as ArrayRef);
        }
        let mut run_date_b = StringBuilder::with_capacity(chunk.len(), chunk.len() * 10);
        let mut source_b = StringBuilder::with_capacity(chunk.len(), chunk.len() * 32);
        let mut rownum_b = Int64Builder::with_capacity(chunk.len());
        for row in chunk {
            run_date_b.append_value(&run_date);
            source_b.append_value(source_file);
            rownum_b.append_value(row.line as i64);
        }
        cols.push(Arc::new(run_date_b.finish()) as ArrayRef);
        cols.push(Arc::new(source_b.finish()) as ArrayRef);
        cols.push(Arc::new(rownum_b.finish()) as ArrayRef);

        let batch = RecordBatch::try_new(schema.clone(), cols)?;
        writer.write(&batch)?;
    }

    writer.finish()?;
    Ok(())
}
