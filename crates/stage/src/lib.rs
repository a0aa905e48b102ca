//! Staging area: holds exactly one run's enriched records.
//!
//! `replace` is all-or-nothing. Readers see either the previous complete content or
//! the new complete content, never a mix.
use anyhow::{anyhow, Context, Result};
use arrow::ipc::reader::FileReader as IpcReader;
use arrow::ipc::writer::FileWriter as IpcWriter;
use metadata::batch::{customer_schema, records_from_batch, records_to_batch};
use metadata::CustomerRecord;
use std::collections::HashMap;
use std::fs::{self, create_dir_all, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use time::macros::format_description;
use time::Date;

/// Schema metadata key holding the run date the staged fields were derived on.
pub const RUN_DATE_KEY: &str = "run_date";

#[derive(Debug, Default, Clone)]
pub struct StageStats {
    pub rows_written: u64,
    pub out_path: Option<PathBuf>,
}

pub trait StagingArea: Send + Sync {
    /// Swaps the whole staging content for `records`.
    fn replace(&self, records: &[CustomerRecord]) -> Result<StageStats>;

    fn read(&self) -> Result<Vec<CustomerRecord>>;
}

/// Staging table kept as a single Arrow IPC file.
#[derive(Debug, Clone)]
pub struct IpcStaging {
    path: PathBuf,
    run_date: Option<Date>,
}

const BATCH_SIZE: usize = 65_536;

impl IpcStaging {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            run_date: None,
        }
    }

    /// Records `run_date` alongside the data written by `replace`.
    pub fn with_run_date(mut self, run_date: Date) -> Self {
        self.run_date = Some(run_date);
        self
    }

    /// Run date stored with the current staging content, if any.
    pub fn staged_run_date(&self) -> Result<Option<Date>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let f = File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;
        let schema = IpcReader::try_new(f, None)?.schema();
        let run_date = match schema.metadata().get(RUN_DATE_KEY) {
            Some(s) => Some(
                Date::parse(s, format_description!("[year]-[month]-[day]"))
                    .with_context(|| format!("bad {RUN_DATE_KEY} '{s}' in {}", self.path.display()))?,
            ),
            None => None,
        };
        Ok(run_date)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_tmp(&self, tmp: &Path, records: &[CustomerRecord]) -> Result<()> {
        let mut schema = customer_schema();
        if let Some(d) = self.run_date {
            let metadata = HashMap::from([(RUN_DATE_KEY.to_string(), d.to_string())]);
            schema = Arc::new(schema.as_ref().clone().with_metadata(metadata));
        }
        let file = File::create(tmp).with_context(|| format!("create {}", tmp.display()))?;
        let mut writer = IpcWriter::try_new(file, &schema)?;
        for chunk in records.chunks(BATCH_SIZE) {
            writer.write(&records_to_batch(chunk)?.with_schema(schema.clone())?)?;
        }
        writer.finish()?;
        let mut file = writer.into_inner()?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

impl StagingArea for IpcStaging {
    fn replace(&self, records: &[CustomerRecord]) -> Result<StageStats> {
        if let Some(dir) = self.path.parent() {
            create_dir_all(dir).with_context(|| format!("mkdir -p {}", dir.display()))?;
        }
        let tmp = self.tmp_path();
        let written = self
            .write_tmp(&tmp, records)
            .and_then(|_| {
                fs::rename(&tmp, &self.path)
                    .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))
            });
        if let Err(e) = written {
            // Previous staging file is untouched; drop the partial one.
            let _ = fs::remove_file(&tmp);
            return Err(e.context(format!("staging load into {} failed", self.path.display())));
        }

        tracing::info!(path = %self.path.display(), rows = records.len(), "staging replaced");
        Ok(StageStats {
            rows_written: records.len() as u64,
            out_path: Some(self.path.clone()),
        })
    }

    fn read(&self) -> Result<Vec<CustomerRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let f = File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;
        let reader = IpcReader::try_new(f, None)?;
        let mut out = Vec::new();
        for maybe_batch in reader {
            out.extend(records_from_batch(&maybe_batch?)?);
        }
        Ok(out)
    }
}

/// In-process staging area.
#[derive(Debug, Default)]
pub struct MemoryStaging {
    records: RwLock<Vec<CustomerRecord>>,
}

impl MemoryStaging {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StagingArea for MemoryStaging {
    fn replace(&self, records: &[CustomerRecord]) -> Result<StageStats> {
        let fresh = records.to_vec();
        let mut guard = self
            .records
            .write()
            .map_err(|_| anyhow!("staging lock poisoned"))?;
        *guard = fresh;
        Ok(StageStats {
            rows_written: records.len() as u64,
            out_path: None,
        })
    }

    fn read(&self) -> Result<Vec<CustomerRecord>> {
        Ok(self
            .records
            .read()
            .map_err(|_| anyhow!("staging lock poisoned"))?
            .clone())
    }
}
