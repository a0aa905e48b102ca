//! Dataset descriptor, pipeline configuration and the customer model shared by all stages.
pub mod batch;
pub mod error;
pub mod record;

pub use error::{RecordError, RejectCategory, ValidationReason};
pub use record::{ActiveFlag, CustomerKey, CustomerRecord, RawRow};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::format_description::{self, OwnedFormatItem};
use time::Date;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("validation: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    #[serde(default = "default_slug")]
    pub slug: String,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl Default for DatasetDescriptor {
    fn default() -> Self {
        Self {
            slug: default_slug(),
            schema_version: default_schema_version(),
            format: default_format(),
            delimiter: default_delimiter(),
        }
    }
}

/// Header names of the export, per customer field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMap {
    pub customer_name: String,
    pub customer_id: String,
    pub customer_open_date: String,
    pub last_consulted_date: String,
    pub vaccination_type: String,
    pub doctor_consulted: String,
    pub state: String,
    pub country: String,
    pub post_code: String,
    pub date_of_birth: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            customer_name: "Customer_Name".into(),
            customer_id: "Customer_ID".into(),
            customer_open_date: "Customer_Open_Date".into(),
            last_consulted_date: "Last_Consulted_Date".into(),
            vaccination_type: "Vaccination_Type".into(),
            doctor_consulted: "Doctor_Consulted".into(),
            state: "State".into(),
            country: "Country".into(),
            post_code: "Post_Code".into(),
            date_of_birth: "Date_of_Birth".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Rules {
    /// `time` format description, e.g. `[year][month][day]`.
    pub date_format: String,
    /// Overrides `date_format` for `date_of_birth` when set.
    pub date_of_birth_format: Option<String>,
    pub freshness_threshold_days: u32,
    pub countries: Vec<String>,
    pub strict: bool,
    /// Largest tolerated share of rows rejected by validation, 0.0..=1.0.
    pub max_reject_ratio: f64,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            date_format: "[year][month][day]".into(),
            date_of_birth_format: None,
            freshness_threshold_days: 30,
            countries: Vec::new(),
            strict: false,
            max_reject_ratio: 0.05,
        }
    }
}

impl Rules {
    pub fn parsed_date_format(&self) -> Result<OwnedFormatItem, ConfigError> {
        parse_format(&self.date_format)
    }

    pub fn parsed_dob_format(&self) -> Result<OwnedFormatItem, ConfigError> {
        parse_format(
            self.date_of_birth_format
                .as_deref()
                .unwrap_or(&self.date_format),
        )
    }

    pub fn dob_format_str(&self) -> &str {
        self.date_of_birth_format
            .as_deref()
            .unwrap_or(&self.date_format)
    }
}

fn parse_format(s: &str) -> Result<OwnedFormatItem, ConfigError> {
    format_description::parse_owned::<2>(s)
        .map_err(|e| ConfigError::Validation(format!("date format '{s}': {e}")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub bronze_dir: String,
    pub rejects_dir: String,
    pub staging_dir: String,
    pub curate_dir: String,
    pub manifests_dir: String,
    /// Name of the customer table in both staging and curated areas.
    pub table: String,
    pub max_parallel_partitions: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            bronze_dir: "bronze".into(),
            rejects_dir: "rejects".into(),
            staging_dir: "stg".into(),
            curate_dir: "curate".into(),
            manifests_dir: "manifests".into(),
            table: "customer_info".into(),
            max_parallel_partitions: 4,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub dataset: DatasetDescriptor,
    #[serde(default)]
    pub columns: ColumnMap,
    #[serde(default)]
    pub rules: Rules,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Fixed run date; the CLI falls back to today when unset.
    #[serde(default)]
    pub run_date: Option<Date>,
}

impl PipelineConfig {
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        for c in self.rules.countries.iter_mut() {
            *c = c.trim().to_uppercase();
        }
        self.rules.countries.sort();
        self.rules.countries.dedup();
        if self.rules.countries.is_empty() || self.rules.countries.iter().any(|c| c.is_empty()) {
            return Err(ConfigError::Validation(
                "rules.countries must list at least one non-empty country code".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.rules.max_reject_ratio) {
            return Err(ConfigError::Validation(format!(
                "rules.max_reject_ratio must be within 0..=1, got {}",
                self.rules.max_reject_ratio
            )));
        }
        if self.storage.max_parallel_partitions == 0 {
            return Err(ConfigError::Validation(
                "storage.max_parallel_partitions must be at least 1".into(),
            ));
        }
        if self.storage.table.trim().is_empty() {
            return Err(ConfigError::Validation("storage.table is empty".into()));
        }
        self.rules.parsed_date_format()?;
        self.rules.parsed_dob_format()?;
        Ok(())
    }

    pub fn staging_path(&self) -> PathBuf {
        self.storage
            .root
            .join(&self.storage.staging_dir)
            .join(&self.storage.table)
            .join("part-000000.arrow")
    }

    pub fn curate_root(&self) -> PathBuf {
        self.storage
            .root
            .join(&self.storage.curate_dir)
            .join(&self.storage.table)
    }

    fn dated_dir(&self, area: &str, run_date: Date) -> PathBuf {
        self.storage
            .root
            .join(area)
            .join(&self.dataset.slug)
            .join(format!("run_date={run_date}"))
    }

    pub fn bronze_path(&self, run_date: Date) -> PathBuf {
        self.dated_dir(&self.storage.bronze_dir, run_date)
            .join("part-000000.arrow")
    }

    pub fn rejects_path(&self, run_date: Date) -> PathBuf {
        self.dated_dir(&self.storage.rejects_dir, run_date)
            .join("part-000000.arrow")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.storage
            .root
            .join(&self.storage.manifests_dir)
            .join(&self.dataset.slug)
    }
}

/// Reads and validates a TOML pipeline configuration.
pub fn load_config(path: impl AsRef<Path>) -> Result<PipelineConfig, ConfigError> {
    let data = fs::read_to_string(path.as_ref())?;
    let mut cfg: PipelineConfig = toml::from_str(&data)?;
    cfg.validate()?;
    Ok(cfg)
}

fn default_slug() -> String {
    "customer_info".into()
}
fn default_schema_version() -> u32 {
    1
}
fn default_format() -> String {
    "pipe_hd".into()
}
fn default_delimiter() -> char {
    '|'
}
