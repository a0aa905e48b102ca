//! Run reporting: per-partition outcomes, the run summary and its manifests.
use anyhow::{Context, Result};
use metadata::{CustomerKey, RecordError, RejectCategory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, create_dir_all, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::Date;

pub const MAX_ERROR_SAMPLES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PartitionStatus {
    Committed,
    NoChanges,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionReport {
    pub partition: String,
    pub country: String,
    pub staged: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub rejected_duplicates: u64,
    #[serde(flatten)]
    pub status: PartitionStatus,
}

impl PartitionReport {
    pub fn new(partition: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            country: country.into(),
            staged: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            rejected_duplicates: 0,
            status: PartitionStatus::NoChanges,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, PartitionStatus::Failed { .. })
    }
}

/// A staged record excluded by the engine before any write.
#[derive(Debug, Clone)]
pub struct StagedReject {
    pub key: CustomerKey,
    pub partition: Option<String>,
    pub error: RecordError,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub partitions: Vec<PartitionReport>,
    pub rejects: Vec<StagedReject>,
}

impl ReconcileReport {
    pub fn inserted(&self) -> u64 {
        self.partitions.iter().map(|p| p.inserted).sum()
    }

    pub fn updated(&self) -> u64 {
        self.partitions.iter().map(|p| p.updated).sum()
    }

    pub fn unchanged(&self) -> u64 {
        self.partitions.iter().map(|p| p.unchanged).sum()
    }

    pub fn failed_partitions(&self) -> impl Iterator<Item = &PartitionReport> {
        self.partitions.iter().filter(|p| p.is_failed())
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionReport> {
        self.partitions.iter().find(|p| p.partition == name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSample {
    pub reason_code: String,
    pub message: String,
    pub row_no: Option<u64>,
    pub customer_id: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub dataset: String,
    pub run_date: Date,
    pub source_file: Option<String>,
    pub source_checksum: Option<String>,
    pub records_read: u64,
    pub records_validated: u64,
    pub warnings: u64,
    pub rejected: BTreeMap<RejectCategory, u64>,
    pub staged: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub partitions: Vec<PartitionReport>,
    pub error_samples: Vec<ErrorSample>,
}

impl RunSummary {
    pub fn new(dataset: impl Into<String>, run_date: Date) -> Self {
        Self {
            dataset: dataset.into(),
            run_date,
            source_file: None,
            source_checksum: None,
            records_read: 0,
            records_validated: 0,
            warnings: 0,
            rejected: BTreeMap::new(),
            staged: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            partitions: Vec::new(),
            error_samples: Vec::new(),
        }
    }

    pub fn record_reject(&mut self, error: &RecordError, row_no: Option<u64>, key: Option<&CustomerKey>) {
        *self.rejected.entry(error.category()).or_insert(0) += 1;
        if self.error_samples.len() < MAX_ERROR_SAMPLES {
            self.error_samples.push(ErrorSample {
                reason_code: error.code().to_string(),
                message: error.to_string(),
                row_no,
                customer_id: key.map(|k| k.customer_id.clone()),
                country: key.map(|k| k.country.clone()),
            });
        }
    }

    pub fn absorb(&mut self, report: &ReconcileReport) {
        for r in &report.rejects {
            self.record_reject(&r.error, None, Some(&r.key));
        }
        self.inserted += report.inserted();
        self.updated += report.updated();
        self.unchanged += report.unchanged();
        self.partitions.extend(report.partitions.iter().cloned());
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected.values().sum()
    }

    pub fn has_failures(&self) -> bool {
        self.partitions.iter().any(PartitionReport::is_failed)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Latest {
    run_date: String,
}

/// Writes `run_date=<date>/summary.json` and points `latest.json` at it.
pub fn write_run_manifest(manifests_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = manifests_dir.join(format!("run_date={}", summary.run_date));
    create_dir_all(&run_dir).with_context(|| format!("mkdir -p {}", run_dir.display()))?;
    let summary_path = run_dir.join("summary.json");
    {
        let mut out = File::create(&summary_path)
            .with_context(|| format!("create {}", summary_path.display()))?;
        let json = serde_json::to_string_pretty(summary)?;
        out.write_all(json.as_bytes())?;
        out.flush()?;
    }

    let latest_tmp = manifests_dir.join("latest.json.tmp");
    let latest_path = manifests_dir.join("latest.json");
    {
        let mut out = File::create(&latest_tmp)?;
        let json = serde_json::to_string(&Latest {
            run_date: summary.run_date.to_string(),
        })?;
        out.write_all(json.as_bytes())?;
        out.flush()?;
    }
    fs::rename(&latest_tmp, &latest_path)
        .with_context(|| format!("rename {} -> {}", latest_tmp.display(), latest_path.display()))?;

    Ok(summary_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn summary_counts_rejects_by_category_and_caps_samples() {
        let mut s = RunSummary::new("customer_info", date!(2024 - 03 - 01));
        for i in 0..(MAX_ERROR_SAMPLES as u64 + 5) {
            s.record_reject(&RecordError::missing("customer_id"), Some(i + 1), None);
        }
        s.record_reject(
            &RecordError::UnroutablePartition {
                country: "NZ".into(),
            },
            Some(200),
            None,
        );
        assert_eq!(s.rejected[&RejectCategory::Validation], 105);
        assert_eq!(s.rejected[&RejectCategory::UnroutablePartition], 1);
        assert_eq!(s.rejected_total(), 106);
        assert_eq!(s.error_samples.len(), MAX_ERROR_SAMPLES);
    }

    #[test]
    fn manifest_json_and_latest_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = RunSummary::new("customer_info", date!(2024 - 03 - 01));
        let mut failed = PartitionReport::new("customer_info_us", "US");
        failed.status = PartitionStatus::Failed {
            error: "disk full".into(),
        };
        s.partitions.push(failed);
        s.record_reject(&RecordError::missing("country"), Some(3), None);
        assert!(s.has_failures());

        let path = write_run_manifest(dir.path(), &s).unwrap();
        assert!(path.ends_with("run_date=2024-03-01/summary.json"));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["rejected"]["validation"], 1);
        assert_eq!(json["partitions"][0]["status"], "failed");
        assert_eq!(json["partitions"][0]["error"], "disk full");

        let latest: Latest =
            serde_json::from_str(&fs::read_to_string(dir.path().join("latest.json")).unwrap())
                .unwrap();
        assert_eq!(latest.run_date, "2024-03-01");
    }
}
