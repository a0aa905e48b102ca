pub mod engine;
pub mod report;
pub mod router;
pub mod store;

pub use engine::{reconcile, Action, ReconcileConfig, ReconcileError};
pub use report::{write_run_manifest, PartitionReport, PartitionStatus, ReconcileReport, RunSummary};
pub use router::{Partition, PartitionRouter};
pub use store::{DurableStore, MemoryStore, ParquetStore, WritePlan};

use anyhow::Result;
use metadata::{CustomerRecord, PipelineConfig};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CurateConfig {
    /// `<root>/<curate_dir>/<table>`
    pub curate_root: PathBuf,
    pub table: String,
    pub countries: Vec<String>,
    pub strict: bool,
    pub max_parallel_partitions: usize,
}

impl CurateConfig {
    pub fn from_pipeline(cfg: &PipelineConfig) -> Self {
        Self {
            curate_root: cfg.curate_root(),
            table: cfg.storage.table.clone(),
            countries: cfg.rules.countries.clone(),
            strict: cfg.rules.strict,
            max_parallel_partitions: cfg.storage.max_parallel_partitions,
        }
    }

    pub fn router(&self) -> PartitionRouter {
        PartitionRouter::new(&self.table, &self.countries)
    }
}

/// Creates the partition directories of every configured country.
pub fn provision_partitions(cfg: &CurateConfig) -> Result<Vec<(Partition, bool)>> {
    let store = ParquetStore::new(&cfg.curate_root);
    cfg.router()
        .partitions()
        .map(|p| Ok((p.clone(), store.provision(p)?)))
        .collect()
}

/// Reconciles the staged records into the Parquet-backed durable table.
pub async fn reconcile_into_parquet(
    cfg: &CurateConfig,
    staged: Vec<CustomerRecord>,
) -> Result<ReconcileReport> {
    let store: Arc<dyn DurableStore> = Arc::new(ParquetStore::new(&cfg.curate_root));
    let engine_cfg = ReconcileConfig {
        strict: cfg.strict,
        max_parallel_partitions: cfg.max_parallel_partitions,
    };
    reconcile(store, &cfg.router(), staged, &engine_cfg).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[tokio::test]
    async fn parquet_backed_run_after_provisioning() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CurateConfig {
            curate_root: dir.path().join("curate/customer_info"),
            table: "customer_info".into(),
            countries: vec!["US".into(), "IN".into()],
            strict: false,
            max_parallel_partitions: 2,
        };
        let created = provision_partitions(&cfg).unwrap();
        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|(_, fresh)| *fresh));

        let staged = vec![
            CustomerRecord::new("C1", "Alex", date!(2010 - 10 - 12), "US"),
            CustomerRecord::new("C2", "Mary", date!(2011 - 01 - 05), "IN"),
        ];
        let first = reconcile_into_parquet(&cfg, staged.clone()).await.unwrap();
        assert_eq!(first.inserted(), 2);
        assert!(dir
            .path()
            .join("curate/customer_info/country=US/part-000000.parquet")
            .exists());

        let second = reconcile_into_parquet(&cfg, staged).await.unwrap();
        assert_eq!(second.inserted() + second.updated(), 0);
        assert_eq!(second.unchanged(), 2);
    }

    #[tokio::test]
    async fn missing_partition_fails_only_that_partition() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CurateConfig {
            curate_root: dir.path().to_path_buf(),
            table: "customer_info".into(),
            countries: vec!["US".into(), "IN".into()],
            strict: false,
            max_parallel_partitions: 2,
        };
        let store = ParquetStore::new(&cfg.curate_root);
        store.provision(cfg.router().route("US").unwrap()).unwrap();

        let staged = vec![
            CustomerRecord::new("C1", "Alex", date!(2010 - 10 - 12), "US"),
            CustomerRecord::new("C2", "Mary", date!(2011 - 01 - 05), "IN"),
        ];
        let report = reconcile_into_parquet(&cfg, staged).await.unwrap();
        let failed: Vec<_> = report.failed_partitions().map(|p| p.partition.clone()).collect();
        assert_eq!(failed, vec!["customer_info_in"]);
        assert_eq!(report.partition("customer_info_us").unwrap().inserted, 1);
    }
}
