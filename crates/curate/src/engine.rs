//! Incremental reconciliation of the staging set into the durable store.
//!
//! Staged records are routed to their country partition, duplicate keys are pulled
//! out, and every partition is then diffed and written on its own. Nothing is ever
//! deleted: durable records absent from staging stay as they are.
use crate::report::{PartitionReport, PartitionStatus, ReconcileReport, StagedReject};
use crate::router::{Partition, PartitionRouter};
use crate::store::{DurableStore, WritePlan};
use anyhow::Result;
use futures::StreamExt;
use metadata::{CustomerKey, CustomerRecord, RecordError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub strict: bool,
    pub max_parallel_partitions: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            strict: false,
            max_parallel_partitions: 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("strict mode: {count} staged record(s) rejected, first: {first}")]
    StrictViolation { count: usize, first: RecordError },

    #[error("partition {partition} write failed: {detail}")]
    PartitionWrite { partition: String, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Insert,
    Update,
    Unchanged,
}

pub fn classify(staged: &CustomerRecord, durable: Option<&CustomerRecord>) -> Action {
    match durable {
        None => Action::Insert,
        Some(d) if staged.differs_for_update(d) => Action::Update,
        Some(_) => Action::Unchanged,
    }
}

/// Staging set split by partition, minus the records the engine refuses.
#[derive(Debug, Default)]
pub struct RoutedStaging {
    pub partitions: BTreeMap<Partition, Vec<CustomerRecord>>,
    pub rejects: Vec<StagedReject>,
}

pub fn route_staging(
    staged: Vec<CustomerRecord>,
    router: &PartitionRouter,
    strict: bool,
) -> Result<RoutedStaging, ReconcileError> {
    let mut routed: Vec<(Partition, CustomerRecord)> = Vec::with_capacity(staged.len());
    let mut rejects = Vec::new();

    for record in staged {
        match router.route(&record.country) {
            Ok(partition) => routed.push((partition.clone(), record)),
            Err(error) => rejects.push(StagedReject {
                key: record.key(),
                partition: None,
                error,
            }),
        }
    }

    let mut seen: HashMap<CustomerKey, usize> = HashMap::new();
    for (_, r) in &routed {
        *seen.entry(r.key()).or_insert(0) += 1;
    }

    let mut partitions: BTreeMap<Partition, Vec<CustomerRecord>> = BTreeMap::new();
    for (partition, record) in routed {
        let key = record.key();
        if seen.get(&key).copied().unwrap_or(0) > 1 {
            rejects.push(StagedReject {
                error: RecordError::DuplicateKey {
                    customer_id: key.customer_id.clone(),
                    country: key.country.clone(),
                },
                key,
                partition: Some(partition.name.clone()),
            });
            continue;
        }
        partitions.entry(partition).or_default().push(record);
    }

    if strict {
        if let Some(first) = rejects.first() {
            return Err(ReconcileError::StrictViolation {
                count: rejects.len(),
                first: first.error.clone(),
            });
        }
    }

    Ok(RoutedStaging {
        partitions,
        rejects,
    })
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PartitionPlan {
    pub writes: WritePlan,
    pub unchanged: u64,
}

pub fn plan_partition(staged: &[CustomerRecord], durable: &[CustomerRecord]) -> PartitionPlan {
    let existing: HashMap<&str, &CustomerRecord> = durable
        .iter()
        .map(|r| (r.customer_id.as_str(), r))
        .collect();

    let mut plan = PartitionPlan::default();
    for s in staged {
        let d = existing.get(s.customer_id.as_str()).copied();
        match classify(s, d) {
            Action::Insert => plan.writes.inserts.push(s.clone()),
            Action::Update => plan.writes.updates.push(s.clone()),
            Action::Unchanged => plan.unchanged += 1,
        }
    }
    plan
}

/// Diffs and commits one partition. Never fails: errors end up in the report.
pub fn reconcile_partition(
    store: &dyn DurableStore,
    partition: &Partition,
    staged: &[CustomerRecord],
) -> PartitionReport {
    let mut report = PartitionReport::new(&partition.name, &partition.country);
    report.staged = staged.len() as u64;

    let durable = match store.load_partition(partition) {
        Ok(rows) => rows,
        Err(source) => {
            return failed(report, partition, source);
        }
    };

    let plan = plan_partition(staged, &durable);
    report.unchanged = plan.unchanged;
    if plan.writes.is_empty() {
        return report;
    }

    if let Err(source) = store.apply(partition, &plan.writes) {
        return failed(report, partition, source);
    }

    report.inserted = plan.writes.inserts.len() as u64;
    report.updated = plan.writes.updates.len() as u64;
    report.status = PartitionStatus::Committed;
    tracing::debug!(partition = %partition, writes = plan.writes.len(), "partition committed");
    report
}

fn failed(mut report: PartitionReport, partition: &Partition, source: anyhow::Error) -> PartitionReport {
    let error = ReconcileError::PartitionWrite {
        partition: partition.name.clone(),
        detail: format!("{source:#}"),
    };
    tracing::error!(partition = %partition, "{error}");
    report.status = PartitionStatus::Failed {
        error: error.to_string(),
    };
    report
}

/// Reconciles `staged` into `store`, one task per partition, at most
/// `max_parallel_partitions` at a time.
pub async fn reconcile(
    store: Arc<dyn DurableStore>,
    router: &PartitionRouter,
    staged: Vec<CustomerRecord>,
    cfg: &ReconcileConfig,
) -> Result<ReconcileReport> {
    let RoutedStaging {
        partitions,
        rejects,
    } = route_staging(staged, router, cfg.strict)?;

    for r in &rejects {
        tracing::warn!(key = %r.key, code = r.error.code(), "{}", r.error);
    }

    let tasks = partitions.into_iter().map(|(partition, records)| {
        let store = Arc::clone(&store);
        async move {
            let name = partition.name.clone();
            let country = partition.country.clone();
            let staged = records.len() as u64;
            match tokio::task::spawn_blocking(move || {
                reconcile_partition(store.as_ref(), &partition, &records)
            })
            .await
            {
                Ok(report) => report,
                Err(join_err) => {
                    let mut report = PartitionReport::new(name, country);
                    report.staged = staged;
                    report.status = PartitionStatus::Failed {
                        error: format!("partition task aborted: {join_err}"),
                    };
                    report
                }
            }
        }
    });

    let mut reports: Vec<PartitionReport> = futures::stream::iter(tasks)
        .buffer_unordered(cfg.max_parallel_partitions.max(1))
        .collect()
        .await;

    for r in &rejects {
        let (Some(name), RecordError::DuplicateKey { country, .. }) = (&r.partition, &r.error) else {
            continue;
        };
        match reports.iter_mut().find(|p| &p.partition == name) {
            Some(p) => p.rejected_duplicates += 1,
            None => {
                let mut p = PartitionReport::new(name.clone(), country.clone());
                p.rejected_duplicates = 1;
                reports.push(p);
            }
        }
    }
    reports.sort_by(|a, b| a.partition.cmp(&b.partition));

    for p in &reports {
        tracing::info!(
            partition = %p.partition,
            country = %p.country,
            staged = p.staged,
            inserted = p.inserted,
            updated = p.updated,
            unchanged = p.unchanged,
            rejected = p.rejected_duplicates,
            failed = p.is_failed(),
            "partition reconciled"
        );
    }

    Ok(ReconcileReport {
        partitions: reports,
        rejects,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use anyhow::bail;
    use metadata::ActiveFlag;
    use std::collections::HashSet;
    use time::macros::date;

    fn rec(id: &str, country: &str) -> CustomerRecord {
        let mut r = CustomerRecord::new(id, "Alex", date!(2010 - 10 - 12), country);
        r.last_consulted_date = Some(date!(2024 - 02 - 20));
        r.days_since_last_consulted = Some(10);
        r.active_customer = ActiveFlag::Yes;
        r
    }

    fn router() -> PartitionRouter {
        PartitionRouter::new("customer_info", ["US", "IN", "AU"])
    }

    fn memory_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_partitions(router().partitions()))
    }

    fn seed(store: &MemoryStore, records: Vec<CustomerRecord>) {
        let router = router();
        let routed = route_staging(records, &router, true).unwrap();
        for (p, rows) in routed.partitions {
            store
                .apply(&p, &WritePlan { inserts: rows, updates: vec![] })
                .unwrap();
        }
    }

    /// Delegates to a memory store but refuses writes for the listed countries.
    struct FailingStore {
        inner: MemoryStore,
        failing: HashSet<String>,
    }

    impl DurableStore for FailingStore {
        fn load_partition(&self, partition: &Partition) -> Result<Vec<CustomerRecord>> {
            self.inner.load_partition(partition)
        }

        fn apply(&self, partition: &Partition, plan: &WritePlan) -> Result<()> {
            if self.failing.contains(&partition.country) {
                bail!("simulated write failure");
            }
            self.inner.apply(partition, plan)
        }
    }

    #[test]
    fn classify_by_comparison_fields() {
        let d = rec("C1", "US");
        assert_eq!(classify(&d, None), Action::Insert);
        assert_eq!(classify(&d, Some(&d)), Action::Unchanged);
        let mut s = d.clone();
        s.vaccination_type = Some("MVD".into());
        assert_eq!(classify(&s, Some(&d)), Action::Update);
    }

    #[tokio::test]
    async fn new_record_is_inserted() {
        let store = memory_store();
        let report = reconcile(store.clone(), &router(), vec![rec("C1", "US")], &ReconcileConfig::default())
            .await
            .unwrap();

        assert_eq!(report.inserted(), 1);
        assert_eq!(report.updated(), 0);
        let us = report.partition("customer_info_us").unwrap();
        assert_eq!(us.status, PartitionStatus::Committed);
        assert_eq!(store.snapshot().unwrap(), vec![rec("C1", "US")]);
    }

    #[tokio::test]
    async fn changed_consultation_updates_in_place() {
        let store = memory_store();
        let mut old = rec("C2", "IN");
        old.last_consulted_date = Some(date!(2023 - 01 - 01));
        old.days_since_last_consulted = Some(425);
        old.active_customer = ActiveFlag::No;
        seed(&store, vec![old]);

        let mut new = rec("C2", "IN");
        new.last_consulted_date = Some(date!(2023 - 06 - 01));
        new.days_since_last_consulted = Some(274);
        new.active_customer = ActiveFlag::No;

        let report = reconcile(store.clone(), &router(), vec![new.clone()], &ReconcileConfig::default())
            .await
            .unwrap();
        assert_eq!(report.updated(), 1);
        assert_eq!(report.inserted(), 0);

        let rows = store.snapshot().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key(), new.key());
        assert_eq!(rows[0].last_consulted_date, Some(date!(2023 - 06 - 01)));
        assert_eq!(rows[0].days_since_last_consulted, Some(274));
    }

    #[tokio::test]
    async fn identical_record_is_unchanged() {
        let store = memory_store();
        seed(&store, vec![rec("C1", "US")]);
        let report = reconcile(store.clone(), &router(), vec![rec("C1", "US")], &ReconcileConfig::default())
            .await
            .unwrap();
        let us = report.partition("customer_info_us").unwrap();
        assert_eq!(us.unchanged, 1);
        assert_eq!(us.status, PartitionStatus::NoChanges);
        assert_eq!(report.inserted() + report.updated(), 0);
    }

    #[tokio::test]
    async fn second_identical_run_writes_nothing() {
        let store = memory_store();
        let staged = vec![rec("C1", "US"), rec("C2", "IN"), rec("C3", "AU")];
        let cfg = ReconcileConfig::default();
        let first = reconcile(store.clone(), &router(), staged.clone(), &cfg).await.unwrap();
        assert_eq!(first.inserted(), 3);

        let second = reconcile(store.clone(), &router(), staged, &cfg).await.unwrap();
        assert_eq!(second.inserted() + second.updated(), 0);
        assert_eq!(second.unchanged(), 3);
    }

    #[tokio::test]
    async fn duplicate_keys_are_rejected_together() {
        let store = memory_store();
        let mut second = rec("C3", "US");
        second.doctor_consulted = Some("Paul".into());
        let staged = vec![rec("C3", "US"), second, rec("C4", "US")];

        let report = reconcile(store.clone(), &router(), staged, &ReconcileConfig::default())
            .await
            .unwrap();
        assert_eq!(report.rejects.len(), 2);
        assert!(report
            .rejects
            .iter()
            .all(|r| matches!(r.error, RecordError::DuplicateKey { .. })));
        let us = report.partition("customer_info_us").unwrap();
        assert_eq!(us.rejected_duplicates, 2);
        assert_eq!(us.inserted, 1);

        let ids: Vec<_> = store.snapshot().unwrap().into_iter().map(|r| r.customer_id).collect();
        assert_eq!(ids, vec!["C4"]);
    }

    #[tokio::test]
    async fn duplicate_only_partition_is_reported_untouched() {
        let store = memory_store();
        let staged = vec![rec("C3", "AU"), rec("C3", "AU")];
        let report = reconcile(store.clone(), &router(), staged, &ReconcileConfig::default())
            .await
            .unwrap();
        let au = report.partition("customer_info_au").unwrap();
        assert_eq!(au.rejected_duplicates, 2);
        assert_eq!(au.status, PartitionStatus::NoChanges);
        assert!(store.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn strict_mode_aborts_before_writing() {
        let store = memory_store();
        let cfg = ReconcileConfig {
            strict: true,
            ..ReconcileConfig::default()
        };
        let staged = vec![rec("C1", "US"), rec("C9", "NZ")];
        let err = reconcile(store.clone(), &router(), staged, &cfg).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::StrictViolation { count: 1, .. })
        ));
        assert!(store.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn strict_mode_aborts_on_duplicate_key_before_writing() {
        let store = memory_store();
        let cfg = ReconcileConfig {
            strict: true,
            ..ReconcileConfig::default()
        };
        let staged = vec![rec("C1", "US"), rec("C3", "US"), rec("C3", "US")];
        let err = reconcile(store.clone(), &router(), staged, &cfg).await.unwrap_err();
        match err.downcast_ref::<ReconcileError>() {
            Some(ReconcileError::StrictViolation { count, first }) => {
                assert_eq!(*count, 2);
                assert!(matches!(first, RecordError::DuplicateKey { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(store.snapshot().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unroutable_country_is_reported_not_dropped() {
        let store = memory_store();
        let report = reconcile(store.clone(), &router(), vec![rec("C9", "NZ")], &ReconcileConfig::default())
            .await
            .unwrap();
        assert_eq!(report.rejects.len(), 1);
        assert_eq!(report.rejects[0].error.code(), "CUST_PARTITION_UNROUTABLE");
        assert!(report.partitions.is_empty());
    }

    #[tokio::test]
    async fn failing_partition_does_not_touch_others() {
        let inner = MemoryStore::with_partitions(router().partitions());
        let store = Arc::new(FailingStore {
            inner,
            failing: HashSet::from(["IN".to_string()]),
        });
        let staged = vec![rec("C1", "US"), rec("C2", "IN"), rec("C3", "AU")];
        let cfg = ReconcileConfig {
            max_parallel_partitions: 3,
            ..ReconcileConfig::default()
        };

        let report = reconcile(store.clone(), &router(), staged, &cfg).await.unwrap();
        let failed: Vec<_> = report.failed_partitions().map(|p| p.country.as_str()).collect();
        assert_eq!(failed, vec!["IN"]);
        assert_eq!(report.inserted(), 2);

        let countries: Vec<_> = store
            .inner
            .snapshot()
            .unwrap()
            .into_iter()
            .map(|r| r.country)
            .collect();
        assert_eq!(countries, vec!["AU", "US"]);
    }

    #[tokio::test]
    async fn absent_durable_records_are_kept() {
        let store = memory_store();
        seed(&store, vec![rec("C1", "US"), rec("C2", "US"), rec("C5", "IN")]);
        let before = store.snapshot().unwrap();

        let report = reconcile(store.clone(), &router(), vec![rec("C7", "US")], &ReconcileConfig::default())
            .await
            .unwrap();
        assert_eq!(report.inserted(), 1);

        let after = store.snapshot().unwrap();
        for r in &before {
            assert!(after.contains(r));
        }
        assert_eq!(after.len(), before.len() + 1);

        let mut keys: Vec<_> = after.iter().map(|r| r.key()).collect();
        let total = keys.len();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), total);
    }
}
