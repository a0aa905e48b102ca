//! Durable, country-partitioned customer table.
//!
//! Partition provisioning is a precondition: a store never creates a partition while
//! applying writes. Each `apply` is a single transaction for its partition.
use crate::router::Partition;
use anyhow::{anyhow, bail, Context, Result};
use metadata::batch::{customer_schema, records_from_batch, records_to_batch};
use metadata::CustomerRecord;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::collections::BTreeMap;
use std::fs::{self, create_dir_all, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Writes for one partition.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WritePlan {
    pub inserts: Vec<CustomerRecord>,
    pub updates: Vec<CustomerRecord>,
}

impl WritePlan {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len()
    }
}

pub trait DurableStore: Send + Sync {
    fn load_partition(&self, partition: &Partition) -> Result<Vec<CustomerRecord>>;

    /// Applies every write of `plan` or none of them.
    fn apply(&self, partition: &Partition, plan: &WritePlan) -> Result<()>;
}

type PartitionRows = BTreeMap<String, CustomerRecord>;

fn index_rows(records: Vec<CustomerRecord>) -> PartitionRows {
    records
        .into_iter()
        .map(|r| (r.customer_id.clone(), r))
        .collect()
}

/// Applies `plan` to a copy of the partition content, checking every invariant first.
fn merge_plan(partition: &Partition, mut rows: PartitionRows, plan: &WritePlan) -> Result<PartitionRows> {
    for r in plan.inserts.iter().chain(plan.updates.iter()) {
        if r.country != partition.country {
            bail!(
                "record {} does not belong to partition {}",
                r.key(),
                partition.name
            );
        }
    }
    for r in &plan.inserts {
        if rows.insert(r.customer_id.clone(), r.clone()).is_some() {
            bail!("insert of existing key {} into {}", r.key(), partition.name);
        }
    }
    for r in &plan.updates {
        match rows.get_mut(&r.customer_id) {
            Some(existing) => *existing = r.clone(),
            None => bail!("update of missing key {} in {}", r.key(), partition.name),
        }
    }
    Ok(rows)
}

/// Store kept in memory; partitions must be provisioned before use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    partitions: RwLock<BTreeMap<String, PartitionRows>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_partitions<'a>(partitions: impl IntoIterator<Item = &'a Partition>) -> Self {
        let store = Self::new();
        if let Ok(mut guard) = store.partitions.write() {
            for p in partitions {
                guard.entry(p.name.clone()).or_default();
            }
        }
        store
    }

    pub fn provision(&self, partition: &Partition) -> Result<()> {
        self.partitions
            .write()
            .map_err(|_| anyhow!("store lock poisoned"))?
            .entry(partition.name.clone())
            .or_default();
        Ok(())
    }

    /// Every record across partitions, ordered by partition then customer id.
    pub fn snapshot(&self) -> Result<Vec<CustomerRecord>> {
        let guard = self
            .partitions
            .read()
            .map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(guard.values().flat_map(|rows| rows.values().cloned()).collect())
    }
}

impl DurableStore for MemoryStore {
    fn load_partition(&self, partition: &Partition) -> Result<Vec<CustomerRecord>> {
        let guard = self
            .partitions
            .read()
            .map_err(|_| anyhow!("store lock poisoned"))?;
        let rows = guard
            .get(&partition.name)
            .ok_or_else(|| anyhow!("partition {} is not provisioned", partition.name))?;
        Ok(rows.values().cloned().collect())
    }

    fn apply(&self, partition: &Partition, plan: &WritePlan) -> Result<()> {
        let mut guard = self
            .partitions
            .write()
            .map_err(|_| anyhow!("store lock poisoned"))?;
        let rows = guard
            .get(&partition.name)
            .ok_or_else(|| anyhow!("partition {} is not provisioned", partition.name))?;
        let merged = merge_plan(partition, rows.clone(), plan)?;
        guard.insert(partition.name.clone(), merged);
        Ok(())
    }
}

/// One Parquet file per partition under `<root>/country=<CODE>/`.
#[derive(Debug, Clone)]
pub struct ParquetStore {
    root: PathBuf,
}

const PART_FILE: &str = "part-000000.parquet";

impl ParquetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn partition_dir(&self, partition: &Partition) -> PathBuf {
        self.root.join(format!("country={}", partition.country))
    }

    fn partition_file(&self, partition: &Partition) -> PathBuf {
        self.partition_dir(partition).join(PART_FILE)
    }

    /// Creates the partition directory when missing. Returns true if it was created.
    pub fn provision(&self, partition: &Partition) -> Result<bool> {
        let dir = self.partition_dir(partition);
        if dir.is_dir() {
            tracing::info!(partition = %partition, "partition already exists");
            return Ok(false);
        }
        create_dir_all(&dir).with_context(|| format!("mkdir -p {}", dir.display()))?;
        tracing::info!(partition = %partition, "partition created");
        Ok(true)
    }

    fn ensure_provisioned(&self, partition: &Partition) -> Result<()> {
        let dir = self.partition_dir(partition);
        if !dir.is_dir() {
            bail!(
                "partition {} is not provisioned ({} missing)",
                partition.name,
                dir.display()
            );
        }
        Ok(())
    }

    fn read_file(path: &Path) -> Result<Vec<CustomerRecord>> {
        let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(f)?.build()?;
        let mut out = Vec::new();
        for maybe_batch in reader {
            out.extend(records_from_batch(&maybe_batch?)?);
        }
        Ok(out)
    }

    fn write_file(path: &Path, records: &[CustomerRecord]) -> Result<()> {
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(ZstdLevel::try_new(3)?))
            .set_dictionary_enabled(true)
            .build();
        let mut file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut writer = ArrowWriter::try_new(&mut file, customer_schema(), Some(props))?;
        if !records.is_empty() {
            writer.write(&records_to_batch(records)?)?;
        }
        writer.close()?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

impl DurableStore for ParquetStore {
    fn load_partition(&self, partition: &Partition) -> Result<Vec<CustomerRecord>> {
        self.ensure_provisioned(partition)?;
        let path = self.partition_file(partition);
        if !path.exists() {
            return Ok(Vec::new());
        }
        Self::read_file(&path)
    }

    fn apply(&self, partition: &Partition, plan: &WritePlan) -> Result<()> {
        let existing = self.load_partition(partition)?;
        let merged = merge_plan(partition, index_rows(existing), plan)?;
        let records: Vec<CustomerRecord> = merged.into_values().collect();

        let path = self.partition_file(partition);
        let tmp = path.with_file_name(format!("{PART_FILE}.tmp"));
        let written = Self::write_file(&tmp, &records).and_then(|_| {
            fs::rename(&tmp, &path)
                .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    }
}
