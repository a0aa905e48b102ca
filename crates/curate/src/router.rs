use metadata::RecordError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Handle on one country's slice of the durable table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Partition {
    pub country: String,
    /// Physical name, `<table>_<country>` in lower case.
    pub name: String,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Maps a country code onto its partition from a closed, configured set.
#[derive(Debug, Clone)]
pub struct PartitionRouter {
    partitions: BTreeMap<String, Partition>,
}

impl PartitionRouter {
    pub fn new<I, S>(table: &str, countries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let partitions = countries
            .into_iter()
            .map(|c| c.as_ref().trim().to_uppercase())
            .filter(|c| !c.is_empty())
            .map(|country| {
                let partition = Partition {
                    name: format!("{}_{}", table, country.to_lowercase()),
                    country: country.clone(),
                };
                (country, partition)
            })
            .collect();
        Self { partitions }
    }

    pub fn route(&self, country: &str) -> Result<&Partition, RecordError> {
        self.partitions
            .get(country.trim().to_uppercase().as_str())
            .ok_or_else(|| RecordError::UnroutablePartition {
                country: country.to_string(),
            })
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values()
    }
}
