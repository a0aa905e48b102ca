//! Derived fields: age, days since last consultation, active flag.
//!
//! Everything here is a pure function of the record and an explicit run date.
use metadata::{ActiveFlag, CustomerRecord, RecordError};
use std::fmt;
use time::Date;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataQualityWarning {
    ConsultedBeforeOpen { last_consulted: Date, opened: Date },
}

impl fmt::Display for DataQualityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataQualityWarning::ConsultedBeforeOpen {
                last_consulted,
                opened,
            } => write!(
                f,
                "last_consulted_date {last_consulted} precedes customer_open_date {opened}"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enriched {
    pub record: CustomerRecord,
    pub warnings: Vec<DataQualityWarning>,
}

/// Whole years from `dob` to `run_date`.
pub fn age_on(dob: Date, run_date: Date) -> Result<i32, RecordError> {
    if dob > run_date {
        return Err(RecordError::InvalidDate {
            field: "date_of_birth",
            detail: format!("{dob} is after run date {run_date}"),
        });
    }
    let mut years = run_date.year() - dob.year();
    if (u8::from(run_date.month()), run_date.day()) < (u8::from(dob.month()), dob.day()) {
        years -= 1;
    }
    Ok(years)
}

pub fn days_between(earlier: Date, run_date: Date) -> Result<i64, RecordError> {
    if earlier > run_date {
        return Err(RecordError::InvalidDate {
            field: "last_consulted_date",
            detail: format!("{earlier} is after run date {run_date}"),
        });
    }
    Ok((run_date - earlier).whole_days())
}

pub fn derive(
    mut record: CustomerRecord,
    run_date: Date,
    freshness_threshold_days: u32,
) -> Result<Enriched, RecordError> {
    let mut warnings = Vec::new();

    record.age = record
        .date_of_birth
        .map(|dob| age_on(dob, run_date))
        .transpose()?;

    record.days_since_last_consulted = record
        .last_consulted_date
        .map(|d| days_between(d, run_date))
        .transpose()?;

    record.active_customer = match record.days_since_last_consulted {
        Some(days) if days <= i64::from(freshness_threshold_days) => ActiveFlag::Yes,
        _ => ActiveFlag::No,
    };

    if let Some(last) = record.last_consulted_date {
        if last < record.customer_open_date {
            warnings.push(DataQualityWarning::ConsultedBeforeOpen {
                last_consulted: last,
                opened: record.customer_open_date,
            });
        }
    }

    Ok(Enriched { record, warnings })
}
