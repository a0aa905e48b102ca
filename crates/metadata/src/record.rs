//! Customer record model shared by every pipeline stage.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::Date;

pub const MAX_CUSTOMER_ID_LEN: usize = 18;
pub const MAX_CUSTOMER_NAME_LEN: usize = 255;
pub const MAX_DOCTOR_LEN: usize = 255;
pub const MAX_CODE_LEN: usize = 5;

/// One untyped data row as read from the export, keyed by header name.
///
/// Only the validator looks inside; every later stage works on [`CustomerRecord`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRow {
    /// 1-based position among the data rows of the source file.
    pub line: u64,
    fields: BTreeMap<String, String>,
    /// Values past the last header column.
    overflow: Vec<String>,
}

impl RawRow {
    pub fn new(line: u64) -> Self {
        Self {
            line,
            fields: BTreeMap::new(),
            overflow: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Trimmed value, `None` when the column is absent or blank.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Untrimmed value, used when echoing the row back into a rejects file.
    pub fn raw(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn push_overflow(&mut self, value: impl Into<String>) {
        self.overflow.push(value.into());
    }

    pub fn overflow(&self) -> &[String] {
        &self.overflow
    }

    /// Number of header columns this row carries a value for.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ActiveFlag {
    #[serde(rename = "Y")]
    Yes,
    #[default]
    #[serde(rename = "N")]
    No,
}

impl ActiveFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            ActiveFlag::Yes => "Y",
            ActiveFlag::No => "N",
        }
    }

    pub fn from_str_flag(s: &str) -> Option<Self> {
        match s.trim() {
            "Y" | "y" => Some(ActiveFlag::Yes),
            "N" | "n" => Some(ActiveFlag::No),
            _ => None,
        }
    }
}

impl fmt::Display for ActiveFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite primary key of the durable customer table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CustomerKey {
    pub customer_id: String,
    pub country: String,
}

impl fmt::Display for CustomerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.customer_id, self.country)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub customer_id: String,
    pub customer_name: String,
    pub customer_open_date: Date,
    pub last_consulted_date: Option<Date>,
    pub vaccination_type: Option<String>,
    pub doctor_consulted: Option<String>,
    pub state: Option<String>,
    pub country: String,
    pub post_code: Option<i32>,
    pub date_of_birth: Option<Date>,
    pub active_customer: ActiveFlag,
    pub age: Option<i32>,
    pub days_since_last_consulted: Option<i64>,
}

impl CustomerRecord {
    /// Record with only the required fields set; optional and derived fields empty.
    pub fn new(
        customer_id: impl Into<String>,
        customer_name: impl Into<String>,
        customer_open_date: Date,
        country: impl Into<String>,
    ) -> Self {
        Self {
            customer_id: customer_id.into(),
            customer_name: customer_name.into(),
            customer_open_date,
            last_consulted_date: None,
            vaccination_type: None,
            doctor_consulted: None,
            state: None,
            country: country.into(),
            post_code: None,
            date_of_birth: None,
            active_customer: ActiveFlag::No,
            age: None,
            days_since_last_consulted: None,
        }
    }

    pub fn key(&self) -> CustomerKey {
        CustomerKey {
            customer_id: self.customer_id.clone(),
            country: self.country.clone(),
        }
    }

    /// True when the fields that decide an incremental update differ.
    ///
    /// Name, state, post code and the open date do not participate: a record that
    /// differs only there is reported unchanged and not rewritten.
    pub fn differs_for_update(&self, other: &CustomerRecord) -> bool {
        self.last_consulted_date != other.last_consulted_date
            || self.doctor_consulted != other.doctor_consulted
            || self.vaccination_type != other.vaccination_type
            || self.age != other.age
            || self.days_since_last_consulted != other.days_since_last_consulted
            || self.active_customer != other.active_customer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn raw_row_blank_values_read_as_absent() {
        let row = RawRow::new(1)
            .with_field("Customer_Name", "  Alex ")
            .with_field("State", "   ");
        assert_eq!(row.get("Customer_Name"), Some("Alex"));
        assert_eq!(row.get("State"), None);
        assert_eq!(row.raw("State"), Some("   "));
        assert_eq!(row.get("Country"), None);
    }

    #[test]
    fn update_comparison_ignores_descriptive_fields() {
        let mut a = CustomerRecord::new("C1", "Alex", date!(2010 - 10 - 12), "US");
        a.last_consulted_date = Some(date!(2023 - 01 - 01));
        let mut b = a.clone();
        b.customer_name = "Alexander".into();
        b.state = Some("NY".into());
        assert!(!a.differs_for_update(&b));

        b.doctor_consulted = Some("Dr. Smith".into());
        assert!(a.differs_for_update(&b));
    }

    #[test]
    fn active_flag_chars() {
        assert_eq!(ActiveFlag::Yes.to_string(), "Y");
        assert_eq!(ActiveFlag::from_str_flag(" n"), Some(ActiveFlag::No));
        assert_eq!(ActiveFlag::from_str_flag("maybe"), None);
    }
}
