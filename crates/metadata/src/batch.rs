//! Arrow schema of the staging and durable customer tables, and the
//! conversions between record batches and [`CustomerRecord`]s.
use crate::record::{ActiveFlag, CustomerRecord};
use anyhow::{anyhow, Context, Result};
use arrow::array::{
    Array, ArrayRef, Date32Array, Date32Builder, Int32Array, Int32Builder, Int64Array,
    Int64Builder, StringArray, StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;
use time::macros::date;
use time::{Date, Duration};

pub const CUSTOMER_ID: &str = "customer_id";
pub const CUSTOMER_NAME: &str = "customer_name";
pub const CUSTOMER_OPEN_DATE: &str = "customer_open_date";
pub const LAST_CONSULTED_DATE: &str = "last_consulted_date";
pub const VACCINATION_TYPE: &str = "vaccination_type";
pub const DOCTOR_CONSULTED: &str = "doctor_consulted";
pub const STATE: &str = "state";
pub const COUNTRY: &str = "country";
pub const POST_CODE: &str = "post_code";
pub const DATE_OF_BIRTH: &str = "date_of_birth";
pub const ACTIVE_CUSTOMER: &str = "active_customer";
pub const AGE: &str = "age";
pub const DAYS_SINCE_LAST_CONSULTED: &str = "days_since_last_consulted";

pub fn customer_schema() -> SchemaRef {
    use DataType::*;
    Arc::new(Schema::new(vec![
        Field::new(CUSTOMER_ID, Utf8, false),
        Field::new(CUSTOMER_NAME, Utf8, false),
        Field::new(CUSTOMER_OPEN_DATE, Date32, false),
        Field::new(LAST_CONSULTED_DATE, Date32, true),
        Field::new(VACCINATION_TYPE, Utf8, true),
        Field::new(DOCTOR_CONSULTED, Utf8, true),
        Field::new(STATE, Utf8, true),
        Field::new(COUNTRY, Utf8, false),
        Field::new(POST_CODE, Int32, true),
        Field::new(DATE_OF_BIRTH, Date32, true),
        Field::new(ACTIVE_CUSTOMER, Utf8, false),
        Field::new(AGE, Int32, true),
        Field::new(DAYS_SINCE_LAST_CONSULTED, Int64, true),
    ]))
}

const UNIX_EPOCH: Date = date!(1970 - 01 - 01);

pub fn date32_from_date(d: Date) -> i32 {
    (d - UNIX_EPOCH).whole_days() as i32
}

pub fn date_from_date32(days: i32) -> Result<Date> {
    UNIX_EPOCH
        .checked_add(Duration::days(days as i64))
        .ok_or_else(|| anyhow!("Date32 value {days} out of range"))
}

struct CustomerBuilders {
    customer_id: StringBuilder,
    customer_name: StringBuilder,
    customer_open_date: Date32Builder,
    last_consulted_date: Date32Builder,
    vaccination_type: StringBuilder,
    doctor_consulted: StringBuilder,
    state: StringBuilder,
    country: StringBuilder,
    post_code: Int32Builder,
    date_of_birth: Date32Builder,
    active_customer: StringBuilder,
    age: Int32Builder,
    days_since_last_consulted: Int64Builder,
}

impl CustomerBuilders {
    fn with_capacity(cap: usize) -> Self {
        Self {
            customer_id: StringBuilder::with_capacity(cap, cap * 18),
            customer_name: StringBuilder::with_capacity(cap, cap * 16),
            customer_open_date: Date32Builder::with_capacity(cap),
            last_consulted_date: Date32Builder::with_capacity(cap),
            vaccination_type: StringBuilder::with_capacity(cap, cap * 5),
            doctor_consulted: StringBuilder::with_capacity(cap, cap * 16),
            state: StringBuilder::with_capacity(cap, cap * 5),
            country: StringBuilder::with_capacity(cap, cap * 5),
            post_code: Int32Builder::with_capacity(cap),
            date_of_birth: Date32Builder::with_capacity(cap),
            active_customer: StringBuilder::with_capacity(cap, cap),
            age: Int32Builder::with_capacity(cap),
            days_since_last_consulted: Int64Builder::with_capacity(cap),
        }
    }

    fn append(&mut self, r: &CustomerRecord) {
        self.customer_id.append_value(&r.customer_id);
        self.customer_name.append_value(&r.customer_name);
        self.customer_open_date
            .append_value(date32_from_date(r.customer_open_date));
        self.last_consulted_date
            .append_option(r.last_consulted_date.map(date32_from_date));
        self.vaccination_type
            .append_option(r.vaccination_type.as_deref());
        self.doctor_consulted
            .append_option(r.doctor_consulted.as_deref());
        self.state.append_option(r.state.as_deref());
        self.country.append_value(&r.country);
        self.post_code.append_option(r.post_code);
        self.date_of_birth
            .append_option(r.date_of_birth.map(date32_from_date));
        self.active_customer.append_value(r.active_customer.as_str());
        self.age.append_option(r.age);
        self.days_since_last_consulted
            .append_option(r.days_since_last_consulted);
    }

    fn finish(mut self, schema: SchemaRef) -> Result<RecordBatch> {
        macro_rules! finish {
            ($b:expr) => {
                Arc::new($b.finish()) as ArrayRef
            };
        }
        let cols: Vec<ArrayRef> = vec![
            finish!(self.customer_id),
            finish!(self.customer_name),
            finish!(self.customer_open_date),
            finish!(self.last_consulted_date),
            finish!(self.vaccination_type),
            finish!(self.doctor_consulted),
            finish!(self.state),
            finish!(self.country),
            finish!(self.post_code),
            finish!(self.date_of_birth),
            finish!(self.active_customer),
            finish!(self.age),
            finish!(self.days_since_last_consulted),
        ];
        Ok(RecordBatch::try_new(schema, cols)?)
    }
}

pub fn records_to_batch(records: &[CustomerRecord]) -> Result<RecordBatch> {
    let mut b = CustomerBuilders::with_capacity(records.len());
    for r in records {
        b.append(r);
    }
    b.finish(customer_schema())
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    let idx = batch
        .schema()
        .index_of(name)
        .with_context(|| format!("missing column '{name}'"))?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("unexpected Arrow type for column '{name}'"))
}

fn opt_str(arr: &StringArray, row: usize) -> Option<String> {
    if arr.is_null(row) {
        None
    } else {
        Some(arr.value(row).to_string())
    }
}

fn opt_date(arr: &Date32Array, row: usize) -> Result<Option<Date>> {
    if arr.is_null(row) {
        Ok(None)
    } else {
        date_from_date32(arr.value(row)).map(Some)
    }
}

fn req_str<'a>(arr: &'a StringArray, row: usize, name: &str) -> Result<&'a str> {
    if arr.is_null(row) {
        return Err(anyhow!("null in non-nullable column '{name}' at row {row}"));
    }
    Ok(arr.value(row))
}

pub fn records_from_batch(batch: &RecordBatch) -> Result<Vec<CustomerRecord>> {
    let customer_id = column::<StringArray>(batch, CUSTOMER_ID)?;
    let customer_name = column::<StringArray>(batch, CUSTOMER_NAME)?;
    let customer_open_date = column::<Date32Array>(batch, CUSTOMER_OPEN_DATE)?;
    let last_consulted_date = column::<Date32Array>(batch, LAST_CONSULTED_DATE)?;
    let vaccination_type = column::<StringArray>(batch, VACCINATION_TYPE)?;
    let doctor_consulted = column::<StringArray>(batch, DOCTOR_CONSULTED)?;
    let state = column::<StringArray>(batch, STATE)?;
    let country = column::<StringArray>(batch, COUNTRY)?;
    let post_code = column::<Int32Array>(batch, POST_CODE)?;
    let date_of_birth = column::<Date32Array>(batch, DATE_OF_BIRTH)?;
    let active_customer = column::<StringArray>(batch, ACTIVE_CUSTOMER)?;
    let age = column::<Int32Array>(batch, AGE)?;
    let days = column::<Int64Array>(batch, DAYS_SINCE_LAST_CONSULTED)?;

    let mut out = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        if customer_open_date.is_null(row) {
            return Err(anyhow!("null customer_open_date at row {row}"));
        }
        let flag = req_str(active_customer, row, ACTIVE_CUSTOMER)?;
        out.push(CustomerRecord {
            customer_id: req_str(customer_id, row, CUSTOMER_ID)?.to_string(),
            customer_name: req_str(customer_name, row, CUSTOMER_NAME)?.to_string(),
            customer_open_date: date_from_date32(customer_open_date.value(row))?,
            last_consulted_date: opt_date(last_consulted_date, row)?,
            vaccination_type: opt_str(vaccination_type, row),
            doctor_consulted: opt_str(doctor_consulted, row),
            state: opt_str(state, row),
            country: req_str(country, row, COUNTRY)?.to_string(),
            post_code: (!post_code.is_null(row)).then(|| post_code.value(row)),
            date_of_birth: opt_date(date_of_birth, row)?,
            active_customer: ActiveFlag::from_str_flag(flag)
                .ok_or_else(|| anyhow!("invalid active_customer '{flag}' at row {row}"))?,
            age: (!age.is_null(row)).then(|| age.value(row)),
            days_since_last_consulted: (!days.is_null(row)).then(|| days.value(row)),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date32_matches_unix_days() {
        assert_eq!(date32_from_date(date!(1970 - 01 - 02)), 1);
        assert_eq!(date32_from_date(date!(1969 - 12 - 31)), -1);
        assert_eq!(date_from_date32(19_723).unwrap(), date!(2024 - 01 - 01));
    }

    #[test]
    fn batch_preserves_nulls_and_derived_fields() {
        let mut full = CustomerRecord::new("C1", "Alex", date!(2010 - 10 - 12), "US");
        full.last_consulted_date = Some(date!(2023 - 06 - 01));
        full.vaccination_type = Some("MVD".into());
        full.post_code = Some(10001);
        full.date_of_birth = Some(date!(1987 - 03 - 06));
        full.active_customer = ActiveFlag::Yes;
        full.age = Some(36);
        full.days_since_last_consulted = Some(12);
        let sparse = CustomerRecord::new("C2", "Sam", date!(2012 - 01 - 01), "IN");

        let batch = records_to_batch(&[full.clone(), sparse.clone()]).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema(), customer_schema());
        assert_eq!(records_from_batch(&batch).unwrap(), vec![full, sparse]);
    }

    #[test]
    fn missing_column_is_reported_by_name() {
        let schema = Arc::new(Schema::new(vec![Field::new(
            CUSTOMER_ID,
            DataType::Utf8,
            false,
        )]));
        let ids: ArrayRef = Arc::new(StringArray::from(vec!["C1"]));
        let batch = RecordBatch::try_new(schema, vec![ids]).unwrap();
        let err = records_from_batch(&batch).unwrap_err();
        assert!(err.to_string().contains("customer_name"));
    }
}
