//! Row-level validation: one [`RawRow`] in, one typed [`CustomerRecord`] out.
use metadata::record::{MAX_CODE_LEN, MAX_CUSTOMER_ID_LEN, MAX_CUSTOMER_NAME_LEN, MAX_DOCTOR_LEN};
use metadata::{ColumnMap, ConfigError, CustomerRecord, RawRow, RecordError, Rules, ValidationReason};
use time::format_description::OwnedFormatItem;
use time::Date;

pub struct Validator {
    columns: ColumnMap,
    date_fmt: OwnedFormatItem,
    date_fmt_str: String,
    dob_fmt: OwnedFormatItem,
    dob_fmt_str: String,
}

impl Validator {
    pub fn new(columns: ColumnMap, rules: &Rules) -> Result<Self, ConfigError> {
        Ok(Self {
            columns,
            date_fmt: rules.parsed_date_format()?,
            date_fmt_str: rules.date_format.clone(),
            dob_fmt: rules.parsed_dob_format()?,
            dob_fmt_str: rules.dob_format_str().to_string(),
        })
    }

    pub fn validate_row(&self, row: &RawRow) -> Result<CustomerRecord, RecordError> {
        if !row.overflow().is_empty() {
            return Err(RecordError::Validation {
                field: "row",
                reason: ValidationReason::FieldCount {
                    expected: row.field_count(),
                    actual: row.field_count() + row.overflow().len(),
                },
            });
        }
        let c = &self.columns;

        let customer_name = required(row, &c.customer_name, "customer_name")?;
        check_len("customer_name", customer_name, MAX_CUSTOMER_NAME_LEN)?;
        let customer_id = required(row, &c.customer_id, "customer_id")?;
        check_len("customer_id", customer_id, MAX_CUSTOMER_ID_LEN)?;
        let open_raw = required(row, &c.customer_open_date, "customer_open_date")?;
        let customer_open_date = self.parse_date("customer_open_date", open_raw)?;
        let country = required(row, &c.country, "country")?.to_uppercase();
        check_len("country", &country, MAX_CODE_LEN)?;

        let last_consulted_date = row
            .get(&c.last_consulted_date)
            .map(|s| self.parse_date("last_consulted_date", s))
            .transpose()?;
        let date_of_birth = row
            .get(&c.date_of_birth)
            .map(|s| {
                Date::parse(s, &self.dob_fmt).map_err(|_| RecordError::Validation {
                    field: "date_of_birth",
                    reason: ValidationReason::MalformedDate {
                        format: self.dob_fmt_str.clone(),
                    },
                })
            })
            .transpose()?;

        let vaccination_type = optional(row, &c.vaccination_type, "vaccination_type", MAX_CODE_LEN)?;
        let doctor_consulted = optional(row, &c.doctor_consulted, "doctor_consulted", MAX_DOCTOR_LEN)?;
        let state = optional(row, &c.state, "state", MAX_CODE_LEN)?;

        let post_code = row
            .get(&c.post_code)
            .map(|s| {
                s.parse::<i32>().map_err(|_| RecordError::Validation {
                    field: "post_code",
                    reason: ValidationReason::TypeMismatch { expected: "integer" },
                })
            })
            .transpose()?;

        let mut record = CustomerRecord::new(customer_id, customer_name, customer_open_date, country);
        record.last_consulted_date = last_consulted_date;
        record.vaccination_type = vaccination_type;
        record.doctor_consulted = doctor_consulted;
        record.state = state;
        record.post_code = post_code;
        record.date_of_birth = date_of_birth;
        Ok(record)
    }

    fn parse_date(&self, field: &'static str, s: &str) -> Result<Date, RecordError> {
        Date::parse(s, &self.date_fmt).map_err(|_| RecordError::Validation {
            field,
            reason: ValidationReason::MalformedDate {
                format: self.date_fmt_str.clone(),
            },
        })
    }
}

fn required<'a>(row: &'a RawRow, column: &str, field: &'static str) -> Result<&'a str, RecordError> {
    row.get(column).ok_or_else(|| RecordError::missing(field))
}

fn optional(
    row: &RawRow,
    column: &str,
    field: &'static str,
    max: usize,
) -> Result<Option<String>, RecordError> {
    match row.get(column) {
        Some(v) => {
            check_len(field, v, max)?;
            Ok(Some(v.to_string()))
        }
        None => Ok(None),
    }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), RecordError> {
    let actual = value.chars().count();
    if actual > max {
        return Err(RecordError::Validation {
            field,
            reason: ValidationReason::TooLong { max, actual },
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    fn validator() -> Validator {
        let rules = Rules {
            date_of_birth_format: Some("[day][month][year]".into()),
            countries: vec!["USA".into()],
            ..Rules::default()
        };
        Validator::new(ColumnMap::default(), &rules).unwrap()
    }

    fn alex() -> RawRow {
        RawRow::new(1)
            .with_field("Customer_Name", "Alex")
            .with_field("Customer_ID", "123457")
            .with_field("Customer_Open_Date", "20101012")
            .with_field("Last_Consulted_Date", "20121013")
            .with_field("Vaccination_Type", "MVD")
            .with_field("Doctor_Consulted", "Paul")
            .with_field("State", "SA")
            .with_field("Country", "usa")
            .with_field("Post_Code", "5000")
            .with_field("Date_of_Birth", "06031987")
    }

    #[test]
    fn typed_record_from_complete_row() {
        let r = validator().validate_row(&alex()).unwrap();
        assert_eq!(r.customer_id, "123457");
        assert_eq!(r.country, "USA");
        assert_eq!(r.customer_open_date, date!(2010 - 10 - 12));
        assert_eq!(r.last_consulted_date, Some(date!(2012 - 10 - 13)));
        assert_eq!(r.date_of_birth, Some(date!(1987 - 03 - 06)));
        assert_eq!(r.post_code, Some(5000));
        assert_eq!(r.age, None);
    }

    #[test]
    fn blank_optionals_become_null() {
        let row = alex()
            .with_field("Last_Consulted_Date", "")
            .with_field("Post_Code", " ")
            .with_field("State", "");
        let r = validator().validate_row(&row).unwrap();
        assert_eq!(r.last_consulted_date, None);
        assert_eq!(r.post_code, None);
        assert_eq!(r.state, None);
    }

    #[test]
    fn missing_required_field() {
        let row = alex().with_field("Customer_Name", "  ");
        let err = validator().validate_row(&row).unwrap_err();
        assert_eq!(err, RecordError::missing("customer_name"));
    }

    #[test]
    fn id_longer_than_eighteen_chars() {
        let row = alex().with_field("Customer_ID", "1234567890123456789");
        let err = validator().validate_row(&row).unwrap_err();
        assert_eq!(
            err,
            RecordError::Validation {
                field: "customer_id",
                reason: ValidationReason::TooLong { max: 18, actual: 19 },
            }
        );
    }

    #[test]
    fn extra_values_reject_the_row() {
        let mut row = alex();
        row.push_overflow("A");
        let err = validator().validate_row(&row).unwrap_err();
        assert_eq!(err.code(), "CUST_FIELD_COUNT");
        assert_eq!(
            err,
            RecordError::Validation {
                field: "row",
                reason: ValidationReason::FieldCount { expected: 10, actual: 11 },
            }
        );
    }

    #[test]
    fn malformed_dates_and_numbers() {
        let err = validator()
            .validate_row(&alex().with_field("Customer_Open_Date", "2010-10-12"))
            .unwrap_err();
        assert_eq!(err.code(), "CUST_DATE_MALFORMED");

        let err = validator()
            .validate_row(&alex().with_field("Date_of_Birth", "19870306"))
            .unwrap_err();
        assert!(matches!(err, RecordError::Validation { field: "date_of_birth", .. }));

        let err = validator()
            .validate_row(&alex().with_field("Post_Code", "50A0"))
            .unwrap_err();
        assert_eq!(err.code(), "CUST_TYPE_MISMATCH");
    }
}
