// src/gap_detector.rs
use chrono::NaiveDate;

use crate::hours_table::{Field, HoursRecord, HoursTable};

/// A date with at least one missing punch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gap {
    pub date: NaiveDate,
    pub missing: Vec<Field>,
}

pub fn missing_fields(record: &HoursRecord) -> Vec<Field> {
    Field::ALL
        .into_iter()
        .filter(|field| record.get(*field).is_none())
        .collect()
}

/// Per-row null scan, in table order.
pub fn detect_gaps(table: &HoursTable) -> Vec<Gap> {
    table
        .records()
        .iter()
        .filter_map(|record| {
            let missing = missing_fields(record);
            (!missing.is_empty()).then(|| Gap {
                date: record.date,
                missing,
            })
        })
        .collect()
}
