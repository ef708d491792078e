// src/hours_table.rs
//! Turns the portal's results page into an [`HoursTable`].
//!
//! The page renders auxiliary tables before the results, so the last `<table>`
//! of the document is the canonical one. Its first rows are decorative headers
//! and only the first five columns carry data: date, clock-in, break start,
//! break end and clock-out. Anything after that is ignored.

use chrono::{NaiveDate, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::date_policy::DateRange;

pub const DEFAULT_SKIP_ROWS: usize = 2;
/// Two-digit year, as rendered in the portal's date column.
pub const TABLE_DATE_FORMAT: &str = "%d/%m/%y";
const DATE_SEPARATOR: &str = " - ";
const MAX_COLSPAN: usize = 64;

static TABLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("table").expect("table selector is valid"));
static ROW_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("tr").expect("row selector is valid"));
static TIME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2}):(\d{2})\b").expect("time pattern is valid"));

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("Table not found")]
    TableNotFound,
    #[error("Row {row}: cannot parse date from '{text}'")]
    InvalidDate { row: usize, text: String },
    #[error("Date {0} appears more than once in the hours table")]
    DuplicateDate(NaiveDate),
}

/// The four punch columns, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    ClockIn,
    BreakIn,
    BreakOut,
    ClockOut,
}

impl Field {
    pub const ALL: [Field; 4] = [
        Field::ClockIn,
        Field::BreakIn,
        Field::BreakOut,
        Field::ClockOut,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Field::ClockIn => "clockin",
            Field::BreakIn => "breakin",
            Field::BreakOut => "breakout",
            Field::ClockOut => "clockout",
        }
    }

    pub fn from_key(key: &str) -> Option<Field> {
        Field::ALL.into_iter().find(|f| f.key() == key)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoursRecord {
    pub date: NaiveDate,
    pub clockin: Option<NaiveTime>,
    pub breakin: Option<NaiveTime>,
    pub breakout: Option<NaiveTime>,
    pub clockout: Option<NaiveTime>,
}

impl HoursRecord {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            clockin: None,
            breakin: None,
            breakout: None,
            clockout: None,
        }
    }

    pub fn get(&self, field: Field) -> Option<NaiveTime> {
        match field {
            Field::ClockIn => self.clockin,
            Field::BreakIn => self.breakin,
            Field::BreakOut => self.breakout,
            Field::ClockOut => self.clockout,
        }
    }

    pub fn set(&mut self, field: Field, value: Option<NaiveTime>) {
        match field {
            Field::ClockIn => self.clockin = value,
            Field::BreakIn => self.breakin = value,
            Field::BreakOut => self.breakout = value,
            Field::ClockOut => self.clockout = value,
        }
    }
}

/// Records in the order the portal rendered them, at most one per date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoursTable {
    records: Vec<HoursRecord>,
}

impl HoursTable {
    pub fn from_records(records: Vec<HoursRecord>) -> Result<Self, ExtractionError> {
        let mut seen = HashSet::new();
        for record in &records {
            if !seen.insert(record.date) {
                return Err(ExtractionError::DuplicateDate(record.date));
            }
        }
        Ok(Self { records })
    }

    /// Selects the results table of a full page and normalizes it.
    pub fn from_page(page_html: &str, skip_rows: usize) -> Result<Self, ExtractionError> {
        let table = extract_results_table(page_html)?;
        Self::from_table_html(&table, skip_rows)
    }

    pub fn from_table_html(table_html: &str, skip_rows: usize) -> Result<Self, ExtractionError> {
        let rows = table_rows(table_html)?;
        let mut records = Vec::with_capacity(rows.len().saturating_sub(skip_rows));

        for (index, cells) in rows.into_iter().enumerate().skip(skip_rows) {
            let Some(date_text) = cells.first() else {
                debug!("Skipping row {} without cells", index);
                continue;
            };
            let date = parse_table_date(date_text).ok_or_else(|| ExtractionError::InvalidDate {
                row: index,
                text: date_text.clone(),
            })?;

            let mut record = HoursRecord::empty(date);
            for (field, cell) in Field::ALL.iter().zip(cells.iter().skip(1)) {
                record.set(*field, parse_punch(cell));
            }
            records.push(record);
        }

        Self::from_records(records)
    }

    pub fn records(&self) -> &[HoursRecord] {
        &self.records
    }

    pub fn get(&self, date: NaiveDate) -> Option<&HoursRecord> {
        self.records.iter().find(|r| r.date == date)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Dates of `range` the portal rendered no row for.
    pub fn missing_dates(&self, range: &DateRange) -> Vec<NaiveDate> {
        range.days().filter(|d| self.get(*d).is_none()).collect()
    }

    /// Adds an empty record for every date of `range` without a row, keeping the
    /// records in date order. Returns the dates that were added.
    pub fn fill_missing(&mut self, range: &DateRange) -> Vec<NaiveDate> {
        let absent = self.missing_dates(range);
        if !absent.is_empty() {
            self.records
                .extend(absent.iter().copied().map(HoursRecord::empty));
            self.records.sort_by_key(|r| r.date);
        }
        absent
    }
}

/// Outer HTML of the last `<table>` on the page.
pub fn extract_results_table(page_html: &str) -> Result<String, ExtractionError> {
    let document = Html::parse_document(page_html);
    document
        .select(&TABLE_SELECTOR)
        .last()
        .map(|table| table.html())
        .ok_or(ExtractionError::TableNotFound)
}

/// Cell texts per row of the outermost table in `table_html`, colspans expanded.
fn table_rows(table_html: &str) -> Result<Vec<Vec<String>>, ExtractionError> {
    let fragment = Html::parse_fragment(table_html);
    let table = fragment
        .select(&TABLE_SELECTOR)
        .next()
        .ok_or(ExtractionError::TableNotFound)?;

    Ok(table
        .select(&ROW_SELECTOR)
        .filter(|row| owning_table(row).map_or(false, |owner| owner.id() == table.id()))
        .map(row_cells)
        .collect())
}

fn owning_table<'a>(row: &ElementRef<'a>) -> Option<ElementRef<'a>> {
    row.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "table")
}

fn row_cells(row: ElementRef<'_>) -> Vec<String> {
    let mut cells = Vec::new();
    for cell in row.children().filter_map(ElementRef::wrap) {
        if !matches!(cell.value().name(), "td" | "th") {
            continue;
        }
        let text = normalize_text(&cell.text().collect::<Vec<_>>().join(" "));
        let span = cell
            .value()
            .attr("colspan")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(1)
            .clamp(1, MAX_COLSPAN);
        cells.extend(std::iter::repeat(text).take(span));
    }
    cells
}

fn normalize_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `"10/01/24 - Quarta"` → 2024-01-10; only the part before the separator is the date.
pub fn parse_table_date(text: &str) -> Option<NaiveDate> {
    let date_part = text.split(DATE_SEPARATOR).next().unwrap_or_default().trim();
    NaiveDate::parse_from_str(date_part, TABLE_DATE_FORMAT).ok()
}

/// First `H:MM` token of a punch cell; blanks and anything else are absent.
pub fn parse_punch(text: &str) -> Option<NaiveTime> {
    let caps = TIME_PATTERN.captures(text)?;
    let hour = caps.get(1)?.as_str().parse().ok()?;
    let minute = caps.get(2)?.as_str().parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}
