// src/date_policy.rs
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Weekday};
use std::fmt;
use thiserror::Error;

use crate::holidays::HolidayCalendar;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DateRangeError {
    #[error("Range start {start} is after range end {end}")]
    StartAfterEnd { start: NaiveDate, end: NaiveDate },
}

/// Inclusive pair of calendar dates sent to the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, DateRangeError> {
        if start > end {
            return Err(DateRangeError::StartAfterEnd { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// First to last day of the month containing `date`.
    pub fn month_of(date: NaiveDate) -> Self {
        let start = date.with_day(1).unwrap_or(date);
        let next_month = if date.month() == 12 {
            NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
        };
        let end = next_month
            .and_then(|d| d.pred_opt())
            .unwrap_or(date);
        Self { start, end }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn is_single_day(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single_day() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..={}", self.start, self.end)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditDecision {
    Audit(DateRange),
    Skip { date: NaiveDate, holiday: String },
}

/// The last workday before `now`: Friday on Mondays, yesterday otherwise.
pub fn audit_date(now: NaiveDateTime) -> NaiveDate {
    let today = now.date();
    let days_back = if today.weekday() == Weekday::Mon { 3 } else { 1 };
    today - Duration::days(days_back)
}

pub fn plan_audit(now: NaiveDateTime, holidays: &HolidayCalendar) -> AuditDecision {
    let date = audit_date(now);
    match holidays.get(date) {
        Some(name) => AuditDecision::Skip {
            date,
            holiday: name.to_string(),
        },
        None => AuditDecision::Audit(DateRange::single(date)),
    }
}

/// Same holiday rule as [`plan_audit`], but the audit runs from the first of the
/// month up to the audit date. Days that have not happened yet are never queried.
pub fn plan_month_audit(now: NaiveDateTime, holidays: &HolidayCalendar) -> AuditDecision {
    match plan_audit(now, holidays) {
        AuditDecision::Audit(range) => {
            let audited = range.end();
            let month_start = DateRange::month_of(audited).start();
            AuditDecision::Audit(DateRange::new(month_start, audited).unwrap_or(range))
        }
        skip => skip,
    }
}
