// src/pipeline.rs

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::ClockbotConfig;
use crate::date_policy::{AuditDecision, DateRange};
use crate::gap_detector::{detect_gaps, Gap};
use crate::hours_table::{ExtractionError, HoursTable, DEFAULT_SKIP_ROWS};
use crate::notifier::{NotificationError, Notifier};
use crate::portal_client::{Credentials, PortalEndpoints, PortalError, PortalSession, PortalTransport};
use crate::report::{Report, ReportError, ReportSettings};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Portal error: {0}")]
    Portal(#[from] PortalError),
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("Report error: {0}")]
    Report(#[from] ReportError),
}

#[derive(Debug)]
pub enum RunOutcome {
    HolidaySkipped {
        date: NaiveDate,
        holiday: String,
    },
    Delivered {
        range: DateRange,
        gap_count: usize,
    },
    DeliveryFailed {
        range: DateRange,
        gap_count: usize,
        error: NotificationError,
    },
    Failed {
        range: DateRange,
        error: PipelineError,
    },
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        matches!(
            self,
            RunOutcome::HolidaySkipped { .. } | RunOutcome::Delivered { .. }
        )
    }
}

/// Everything one check needs besides the transport.
pub struct ClockCheck<N: Notifier> {
    credentials: Credentials,
    endpoints: PortalEndpoints,
    skip_rows: usize,
    report: ReportSettings,
    slack_user_id: String,
    notifier: N,
}

impl<N: Notifier> ClockCheck<N> {
    pub fn new(
        credentials: Credentials,
        endpoints: PortalEndpoints,
        report: ReportSettings,
        slack_user_id: impl Into<String>,
        notifier: N,
    ) -> Self {
        Self {
            credentials,
            endpoints,
            skip_rows: DEFAULT_SKIP_ROWS,
            report,
            slack_user_id: slack_user_id.into(),
            notifier,
        }
    }

    pub fn from_config(config: &ClockbotConfig, notifier: N) -> Self {
        Self::new(
            config.credentials.clone(),
            config.endpoints.clone(),
            config.report.clone(),
            config.slack_user_id.clone(),
            notifier,
        )
        .with_skip_rows(config.skip_rows)
    }

    pub fn with_skip_rows(mut self, skip_rows: usize) -> Self {
        self.skip_rows = skip_rows;
        self
    }

    /// Runs one check. `connect` is only called when the decision is to audit.
    pub async fn run<T, F>(&self, decision: AuditDecision, connect: F) -> RunOutcome
    where
        T: PortalTransport,
        F: FnOnce() -> Result<T, PortalError>,
    {
        let range = match decision {
            AuditDecision::Skip { date, holiday } => {
                info!("{} is a holiday ({}), nothing to check", date, holiday);
                return RunOutcome::HolidaySkipped { date, holiday };
            }
            AuditDecision::Audit(range) => range,
        };

        info!("Checking time clock records for {}", range);
        let (gaps, report) = match self.check(range, connect).await {
            Ok(checked) => checked,
            Err(error) => {
                error!("Time clock check for {} failed: {:?}", range, error);
                return RunOutcome::Failed { range, error };
            }
        };

        let gap_count = gaps.len();
        info!("Report for {} ({} gaps):\n{}", range, gap_count, report.text);
        match self
            .notifier
            .send_direct_message(&self.slack_user_id, &report.text)
            .await
        {
            Ok(()) => RunOutcome::Delivered { range, gap_count },
            Err(error) => {
                error!("Failed to deliver report for {}: {:?}", range, error);
                RunOutcome::DeliveryFailed {
                    range,
                    gap_count,
                    error,
                }
            }
        }
    }

    /// Fetches, normalizes and formats without notifying anyone.
    pub async fn check<T, F>(
        &self,
        range: DateRange,
        connect: F,
    ) -> Result<(Vec<Gap>, Report), PipelineError>
    where
        T: PortalTransport,
        F: FnOnce() -> Result<T, PortalError>,
    {
        let transport = connect()?;
        let gaps = self.collect_gaps(transport, range).await?;
        let report = self.report.render(&gaps, &range)?;
        Ok((gaps, report))
    }

    pub async fn collect_gaps<T: PortalTransport>(
        &self,
        transport: T,
        range: DateRange,
    ) -> Result<Vec<Gap>, PipelineError> {
        let mut session = PortalSession::new(transport, self.endpoints.clone());
        let page = session.fetch_hours_page(&self.credentials, &range).await?;
        session.close();

        let mut table = HoursTable::from_page(&page, self.skip_rows)?;
        // A date without a row has no punches at all
        let absent = table.fill_missing(&range);
        if !absent.is_empty() {
            warn!(
                "Portal returned no row for {} date(s) of {}, reporting them as missing: {:?}",
                absent.len(),
                range,
                absent
            );
        }

        let gaps = detect_gaps(&table);
        for gap in &gaps {
            debug!("{} is missing {:?}", gap.date, gap.missing);
        }
        Ok(gaps)
    }
}
