// src/pipeline_tests.rs

#[cfg(test)]
mod tests {
    use crate::date_policy::{AuditDecision, DateRange};
    use crate::hours_table::{ExtractionError, Field};
    use crate::notifier::{NotificationError, Notifier};
    use crate::pipeline::{ClockCheck, PipelineError, RunOutcome};
    use crate::portal_client::{Credentials, PortalEndpoints, PortalError, PortalTransport};
    use crate::report::ReportSettings;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const BASE: &str = "https://ponto.example.com";

    const LOGIN_PAGE: &str = r#"<form>
        <input type="hidden" name="__VIEWSTATE" value="vs-login" />
        <input name="txtUsuario" /><input name="txtSenha" type="password" />
    </form>"#;

    const DATA_PAGE: &str = r#"<h2>Cálculos</h2><form>
        <input type="hidden" name="__VIEWSTATE" value="vs-data" />
        <input name="ctl00$ContentPlaceHolder1$txtPeriodoIni" value="" />
        <input name="ctl00$ContentPlaceHolder1$txtPeriodoFim" value="" />
    </form>"#;

    const DENIED_PAGE: &str = r#"<p>Usuário ou senha inválidos</p>"#;

    const PARTIAL_RESULTS: &str = r#"<table><tr><td>menu</td></tr></table>
    <table>
      <tr><th colspan="5">Período</th></tr>
      <tr><th>Data</th><th>Entrada 1</th><th>Saída 1</th><th>Entrada 2</th><th>Saída 2</th></tr>
      <tr><td>10/01/24 - Quarta</td><td>08:00</td><td>12:00</td><td>13:00</td><td>17:00</td></tr>
      <tr><td>11/01/24 - Quinta</td><td>08:10</td><td>12:00</td><td>13:00</td><td></td></tr>
    </table>"#;

    const COMPLETE_RESULTS: &str = r#"<table>
      <tr><th colspan="5">Período</th></tr>
      <tr><th>Data</th><th>Entrada 1</th><th>Saída 1</th><th>Entrada 2</th><th>Saída 2</th></tr>
      <tr><td>10/01/24 - Quarta</td><td>08:00</td><td>12:00</td><td>13:00</td><td>17:00</td></tr>
    </table>"#;

    const HEADER_ONLY_RESULTS: &str = r#"<table>
      <tr><th colspan="5">Período</th></tr>
      <tr><th>Data</th><th>Entrada 1</th><th>Saída 1</th><th>Entrada 2</th><th>Saída 2</th></tr>
    </table>"#;

    type Call = (&'static str, String, Vec<(String, String)>);

    struct ScriptedPortal {
        data_page: &'static str,
        results_page: &'static str,
        calls: Arc<Mutex<Vec<Call>>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl PortalTransport for ScriptedPortal {
        async fn get(&mut self, url: &str) -> Result<String, PortalError> {
            self.calls
                .lock()
                .unwrap()
                .push(("GET", url.to_string(), Vec::new()));
            if url.ends_with("pgLogin.aspx") {
                Ok(LOGIN_PAGE.to_string())
            } else {
                Ok(self.data_page.to_string())
            }
        }

        async fn post_form(
            &mut self,
            url: &str,
            fields: &[(String, String)],
        ) -> Result<String, PortalError> {
            self.calls
                .lock()
                .unwrap()
                .push(("POST", url.to_string(), fields.to_vec()));
            if url.ends_with("pgLogin.aspx") {
                Ok(String::new())
            } else {
                Ok(self.results_page.to_string())
            }
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct RecordingNotifier {
        sent: Arc<Mutex<Vec<(String, String)>>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_direct_message(
            &self,
            user_id: &str,
            text: &str,
        ) -> Result<(), NotificationError> {
            if self.fail {
                return Err(NotificationError::PostMessage {
                    channel: "D123".to_string(),
                    message: "channel_not_found".to_string(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((user_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    struct Harness {
        calls: Arc<Mutex<Vec<Call>>>,
        closed: Arc<AtomicBool>,
        connects: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                calls: Arc::default(),
                closed: Arc::default(),
                connects: Arc::default(),
            }
        }

        fn connect(
            &self,
            data_page: &'static str,
            results_page: &'static str,
        ) -> impl FnOnce() -> Result<ScriptedPortal, PortalError> {
            let calls = self.calls.clone();
            let closed = self.closed.clone();
            let connects = self.connects.clone();
            move || {
                connects.fetch_add(1, Ordering::SeqCst);
                Ok(ScriptedPortal {
                    data_page,
                    results_page,
                    calls,
                    closed,
                })
            }
        }

        fn closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn clock_check(notifier: RecordingNotifier) -> ClockCheck<RecordingNotifier> {
        ClockCheck::new(
            Credentials::new("alice", "s3cret"),
            PortalEndpoints::from_base(BASE).unwrap(),
            ReportSettings::new("Alice", "rh@example.com", "https://mail.google.com/mail"),
            "U123",
            notifier,
        )
    }

    #[tokio::test]
    async fn test_missing_clock_out_is_reported() {
        let harness = Harness::new();
        let notifier = RecordingNotifier::default();
        let check = clock_check(notifier.clone());
        let range = DateRange::new(date(10), date(11)).unwrap();

        let outcome = check
            .run(
                AuditDecision::Audit(range),
                harness.connect(DATA_PAGE, PARTIAL_RESULTS),
            )
            .await;

        assert!(matches!(outcome, RunOutcome::Delivered { gap_count: 1, .. }));
        assert!(outcome.success());
        assert!(harness.closed());

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (user, text) = &sent[0];
        assert_eq!(user, "U123");
        assert!(text.contains("* 11/01/2024:\n  * Saída 2"));
        assert!(!text.contains("10/01/2024"));
        assert!(text.contains("|Enviar Email>"));
        assert!(text.contains("https://mail.google.com/mail?tf=cm&fs=1&to=rh%40example.com"));
    }

    #[tokio::test]
    async fn test_gaps_are_exact() {
        let harness = Harness::new();
        let check = clock_check(RecordingNotifier::default());
        let range = DateRange::new(date(10), date(11)).unwrap();

        let (gaps, report) = check
            .check(range, harness.connect(DATA_PAGE, PARTIAL_RESULTS))
            .await
            .unwrap();

        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].date, date(11));
        assert_eq!(gaps[0].missing, vec![Field::ClockOut]);
        assert!(report.email_link.is_some());
    }

    #[tokio::test]
    async fn test_no_gaps_sends_confirmation() {
        let harness = Harness::new();
        let notifier = RecordingNotifier::default();
        let check = clock_check(notifier.clone());

        let outcome = check
            .run(
                AuditDecision::Audit(DateRange::single(date(10))),
                harness.connect(DATA_PAGE, COMPLETE_RESULTS),
            )
            .await;

        assert!(matches!(outcome, RunOutcome::Delivered { gap_count: 0, .. }));
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent[0].1, ":white_check_mark: 10/01/2024");
    }

    #[tokio::test]
    async fn test_protocol_steps_run_in_order() {
        let harness = Harness::new();
        let check = clock_check(RecordingNotifier::default());

        check
            .run(
                AuditDecision::Audit(DateRange::single(date(10))),
                harness.connect(DATA_PAGE, COMPLETE_RESULTS),
            )
            .await;

        let calls = harness.calls.lock().unwrap();
        let steps: Vec<(&str, &str)> = calls
            .iter()
            .map(|(verb, url, _)| (*verb, url.rsplit('/').next().unwrap_or_default()))
            .collect();
        assert_eq!(
            steps,
            vec![
                ("GET", "pgLogin.aspx"),
                ("POST", "pgLogin.aspx"),
                ("GET", "pgCalculos.aspx"),
                ("GET", "pgCalculos.aspx"),
                ("POST", "pgCalculos.aspx"),
            ]
        );

        let login_fields = &calls[1].2;
        assert!(login_fields.contains(&("__VIEWSTATE".to_string(), "vs-login".to_string())));
        assert!(login_fields.contains(&("txtUsuario".to_string(), "alice".to_string())));

        let query_fields = &calls[4].2;
        assert!(query_fields.contains(&("__VIEWSTATE".to_string(), "vs-data".to_string())));
        assert!(query_fields.contains(&(
            "ctl00$ContentPlaceHolder1$txtPeriodoIni".to_string(),
            "10/01/2024".to_string()
        )));
        assert!(query_fields.contains(&(
            "ctl00$ContentPlaceHolder1$txtPeriodoFim".to_string(),
            "10/01/2024".to_string()
        )));
    }

    #[tokio::test]
    async fn test_rejected_login_sends_nothing() {
        let harness = Harness::new();
        let notifier = RecordingNotifier::default();
        let check = clock_check(notifier.clone());

        let outcome = check
            .run(
                AuditDecision::Audit(DateRange::single(date(10))),
                harness.connect(DENIED_PAGE, COMPLETE_RESULTS),
            )
            .await;

        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                error: PipelineError::Portal(PortalError::Authentication { .. }),
                ..
            }
        ));
        assert!(!outcome.success());
        assert!(harness.closed());
        assert!(notifier.sent.lock().unwrap().is_empty());
        // No data query after a failed login
        assert_eq!(harness.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_page_without_table_sends_nothing() {
        let harness = Harness::new();
        let notifier = RecordingNotifier::default();
        let check = clock_check(notifier.clone());

        let outcome = check
            .run(
                AuditDecision::Audit(DateRange::single(date(10))),
                harness.connect(DATA_PAGE, "<html><body>Nenhum registro</body></html>"),
            )
            .await;

        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                error: PipelineError::Extraction(ExtractionError::TableNotFound),
                ..
            }
        ));
        assert!(harness.closed());
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_holiday_makes_no_network_calls() {
        let harness = Harness::new();
        let notifier = RecordingNotifier::default();
        let check = clock_check(notifier.clone());

        let outcome = check
            .run(
                AuditDecision::Skip {
                    date: date(1),
                    holiday: "Confraternização Universal".to_string(),
                },
                harness.connect(DATA_PAGE, COMPLETE_RESULTS),
            )
            .await;

        assert!(matches!(outcome, RunOutcome::HolidaySkipped { .. }));
        assert!(outcome.success());
        assert_eq!(harness.connects.load(Ordering::SeqCst), 0);
        assert!(harness.calls.lock().unwrap().is_empty());
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_failure_is_not_success() {
        let harness = Harness::new();
        let notifier = RecordingNotifier {
            fail: true,
            ..Default::default()
        };
        let check = clock_check(notifier);

        let outcome = check
            .run(
                AuditDecision::Audit(DateRange::new(date(10), date(11)).unwrap()),
                harness.connect(DATA_PAGE, PARTIAL_RESULTS),
            )
            .await;

        assert!(matches!(
            outcome,
            RunOutcome::DeliveryFailed { gap_count: 1, .. }
        ));
        assert!(!outcome.success());
        assert!(harness.closed());
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let notifier = RecordingNotifier::default();
        let check = clock_check(notifier.clone());

        let outcome = check
            .run(AuditDecision::Audit(DateRange::single(date(10))), || {
                Err::<ScriptedPortal, _>(PortalError::Connection("tls setup".to_string()))
            })
            .await;

        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                error: PipelineError::Portal(PortalError::Connection(_)),
                ..
            }
        ));
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skip_rows_is_honoured() {
        let harness = Harness::new();
        let check = clock_check(RecordingNotifier::default()).with_skip_rows(3);

        let (gaps, _) = check
            .check(
                DateRange::single(date(11)),
                harness.connect(DATA_PAGE, PARTIAL_RESULTS),
            )
            .await
            .unwrap();

        // The complete 10/01 row is skipped as a header, 11/01 still has its gap
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].date, date(11));
        assert_eq!(gaps[0].missing, vec![Field::ClockOut]);
    }

    #[tokio::test]
    async fn test_day_without_row_is_reported_as_missing() {
        let harness = Harness::new();
        let notifier = RecordingNotifier::default();
        let check = clock_check(notifier.clone());

        let outcome = check
            .run(
                AuditDecision::Audit(DateRange::single(date(11))),
                harness.connect(DATA_PAGE, HEADER_ONLY_RESULTS),
            )
            .await;

        assert!(matches!(outcome, RunOutcome::Delivered { gap_count: 1, .. }));
        let sent = notifier.sent.lock().unwrap();
        let text = &sent[0].1;
        assert!(!text.starts_with(":white_check_mark:"));
        assert!(text.contains(
            "* 11/01/2024:\n  * Entrada 1\n  * Saída 1\n  * Entrada 2\n  * Saída 2"
        ));
    }

    #[tokio::test]
    async fn test_range_dates_without_rows_become_full_gaps() {
        let harness = Harness::new();
        let check = clock_check(RecordingNotifier::default());

        let (gaps, _) = check
            .check(
                DateRange::new(date(10), date(12)).unwrap(),
                harness.connect(DATA_PAGE, PARTIAL_RESULTS),
            )
            .await
            .unwrap();

        let dates: Vec<NaiveDate> = gaps.iter().map(|g| g.date).collect();
        assert_eq!(dates, vec![date(11), date(12)]);
        assert_eq!(gaps[1].missing, Field::ALL.to_vec());
    }
}
