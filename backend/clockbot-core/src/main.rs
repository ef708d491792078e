use anyhow::Context;
use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::{env, net::SocketAddr, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod config;
mod date_policy;
mod gap_detector;
mod holidays;
mod hours_table;
mod notifier;
mod pipeline;
mod portal_client;
mod report;

#[cfg(test)]
mod pipeline_tests;

use config::{ClockbotConfig, ConfigError, ServerConfig};
use date_policy::{plan_audit, plan_month_audit, AuditDecision, DateRange, DateRangeError};
use holidays::HolidayError;
use notifier::{DryRunNotifier, NotificationError, Notifier, SlackNotifier};
use pipeline::{ClockCheck, RunOutcome};
use portal_client::ReqwestTransport;

#[derive(Error, Debug)]
enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Holiday calendar error: {0}")]
    Holidays(#[from] HolidayError),
    #[error("Invalid date range: {0}")]
    DateRange(#[from] DateRangeError),
    #[error("Notifier setup failed: {0}")]
    Notification(#[from] NotificationError),
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "clockbot", version, about = "Reports missing time clock punches over Slack")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one check and exit
    Run {
        /// Check this day (YYYY-MM-DD), holidays included
        #[arg(long, conflicts_with_all = ["start", "end", "month"])]
        date: Option<NaiveDate>,
        /// First day of an explicit range (YYYY-MM-DD)
        #[arg(long, requires = "end", conflicts_with = "month")]
        start: Option<NaiveDate>,
        /// Last day of an explicit range (YYYY-MM-DD)
        #[arg(long, requires = "start")]
        end: Option<NaiveDate>,
        /// Check the whole month of the last workday
        #[arg(long)]
        month: bool,
        /// Log the report instead of sending it
        #[arg(long)]
        dry_run: bool,
    },
    /// Serve the HTTP trigger (default)
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

/// How the audit range is chosen for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeRequest {
    LastWorkday,
    Month,
    Explicit(DateRange),
}

impl RangeRequest {
    fn from_args(
        date: Option<NaiveDate>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        month: bool,
    ) -> Result<Self, DateRangeError> {
        match (date, start, end) {
            (Some(date), _, _) => Ok(Self::Explicit(DateRange::single(date))),
            (None, Some(start), Some(end)) => Ok(Self::Explicit(DateRange::new(start, end)?)),
            _ if month => Ok(Self::Month),
            _ => Ok(Self::LastWorkday),
        }
    }

    fn decide(self, config: &ClockbotConfig) -> Result<AuditDecision, HolidayError> {
        if let Self::Explicit(range) = self {
            info!("Explicit range {} requested, holiday rule not applied", range);
            return Ok(AuditDecision::Audit(range));
        }
        let now = Local::now().naive_local();
        let calendar = config.holiday_calendar(now.date())?;
        debug!("Using {} holiday calendar", calendar.region());
        Ok(match self {
            Self::Month => plan_month_audit(now, &calendar),
            _ => plan_audit(now, &calendar),
        })
    }
}

struct AppState {
    config: ClockbotConfig,
    check: ClockCheck<Box<dyn Notifier>>,
    // One check at a time; overlapping triggers wait here
    run_lock: Mutex<()>,
}

#[derive(Serialize)]
struct TriggerResponse {
    success: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    running: bool,
    server_time: String,
}

fn init_tracing() -> anyhow::Result<()> {
    let default_level = match env::var("DEBUG_MODE") {
        Ok(value) if !value.trim().is_empty() => "debug",
        _ => "info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")
}

fn build_notifier(config: &ClockbotConfig, dry_run: bool) -> Result<Box<dyn Notifier>, AppError> {
    if dry_run {
        info!("Dry run: reports will be logged, not sent");
        return Ok(Box::new(DryRunNotifier));
    }
    Ok(Box::new(SlackNotifier::new(config.slack_token.expose())?))
}

async fn run_once(
    check: &ClockCheck<Box<dyn Notifier>>,
    config: &ClockbotConfig,
    request: RangeRequest,
) -> Result<RunOutcome, AppError> {
    let decision = request.decide(config)?;
    Ok(check.run(decision, ReqwestTransport::new).await)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;
    let cli = Cli::parse();

    let config = match ClockbotConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    info!("Configuration loaded, portal login at {}", config.endpoints.login_url);

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Run {
            date,
            start,
            end,
            month,
            dry_run,
        } => {
            let request = RangeRequest::from_args(date, start, end, month)
                .context("Invalid date arguments")?;
            let notifier = build_notifier(&config, dry_run).context("Could not set up Slack")?;
            let check = ClockCheck::from_config(&config, notifier);
            let outcome = run_once(&check, &config, request).await?;
            info!("Run finished: {:?}", outcome);
            if !outcome.success() {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Serve { port } => {
            let mut server = config.server.clone();
            if let Some(port) = port {
                server.port = port;
            }
            let notifier = build_notifier(&config, false).context("Could not set up Slack")?;
            let state = Arc::new(AppState {
                check: ClockCheck::from_config(&config, notifier),
                config,
                run_lock: Mutex::new(()),
            });
            serve(state, server).await.context("Trigger server failed")
        }
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(handle_trigger))
        .route("/status", get(handle_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn serve(state: Arc<AppState>, server: ServerConfig) -> Result<(), AppError> {
    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], server.port));

    match server.tls {
        Some(tls) => {
            let tls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                .await
                .map_err(|e| {
                    let err_msg = format!("Failed to load TLS cert/key: {}", e);
                    error!("{}", err_msg);
                    AppError::TlsConfig(err_msg)
                })?;
            info!(
                "TLS configuration loaded from {} and {}",
                tls.cert_path.display(),
                tls.key_path.display()
            );
            info!("Listening on https://{}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            info!("Listening on http://{}", addr);
            axum_server::bind(addr)
                .serve(app.into_make_service())
                .await?;
        }
    }
    Ok(())
}

/// Id and type of the triggering CloudEvent, from binary-mode headers or a structured body.
fn cloud_event_summary(headers: &HeaderMap, body: &str) -> Option<(String, String)> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    if let (Some(id), Some(kind)) = (header("ce-id"), header("ce-type")) {
        return Some((id, kind));
    }
    let event: serde_json::Value = serde_json::from_str(body).ok()?;
    let id = event.get("id")?.as_str()?.to_string();
    let kind = event.get("type")?.as_str()?.to_string();
    Some((id, kind))
}

async fn handle_trigger(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Json<TriggerResponse> {
    match cloud_event_summary(&headers, &body) {
        Some((id, kind)) => info!("Triggered by event {} ({})", id, kind),
        None => info!("Triggered without a CloudEvent envelope"),
    }

    let _guard = state.run_lock.lock().await;
    let success = match run_once(&state.check, &state.config, RangeRequest::LastWorkday).await {
        Ok(outcome) => {
            info!("Run finished: {:?}", outcome);
            outcome.success()
        }
        Err(e) => {
            warn!("Run could not start: {}", e);
            false
        }
    };
    Json(TriggerResponse { success })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        running: state.run_lock.try_lock().is_err(),
        server_time: Local::now().to_rfc3339(),
    })
}
