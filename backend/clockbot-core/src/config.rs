// src/config.rs

use chrono::NaiveDate;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::holidays::{years_around, HolidayCalendar, HolidayError};
use crate::hours_table::DEFAULT_SKIP_ROWS;
use crate::portal_client::{Credentials, PortalEndpoints};
use crate::report::{validate_date_pattern, ReportSettings, DEFAULT_DATE_PATTERN, DEFAULT_MAIL_BASE};

pub const DEFAULT_HOLIDAYS_COUNTRY: &str = "BR";
pub const DEFAULT_HOLIDAYS_SUBDIV: &str = "SP";
pub const DEFAULT_PORT: u16 = 8080;

/// One malformed setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Malformed {
    pub var: &'static str,
    pub reason: String,
}

impl fmt::Display for Malformed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.var, self.reason)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{}", describe(.missing, .malformed))]
    Invalid {
        missing: Vec<&'static str>,
        malformed: Vec<Malformed>,
    },
    #[error("Environment could not be read: {0}")]
    Env(#[from] envy::Error),
}

fn describe(missing: &[&'static str], malformed: &[Malformed]) -> String {
    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!("Missing environment variable(s): {}", missing.join(", ")));
    }
    if !malformed.is_empty() {
        let details: Vec<String> = malformed.iter().map(ToString::to_string).collect();
        parts.push(format!("Malformed setting(s): {}", details.join("; ")));
    }
    parts.join(". ")
}

// Field names map to upper-case environment variables through envy.
#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    clockbot_auth: Option<String>,
    clockbot_slack_token: Option<String>,
    slack_user_id: Option<String>,
    recipient: Option<String>,
    sender: Option<String>,
    portal_url_base: Option<String>,
    url_email: Option<String>,
    holidays_country: Option<String>,
    holidays_subdiv: Option<String>,
    date_mask_pattern: Option<String>,
    webscrap_table_skip_rows: Option<String>,
    debug_mode: Option<String>,
    port: Option<String>,
    cert_path: Option<String>,
    key_path: Option<String>,
}

/// Wraps a secret so it never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub tls: Option<TlsPaths>,
}

#[derive(Debug, Clone)]
pub struct ClockbotConfig {
    pub credentials: Credentials,
    pub slack_token: Secret,
    pub slack_user_id: String,
    pub endpoints: PortalEndpoints,
    pub holidays_country: String,
    pub holidays_subdiv: Option<String>,
    pub skip_rows: usize,
    pub report: ReportSettings,
    pub debug_mode: bool,
    pub server: ServerConfig,
}

impl ClockbotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw: RawEnv = envy::from_env()?;
        Self::from_raw(raw)
    }

    pub fn from_iter<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let raw: RawEnv = envy::from_iter(vars)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawEnv) -> Result<Self, ConfigError> {
        let mut missing = Vec::new();
        let mut malformed = Vec::new();

        let mut required = |value: Option<String>, name: &'static str| {
            let value = non_empty(value);
            if value.is_none() {
                missing.push(name);
            }
            value.unwrap_or_default()
        };
        let auth = required(raw.clockbot_auth, "CLOCKBOT_AUTH");
        let slack_token = required(raw.clockbot_slack_token, "CLOCKBOT_SLACK_TOKEN");
        let slack_user_id = required(raw.slack_user_id, "SLACK_USER_ID");
        let recipient = required(raw.recipient, "RECIPIENT");
        let sender = required(raw.sender, "SENDER");
        let url_base = required(raw.portal_url_base, "PORTAL_URL_BASE");

        let credentials = if auth.is_empty() {
            None
        } else {
            collect(parse_auth(&auth), &mut malformed)
        };
        let endpoints = if url_base.is_empty() {
            None
        } else {
            collect(
                PortalEndpoints::from_base(&url_base)
                    .map_err(|e| malformed_var("PORTAL_URL_BASE", e)),
                &mut malformed,
            )
        };

        let mail_base = non_empty(raw.url_email).unwrap_or_else(|| DEFAULT_MAIL_BASE.to_string());
        if let Err(e) = url::Url::parse(&mail_base) {
            malformed.push(malformed_var("URL_EMAIL", e));
        }

        let date_pattern =
            non_empty(raw.date_mask_pattern).unwrap_or_else(|| DEFAULT_DATE_PATTERN.to_string());
        if let Err(e) = validate_date_pattern(&date_pattern) {
            malformed.push(malformed_var("DATE_MASK_PATTERN", e));
        }

        let skip_rows = parse_number(
            raw.webscrap_table_skip_rows,
            "WEBSCRAP_TABLE_SKIP_ROWS",
            DEFAULT_SKIP_ROWS,
            &mut malformed,
        );
        let port = parse_number(raw.port, "PORT", DEFAULT_PORT, &mut malformed);

        let holidays_country = non_empty(raw.holidays_country)
            .unwrap_or_else(|| DEFAULT_HOLIDAYS_COUNTRY.to_string());
        let holidays_subdiv = match raw.holidays_subdiv {
            // Explicitly empty means national holidays only
            Some(value) => non_empty(Some(value)),
            None => Some(DEFAULT_HOLIDAYS_SUBDIV.to_string()),
        };
        if let Err(e) =
            HolidayCalendar::for_years(&holidays_country, holidays_subdiv.as_deref(), 2000..=2000)
        {
            let var = match e {
                HolidayError::UnsupportedCountry(_) => "HOLIDAYS_COUNTRY",
                HolidayError::UnsupportedSubdivision { .. } => "HOLIDAYS_SUBDIV",
            };
            malformed.push(malformed_var(var, e));
        }

        let tls = match (non_empty(raw.cert_path), non_empty(raw.key_path)) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            }),
            (None, None) => None,
            _ => {
                malformed.push(Malformed {
                    var: "CERT_PATH/KEY_PATH",
                    reason: "both must be set to enable TLS".to_string(),
                });
                None
            }
        };

        match (credentials, endpoints) {
            (Some(credentials), Some(endpoints)) if missing.is_empty() && malformed.is_empty() => {
                Ok(Self {
                    credentials,
                    slack_token: Secret(slack_token),
                    slack_user_id,
                    endpoints,
                    holidays_country,
                    holidays_subdiv,
                    skip_rows,
                    report: ReportSettings::new(sender, recipient, mail_base)
                        .with_date_pattern(date_pattern),
                    debug_mode: non_empty(raw.debug_mode).is_some(),
                    server: ServerConfig { port, tls },
                })
            }
            _ => Err(ConfigError::Invalid { missing, malformed }),
        }
    }

    pub fn holiday_calendar(&self, today: NaiveDate) -> Result<HolidayCalendar, HolidayError> {
        HolidayCalendar::for_years(
            &self.holidays_country,
            self.holidays_subdiv.as_deref(),
            years_around(today),
        )
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn malformed_var(var: &'static str, reason: impl fmt::Display) -> Malformed {
    Malformed {
        var,
        reason: reason.to_string(),
    }
}

fn collect<T>(result: Result<T, Malformed>, malformed: &mut Vec<Malformed>) -> Option<T> {
    result.map_err(|e| malformed.push(e)).ok()
}

fn parse_number<N: std::str::FromStr>(
    value: Option<String>,
    var: &'static str,
    default: N,
    malformed: &mut Vec<Malformed>,
) -> N {
    match non_empty(value) {
        Some(value) => match value.trim().parse() {
            Ok(number) => number,
            Err(_) => {
                malformed.push(malformed_var(var, format!("'{}' is not a number", value)));
                default
            }
        },
        None => default,
    }
}

/// `<username>:<password>`; the password may itself contain colons.
pub fn parse_auth(secret: &str) -> Result<Credentials, Malformed> {
    match secret.split_once(':') {
        Some((user, pass)) if !user.is_empty() && !pass.is_empty() => {
            Ok(Credentials::new(user, pass))
        }
        _ => Err(malformed_var(
            "CLOCKBOT_AUTH",
            "should be <username>:<password>",
        )),
    }
}
