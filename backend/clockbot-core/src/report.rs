// src/report.rs
use chrono::format::{Item, StrftimeItems};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use thiserror::Error;
use url::Url;

use crate::date_policy::DateRange;
use crate::gap_detector::Gap;
use crate::hours_table::Field;

pub const DEFAULT_DATE_PATTERN: &str = "%d/%m/%Y";
pub const DEFAULT_MAIL_BASE: &str = "https://mail.google.com/mail";

pub const SUBJECT_TEMPLATE: &str = "{date} - Falha de sincronização de ponto eletrônico";
pub const EMAIL_TEMPLATE: &str = "Bom dia,

Notei que houve {errors_len} falha{plural} no ponto eletrônico do dia {date}.
Seguem em anexo o relatório extraído do sistema de ponto eletrônico com a falha detectada, bem como o{plural} comprovante{plural} do{plural} ponto{plural} faltante{plural}.

At.te, {sender}.
";
// Slack mrkdwn link syntax
pub const MESSAGE_TEMPLATE: &str = "
{errors}

<{email_link}|Enviar Email>
";
pub const CONFIRMATION_TEMPLATE: &str = ":white_check_mark: {date}";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Invalid date pattern '{0}'")]
    InvalidDatePattern(String),
    #[error("Invalid mail base URL")]
    MailLink(#[from] url::ParseError),
}

pub fn validate_date_pattern(pattern: &str) -> Result<(), ReportError> {
    if pattern.is_empty()
        || StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error))
    {
        return Err(ReportError::InvalidDatePattern(pattern.to_string()));
    }
    Ok(())
}

pub fn default_field_labels() -> BTreeMap<Field, String> {
    BTreeMap::from([
        (Field::ClockIn, "Entrada 1".to_string()),
        (Field::BreakIn, "Saída 1".to_string()),
        (Field::BreakOut, "Entrada 2".to_string()),
        (Field::ClockOut, "Saída 2".to_string()),
    ])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportTemplates {
    pub subject: String,
    pub email: String,
    pub message: String,
    pub confirmation: String,
}

impl Default for ReportTemplates {
    fn default() -> Self {
        Self {
            subject: SUBJECT_TEMPLATE.to_string(),
            email: EMAIL_TEMPLATE.to_string(),
            message: MESSAGE_TEMPLATE.to_string(),
            confirmation: CONFIRMATION_TEMPLATE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSettings {
    pub date_pattern: String,
    pub field_labels: BTreeMap<Field, String>,
    pub sender: String,
    pub recipient: String,
    pub mail_base: String,
    pub templates: ReportTemplates,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub text: String,
    pub email_link: Option<String>,
}

impl ReportSettings {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        mail_base: impl Into<String>,
    ) -> Self {
        Self {
            date_pattern: DEFAULT_DATE_PATTERN.to_string(),
            field_labels: default_field_labels(),
            sender: sender.into(),
            recipient: recipient.into(),
            mail_base: mail_base.into(),
            templates: ReportTemplates::default(),
        }
    }

    pub fn with_date_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.date_pattern = pattern.into();
        self
    }

    pub fn label(&self, field: Field) -> &str {
        self.field_labels
            .get(&field)
            .map(String::as_str)
            .unwrap_or_else(|| field.key())
    }

    pub fn mask_date(&self, date: NaiveDate) -> Result<String, ReportError> {
        let mut masked = String::new();
        write!(masked, "{}", date.format(&self.date_pattern))
            .map_err(|_| ReportError::InvalidDatePattern(self.date_pattern.clone()))?;
        Ok(masked)
    }

    pub fn mask_range(&self, range: &DateRange) -> Result<String, ReportError> {
        let start = self.mask_date(range.start())?;
        if range.is_single_day() {
            return Ok(start);
        }
        Ok(format!("{} a {}", start, self.mask_date(range.end())?))
    }

    /// `* <date>:` per gap, one indented `* <label>` per missing field.
    pub fn gap_list(&self, gaps: &[Gap]) -> Result<String, ReportError> {
        let mut blocks = Vec::with_capacity(gaps.len());
        for gap in gaps {
            let mut block = format!("* {}:", self.mask_date(gap.date)?);
            for field in &gap.missing {
                block.push_str("\n  * ");
                block.push_str(self.label(*field));
            }
            blocks.push(block);
        }
        Ok(blocks.join("\n"))
    }

    pub fn render(&self, gaps: &[Gap], range: &DateRange) -> Result<Report, ReportError> {
        let date = self.mask_range(range)?;

        if gaps.is_empty() {
            return Ok(Report {
                text: render_template(&self.templates.confirmation, &[("date", date.as_str())]),
                email_link: None,
            });
        }

        let errors_len = gaps.len().to_string();
        let plural = if gaps.len() > 1 { "s" } else { "" };
        let subject = render_template(&self.templates.subject, &[("date", date.as_str())]);
        let body = render_template(
            &self.templates.email,
            &[
                ("errors_len", errors_len.as_str()),
                ("plural", plural),
                ("date", date.as_str()),
                ("sender", self.sender.as_str()),
            ],
        );
        let email_link = build_mail_link(&self.mail_base, &self.recipient, &subject, &body)?;
        let errors = self.gap_list(gaps)?;
        let text = render_template(
            &self.templates.message,
            &[("errors", errors.as_str()), ("email_link", email_link.as_str())],
        );

        Ok(Report {
            text,
            email_link: Some(email_link),
        })
    }
}

/// `<base>?tf=cm&fs=1&to=..&su=..&body=..`, the mail provider's compose-link contract.
pub fn build_mail_link(
    base: &str,
    recipient: &str,
    subject: &str,
    body: &str,
) -> Result<String, ReportError> {
    let mut link = Url::parse(base)?;
    link.query_pairs_mut()
        .append_pair("tf", "cm")
        .append_pair("fs", "1")
        .append_pair("to", recipient)
        .append_pair("su", subject)
        .append_pair("body", body);
    Ok(link.to_string())
}

/// Single pass `{name}` substitution; unknown placeholders are left untouched.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match vars.iter().find(|(key, _)| *key == name) {
                    Some((_, value)) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
