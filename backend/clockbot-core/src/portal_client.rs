// src/portal_client.rs

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::Client;
use scraper::{Html, Selector};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::date_policy::DateRange;

pub const LOGIN_PATH: &str = "/Paginas/pgLogin.aspx";
pub const DATA_PATH: &str = "/Paginas/pgCalculos.aspx";
pub const LOGIN_SUCCESS_MATCH: &str = "Cálculos";
/// The portal only accepts period fields in this shape, whatever the display pattern is.
pub const PORTAL_DATE_FORMAT: &str = "%d/%m/%Y";
pub const PORTAL_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:91.0) Gecko/20100101 Firefox/91.0";

// Login postback fields
const FIELD_USERNAME: &str = "txtUsuario";
const FIELD_PASSWORD: &str = "txtSenha";
const FIELD_LOGIN_MODE: &str = "cboModoLogin";
const FIELD_SCRIPT_MANAGER: &str = "ScriptManager1";
const FIELD_EVENT_TARGET: &str = "__EVENTTARGET";
const FIELD_ASYNC_POST: &str = "__ASYNCPOST";
const LOGIN_MODE_DEFAULT: &str = "0";
const LOGIN_SCRIPT_MANAGER: &str = "updPanel|lnkLogin";
const LOGIN_EVENT_TARGET: &str = "lnkLogin";

// Data page postback fields
const FIELD_PERIOD_START: &str = "ctl00$ContentPlaceHolder1$txtPeriodoIni";
const FIELD_PERIOD_END: &str = "ctl00$ContentPlaceHolder1$txtPeriodoFim";
const REFRESH_EVENT_TARGET: &str = "ctl00$ContentPlaceHolder1$lnkAtualizar";

static INPUT_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("input[name]").expect("input selector is valid"));

#[derive(Error, Debug)]
pub enum PortalError {
    #[error("HTTP request failed")]
    Transport(#[from] reqwest::Error),

    #[error("Portal connection failed: {0}")]
    Connection(String),

    #[error("URL parsing error")]
    UrlParse(#[from] url::ParseError),

    #[error("Login failed: data page does not contain '{marker}'")]
    Authentication { marker: String },

    #[error("Cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Stale form state for {url} (scraped at generation {scraped}, session at {current})")]
    StaleFormState {
        url: String,
        scraped: u64,
        current: u64,
    },

    #[error("Portal session already closed")]
    SessionClosed,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalEndpoints {
    pub login_url: String,
    pub data_url: String,
}

impl PortalEndpoints {
    pub fn from_base(base: &str) -> Result<Self, PortalError> {
        let base = base.trim().trim_end_matches('/');
        let login_url = format!("{}{}", base, LOGIN_PATH);
        let data_url = format!("{}{}", base, DATA_PATH);
        // Validate both targets before any request goes out
        Url::parse(&login_url)?;
        Url::parse(&data_url)?;
        Ok(Self {
            login_url,
            data_url,
        })
    }
}

/// Every named `<input>` of a page, in document order, plus where and when it was scraped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormState {
    url: String,
    generation: u64,
    fields: Vec<(String, String)>,
}

impl FormState {
    pub fn scrape(html: &str, url: &str, generation: u64) -> Self {
        let document = Html::parse_document(html);
        let mut state = Self {
            url: url.to_string(),
            generation,
            fields: Vec::new(),
        };
        for input in document.select(&INPUT_SELECTOR) {
            if let Some(name) = input.value().attr("name") {
                let value = input.value().attr("value").unwrap_or_default();
                state.set(name, value);
            }
        }
        state
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Overwrites in place so the field keeps its original position.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = value.to_string(),
            None => self.fields.push((name.to_string(), value.to_string())),
        }
    }

    pub fn with_overrides<'a, I>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (name, value) in overrides {
            self.set(name, value);
        }
        self
    }

    pub fn into_fields(self) -> Vec<(String, String)> {
        self.fields
    }
}

/// One stateful HTTP conversation with the portal; implementations must keep cookies.
#[async_trait]
pub trait PortalTransport: Send {
    async fn get(&mut self, url: &str) -> Result<String, PortalError>;
    async fn post_form(
        &mut self,
        url: &str,
        fields: &[(String, String)],
    ) -> Result<String, PortalError>;
    /// Releases the underlying connections. Called exactly once by [`PortalSession`].
    fn close(&mut self);
}

pub struct ReqwestTransport {
    client: Option<Client>,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, PortalError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(PORTAL_USER_AGENT));
        let client = Client::builder()
            .cookie_store(true)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client: Some(client),
        })
    }

    fn client(&self) -> Result<&Client, PortalError> {
        self.client.as_ref().ok_or(PortalError::SessionClosed)
    }
}

#[async_trait]
impl PortalTransport for ReqwestTransport {
    async fn get(&mut self, url: &str) -> Result<String, PortalError> {
        let response = self.client()?.get(url).send().await?.error_for_status()?;
        debug!("GET {} -> {}", url, response.status());
        Ok(response.text().await?)
    }

    async fn post_form(
        &mut self,
        url: &str,
        fields: &[(String, String)],
    ) -> Result<String, PortalError> {
        let response = self
            .client()?
            .post(url)
            .form(fields)
            .send()
            .await?
            .error_for_status()?;
        debug!("POST {} ({} fields) -> {}", url, fields.len(), response.status());
        Ok(response.text().await?)
    }

    fn close(&mut self) {
        self.client = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    FormScraped,
    Authenticated,
    DataFormScraped,
    Queried,
    Closed,
}

/// Drives the login and query postbacks in order. Every POST must echo a
/// [`FormState`] scraped from the same page by the most recent request.
pub struct PortalSession<T: PortalTransport> {
    transport: T,
    endpoints: PortalEndpoints,
    state: SessionState,
    generation: u64,
}

impl<T: PortalTransport> PortalSession<T> {
    pub fn new(transport: T, endpoints: PortalEndpoints) -> Self {
        Self {
            transport,
            endpoints,
            state: SessionState::Unauthenticated,
            generation: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
    ) -> Result<(), PortalError> {
        if self.state == SessionState::Closed {
            return Err(PortalError::SessionClosed);
        }
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PortalError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn require_fresh(&self, form: &FormState, url: &str) -> Result<(), PortalError> {
        if form.url() != url || form.generation() != self.generation {
            warn!(
                "Rejecting form state scraped from {} at generation {} (session at {})",
                form.url(),
                form.generation(),
                self.generation
            );
            return Err(PortalError::StaleFormState {
                url: form.url().to_string(),
                scraped: form.generation(),
                current: self.generation,
            });
        }
        Ok(())
    }

    async fn fetch(&mut self, url: &str) -> Result<String, PortalError> {
        let body = self.transport.get(url).await?;
        self.generation += 1;
        Ok(body)
    }

    async fn submit(&mut self, form: FormState) -> Result<String, PortalError> {
        let url = form.url().to_string();
        let fields = form.into_fields();
        let body = self.transport.post_form(&url, &fields).await?;
        self.generation += 1;
        Ok(body)
    }

    /// Step 1: GET the login page and capture its hidden fields.
    pub async fn scrape_login_form(&mut self) -> Result<FormState, PortalError> {
        self.require("scrape the login form", &[SessionState::Unauthenticated])?;
        let url = self.endpoints.login_url.clone();
        let page = self.fetch(&url).await?;
        let form = FormState::scrape(&page, &url, self.generation);
        debug!("Login form scraped with {} fields", form.len());
        self.state = SessionState::FormScraped;
        Ok(form)
    }

    /// Steps 2 and 3: post the credentials, then confirm the data page is reachable.
    pub async fn login(
        &mut self,
        form: FormState,
        credentials: &Credentials,
    ) -> Result<(), PortalError> {
        self.require("log in", &[SessionState::FormScraped])?;
        let login_url = self.endpoints.login_url.clone();
        self.require_fresh(&form, &login_url)?;

        let form = form.with_overrides([
            (FIELD_USERNAME, credentials.username.as_str()),
            (FIELD_PASSWORD, credentials.password.as_str()),
            (FIELD_LOGIN_MODE, LOGIN_MODE_DEFAULT),
            (FIELD_SCRIPT_MANAGER, LOGIN_SCRIPT_MANAGER),
            (FIELD_EVENT_TARGET, LOGIN_EVENT_TARGET),
            (FIELD_ASYNC_POST, "true"),
        ]);
        self.submit(form).await?;

        let data_url = self.endpoints.data_url.clone();
        let landing = self.fetch(&data_url).await?;
        if !landing.contains(LOGIN_SUCCESS_MATCH) {
            self.state = SessionState::Unauthenticated;
            return Err(PortalError::Authentication {
                marker: LOGIN_SUCCESS_MATCH.to_string(),
            });
        }

        info!("Logged into portal as {}", credentials.username);
        self.state = SessionState::Authenticated;
        Ok(())
    }

    /// Step 4: GET the data page again; its form tokens belong to the authenticated session.
    pub async fn scrape_data_form(&mut self) -> Result<FormState, PortalError> {
        self.require(
            "scrape the data form",
            &[SessionState::Authenticated, SessionState::Queried],
        )?;
        let url = self.endpoints.data_url.clone();
        let page = self.fetch(&url).await?;
        let form = FormState::scrape(&page, &url, self.generation);
        debug!("Data form scraped with {} fields", form.len());
        self.state = SessionState::DataFormScraped;
        Ok(form)
    }

    /// Step 5: post the period and return the rendered results page.
    pub async fn query(
        &mut self,
        form: FormState,
        range: &DateRange,
    ) -> Result<String, PortalError> {
        self.require("query hours", &[SessionState::DataFormScraped])?;
        let data_url = self.endpoints.data_url.clone();
        self.require_fresh(&form, &data_url)?;

        let start = range.start().format(PORTAL_DATE_FORMAT).to_string();
        let end = range.end().format(PORTAL_DATE_FORMAT).to_string();
        let form = form.with_overrides([
            (FIELD_PERIOD_START, start.as_str()),
            (FIELD_PERIOD_END, end.as_str()),
            (FIELD_EVENT_TARGET, REFRESH_EVENT_TARGET),
        ]);
        let page = self.submit(form).await?;
        debug!("Hours page for {} to {} received ({} bytes)", start, end, page.len());
        self.state = SessionState::Queried;
        Ok(page)
    }

    /// Runs the whole login and query protocol for `range`.
    pub async fn fetch_hours_page(
        &mut self,
        credentials: &Credentials,
        range: &DateRange,
    ) -> Result<String, PortalError> {
        let login_form = self.scrape_login_form().await?;
        self.login(login_form, credentials).await?;
        let data_form = self.scrape_data_form().await?;
        self.query(data_form, range).await
    }

    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            self.transport.close();
            self.state = SessionState::Closed;
            debug!("Portal session closed");
        }
    }
}

impl<T: PortalTransport> Drop for PortalSession<T> {
    fn drop(&mut self) {
        self.close();
    }
}
