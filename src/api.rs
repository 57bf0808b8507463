//! Remote master API client.
//!
//! The remote system of record exposes one REST collection per master
//! entity (`Route`, `CustomerCategory`, …) keyed by business code:
//!
//! * `GET  {base}/{Entity}/{companyId}` – full collection
//! * `POST {base}/{Entity}`             – create
//! * `PUT  {base}/{Entity}/{code}`      – update, `CompID` header required
//!
//! Every write carries the tenant envelope (`compID`, `siteID`,
//! `lastModifiedBy`, `lastModifiedOn`, `active`). Failures are returned as
//! `Error::Remote` with the raw response body text.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::master::MasterKind;

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The remote collaborator the sync coordinator talks to.
#[async_trait]
pub trait MasterApi: Send + Sync {
    /// Fetch the whole remote collection for `kind`.
    async fn fetch_all(&self, kind: MasterKind) -> Result<Vec<Value>>;

    /// Create a row. Returns the created row as echoed by the server
    /// (`Value::Null` when the server sends no body).
    async fn create(
        &self,
        kind: MasterKind,
        fields: &Map<String, Value>,
        modified_by: &str,
    ) -> Result<Value>;

    /// Update the row identified by `code`. `None` for 204 / empty bodies.
    async fn update(
        &self,
        kind: MasterKind,
        code: &str,
        fields: &Map<String, Value>,
        modified_by: &str,
    ) -> Result<Option<Value>>;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the remote base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> Error {
    if err.is_connect() {
        return Error::remote(format!("Cannot reach server at {url}"));
    }
    if err.is_timeout() {
        return Error::remote(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return Error::Config(format!("Invalid remote URL: {url}"));
    }
    Error::remote(format!("Network error communicating with {url}: {err}"))
}

/// Failure for a non-success status, keeping the raw body text.
fn status_error(status: StatusCode, body_text: &str) -> Error {
    let body = body_text.trim();
    if body.is_empty() {
        Error::remote(format!("HTTP {}", status.as_u16()))
    } else {
        Error::remote(format!("HTTP {}: {body}", status.as_u16()))
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// reqwest-backed client for the remote master API.
#[derive(Clone)]
pub struct HttpMasterApi {
    client: Client,
    base_url: String,
    company_id: String,
    site_id: String,
}

impl HttpMasterApi {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(&config.base_url),
            company_id: config.company_id.clone(),
            site_id: config.site_id.clone(),
        })
    }

    fn collection_url(&self, kind: MasterKind) -> String {
        format!("{}/{}", self.base_url, kind.entity())
    }

    /// Merge the tenant envelope into the entity fields.
    fn envelope(&self, fields: &Map<String, Value>, modified_by: &str) -> Map<String, Value> {
        let mut body = fields.clone();
        body.insert("compID".into(), Value::String(self.company_id.clone()));
        body.insert("siteID".into(), Value::String(self.site_id.clone()));
        body.insert(
            "lastModifiedBy".into(),
            Value::String(modified_by.to_string()),
        );
        body.insert(
            "lastModifiedOn".into(),
            Value::String(Utc::now().to_rfc3339()),
        );
        body
    }

    /// Send a request and return the body text of a 2xx response.
    async fn send(&self, req: reqwest::RequestBuilder) -> Result<String> {
        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(status_error(status, &body_text));
        }
        Ok(body_text)
    }
}

fn parse_json_body(body_text: &str) -> Result<Value> {
    serde_json::from_str(body_text).map_err(|_| {
        Error::remote(format!(
            "Invalid JSON from server: {}",
            body_text.trim().chars().take(200).collect::<String>()
        ))
    })
}

#[async_trait]
impl MasterApi for HttpMasterApi {
    async fn fetch_all(&self, kind: MasterKind) -> Result<Vec<Value>> {
        let url = format!(
            "{}/{}",
            self.collection_url(kind),
            percent_encode(&self.company_id)
        );
        debug!(url = %url, "fetching master collection");
        let body_text = self.send(self.client.get(&url)).await?;
        match parse_json_body(&body_text)? {
            Value::Array(rows) => {
                info!(kind = kind.as_str(), count = rows.len(), "fetched remote master rows");
                Ok(rows)
            }
            other => Err(Error::remote(format!(
                "Expected an array of {} rows, got {}",
                kind.entity(),
                other
            ))),
        }
    }

    async fn create(
        &self,
        kind: MasterKind,
        fields: &Map<String, Value>,
        modified_by: &str,
    ) -> Result<Value> {
        let mut body = self.envelope(fields, modified_by);
        body.insert("active".into(), Value::Bool(true));
        let body_text = self
            .send(self.client.post(self.collection_url(kind)).json(&body))
            .await?;
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        parse_json_body(&body_text)
    }

    async fn update(
        &self,
        kind: MasterKind,
        code: &str,
        fields: &Map<String, Value>,
        modified_by: &str,
    ) -> Result<Option<Value>> {
        let mut body = self.envelope(fields, modified_by);
        body.entry("active").or_insert(Value::Bool(true));
        let url = format!("{}/{}", self.collection_url(kind), percent_encode(code));
        let body_text = self
            .send(
                self.client
                    .put(&url)
                    .header("CompID", &self.company_id)
                    .json(&body),
            )
            .await?;
        if body_text.trim().is_empty() {
            return Ok(None);
        }
        parse_json_body(&body_text).map(Some)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
