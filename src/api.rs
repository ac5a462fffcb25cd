//! Remote POS service client.
//!
//! The sync subsystem only consumes the remote service, it never implements
//! it. [`RemoteService`] is the seam the facades and the sync engine talk to;
//! [`HttpRemote`] is the production implementation over reqwest.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::models::{Customer, LoginResponse, Product, RemoteTransaction, TransactionPayload};

/// Default timeout for API requests (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used for the lightweight reachability probe.
pub const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("Cannot reach POS server at {0}")]
    Unreachable(String),

    #[error("Connection to {0} timed out")]
    Timeout(String),

    #[error("Invalid POS server URL: {0}")]
    InvalidUrl(String),

    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },

    #[error("Invalid response from POS server: {0}")]
    InvalidResponse(String),

    #[error("Network error communicating with {url}: {message}")]
    Network { url: String, message: String },
}

impl RemoteError {
    /// Connectivity failures are retried when the link comes back; everything
    /// else is a rejection by the server.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            RemoteError::Unreachable(_) | RemoteError::Timeout(_) | RemoteError::Network { .. }
        )
    }

    /// HTTP status for server rejections.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the POS server URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes and a trailing `/api` segment
pub fn normalize_server_url(url: &str) -> String {
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
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn friendly_error(url: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_connect() {
        return RemoteError::Unreachable(url.to_string());
    }
    if err.is_timeout() {
        return RemoteError::Timeout(url.to_string());
    }
    if err.is_builder() {
        return RemoteError::InvalidUrl(url.to_string());
    }
    RemoteError::Network {
        url: url.to_string(),
        message: err.to_string(),
    }
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key or session is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "POS server endpoint not found".to_string(),
        422 => "POS server rejected the request".to_string(),
        s if s >= 500 => "POS server error".to_string(),
        _ => "Unexpected response from POS server".to_string(),
    }
}

/// Build a status error, preferring the server's own `error`/`message` field.
fn status_error(status: StatusCode, body_text: &str) -> RemoteError {
    let trimmed = body_text.trim();
    let message = match serde_json::from_str::<Value>(trimmed) {
        Ok(json) => {
            let message = json
                .get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| status_message(status));
            match json.get("details").or_else(|| json.get("errors")) {
                Some(details) => format!("{message}: {details}"),
                None => message,
            }
        }
        Err(_) if !trimmed.is_empty() => format!("{}: {trimmed}", status_message(status)),
        Err(_) => status_message(status),
    };
    RemoteError::Status {
        status: status.as_u16(),
        message,
    }
}

/// Accept both a bare JSON body and a `{ "data": ... }` envelope.
fn unwrap_data<T: DeserializeOwned>(body: Value) -> Result<T, RemoteError> {
    let inner = match body {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(inner).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
}

/// Bound a remote call by `timeout`, reporting expiry as [`RemoteError::Timeout`].
pub async fn with_timeout<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T, RemoteError>
where
    F: std::future::Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(what.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Service seams
// ---------------------------------------------------------------------------

/// Remote operations consumed by the offline subsystem.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn list_products(&self) -> Result<Vec<Product>, RemoteError>;

    async fn list_customers(&self) -> Result<Vec<Customer>, RemoteError>;

    /// Most recent transactions, newest first.
    async fn list_transactions(&self, limit: usize) -> Result<Vec<RemoteTransaction>, RemoteError>;

    /// Not idempotent: every successful call creates a new remote transaction.
    async fn create_transaction(
        &self,
        payload: &TransactionPayload,
    ) -> Result<RemoteTransaction, RemoteError>;

    async fn login(&self, login: &str, password: &str) -> Result<LoginResponse, RemoteError>;
}

/// Lightweight upstream reachability check used by the network observer.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpRemote {
    base_url: String,
    api_key: Zeroizing<String>,
    client: Client,
    health_client: Client,
    session_token: RwLock<Option<Zeroizing<String>>>,
}

impl HttpRemote {
    pub fn new(
        server_url: &str,
        api_key: &str,
        request_timeout: Duration,
        connectivity_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let base_url = normalize_server_url(server_url);
        if base_url.is_empty() {
            return Err(RemoteError::InvalidUrl(server_url.to_string()));
        }
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| friendly_error(&base_url, &e))?;
        let health_client = Client::builder()
            .timeout(connectivity_timeout)
            .build()
            .map_err(|e| friendly_error(&base_url, &e))?;
        Ok(Self {
            base_url,
            api_key: Zeroizing::new(api_key.trim().to_string()),
            client,
            health_client,
            session_token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Replace the bearer token sent with every request.
    pub fn set_session_token(&self, token: Option<&str>) {
        match self.session_token.write() {
            Ok(mut guard) => *guard = token.map(|t| Zeroizing::new(t.to_string())),
            Err(e) => warn!("session token lock poisoned: {e}"),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .header("Accept", "application/json");
        if !self.api_key.is_empty() {
            req = req.header("X-POS-API-Key", self.api_key.as_str());
        }
        if let Ok(guard) = self.session_token.read() {
            if let Some(token) = guard.as_ref() {
                req = req.bearer_auth(token.as_str());
            }
        }
        req
    }

    async fn send_json(&self, req: reqwest::RequestBuilder) -> Result<Value, RemoteError> {
        let start = Instant::now();
        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        debug!(
            status = status.as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "POS server responded"
        );

        if !status.is_success() {
            return Err(status_error(status, &body_text));
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn list_products(&self) -> Result<Vec<Product>, RemoteError> {
        let body = self
            .send_json(self.request(reqwest::Method::GET, "/api/products"))
            .await?;
        unwrap_data(body)
    }

    async fn list_customers(&self) -> Result<Vec<Customer>, RemoteError> {
        let body = self
            .send_json(self.request(reqwest::Method::GET, "/api/customers"))
            .await?;
        unwrap_data(body)
    }

    async fn list_transactions(&self, limit: usize) -> Result<Vec<RemoteTransaction>, RemoteError> {
        let req = self
            .request(reqwest::Method::GET, "/api/transactions")
            .query(&[("limit", limit)]);
        let body = self.send_json(req).await?;
        unwrap_data(body)
    }

    async fn create_transaction(
        &self,
        payload: &TransactionPayload,
    ) -> Result<RemoteTransaction, RemoteError> {
        let req = self
            .request(reqwest::Method::POST, "/api/transactions")
            .json(payload);
        let body = self.send_json(req).await?;
        let created: RemoteTransaction = unwrap_data(body)?;
        info!(remote_id = created.id, "Transaction created on POS server");
        Ok(created)
    }

    async fn login(&self, login: &str, password: &str) -> Result<LoginResponse, RemoteError> {
        let body = Zeroizing::new(
            serde_json::json!({ "login": login, "password": password }).to_string(),
        );
        let req = self
            .request(reqwest::Method::POST, "/api/auth/login")
            .header("Content-Type", "application/json")
            .body(body.as_str().to_owned());
        let resp = self.send_json(req).await?;
        let login_resp: LoginResponse = unwrap_data(resp)?;
        self.set_session_token(Some(&login_resp.token));
        Ok(login_resp)
    }
}

#[async_trait]
impl ReachabilityProbe for HttpRemote {
    async fn probe(&self) -> bool {
        let health_url = format!("{}/api/health", self.base_url);
        let start = Instant::now();
        match self.health_client.head(&health_url).send().await {
            // Any HTTP answer means the server is reachable.
            Ok(resp) => {
                debug!(
                    status = resp.status().as_u16(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Reachability probe answered"
                );
                true
            }
            Err(e) => {
                debug!(error = %friendly_error(&self.base_url, &e), "Reachability probe failed");
                false
            }
        }
    }
}
