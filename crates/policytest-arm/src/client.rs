use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ArmError;
use crate::session::Session;

// ── Base URLs (overridden in tests) ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BaseUrls {
    pub management: String,
}

impl Default for BaseUrls {
    fn default() -> Self {
        Self { management: "https://management.azure.com".into() }
    }
}

// ── Long-running operation polling ────────────────────────────────────────────

/// How 202 Accepted responses are awaited.
#[derive(Debug, Clone)]
pub struct LroPolicy {
    /// Poll intervals in seconds, cycled; a `Retry-After` header takes precedence.
    pub delays: Vec<u64>,
    pub max_polls: usize,
}

impl Default for LroPolicy {
    fn default() -> Self {
        Self { delays: vec![1, 2, 4, 8, 16, 30], max_polls: 120 }
    }
}

// ── Request / response ────────────────────────────────────────────────────────

/// One management API call: verb, resource path, API version, optional body.
#[derive(Debug, Clone)]
pub struct ArmRequest {
    pub method: Method,
    /// Resource path starting with `/`, or an absolute URL (e.g. a `nextLink`).
    pub path: String,
    pub api_version: Option<String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ArmRequest {
    pub fn new(method: Method, path: impl Into<String>, api_version: &str) -> Self {
        Self {
            method,
            path: path.into(),
            api_version: Some(api_version.to_string()),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>, api_version: &str) -> Self {
        Self::new(Method::GET, path, api_version)
    }

    pub fn put(path: impl Into<String>, api_version: &str, body: Value) -> Self {
        Self::new(Method::PUT, path, api_version).body(body)
    }

    pub fn post(path: impl Into<String>, api_version: &str) -> Self {
        Self::new(Method::POST, path, api_version)
    }

    pub fn delete(path: impl Into<String>, api_version: &str) -> Self {
        Self::new(Method::DELETE, path, api_version)
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    fn describe(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// How a call reached its terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// 200/201/204 on the first response.
    Immediate,
    /// 202 Accepted, polled until the operation reported success.
    Resolved,
    /// Any other status, or an accepted operation that ended unsuccessfully.
    Failed,
}

/// Terminal outcome of an [`ArmRequest`].
#[derive(Debug, Clone)]
pub struct ArmResponse {
    pub kind: ResponseKind,
    pub status: u16,
    pub body: Value,
    /// Response text exactly as received, for substring assertions.
    pub raw: String,
}

impl ArmResponse {
    fn from_parts(kind: ResponseKind, status: u16, raw: String) -> Self {
        let body = serde_json::from_str(&raw).unwrap_or(Value::Null);
        Self { kind, status, body, raw }
    }

    pub fn is_success(&self) -> bool {
        self.kind != ResponseKind::Failed
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// `error.code` of an ARM error envelope.
    pub fn error_code(&self) -> Option<&str> {
        self.body
            .get("error")
            .or_else(|| self.body.get("Error"))
            .and_then(|e| e["code"].as_str())
    }

    pub fn error_message(&self) -> String {
        parse_arm_error(&self.body)
    }

    /// Case-insensitive substring match over the raw response text.
    pub fn mentions(&self, needle: &str) -> bool {
        self.raw.to_lowercase().contains(&needle.to_lowercase())
    }

    /// The body, or an [`ArmError::Rejected`] naming `context`.
    pub fn require_success(self, context: &str) -> Result<Value, ArmError> {
        if self.is_success() {
            return Ok(self.body);
        }
        Err(ArmError::Rejected {
            context: context.to_string(),
            status: self.status,
            message: self.error_message(),
        })
    }
}

/// Convert an ARM error envelope into `"<code>: <message>"`.
pub fn parse_arm_error(body: &Value) -> String {
    let err = body
        .get("error")
        .or_else(|| body.get("Error"))
        .unwrap_or(body);
    let code    = err["code"].as_str().unwrap_or("Unknown");
    let message = err["message"].as_str().unwrap_or("unknown error");
    format!("{}: {}", code, message)
}

fn async_operation_url(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Azure-AsyncOperation")
        .or_else(|| headers.get("Location"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Thin client for the management API that hides the 202-Accepted pattern.
pub struct ArmClient {
    http:    reqwest::Client,
    session: Arc<Session>,
    base:    BaseUrls,
    lro:     LroPolicy,
}

impl ArmClient {
    pub fn new(session: Arc<Session>) -> Self {
        Self::with_base(session, BaseUrls::default(), LroPolicy::default())
    }

    /// Client against custom endpoints; used by tests and fakes.
    pub fn with_base(session: Arc<Session>, base: BaseUrls, lro: LroPolicy) -> Self {
        Self { http: reqwest::Client::new(), session, base, lro }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn subscription_id(&self) -> &str {
        self.session.subscription_id()
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base.management, path)
        }
    }

    async fn send(&self, req: &ArmRequest) -> Result<(u16, HeaderMap, String), ArmError> {
        let token = self.session.bearer().await?;
        let url = self.url_for(&req.path);
        debug!(method = %req.method, url, "ARM request");

        let mut builder = self.http.request(req.method.clone(), &url).bearer_auth(&token);
        if let Some(v) = &req.api_version {
            builder = builder.query(&[("api-version", v.as_str())]);
        }
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        } else if req.method == Method::POST {
            builder = builder.header("Content-Length", "0");
        }

        let resp = builder.send().await.map_err(|e| ArmError::Transport {
            method: req.method.to_string(),
            url: url.clone(),
            message: e.to_string(),
        })?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let raw = resp.text().await.map_err(|e| ArmError::Transport {
            method: req.method.to_string(),
            url,
            message: format!("reading body: {}", e),
        })?;
        Ok((status, headers, raw))
    }

    /// Perform a call and resolve it to a terminal outcome.
    ///
    /// 200/201/204 → [`ResponseKind::Immediate`]. 202 → the operation URL is
    /// polled until terminal: success → [`ResponseKind::Resolved`] (for PUT and
    /// PATCH, with the resource re-read so the body is the resource), anything
    /// else → [`ResponseKind::Failed`] carrying the operation's error payload.
    /// Any other status → [`ResponseKind::Failed`] with the body verbatim.
    ///
    /// `Err` is reserved for transport and authentication failures.
    pub async fn invoke(&self, req: &ArmRequest) -> Result<ArmResponse, ArmError> {
        let (status, headers, raw) = self.send(req).await?;
        match status {
            200 | 201 | 204 => Ok(ArmResponse::from_parts(ResponseKind::Immediate, status, raw)),
            202 => {
                let Some(op_url) = async_operation_url(&headers) else {
                    // Accepted with nothing to poll: the service finishes on its own.
                    return Ok(ArmResponse::from_parts(ResponseKind::Resolved, status, raw));
                };
                let outcome = self.wait_for_operation(&op_url, retry_after(&headers)).await?;
                if outcome.is_success() && (req.method == Method::PUT || req.method == Method::PATCH) {
                    let (get_status, _, get_raw) = self.send(&ArmRequest {
                        method: Method::GET,
                        path: req.path.clone(),
                        api_version: req.api_version.clone(),
                        query: Vec::new(),
                        body: None,
                    }).await?;
                    if (200..300).contains(&get_status) {
                        return Ok(ArmResponse::from_parts(ResponseKind::Resolved, get_status, get_raw));
                    }
                }
                Ok(outcome)
            }
            _ => {
                debug!(status, request = %req.describe(), "ARM request failed");
                Ok(ArmResponse::from_parts(ResponseKind::Failed, status, raw))
            }
        }
    }

    /// Fire a call without awaiting a long-running operation. 202 counts as
    /// success (the service has accepted the work).
    pub async fn submit(&self, req: &ArmRequest) -> Result<ArmResponse, ArmError> {
        let (status, _, raw) = self.send(req).await?;
        let kind = match status {
            200 | 201 | 204 => ResponseKind::Immediate,
            202 => ResponseKind::Resolved,
            _ => ResponseKind::Failed,
        };
        Ok(ArmResponse::from_parts(kind, status, raw))
    }

    /// GET every page of a list endpoint, following `nextLink`.
    pub async fn list(&self, req: &ArmRequest) -> Result<Vec<Value>, ArmError> {
        let mut items = Vec::new();
        let mut next = Some(req.clone());
        while let Some(page_req) = next.take() {
            let page = self.invoke(&page_req).await?.require_success(&page_req.describe())?;
            if let Some(values) = page["value"].as_array() {
                items.extend(values.iter().cloned());
            }
            if let Some(link) = page["nextLink"].as_str().filter(|s| !s.is_empty()) {
                // nextLink already carries api-version and the query.
                next = Some(ArmRequest {
                    method: Method::GET,
                    path: link.to_string(),
                    api_version: None,
                    query: Vec::new(),
                    body: None,
                });
            }
        }
        Ok(items)
    }

    /// Poll an async operation URL until it completes or the poll budget runs out.
    ///
    /// Azure returns either `Azure-AsyncOperation` (status document with a
    /// `status` field) or `Location` (202 while running, then the result).
    async fn wait_for_operation(
        &self,
        op_url: &str,
        first_wait: Option<Duration>,
    ) -> Result<ArmResponse, ArmError> {
        let poll = ArmRequest {
            method: Method::GET,
            path: op_url.to_string(),
            api_version: None,
            query: Vec::new(),
            body: None,
        };
        let mut wait = first_wait;
        let max_polls = self.lro.max_polls;

        for (i, &delay) in self.lro.delays.iter().cycle().take(max_polls).enumerate() {
            let pause = wait.take().unwrap_or(Duration::from_secs(delay));
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }

            let (status, headers, raw) = self.send(&poll).await?;
            let outcome = ArmResponse::from_parts(ResponseKind::Resolved, status, raw);

            if status == 202 {
                wait = retry_after(&headers);
            } else if !(200..300).contains(&status) {
                return Ok(ArmResponse { kind: ResponseKind::Failed, ..outcome });
            } else {
                // Operation status values are case-insensitive.
                let state = outcome.body["status"].as_str().map(str::to_ascii_lowercase);
                match state.as_deref() {
                    None | Some("succeeded") => return Ok(outcome),
                    Some("failed") | Some("canceled") => {
                        return Ok(ArmResponse { kind: ResponseKind::Failed, ..outcome });
                    }
                    Some(_) => wait = retry_after(&headers),
                }
            }

            let n = i + 1;
            if n % 10 == 0 {
                info!(poll = n, op_url, "still waiting for ARM operation");
            } else {
                debug!(poll = n, op_url, "ARM operation pending");
            }
        }

        Err(ArmError::OperationTimeout { url: op_url.to_string(), polls: max_polls })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
