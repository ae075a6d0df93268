//! Wire-level request/response types and the HTTP transport seam.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::de::DeserializeOwned;

use crate::errors::{CrawlError, CrawlResult};

// `<https://api.github.com/search/code?page=2>; rel="next"`
static NEXT_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<([^>]+)>\s*;\s*rel="?next"?"#).unwrap());

const USER_AGENT: &str = concat!("stratum/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// An outbound GET request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub url: String,
    pub query: Vec<(String, String)>,
    /// Whether the call counts against the provider's quota and is throttled.
    pub rate_limited: bool,
    /// Whether the access credential is attached.
    pub authenticated: bool,
}

impl Request {
    pub fn api(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            rate_limited: true,
            authenticated: true,
        }
    }

    /// Content retrieval that carries no quota.
    pub fn raw(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            rate_limited: false,
            authenticated: false,
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    /// URL with query parameters, for diagnostics only.
    pub fn display_url(&self) -> String {
        if self.query.is_empty() {
            return self.url.clone();
        }
        let params: Vec<String> = self
            .query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!("{}?{}", self.url, params.join("&"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    /// Header names are lower-case.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_u64(&self, name: &str) -> Option<u64> {
        self.header(name).and_then(|v| v.trim().parse::<u64>().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Continuation link from the `Link` header, if another page exists.
    pub fn next_link(&self) -> Option<String> {
        let link = self.header("link")?;
        NEXT_LINK_RE
            .captures(link)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> CrawlResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Sends one request and returns whatever the server answered. Only a lost
/// connection is an error at this level; status codes are the caller's
/// business.
pub trait Transport {
    fn send(&mut self, request: &Request) -> CrawlResult<Response>;
}

/// Blocking HTTP transport backed by `ureq`.
pub struct HttpTransport {
    agent: ureq::Agent,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(token: Option<String>) -> Self {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build();
        Self {
            agent: ureq::Agent::new_with_config(config),
            token,
        }
    }
}

impl Transport for HttpTransport {
    fn send(&mut self, request: &Request) -> CrawlResult<Response> {
        let mut builder = self
            .agent
            .get(&request.url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json");
        for (key, value) in &request.query {
            builder = builder.query(key, value);
        }
        if request.authenticated {
            if let Some(token) = &self.token {
                builder = builder.header("Authorization", &format!("token {token}"));
            }
        }

        let response = builder.call().map_err(|err| {
            CrawlError::Transport(format!("GET {}: {err}", request.display_url()))
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response.into_body().read_to_vec().map_err(|err| {
            CrawlError::Transport(format!(
                "failed reading response body from {}: {err}",
                request.display_url()
            ))
        })?;

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}
