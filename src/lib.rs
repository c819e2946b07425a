use std::{
    cmp::min,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use reqwest::{Client, Method, RequestBuilder, StatusCode, Url, header::USER_AGENT};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub mod analytics;
pub mod cache;
pub mod server;
pub mod tools;

/// Default Plausible instance used when no base URL is configured.
pub const DEFAULT_API_URL: &str = "https://plausible.io";

/// Fixed identifier of this server inside the remote analytics store.
pub const SERVER_ID: &str = "plausible-mcp-server";

const EVENT_PATH: &str = "/api/event";
const QUERY_PATH: &str = "/api/v2/query";
const REALTIME_PATH: &str = "/api/v1/stats/realtime/visitors";
const HEALTH_PATH: &str = "/api/health";

/// Stats API v1 endpoints that take flat query-string parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsEndpoint {
    Aggregate,
    Timeseries,
    Breakdown,
}

impl StatsEndpoint {
    fn path(self) -> &'static str {
        match self {
            StatsEndpoint::Aggregate => "/api/v1/stats/aggregate",
            StatsEndpoint::Timeseries => "/api/v1/stats/timeseries",
            StatsEndpoint::Breakdown => "/api/v1/stats/breakdown",
        }
    }
}

/// Authenticated client for one Plausible base URL and API key.
#[derive(Clone, Debug)]
pub struct PlausibleClient {
    client: Client,
    base: Url,
    api_key: String,
    rejected: Arc<AtomicBool>,
}

impl PlausibleClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, PlausibleError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let base = Url::parse(trimmed).map_err(|source| PlausibleError::InvalidEndpoint {
            endpoint: base_url.to_owned(),
            source,
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(PlausibleError::UnsupportedScheme {
                endpoint: base_url.to_owned(),
            });
        }

        Ok(Self {
            client: Client::new(),
            base,
            api_key: api_key.trim().to_owned(),
            rejected: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Set once the upstream answered 401 to this client's key. Shared by
    /// every clone of the client.
    pub fn credentials_rejected(&self) -> bool {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Runs a Stats API v2 query. The body is forwarded untouched.
    pub async fn query<B: Serialize + ?Sized>(&self, body: &B) -> Result<Value, PlausibleError> {
        let url = self.endpoint(QUERY_PATH)?;
        let builder = self.authorized(Method::POST, url).json(body);
        self.send(Method::POST, QUERY_PATH, builder).await
    }

    pub async fn realtime_visitors(&self, site_id: &str) -> Result<Value, PlausibleError> {
        let url = self.endpoint(REALTIME_PATH)?;
        let builder = self
            .authorized(Method::GET, url)
            .query(&[("site_id", site_id)]);
        self.send(Method::GET, REALTIME_PATH, builder).await
    }

    pub async fn stats(
        &self,
        endpoint: StatsEndpoint,
        params: &[(&str, String)],
    ) -> Result<Value, PlausibleError> {
        let path = endpoint.path();
        let url = self.endpoint(path)?;
        let builder = self.authorized(Method::GET, url).query(params);
        self.send(Method::GET, path, builder).await
    }

    /// Sends an event to the Events API. Plausible derives the visitor from
    /// the user agent and forwarded IP, so both are passed through.
    pub async fn record_event<B: Serialize + ?Sized>(
        &self,
        event: &B,
        user_agent: &str,
        forwarded_for: Option<&str>,
    ) -> Result<Value, PlausibleError> {
        let url = self.endpoint(EVENT_PATH)?;
        let mut builder = self
            .client
            .post(url)
            .header(USER_AGENT, user_agent)
            .json(event);
        if let Some(ip) = forwarded_for {
            builder = builder.header("X-Forwarded-For", ip);
        }
        self.send(Method::POST, EVENT_PATH, builder).await
    }

    /// Calls a Sites API path (`/api/v1/sites...`) with query parameters.
    pub async fn sites_query(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, PlausibleError> {
        let url = self.endpoint(path)?;
        let builder = self.authorized(method.clone(), url).query(params);
        self.send(method, path, builder).await
    }

    /// Calls a Sites API path with a JSON body.
    pub async fn sites_send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<Value, PlausibleError> {
        let url = self.endpoint(path)?;
        let builder = self.authorized(method.clone(), url).json(body);
        self.send(method, path, builder).await
    }

    pub async fn health(&self) -> Result<Value, PlausibleError> {
        let url = self.endpoint(HEALTH_PATH)?;
        let builder = self.client.get(url);
        self.send(Method::GET, HEALTH_PATH, builder).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, PlausibleError> {
        let base = self.base.as_str().trim_end_matches('/');
        let raw = format!("{base}{path}");
        Url::parse(&raw).map_err(|source| PlausibleError::InvalidEndpoint {
            endpoint: raw,
            source,
        })
    }

    fn authorized(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(self.api_key.as_str())
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        builder: RequestBuilder,
    ) -> Result<Value, PlausibleError> {
        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => {
                log_error(&self.api_key, &method, path, &err);
                return Err(PlausibleError::Http(err));
            }
        };

        let status = response.status();
        let text = response.text().await.map_err(PlausibleError::Http)?;
        log_response(&self.api_key, &method, path, status);

        if status == StatusCode::UNAUTHORIZED {
            self.rejected.store(true, Ordering::Relaxed);
        }
        if !status.is_success() {
            return Err(PlausibleError::Api {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("").to_owned(),
                body: text,
            });
        }

        Ok(parse_body(&text))
    }
}

#[derive(Debug, Error)]
pub enum PlausibleError {
    #[error("invalid Plausible endpoint '{endpoint}': {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported scheme in Plausible endpoint '{endpoint}'")]
    UnsupportedScheme { endpoint: String },
    #[error("Plausible API error {status} {status_text}: {body}")]
    Api {
        status: u16,
        status_text: String,
        body: String,
    },
    #[error("http error: {0}")]
    Http(reqwest::Error),
}

/// Upstream bodies are JSON except for the Events API, which answers `ok`.
fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned()))
}

/// Shortened key for log lines.
pub fn preview_key(key: &str) -> String {
    if key.is_empty() {
        return "anonymous".to_owned();
    }
    let shown = key
        .char_indices()
        .nth(min(6, key.chars().count()))
        .map(|(idx, _)| idx)
        .unwrap_or(key.len());
    format!("{}…", &key[..shown])
}

fn log_response(key: &str, method: &Method, path: &str, status: StatusCode) {
    let key_preview = preview_key(key);
    if status.is_success() {
        debug!(key = %key_preview, %method, path, %status, "plausible request");
    } else {
        warn!(key = %key_preview, %method, path, %status, "plausible request failed");
    }
}

fn log_error(key: &str, method: &Method, path: &str, err: &reqwest::Error) {
    let key_preview = preview_key(key);
    warn!(key = %key_preview, %method, path, error = %err, "plausible request error");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_trims_trailing_slash_and_whitespace() {
        let client = PlausibleClient::new(" https://stats.example.com/ ", " key ").unwrap();
        assert_eq!(
            client.endpoint(QUERY_PATH).unwrap().as_str(),
            "https://stats.example.com/api/v2/query"
        );
        assert!(client.has_api_key());
    }

    #[test]
    fn endpoint_keeps_base_path_prefix() {
        let client = PlausibleClient::new("https://example.com/plausible", "key").unwrap();
        assert_eq!(
            client.endpoint(EVENT_PATH).unwrap().as_str(),
            "https://example.com/plausible/api/event"
        );
    }

    #[test]
    fn new_rejects_invalid_and_non_http_urls() {
        assert!(matches!(
            PlausibleClient::new("not a url", "key"),
            Err(PlausibleError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            PlausibleClient::new("ftp://example.com", "key"),
            Err(PlausibleError::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn parse_body_falls_back_to_text() {
        assert_eq!(parse_body("ok"), Value::String("ok".into()));
        assert_eq!(parse_body(""), Value::Null);
        assert_eq!(parse_body("{\"a\":1}")["a"], 1);
    }

    #[test]
    fn preview_key_hides_most_of_the_secret() {
        assert_eq!(preview_key("abcdefghijkl"), "abcdef…");
        assert_eq!(preview_key("abc"), "abc…");
        assert_eq!(preview_key(""), "anonymous");
    }
}
