//! In-process traffic and tool-call analytics.
//!
//! The recorder is shared between the HTTP layer and every protocol server.
//! All mutations go through one mutex that is never held across an await.

use std::{collections::BTreeMap, net::SocketAddr};

use axum::http::{HeaderMap, Method, header::USER_AGENT};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub mod firebase;
pub mod store;

pub const RECENT_TOOL_CALL_LIMIT: usize = 100;
pub const USER_AGENT_LIMIT: usize = 50;
pub const UNKNOWN: &str = "unknown";

const HOUR_BUCKET_FORMAT: &str = "%Y-%m-%dT%H";
const HOURLY_WINDOW: i64 = 24;
const TOP_CLIENT_LIMIT: usize = 20;
const TOOL_SUMMARY_RECENT_LIMIT: usize = 50;

/// Everything that is persisted between restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyticsState {
    pub server_start_time: DateTime<Utc>,
    pub total_requests: u64,
    pub total_tool_calls: u64,
    pub requests_by_method: BTreeMap<String, u64>,
    pub requests_by_endpoint: BTreeMap<String, u64>,
    pub tool_calls: BTreeMap<String, u64>,
    pub clients_by_ip: BTreeMap<String, u64>,
    pub clients_by_user_agent: BTreeMap<String, u64>,
    pub hourly_requests: BTreeMap<String, u64>,
    pub recent_tool_calls: Vec<ToolCallRecord>,
}

impl Default for AnalyticsState {
    fn default() -> Self {
        Self::started_at(Utc::now())
    }
}

impl AnalyticsState {
    pub fn started_at(server_start_time: DateTime<Utc>) -> Self {
        Self {
            server_start_time,
            total_requests: 0,
            total_tool_calls: 0,
            requests_by_method: BTreeMap::new(),
            requests_by_endpoint: BTreeMap::new(),
            tool_calls: BTreeMap::new(),
            clients_by_ip: BTreeMap::new(),
            clients_by_user_agent: BTreeMap::new(),
            hourly_requests: BTreeMap::new(),
            recent_tool_calls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub user_agent: String,
}

/// Who sent a request, resolved once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    pub method: String,
    pub client_ip: String,
    pub user_agent: String,
}

impl Default for RequestMeta {
    fn default() -> Self {
        Self {
            method: UNKNOWN.to_owned(),
            client_ip: UNKNOWN.to_owned(),
            user_agent: UNKNOWN.to_owned(),
        }
    }
}

impl RequestMeta {
    pub fn from_http(method: &Method, headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(truncate_user_agent)
            .unwrap_or_else(|| UNKNOWN.to_owned());

        Self {
            method: method.as_str().to_owned(),
            client_ip: client_ip(headers, peer),
            user_agent,
        }
    }
}

/// First `X-Forwarded-For` hop, then the socket peer, then `unknown`.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    match (forwarded, peer) {
        (Some(ip), _) => ip.to_owned(),
        (None, Some(addr)) => addr.ip().to_string(),
        (None, None) => UNKNOWN.to_owned(),
    }
}

pub fn truncate_user_agent(raw: &str) -> String {
    raw.chars().take(USER_AGENT_LIMIT).collect()
}

pub fn hour_bucket(at: DateTime<Utc>) -> String {
    at.format(HOUR_BUCKET_FORMAT).to_string()
}

#[derive(Debug)]
pub struct AnalyticsRecorder {
    state: Mutex<AnalyticsState>,
}

impl Default for AnalyticsRecorder {
    fn default() -> Self {
        Self::new(AnalyticsState::default())
    }
}

impl AnalyticsRecorder {
    pub fn new(state: AnalyticsState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn record_request(&self, endpoint: &str, meta: &RequestMeta) {
        self.record_request_at(endpoint, meta, Utc::now());
    }

    pub fn record_request_at(&self, endpoint: &str, meta: &RequestMeta, at: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.total_requests = state.total_requests.saturating_add(1);
        bump(&mut state.requests_by_method, &meta.method);
        bump(&mut state.requests_by_endpoint, endpoint);
        bump(&mut state.clients_by_ip, &meta.client_ip);
        bump(&mut state.clients_by_user_agent, &meta.user_agent);
        bump(&mut state.hourly_requests, &hour_bucket(at));
    }

    pub fn record_tool_call(&self, tool_name: &str, meta: &RequestMeta) {
        self.record_tool_call_at(tool_name, meta, Utc::now());
    }

    pub fn record_tool_call_at(&self, tool_name: &str, meta: &RequestMeta, at: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.total_tool_calls = state.total_tool_calls.saturating_add(1);
        bump(&mut state.tool_calls, tool_name);
        state.recent_tool_calls.insert(
            0,
            ToolCallRecord {
                tool_name: tool_name.to_owned(),
                timestamp: at,
                client_ip: meta.client_ip.clone(),
                user_agent: truncate_user_agent(&meta.user_agent),
            },
        );
        state.recent_tool_calls.truncate(RECENT_TOOL_CALL_LIMIT);
    }

    pub fn snapshot(&self) -> AnalyticsState {
        self.state.lock().clone()
    }

    pub fn server_start_time(&self) -> DateTime<Utc> {
        self.state.lock().server_start_time
    }

    /// Adds imported totals onto the live counters and returns the new totals.
    /// Counters saturate at `u64::MAX` and never wrap back down.
    pub fn import_totals(&self, totals: &ImportTotals) -> ImportTotals {
        let mut state = self.state.lock();
        state.total_requests = state
            .total_requests
            .saturating_add(totals.total_requests.unwrap_or(0));
        state.total_tool_calls = state
            .total_tool_calls
            .saturating_add(totals.total_tool_calls.unwrap_or(0));
        ImportTotals {
            total_requests: Some(state.total_requests),
            total_tool_calls: Some(state.total_tool_calls),
        }
    }

    pub fn summary(&self, now: DateTime<Utc>) -> AnalyticsSummary {
        let state = self.snapshot();

        let hourly_requests = (0..HOURLY_WINDOW)
            .rev()
            .map(|hours_ago| {
                let hour = hour_bucket(now - Duration::hours(hours_ago));
                let requests = state.hourly_requests.get(&hour).copied().unwrap_or(0);
                HourlyCount { hour, requests }
            })
            .collect();

        let mut clients: Vec<(String, u64)> = state.clients_by_ip.into_iter().collect();
        clients.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let top_clients = clients
            .into_iter()
            .take(TOP_CLIENT_LIMIT)
            .map(|(ip, requests)| ClientCount { ip, requests })
            .collect();

        AnalyticsSummary {
            server_start_time: state.server_start_time,
            uptime_seconds: (now - state.server_start_time).num_seconds().max(0),
            total_requests: state.total_requests,
            total_tool_calls: state.total_tool_calls,
            requests_by_method: state.requests_by_method,
            requests_by_endpoint: state.requests_by_endpoint,
            tool_calls: state.tool_calls,
            hourly_requests,
            top_clients,
            clients_by_user_agent: state.clients_by_user_agent,
            recent_tool_calls: state.recent_tool_calls,
        }
    }

    pub fn tool_summary(&self) -> ToolSummary {
        let state = self.snapshot();
        let total = state.total_tool_calls;

        let mut tools: Vec<ToolUsage> = state
            .tool_calls
            .into_iter()
            .map(|(name, calls)| ToolUsage {
                percentage: percentage(calls, total),
                name,
                calls,
            })
            .collect();
        tools.sort_by(|a, b| b.calls.cmp(&a.calls).then_with(|| a.name.cmp(&b.name)));

        let mut recent_calls = state.recent_tool_calls;
        recent_calls.truncate(TOOL_SUMMARY_RECENT_LIMIT);

        ToolSummary {
            total_tool_calls: total,
            tools,
            recent_calls,
        }
    }
}

fn bump(map: &mut BTreeMap<String, u64>, key: &str) {
    let count = map.entry(key.to_owned()).or_insert(0);
    *count = count.saturating_add(1);
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let raw = part as f64 / total as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportTotals {
    #[serde(default)]
    pub total_requests: Option<u64>,
    #[serde(default)]
    pub total_tool_calls: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    pub server_start_time: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub total_requests: u64,
    pub total_tool_calls: u64,
    pub requests_by_method: BTreeMap<String, u64>,
    pub requests_by_endpoint: BTreeMap<String, u64>,
    pub tool_calls: BTreeMap<String, u64>,
    pub hourly_requests: Vec<HourlyCount>,
    pub top_clients: Vec<ClientCount>,
    pub clients_by_user_agent: BTreeMap<String, u64>,
    pub recent_tool_calls: Vec<ToolCallRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourlyCount {
    pub hour: String,
    pub requests: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientCount {
    pub ip: String,
    pub requests: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSummary {
    pub total_tool_calls: u64,
    pub tools: Vec<ToolUsage>,
    pub recent_calls: Vec<ToolCallRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolUsage {
    pub name: String,
    pub calls: u64,
    pub percentage: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::TimeZone;

    fn meta(method: &str, ip: &str) -> RequestMeta {
        RequestMeta {
            method: method.to_owned(),
            client_ip: ip.to_owned(),
            user_agent: "test-agent".to_owned(),
        }
    }

    #[test]
    fn request_totals_match_method_breakdown() {
        let recorder = AnalyticsRecorder::default();
        let methods = ["GET", "POST", "GET", "DELETE", "POST", "GET", "OPTIONS"];
        for (idx, method) in methods.iter().enumerate() {
            recorder.record_request("/mcp", &meta(method, &format!("10.0.0.{idx}")));
        }

        let state = recorder.snapshot();
        assert_eq!(state.total_requests, methods.len() as u64);
        assert_eq!(
            state.requests_by_method.values().sum::<u64>(),
            methods.len() as u64
        );
        assert_eq!(state.requests_by_method["GET"], 3);
        assert_eq!(state.requests_by_endpoint["/mcp"], methods.len() as u64);
        assert_eq!(state.clients_by_ip.len(), methods.len());
    }

    #[test]
    fn request_lands_in_its_hour_bucket() {
        let recorder = AnalyticsRecorder::default();
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 17, 59, 12).unwrap();
        recorder.record_request_at("/health", &meta("GET", "1.1.1.1"), at);

        let state = recorder.snapshot();
        assert_eq!(state.hourly_requests.get("2026-03-04T17"), Some(&1));
        assert_eq!(hour_bucket(at).len(), 13);
    }

    #[test]
    fn recent_tool_calls_are_capped_newest_first() {
        let recorder = AnalyticsRecorder::default();
        for idx in 1..=101 {
            recorder.record_tool_call(&format!("tool_{idx}"), &meta("POST", "1.2.3.4"));
        }

        let state = recorder.snapshot();
        assert_eq!(state.total_tool_calls, 101);
        assert_eq!(state.recent_tool_calls.len(), RECENT_TOOL_CALL_LIMIT);
        assert_eq!(state.recent_tool_calls[0].tool_name, "tool_101");
        assert!(
            state
                .recent_tool_calls
                .iter()
                .all(|call| call.tool_name != "tool_1")
        );
    }

    #[test]
    fn client_ip_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "192.168.1.9:4000".parse().unwrap();
        assert_eq!(client_ip(&headers, None), UNKNOWN);
        assert_eq!(client_ip(&headers, Some(peer)), "192.168.1.9");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" 203.0.113.7 , 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn user_agent_is_truncated_to_fifty_chars() {
        let mut headers = HeaderMap::new();
        let long = "Mozilla/5.0 ".repeat(10);
        headers.insert(USER_AGENT, HeaderValue::from_str(&long).unwrap());

        let meta = RequestMeta::from_http(&Method::POST, &headers, None);
        assert_eq!(meta.user_agent.chars().count(), USER_AGENT_LIMIT);
        assert_eq!(meta.method, "POST");

        let bare = RequestMeta::from_http(&Method::GET, &HeaderMap::new(), None);
        assert_eq!(bare.user_agent, UNKNOWN);
        assert_eq!(bare.client_ip, UNKNOWN);
    }

    #[test]
    fn summary_fills_last_day_and_ranks_clients() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 12, 30, 0).unwrap();
        let recorder = AnalyticsRecorder::new(AnalyticsState::started_at(
            now - Duration::hours(30),
        ));
        for _ in 0..3 {
            recorder.record_request_at("/mcp", &meta("POST", "9.9.9.9"), now);
        }
        recorder.record_request_at("/health", &meta("GET", "1.1.1.1"), now - Duration::hours(2));
        recorder.record_request_at("/health", &meta("GET", "1.1.1.1"), now - Duration::hours(48));

        let summary = recorder.summary(now);
        assert_eq!(summary.hourly_requests.len(), 24);
        assert_eq!(summary.hourly_requests[23].hour, "2026-03-04T12");
        assert_eq!(summary.hourly_requests[23].requests, 3);
        assert_eq!(summary.hourly_requests[21].requests, 1);
        assert_eq!(summary.hourly_requests[0].hour, "2026-03-03T13");
        assert_eq!(summary.top_clients[0].ip, "9.9.9.9");
        assert_eq!(summary.top_clients[1].requests, 2);
        assert_eq!(summary.uptime_seconds, 30 * 3600);
    }

    #[test]
    fn tool_summary_reports_percentages() {
        let recorder = AnalyticsRecorder::default();
        for _ in 0..3 {
            recorder.record_tool_call("plausible_query", &meta("POST", "1.1.1.1"));
        }
        recorder.record_tool_call("plausible_list_sites", &meta("POST", "1.1.1.1"));

        let summary = recorder.tool_summary();
        assert_eq!(summary.total_tool_calls, 4);
        assert_eq!(summary.tools[0].name, "plausible_query");
        assert_eq!(summary.tools[0].percentage, 75.0);
        assert_eq!(summary.tools[1].percentage, 25.0);
        assert_eq!(summary.recent_calls.len(), 4);
    }

    #[test]
    fn import_adds_onto_existing_totals() {
        let recorder = AnalyticsRecorder::default();
        recorder.record_request("/", &meta("GET", "1.1.1.1"));

        let totals = recorder.import_totals(&ImportTotals {
            total_requests: Some(41),
            total_tool_calls: None,
        });
        assert_eq!(totals.total_requests, Some(42));
        assert_eq!(totals.total_tool_calls, Some(0));
    }

    #[test]
    fn counters_saturate_instead_of_wrapping() {
        let recorder = AnalyticsRecorder::default();
        recorder.record_request("/", &meta("GET", "1.1.1.1"));

        let totals = recorder.import_totals(&ImportTotals {
            total_requests: Some(u64::MAX),
            total_tool_calls: Some(u64::MAX),
        });
        assert_eq!(totals.total_requests, Some(u64::MAX));

        recorder.record_request("/", &meta("GET", "1.1.1.1"));
        recorder.record_tool_call("plausible_query", &meta("POST", "1.1.1.1"));
        let state = recorder.snapshot();
        assert_eq!(state.total_requests, u64::MAX);
        assert_eq!(state.total_tool_calls, u64::MAX);
        assert_eq!(state.requests_by_method["GET"], 2);
    }

    #[test]
    fn missing_fields_deserialize_to_zero_values() {
        let state: AnalyticsState =
            serde_json::from_str(r#"{"serverStartTime":"2026-01-01T00:00:00Z","totalRequests":5}"#)
                .unwrap();
        assert_eq!(state.total_requests, 5);
        assert_eq!(state.total_tool_calls, 0);
        assert!(state.tool_calls.is_empty());
        assert!(state.recent_tool_calls.is_empty());
        assert_eq!(
            state.server_start_time,
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
        );
    }
}
