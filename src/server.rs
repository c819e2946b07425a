use std::{any::Any, net::SocketAddr, num::NonZeroUsize, path::PathBuf, sync::Arc};

use axum::{
    Router,
    body::{self, Body},
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderMap, Response, StatusCode, request::Parts},
    middleware::{self, Next},
    response::{Html, IntoResponse, Json},
    routing::{any, get, post},
};
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::{
    SERVER_ID,
    analytics::{
        AnalyticsRecorder, ImportTotals, RequestMeta,
        firebase::FirebaseStore,
        store::{
            AUTOSAVE_INTERVAL, DualStore, LocalFileStore, SnapshotStore, finish_autosave,
            spawn_autosave,
        },
    },
    cache::ServerCache,
    preview_key,
    tools::PlausibleServer,
};

const BODY_LIMIT: usize = 16 * 1024 * 1024; // 16 MiB
const API_KEY_HEADER: &str = "x-plausible-api-key";
const API_URL_HEADER: &str = "x-plausible-api-url";
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// JSON-RPC methods answered without credentials.
const DISCOVERY_METHODS: &[&str] = &[
    "initialize",
    "notifications/initialized",
    "tools/list",
    "prompts/list",
    "resources/list",
    "resources/templates/list",
    "ping",
];

/// Everything `serve` needs from the command line and environment.
#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub addr: SocketAddr,
    pub api_url: String,
    pub api_key: Option<String>,
    pub analytics_dir: PathBuf,
    pub credential_paths: Vec<PathBuf>,
    pub cache_capacity: NonZeroUsize,
}

pub struct AppState {
    cache: ServerCache,
    recorder: Arc<AnalyticsRecorder>,
    default_api_url: String,
    default_api_key: Option<String>,
    tool_names: Vec<String>,
}

impl AppState {
    pub fn new(
        recorder: Arc<AnalyticsRecorder>,
        cache_capacity: NonZeroUsize,
        default_api_url: &str,
        default_api_key: Option<&str>,
    ) -> Self {
        Self {
            cache: ServerCache::new(cache_capacity, recorder.clone()),
            recorder,
            default_api_url: default_api_url.trim().to_owned(),
            default_api_key: non_empty(default_api_key).map(str::to_owned),
            tool_names: PlausibleServer::tool_names(),
        }
    }

    pub fn cache(&self) -> &ServerCache {
        &self.cache
    }

    pub fn recorder(&self) -> &Arc<AnalyticsRecorder> {
        &self.recorder
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(describe))
        .route("/health", get(health_check))
        .route("/analytics", get(analytics_summary))
        .route("/analytics/tools", get(tool_analytics))
        .route("/analytics/import", post(import_analytics))
        .route("/analytics/dashboard", get(dashboard))
        .route(
            "/mcp",
            any(mcp_handler).layer(CatchPanicLayer::custom(panic_response)),
        )
        .layer(middleware::from_fn_with_state(state.clone(), track_request))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(config: ServeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let remote = FirebaseStore::discover(&config.credential_paths, SERVER_ID)
        .map(|store| Box::new(store) as Box<dyn SnapshotStore>);
    let store = Arc::new(DualStore::new(
        remote,
        LocalFileStore::in_dir(&config.analytics_dir),
    ));
    let recorder = Arc::new(AnalyticsRecorder::new(store.load().await));

    let state = Arc::new(AppState::new(
        recorder.clone(),
        config.cache_capacity,
        &config.api_url,
        config.api_key.as_deref(),
    ));

    let shutdown = CancellationToken::new();
    let autosave = spawn_autosave(
        recorder.clone(),
        store.clone(),
        AUTOSAVE_INTERVAL,
        shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    let bound_addr = listener.local_addr()?;
    info!(
        addr = %bound_addr,
        api_url = %config.api_url,
        default_key = config.api_key.is_some(),
        remote_analytics = store.has_remote(),
        "plausible MCP server listening on http://{bound_addr}/mcp"
    );

    let served = axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    finish_autosave(autosave, &shutdown, &recorder, &store).await;
    info!("shutting down");

    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// Records every inbound request and attaches its [`RequestMeta`] for the
/// protocol servers downstream.
async fn track_request(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> axum::response::Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let meta = RequestMeta::from_http(req.method(), req.headers(), peer);
    state.recorder.record_request(req.uri().path(), &meta);
    req.extensions_mut().insert(meta);
    next.run(req).await
}

async fn describe(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "name": SERVER_ID,
        "version": VERSION,
        "description": "Model Context Protocol server for the Plausible Analytics APIs",
        "endpoints": {
            "mcp": "/mcp",
            "health": "/health",
            "analytics": "/analytics",
            "toolAnalytics": "/analytics/tools",
            "importAnalytics": "/analytics/import",
            "dashboard": "/analytics/dashboard",
        },
        "credentials": {
            "query": ["apiKey", "apiUrl"],
            "headers": ["X-Plausible-Api-Key", "X-Plausible-Api-Url"],
            "defaultApiUrl": state.default_api_url,
            "defaultApiKeyConfigured": state.default_api_key.is_some(),
        },
        "tools": state.tool_names,
    }))
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let now = Utc::now();
    let uptime = (now - state.recorder.server_start_time()).num_seconds().max(0);
    Json(json!({
        "status": "ok",
        "timestamp": now,
        "uptimeSeconds": uptime,
        "version": VERSION,
    }))
}

async fn analytics_summary(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.recorder.summary(Utc::now()))
}

async fn tool_analytics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.recorder.tool_summary())
}

async fn import_analytics(
    State(state): State<Arc<AppState>>,
    Json(totals): Json<ImportTotals>,
) -> Json<Value> {
    let updated = state.recorder.import_totals(&totals);
    info!(
        total_requests = ?updated.total_requests,
        total_tool_calls = ?updated.total_tool_calls,
        "analytics totals imported"
    );
    Json(json!({ "success": true, "totals": updated }))
}

async fn dashboard() -> Html<String> {
    let version = html_escape::encode_text(VERSION);
    Html(DASHBOARD_HTML.replace("{{version}}", &version))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialQuery {
    api_key: Option<String>,
    api_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Credentials {
    api_url: String,
    api_key: Option<String>,
}

/// Query string first, then headers, then the configured defaults.
fn resolve_credentials(query: &CredentialQuery, headers: &HeaderMap, state: &AppState) -> Credentials {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());

    let api_key = non_empty(query.api_key.as_deref())
        .or_else(|| non_empty(header(API_KEY_HEADER)))
        .or(state.default_api_key.as_deref())
        .map(str::to_owned);
    let api_url = non_empty(query.api_url.as_deref())
        .or_else(|| non_empty(header(API_URL_HEADER)))
        .unwrap_or(&state.default_api_url)
        .to_owned();

    Credentials { api_url, api_key }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// JSON-RPC method names in a single or batched message. `None` when the
/// body is not JSON-RPC at all.
fn rpc_methods(body: &[u8]) -> Option<Vec<String>> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let messages = match value {
        Value::Array(items) => items,
        single => vec![single],
    };
    messages
        .iter()
        .map(|message| message.get("method")?.as_str().map(str::to_owned))
        .collect()
}

fn is_discovery(body: &[u8]) -> bool {
    match rpc_methods(body) {
        Some(methods) if !methods.is_empty() => methods
            .iter()
            .all(|method| DISCOVERY_METHODS.contains(&method.as_str())),
        _ => false,
    }
}

async fn mcp_handler(
    State(state): State<Arc<AppState>>,
    query: Option<Query<CredentialQuery>>,
    req: Request,
) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let body: Bytes = match body::to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "failed to read MCP request body");
            return rpc_error(StatusCode::BAD_REQUEST, -32700, "failed to read request body");
        }
    };

    let query = query.map(|Query(query)| query).unwrap_or_default();
    let credentials = resolve_credentials(&query, &parts.headers, &state);

    let Some(api_key) = credentials.api_key.as_deref() else {
        if is_discovery(&body) {
            debug!(api_url = %credentials.api_url, "serving discovery call with demo server");
            return match state.cache.demo(&credentials.api_url) {
                Ok(demo) => forward(demo.http_service(), parts, body).await,
                Err(err) => invalid_api_url(&err.to_string()),
            };
        }
        return missing_api_key();
    };

    match state.cache.resolve(&credentials.api_url, api_key) {
        Ok(handle) => forward(handle.http_service(), parts, body).await,
        Err(err) => {
            warn!(
                api_url = %credentials.api_url,
                key = %preview_key(api_key),
                error = %err,
                "rejected MCP request"
            );
            invalid_api_url(&err.to_string())
        }
    }
}

/// Hands the buffered request to a one-shot stateless transport.
async fn forward(
    service: crate::cache::McpHttpService,
    parts: Parts,
    body: Bytes,
) -> Response<Body> {
    let request = axum::http::Request::from_parts(parts, Body::from(body));
    match service.oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    }
}

fn missing_api_key() -> Response<Body> {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": "missing_api_key",
            "message": "A Plausible API key is required for this request.",
            "howToFix": [
                "Add ?apiKey=<your key> to the MCP endpoint URL",
                "or send the X-Plausible-Api-Key header",
                "or set PLAUSIBLE_API_KEY on the server",
            ],
        })),
    )
        .into_response()
}

fn invalid_api_url(message: &str) -> Response<Body> {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": "invalid_api_url",
            "message": message,
        })),
    )
        .into_response()
}

fn rpc_error(status: StatusCode, code: i64, message: &str) -> Response<Body> {
    (
        status,
        Json(json!({
            "jsonrpc": "2.0",
            "id": Value::Null,
            "error": { "code": code, "message": message },
        })),
    )
        .into_response()
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(detail, "MCP handler panicked");
    rpc_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        -32603,
        "internal server error",
    )
}

const DASHBOARD_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>Plausible MCP analytics</title>
  <script src="https://cdn.jsdelivr.net/npm/chart.js@4"></script>
  <style>
    :root {
      color-scheme: light;
      font-family: 'Inter', -apple-system, BlinkMacSystemFont, 'Segoe UI', sans-serif;
    }
    body { margin: 0; background: #f4f6fb; color: #1f2937; }
    header { padding: 24px 32px; background: #4f46e5; color: #fff; }
    header h1 { margin: 0; font-size: 1.5rem; }
    header small { opacity: 0.8; }
    main { padding: 24px 32px; display: grid; gap: 24px; }
    .stats { display: grid; grid-template-columns: repeat(auto-fit, minmax(180px, 1fr)); gap: 16px; }
    .card { background: #fff; border-radius: 12px; padding: 20px; box-shadow: 0 1px 3px rgba(15, 23, 42, 0.08); }
    .card h2 { margin: 0 0 12px; font-size: 1rem; color: #475569; }
    .value { font-size: 2rem; font-weight: 600; }
    .charts { display: grid; grid-template-columns: repeat(auto-fit, minmax(360px, 1fr)); gap: 24px; }
    table { width: 100%; border-collapse: collapse; font-size: 0.9rem; }
    th, td { text-align: left; padding: 6px 8px; border-bottom: 1px solid #e2e8f0; }
  </style>
</head>
<body>
  <header>
    <h1>Plausible MCP analytics</h1>
    <small>version {{version}}</small>
  </header>
  <main>
    <section class="stats">
      <div class="card"><h2>Total requests</h2><div class="value" id="total-requests">-</div></div>
      <div class="card"><h2>Tool calls</h2><div class="value" id="total-tools">-</div></div>
      <div class="card"><h2>Uptime</h2><div class="value" id="uptime">-</div></div>
      <div class="card"><h2>Clients</h2><div class="value" id="clients">-</div></div>
    </section>
    <section class="charts">
      <div class="card"><h2>Requests per hour (24h)</h2><canvas id="hourly"></canvas></div>
      <div class="card"><h2>Tool usage</h2><canvas id="tools"></canvas></div>
    </section>
    <section class="card">
      <h2>Recent tool calls</h2>
      <table>
        <thead><tr><th>Time</th><th>Tool</th><th>Client</th><th>User agent</th></tr></thead>
        <tbody id="recent"></tbody>
      </table>
    </section>
  </main>
  <script>
    function formatUptime(seconds) {
      const days = Math.floor(seconds / 86400);
      const hours = Math.floor((seconds % 86400) / 3600);
      const minutes = Math.floor((seconds % 3600) / 60);
      return days > 0 ? `${days}d ${hours}h` : `${hours}h ${minutes}m`;
    }

    function cell(text) {
      const td = document.createElement('td');
      td.textContent = text;
      return td;
    }

    async function load() {
      const [summary, tools] = await Promise.all([
        fetch('/analytics').then((r) => r.json()),
        fetch('/analytics/tools').then((r) => r.json()),
      ]);

      document.getElementById('total-requests').textContent = summary.totalRequests;
      document.getElementById('total-tools').textContent = summary.totalToolCalls;
      document.getElementById('uptime').textContent = formatUptime(summary.uptimeSeconds);
      document.getElementById('clients').textContent = summary.topClients.length;

      new Chart(document.getElementById('hourly'), {
        type: 'line',
        data: {
          labels: summary.hourlyRequests.map((h) => h.hour.slice(11) + ':00'),
          datasets: [{ label: 'Requests', data: summary.hourlyRequests.map((h) => h.requests), borderColor: '#4f46e5', tension: 0.3 }],
        },
      });

      new Chart(document.getElementById('tools'), {
        type: 'bar',
        data: {
          labels: tools.tools.map((t) => t.name),
          datasets: [{ label: 'Calls', data: tools.tools.map((t) => t.calls), backgroundColor: '#22c55e' }],
        },
        options: { indexAxis: 'y' },
      });

      const recent = document.getElementById('recent');
      for (const call of tools.recentCalls) {
        const row = document.createElement('tr');
        row.append(
          cell(new Date(call.timestamp).toLocaleString()),
          cell(call.toolName),
          cell(call.clientIp),
          cell(call.userAgent),
        );
        recent.append(row);
      }
    }

    load().catch((err) => console.error('failed to load analytics', err));
  </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn state(default_key: Option<&str>) -> AppState {
        AppState::new(
            Arc::new(AnalyticsRecorder::default()),
            NonZeroUsize::new(4).unwrap(),
            "https://plausible.io",
            default_key,
        )
    }

    #[test]
    fn query_beats_header_beats_default() {
        let state = state(Some("default-key"));
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("header-key"));
        headers.insert(
            API_URL_HEADER,
            HeaderValue::from_static("https://stats.example.com"),
        );

        let query = CredentialQuery {
            api_key: Some("query-key".into()),
            api_url: None,
        };
        let creds = resolve_credentials(&query, &headers, &state);
        assert_eq!(creds.api_key.as_deref(), Some("query-key"));
        assert_eq!(creds.api_url, "https://stats.example.com");

        let creds = resolve_credentials(&CredentialQuery::default(), &headers, &state);
        assert_eq!(creds.api_key.as_deref(), Some("header-key"));

        let creds = resolve_credentials(&CredentialQuery::default(), &HeaderMap::new(), &state);
        assert_eq!(creds.api_key.as_deref(), Some("default-key"));
        assert_eq!(creds.api_url, "https://plausible.io");
    }

    #[test]
    fn blank_values_are_ignored() {
        let state = state(Some("  "));
        let query = CredentialQuery {
            api_key: Some(" ".into()),
            api_url: Some("".into()),
        };
        let creds = resolve_credentials(&query, &HeaderMap::new(), &state);
        assert_eq!(creds.api_key, None);
        assert_eq!(creds.api_url, "https://plausible.io");
    }

    #[test]
    fn discovery_detection_covers_batches() {
        assert!(is_discovery(
            br#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#
        ));
        assert!(is_discovery(
            br#"[{"jsonrpc":"2.0","id":1,"method":"tools/list"},{"jsonrpc":"2.0","method":"notifications/initialized"}]"#
        ));
        assert!(!is_discovery(
            br#"[{"jsonrpc":"2.0","id":1,"method":"tools/list"},{"jsonrpc":"2.0","id":2,"method":"tools/call"}]"#
        ));
        assert!(!is_discovery(br#"{"jsonrpc":"2.0","id":1,"result":{}}"#));
        assert!(!is_discovery(b"[]"));
        assert!(!is_discovery(b"not json"));
        assert!(!is_discovery(b""));
    }

    #[test]
    fn panics_become_json_rpc_internal_errors() {
        let response = panic_response(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
