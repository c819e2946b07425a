//! MCP protocol server exposing the Plausible REST APIs as tools.

use std::{error::Error, sync::Arc};

use axum::http::request::Parts;
use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, tool::ToolCallContext},
    model::{
        CallToolRequestMethod, CallToolRequestParams, CallToolResult, Content, Implementation,
        ListToolsResult, PaginatedRequestParams, ServerCapabilities, ServerInfo,
    },
    service::RequestContext,
    tool, tool_router,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    PlausibleClient, PlausibleError, SERVER_ID,
    analytics::{AnalyticsRecorder, RequestMeta},
};

mod events;
mod sites;
mod stats;

const INSTRUCTIONS: &str = "Plausible Analytics tools. Query stats with plausible_query (Stats API v2) \
or the v1 helpers (aggregate, timeseries, breakdown, realtime visitors), record events and \
pageviews, and manage sites, goals and shared links. Tool parameters are forwarded to the \
Plausible API unchanged.";

/// One protocol server bound to one Plausible base URL and API key.
#[derive(Clone)]
pub struct PlausibleServer {
    client: PlausibleClient,
    recorder: Option<Arc<AnalyticsRecorder>>,
    tool_router: ToolRouter<Self>,
}

impl PlausibleServer {
    pub fn new(client: PlausibleClient, recorder: Option<Arc<AnalyticsRecorder>>) -> Self {
        Self {
            client,
            recorder,
            tool_router: Self::tool_router(),
        }
    }

    fn tool_router() -> ToolRouter<Self> {
        Self::stats_router() + Self::events_router() + Self::sites_router() + Self::health_router()
    }

    pub fn client(&self) -> &PlausibleClient {
        &self.client
    }

    /// Names of every registered tool, sorted. Needs no client.
    pub fn tool_names() -> Vec<String> {
        let mut names: Vec<String> = Self::tool_router()
            .list_all()
            .into_iter()
            .map(|tool| tool.name.into_owned())
            .collect();
        names.sort();
        names
    }
}

#[tool_router(router = health_router, vis = "pub(crate)")]
impl PlausibleServer {
    #[tool(
        description = "Check that the configured Plausible instance is reachable and healthy",
        annotations(read_only_hint = true)
    )]
    async fn plausible_health_check(&self) -> Result<CallToolResult, McpError> {
        Ok(tool_result(self.client.health().await))
    }
}

impl ServerHandler for PlausibleServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: SERVER_ID.into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Implementation::from_build_env()
            },
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some(INSTRUCTIONS.into()),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.tool_router.list_all(),
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        if !self.tool_router.has_route(request.name.as_ref()) {
            return Err(McpError::method_not_found::<CallToolRequestMethod>());
        }

        if let Some(recorder) = self.recorder.as_ref() {
            let meta = request_meta(&context);
            recorder.record_tool_call(request.name.as_ref(), &meta);
        }
        debug!(tool = %request.name, "tool call");

        self.tool_router
            .call(ToolCallContext::new(self, request, context))
            .await
    }
}

/// Metadata the HTTP layer attached to the inbound request. Requests that
/// did not arrive over HTTP get the `unknown` placeholders.
pub fn request_meta(context: &RequestContext<RoleServer>) -> RequestMeta {
    context
        .extensions
        .get::<Parts>()
        .and_then(|parts| parts.extensions.get::<RequestMeta>())
        .cloned()
        .unwrap_or_default()
}

/// Upstream failures become tool-level errors so the model can read them.
pub fn tool_result(result: Result<Value, PlausibleError>) -> CallToolResult {
    match result {
        Ok(value) => {
            let text = match value {
                Value::String(text) => text,
                other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
            };
            CallToolResult::success(vec![Content::text(text)])
        }
        Err(err) => CallToolResult::error(vec![Content::text(err.to_string())]),
    }
}

/// Serves one client over stdin/stdout until it disconnects.
pub async fn serve_stdio(server: PlausibleServer) -> Result<(), Box<dyn Error>> {
    info!(base = %server.client.base_url(), "serving MCP over stdio");
    let running = server.serve(rmcp::transport::stdio()).await?;
    let reason = running.waiting().await?;
    info!(?reason, "stdio session ended");
    Ok(())
}

/// Pushes `key=value` when the optional value is present.
pub(crate) fn push_param<T: ToString>(
    params: &mut Vec<(&'static str, String)>,
    key: &'static str,
    value: Option<T>,
) {
    if let Some(value) = value {
        params.push((key, value.to_string()));
    }
}
