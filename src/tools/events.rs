use rmcp::{
    ErrorData as McpError, RoleServer, handler::server::wrapper::Parameters,
    model::CallToolResult, service::RequestContext, tool, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{PlausibleServer, request_meta, tool_result};
use crate::analytics::{RequestMeta, UNKNOWN};

const PAGEVIEW: &str = "pageview";
const FALLBACK_USER_AGENT: &str = concat!("plausible-mcp/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RecordEventRequest {
    /// Domain of the site as registered in Plausible
    pub domain: String,
    /// Event name, e.g. "Signup" or "pageview"
    pub name: String,
    /// Full URL the event happened on
    pub url: String,
    #[serde(default)]
    pub referrer: Option<String>,
    /// Custom properties attached to the event
    #[serde(default)]
    pub props: Option<Map<String, Value>>,
    /// Revenue, e.g. {"currency": "USD", "amount": 12.5}
    #[serde(default)]
    pub revenue: Option<Value>,
    /// Set to false for events that should not affect bounce rate
    #[serde(default)]
    pub interactive: Option<bool>,
    /// Visitor user agent; defaults to the calling client's
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Visitor IP; defaults to the calling client's
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RecordPageviewRequest {
    /// Domain of the site as registered in Plausible
    pub domain: String,
    /// Full URL of the page
    pub url: String,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub props: Option<Map<String, Value>>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
}

/// Body of `POST /api/event`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventBody {
    pub domain: String,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub props: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revenue: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interactive: Option<bool>,
}

impl From<RecordPageviewRequest> for RecordEventRequest {
    fn from(pageview: RecordPageviewRequest) -> Self {
        Self {
            domain: pageview.domain,
            name: PAGEVIEW.to_owned(),
            url: pageview.url,
            referrer: pageview.referrer,
            props: pageview.props,
            revenue: None,
            interactive: None,
            user_agent: pageview.user_agent,
            ip: pageview.ip,
        }
    }
}

/// Splits a request into the upstream body and the visitor identity headers.
fn event_parts(
    request: RecordEventRequest,
    meta: &RequestMeta,
) -> (EventBody, String, Option<String>) {
    let user_agent = request
        .user_agent
        .filter(|ua| !ua.trim().is_empty())
        .or_else(|| known(&meta.user_agent))
        .unwrap_or_else(|| FALLBACK_USER_AGENT.to_owned());
    let ip = request
        .ip
        .filter(|ip| !ip.trim().is_empty())
        .or_else(|| known(&meta.client_ip));

    let body = EventBody {
        domain: request.domain,
        name: request.name,
        url: request.url,
        referrer: request.referrer,
        props: request.props,
        revenue: request.revenue,
        interactive: request.interactive,
    };
    (body, user_agent, ip)
}

fn known(value: &str) -> Option<String> {
    (value != UNKNOWN).then(|| value.to_owned())
}

#[tool_router(router = events_router, vis = "pub(crate)")]
impl PlausibleServer {
    #[tool(description = "Record a custom event through the Plausible Events API")]
    async fn plausible_record_event(
        &self,
        Parameters(request): Parameters<RecordEventRequest>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let (body, user_agent, ip) = event_parts(request, &request_meta(&context));
        Ok(tool_result(
            self.client
                .record_event(&body, &user_agent, ip.as_deref())
                .await,
        ))
    }

    #[tool(description = "Record a pageview through the Plausible Events API")]
    async fn plausible_record_pageview(
        &self,
        Parameters(request): Parameters<RecordPageviewRequest>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let (body, user_agent, ip) = event_parts(request.into(), &request_meta(&context));
        Ok(tool_result(
            self.client
                .record_event(&body, &user_agent, ip.as_deref())
                .await,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pageview() -> RecordPageviewRequest {
        RecordPageviewRequest {
            domain: "example.com".into(),
            url: "https://example.com/pricing".into(),
            referrer: None,
            props: None,
            user_agent: None,
            ip: None,
        }
    }

    #[test]
    fn pageview_uses_reserved_event_name() {
        let (body, _, _) = event_parts(pageview().into(), &RequestMeta::default());
        assert_eq!(body.name, "pageview");
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("referrer").is_none());
        assert!(json.get("revenue").is_none());
    }

    #[test]
    fn visitor_identity_falls_back_to_caller_then_default() {
        let caller = RequestMeta {
            method: "POST".into(),
            client_ip: "203.0.113.10".into(),
            user_agent: "Mozilla/5.0".into(),
        };
        let (_, ua, ip) = event_parts(pageview().into(), &caller);
        assert_eq!(ua, "Mozilla/5.0");
        assert_eq!(ip.as_deref(), Some("203.0.113.10"));

        let (_, ua, ip) = event_parts(pageview().into(), &RequestMeta::default());
        assert_eq!(ua, FALLBACK_USER_AGENT);
        assert_eq!(ip, None);

        let explicit = RecordPageviewRequest {
            user_agent: Some("curl/8.0".into()),
            ip: Some("198.51.100.1".into()),
            ..pageview()
        };
        let (_, ua, ip) = event_parts(explicit.into(), &caller);
        assert_eq!(ua, "curl/8.0");
        assert_eq!(ip.as_deref(), Some("198.51.100.1"));
    }
}
