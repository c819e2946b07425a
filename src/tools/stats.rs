use rmcp::{
    ErrorData as McpError, handler::server::wrapper::Parameters, model::CallToolResult, tool,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{PlausibleServer, push_param, tool_result};
use crate::StatsEndpoint;

/// Stats API v2 query body. Unknown upstream options travel in the optional
/// JSON fields untouched.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QueryRequest {
    /// Domain of the site as registered in Plausible
    pub site_id: String,
    /// Metrics to compute, e.g. ["visitors", "pageviews", "bounce_rate"]
    pub metrics: Vec<String>,
    /// "day", "7d", "30d", "month", "6mo", "12mo", "year", "all" or ["2024-01-01", "2024-01-31"]
    pub date_range: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SiteRequest {
    /// Domain of the site as registered in Plausible
    pub site_id: String,
}

/// Shared v1 query-string parameters.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct StatsRequest {
    /// Domain of the site as registered in Plausible
    pub site_id: String,
    /// "12mo", "6mo", "month", "30d", "7d", "day" or "custom"
    #[serde(default)]
    pub period: Option<String>,
    /// Date or "YYYY-MM-DD,YYYY-MM-DD" range when period is "custom"
    #[serde(default)]
    pub date: Option<String>,
    /// Comma separated metrics, e.g. "visitors,pageviews"
    #[serde(default)]
    pub metrics: Option<String>,
    /// Filter expression, e.g. "event:page==/blog**"
    #[serde(default)]
    pub filters: Option<String>,
}

impl StatsRequest {
    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("site_id", self.site_id.clone())];
        push_param(&mut params, "period", self.period.as_deref());
        push_param(&mut params, "date", self.date.as_deref());
        push_param(&mut params, "metrics", self.metrics.as_deref());
        push_param(&mut params, "filters", self.filters.as_deref());
        params
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AggregateRequest {
    #[serde(flatten)]
    pub stats: StatsRequest,
    /// Set to "previous_period" to include a comparison
    #[serde(default)]
    pub compare: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct TimeseriesRequest {
    #[serde(flatten)]
    pub stats: StatsRequest,
    /// "date" or "month"
    #[serde(default)]
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct BreakdownRequest {
    #[serde(flatten)]
    pub stats: StatsRequest,
    /// Property to break down by, e.g. "visit:source" or "event:page"
    pub property: String,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub page: Option<u32>,
}

#[tool_router(router = stats_router, vis = "pub(crate)")]
impl PlausibleServer {
    #[tool(
        description = "Run a Plausible Stats API v2 query with metrics, date range, dimensions and filters",
        annotations(read_only_hint = true)
    )]
    async fn plausible_query(
        &self,
        Parameters(request): Parameters<QueryRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(self.client.query(&request).await))
    }

    #[tool(
        description = "Number of visitors currently on the site (last 5 minutes)",
        annotations(read_only_hint = true)
    )]
    async fn plausible_realtime_visitors(
        &self,
        Parameters(request): Parameters<SiteRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(
            self.client.realtime_visitors(&request.site_id).await,
        ))
    }

    #[tool(
        description = "Aggregate metrics over a period (Stats API v1)",
        annotations(read_only_hint = true)
    )]
    async fn plausible_aggregate(
        &self,
        Parameters(request): Parameters<AggregateRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut params = request.stats.params();
        push_param(&mut params, "compare", request.compare);
        Ok(tool_result(
            self.client.stats(StatsEndpoint::Aggregate, &params).await,
        ))
    }

    #[tool(
        description = "Metrics over time, one point per day or month (Stats API v1)",
        annotations(read_only_hint = true)
    )]
    async fn plausible_timeseries(
        &self,
        Parameters(request): Parameters<TimeseriesRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut params = request.stats.params();
        push_param(&mut params, "interval", request.interval);
        Ok(tool_result(
            self.client.stats(StatsEndpoint::Timeseries, &params).await,
        ))
    }

    #[tool(
        description = "Metrics broken down by a property such as source, page or country (Stats API v1)",
        annotations(read_only_hint = true)
    )]
    async fn plausible_breakdown(
        &self,
        Parameters(request): Parameters<BreakdownRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut params = request.stats.params();
        params.push(("property", request.property));
        push_param(&mut params, "limit", request.limit);
        push_param(&mut params, "page", request.page);
        Ok(tool_result(
            self.client.stats(StatsEndpoint::Breakdown, &params).await,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_body_omits_unset_fields() {
        let request: QueryRequest = serde_json::from_value(json!({
            "site_id": "example.com",
            "metrics": ["visitors"],
            "date_range": "7d",
            "dimensions": ["visit:source"]
        }))
        .unwrap();

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["date_range"], "7d");
        assert_eq!(body["dimensions"][0], "visit:source");
        assert!(body.get("filters").is_none());
        assert!(body.get("pagination").is_none());
    }

    #[test]
    fn breakdown_params_keep_order_and_skip_missing() {
        let request: BreakdownRequest = serde_json::from_value(json!({
            "site_id": "example.com",
            "period": "30d",
            "property": "visit:source",
            "limit": 10
        }))
        .unwrap();

        let mut params = request.stats.params();
        params.push(("property", request.property.clone()));
        push_param(&mut params, "limit", request.limit);
        assert_eq!(
            params,
            vec![
                ("site_id", "example.com".to_owned()),
                ("period", "30d".to_owned()),
                ("property", "visit:source".to_owned()),
                ("limit", "10".to_owned()),
            ]
        );
    }
}
