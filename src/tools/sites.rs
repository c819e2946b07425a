use reqwest::Method;
use rmcp::{
    ErrorData as McpError, handler::server::wrapper::Parameters, model::CallToolResult, tool,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{PlausibleServer, push_param, tool_result};

const SITES_PATH: &str = "/api/v1/sites";
const GOALS_PATH: &str = "/api/v1/sites/goals";
const SHARED_LINKS_PATH: &str = "/api/v1/sites/shared-links";

fn site_path(site_id: &str) -> String {
    format!("{SITES_PATH}/{}", urlencoding::encode(site_id))
}

fn goal_path(goal_id: &str) -> String {
    format!("{GOALS_PATH}/{}", urlencoding::encode(goal_id))
}

/// Cursor pagination shared by the list endpoints.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct PageRequest {
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl PageRequest {
    fn push_into(self, params: &mut Vec<(&'static str, String)>) {
        push_param(params, "after", self.after);
        push_param(params, "before", self.before);
        push_param(params, "limit", self.limit);
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SiteIdRequest {
    /// Domain of the site as registered in Plausible
    pub site_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CreateSiteRequest {
    pub domain: String,
    /// IANA timezone, e.g. "Europe/Tallinn"; Plausible defaults to UTC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct UpdateSiteRequest {
    /// Current domain of the site
    pub site_id: String,
    /// New domain
    pub domain: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListGoalsRequest {
    pub site_id: String,
    #[serde(flatten)]
    pub page: PageRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CreateGoalRequest {
    pub site_id: String,
    /// "event" or "page"
    pub goal_type: String,
    /// Required when goal_type is "event"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    /// Required when goal_type is "page", e.g. "/signup"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DeleteGoalRequest {
    pub site_id: String,
    pub goal_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SharedLinkRequest {
    pub site_id: String,
    /// Name of the link; an existing link with this name is returned as is
    pub name: String,
}

#[tool_router(router = sites_router, vis = "pub(crate)")]
impl PlausibleServer {
    #[tool(
        description = "List sites the API key can access",
        annotations(read_only_hint = true)
    )]
    async fn plausible_list_sites(
        &self,
        Parameters(page): Parameters<PageRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut params = Vec::new();
        page.push_into(&mut params);
        Ok(tool_result(
            self.client
                .sites_query(Method::GET, SITES_PATH, &params)
                .await,
        ))
    }

    #[tool(
        description = "Get a site's details, including timezone and custom properties",
        annotations(read_only_hint = true)
    )]
    async fn plausible_get_site(
        &self,
        Parameters(request): Parameters<SiteIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(
            self.client
                .sites_query(Method::GET, &site_path(&request.site_id), &[])
                .await,
        ))
    }

    #[tool(description = "Create a new site")]
    async fn plausible_create_site(
        &self,
        Parameters(request): Parameters<CreateSiteRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(
            self.client
                .sites_send(Method::POST, SITES_PATH, &request)
                .await,
        ))
    }

    #[tool(description = "Change the domain of an existing site")]
    async fn plausible_update_site(
        &self,
        Parameters(request): Parameters<UpdateSiteRequest>,
    ) -> Result<CallToolResult, McpError> {
        let body = json!({ "domain": request.domain });
        Ok(tool_result(
            self.client
                .sites_send(Method::PUT, &site_path(&request.site_id), &body)
                .await,
        ))
    }

    #[tool(
        description = "Delete a site and all of its data. This cannot be undone",
        annotations(destructive_hint = true)
    )]
    async fn plausible_delete_site(
        &self,
        Parameters(request): Parameters<SiteIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(
            self.client
                .sites_query(Method::DELETE, &site_path(&request.site_id), &[])
                .await,
        ))
    }

    #[tool(
        description = "List the goals configured for a site",
        annotations(read_only_hint = true)
    )]
    async fn plausible_list_goals(
        &self,
        Parameters(request): Parameters<ListGoalsRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut params = vec![("site_id", request.site_id)];
        request.page.push_into(&mut params);
        Ok(tool_result(
            self.client
                .sites_query(Method::GET, GOALS_PATH, &params)
                .await,
        ))
    }

    #[tool(description = "Create a goal, or return the existing one with the same definition")]
    async fn plausible_create_goal(
        &self,
        Parameters(request): Parameters<CreateGoalRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(
            self.client
                .sites_send(Method::PUT, GOALS_PATH, &request)
                .await,
        ))
    }

    #[tool(
        description = "Delete a goal from a site",
        annotations(destructive_hint = true)
    )]
    async fn plausible_delete_goal(
        &self,
        Parameters(request): Parameters<DeleteGoalRequest>,
    ) -> Result<CallToolResult, McpError> {
        let body = json!({ "site_id": request.site_id });
        Ok(tool_result(
            self.client
                .sites_send(Method::DELETE, &goal_path(&request.goal_id), &body)
                .await,
        ))
    }

    #[tool(description = "Create a shared dashboard link, or return the existing one with the same name")]
    async fn plausible_create_shared_link(
        &self,
        Parameters(request): Parameters<SharedLinkRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(tool_result(
            self.client
                .sites_send(Method::PUT, SHARED_LINKS_PATH, &request)
                .await,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_ids_are_path_encoded() {
        assert_eq!(site_path("example.com"), "/api/v1/sites/example.com");
        assert_eq!(
            site_path("example.com/blog"),
            "/api/v1/sites/example.com%2Fblog"
        );
        assert_eq!(goal_path("42"), "/api/v1/sites/goals/42");
    }

    #[test]
    fn goal_body_omits_unused_kind() {
        let request = CreateGoalRequest {
            site_id: "example.com".into(),
            goal_type: "event".into(),
            event_name: Some("Signup".into()),
            page_path: None,
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["event_name"], "Signup");
        assert!(body.get("page_path").is_none());
    }

    #[test]
    fn pagination_is_appended_after_required_params() {
        let mut params = vec![("site_id", "example.com".to_owned())];
        PageRequest {
            after: None,
            before: Some("cursor".into()),
            limit: Some(25),
        }
        .push_into(&mut params);
        assert_eq!(
            params,
            vec![
                ("site_id", "example.com".to_owned()),
                ("before", "cursor".to_owned()),
                ("limit", "25".to_owned()),
            ]
        );
    }
}
