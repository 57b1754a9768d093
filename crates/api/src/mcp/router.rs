//! Tool-name and resource-URI prefixing between the aggregated namespace a
//! caller sees and the per-MCP namespace each upstream actually owns.
//!
//! Grounded on the teacher's `McpRouter` usage inside
//! `mcp::handlers::McpProxyHandler` (`prefix_tools`, `parse_tool_name`,
//! `parse_resource_uri`).

use super::types::{Prompt, Resource, Tool};

const RESOURCE_URI_SCHEME: &str = "plexmcp://";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpMethod {
    Initialize,
    Notification,
    ToolsList,
    ToolsCall,
    ResourcesList,
    ResourcesRead,
    PromptsList,
    PromptsGet,
    Unknown,
}

pub struct ParsedToolName {
    pub mcp_name: String,
    pub tool_name: String,
}

pub struct ParsedResourceUri {
    pub mcp_name: String,
    pub original_uri: String,
}

#[derive(Debug, Default)]
pub struct McpRouter;

impl McpRouter {
    pub fn new() -> Self {
        Self
    }

    pub fn get_method_type(method: &str) -> McpMethod {
        match method {
            "initialize" => McpMethod::Initialize,
            m if m.starts_with("notifications/") => McpMethod::Notification,
            "tools/list" => McpMethod::ToolsList,
            "tools/call" => McpMethod::ToolsCall,
            "resources/list" => McpMethod::ResourcesList,
            "resources/read" => McpMethod::ResourcesRead,
            "prompts/list" => McpMethod::PromptsList,
            "prompts/get" => McpMethod::PromptsGet,
            _ => McpMethod::Unknown,
        }
    }

    /// Splits `mcp_name:tool_name` into its parts. The MCP name itself may
    /// not contain a colon; the tool name may (tools are free to name
    /// themselves however their own server likes).
    pub fn parse_tool_name(&self, prefixed: &str) -> Option<ParsedToolName> {
        let (mcp_name, tool_name) = prefixed.split_once(':')?;
        if mcp_name.is_empty() || tool_name.is_empty() {
            return None;
        }
        Some(ParsedToolName {
            mcp_name: mcp_name.to_string(),
            tool_name: tool_name.to_string(),
        })
    }

    /// Splits `plexmcp://mcp_name/rest-of-uri` into the MCP name and the
    /// URI the upstream server expects to see.
    pub fn parse_resource_uri(&self, uri: &str) -> Option<ParsedResourceUri> {
        let rest = uri.strip_prefix(RESOURCE_URI_SCHEME)?;
        let (mcp_name, path) = rest.split_once('/')?;
        if mcp_name.is_empty() {
            return None;
        }
        Some(ParsedResourceUri {
            mcp_name: mcp_name.to_string(),
            original_uri: path.to_string(),
        })
    }

    pub fn prefix_tools(&self, mcp_name: &str, tools: Vec<Tool>) -> Vec<Tool> {
        tools
            .into_iter()
            .map(|mut t| {
                t.name = format!("{mcp_name}:{}", t.name);
                t
            })
            .collect()
    }

    pub fn prefix_resources(&self, mcp_name: &str, resources: Vec<Resource>) -> Vec<Resource> {
        resources
            .into_iter()
            .map(|mut r| {
                r.uri = format!("{RESOURCE_URI_SCHEME}{mcp_name}/{}", r.uri);
                r
            })
            .collect()
    }

    pub fn prefix_prompts(&self, mcp_name: &str, prompts: Vec<Prompt>) -> Vec<Prompt> {
        prompts
            .into_iter()
            .map(|mut p| {
                p.name = format!("{mcp_name}:{}", p.name);
                p
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_tool_name() {
        let router = McpRouter::new();
        let parsed = router.parse_tool_name("github:create_issue").unwrap();
        assert_eq!(parsed.mcp_name, "github");
        assert_eq!(parsed.tool_name, "create_issue");
    }

    #[test]
    fn tool_name_without_colon_is_rejected() {
        let router = McpRouter::new();
        assert!(router.parse_tool_name("create_issue").is_none());
    }

    #[test]
    fn parses_resource_uri_with_nested_path() {
        let router = McpRouter::new();
        let parsed = router
            .parse_resource_uri("plexmcp://github/repos/octo/issues/1")
            .unwrap();
        assert_eq!(parsed.mcp_name, "github");
        assert_eq!(parsed.original_uri, "repos/octo/issues/1");
    }

    #[test]
    fn resource_uri_missing_scheme_is_rejected() {
        let router = McpRouter::new();
        assert!(router.parse_resource_uri("github/repos/octo").is_none());
    }

    #[test]
    fn method_type_recognizes_all_known_methods() {
        assert_eq!(McpRouter::get_method_type("initialize"), McpMethod::Initialize);
        assert_eq!(McpRouter::get_method_type("tools/call"), McpMethod::ToolsCall);
        assert_eq!(
            McpRouter::get_method_type("notifications/cancelled"),
            McpMethod::Notification
        );
        assert_eq!(McpRouter::get_method_type("bogus"), McpMethod::Unknown);
    }
}
