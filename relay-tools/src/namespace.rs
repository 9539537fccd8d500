//! Tool name namespacing: `server__resource` (spec §6).

/// Splits a namespaced tool name into its `(server, resource)` parts.
///
/// Tool names the LLM proxy hands back in `tool_calls` are namespaced by
/// the MCP-style server that owns them, joined with a double underscore
/// (e.g. `crm__lookup_order`). A name with no `__` separator has no known
/// server and is rejected by the executor before a dispatch is attempted.
pub fn split(tool_name: &str) -> Option<(&str, &str)> {
    tool_name.split_once("__").filter(|(server, resource)| !server.is_empty() && !resource.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_server_and_resource() {
        assert_eq!(split("crm__lookup_order"), Some(("crm", "lookup_order")));
    }

    #[test]
    fn rejects_unnamespaced() {
        assert_eq!(split("lookup_order"), None);
    }

    #[test]
    fn keeps_only_first_separator() {
        assert_eq!(split("crm__lookup__order"), Some(("crm", "lookup__order")));
    }

    #[test]
    fn rejects_empty_parts() {
        assert_eq!(split("__resource"), None);
        assert_eq!(split("server__"), None);
    }
}
