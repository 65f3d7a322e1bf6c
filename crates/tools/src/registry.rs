//! The tool registry — schemas for every tool callable by the LLM.

use serde_json::json;

use hub_domain::tool::ToolDefinition;

fn tool(name: &str, description: &str, input_schema: serde_json::Value) -> ToolDefinition {
    ToolDefinition {
        name: name.into(),
        description: description.into(),
        input_schema,
    }
}

/// Every tool the hub knows how to dispatch. The executor decides at
/// call time whether a tool runs locally, goes to the browser, or is
/// rejected because the needed side-channel is not wired.
pub fn builtin_tools() -> Vec<ToolDefinition> {
    vec![
        tool(
            "capabilities",
            "Describe which tools and side-channels are available to this agent.",
            json!({ "type": "object", "properties": {} }),
        ),
        tool(
            "bash",
            "Run a shell command inside the agent sandbox.",
            json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" },
                    "cwd": { "type": "string" },
                    "timeout_secs": { "type": "integer" }
                },
                "required": ["command"]
            }),
        ),
        tool(
            "files",
            "Read, write, list and inspect files in the agent workspace.",
            json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["read_file", "write_file", "delete_file", "mkdir",
                                 "list_dir", "list_files", "frontmatter"]
                    },
                    "path": { "type": "string" },
                    "content": { "type": "string" },
                    "glob": { "type": "string" }
                },
                "required": ["action"]
            }),
        ),
        tool(
            "state",
            "Get or set keys in the agent state store, and manage escalation rules.",
            json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": ["get", "get_all", "set", "delete",
                                 "set_escalation", "clear_escalation"]
                    },
                    "key": { "type": "string" },
                    "value": {},
                    "condition": { "type": "string" },
                    "message": { "type": "string" }
                },
                "required": ["action"]
            }),
        ),
        tool(
            "storage",
            "Persistent key/value storage for the agent.",
            json!({
                "type": "object",
                "properties": {
                    "action": { "type": "string", "enum": ["get", "get_all", "set", "delete"] },
                    "key": { "type": "string" },
                    "value": {}
                },
                "required": ["action"]
            }),
        ),
        tool(
            "schedule",
            "Create, list, enable, disable or remove cron and event schedules.",
            json!({
                "type": "object",
                "properties": {
                    "action": { "type": "string",
                                "enum": ["add", "list", "remove", "enable", "disable"] },
                    "id": { "type": "string" },
                    "schedule_type": { "type": "string", "enum": ["cron", "event"] },
                    "cron_expression": { "type": "string" },
                    "event_name": { "type": "string" },
                    "event_condition": { "type": "string" },
                    "message": { "type": "string" },
                    "tool": { "type": "string" },
                    "tool_input": { "type": "object" },
                    "max_runs": { "type": "integer" }
                },
                "required": ["action"]
            }),
        ),
        tool(
            "context_search",
            "Search earlier conversation turns for a substring.",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer" }
                },
                "required": ["query"]
            }),
        ),
        tool(
            "list_skills",
            "List the skills available to this agent.",
            json!({ "type": "object", "properties": {} }),
        ),
        tool(
            "get_skill",
            "Fetch a skill definition without loading it.",
            json!({
                "type": "object",
                "properties": { "name": { "type": "string" } },
                "required": ["name"]
            }),
        ),
        tool(
            "load_skill",
            "Load a skill's body into the conversation.",
            json!({
                "type": "object",
                "properties": { "name": { "type": "string" } },
                "required": ["name"]
            }),
        ),
        tool(
            "create_skill",
            "Create a new skill (requires approval from a connected client).",
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "description": { "type": "string" },
                    "capabilities": { "type": "array", "items": { "type": "string" } },
                    "body": { "type": "string" }
                },
                "required": ["name", "body"]
            }),
        ),
        tool(
            "remove_skill",
            "Remove a skill by name.",
            json!({
                "type": "object",
                "properties": { "name": { "type": "string" } },
                "required": ["name"]
            }),
        ),
        tool(
            "dom",
            "Query or mutate the page DOM in the connected browser.",
            json!({ "type": "object", "additionalProperties": true }),
        ),
        tool(
            "runjs",
            "Run JavaScript in the browser iframe context.",
            json!({
                "type": "object",
                "properties": { "code": { "type": "string" } },
                "required": ["code"]
            }),
        ),
        tool(
            "view_state",
            "Render the agent state view in the browser.",
            json!({ "type": "object", "additionalProperties": true }),
        ),
        tool(
            "audit_log",
            "Append an entry to the browser-side audit log.",
            json!({ "type": "object", "additionalProperties": true }),
        ),
        tool(
            "agent_respond",
            "Deliver a response to the browser-side agent surface.",
            json!({ "type": "object", "additionalProperties": true }),
        ),
        tool(
            "worker_message",
            "Post a message to a browser-side worker.",
            json!({ "type": "object", "additionalProperties": true }),
        ),
    ]
}

/// Subset of the registry matching the agent's configured tool names.
/// An empty list means every tool.
pub fn tools_for(names: &[String]) -> Vec<ToolDefinition> {
    let all = builtin_tools();
    if names.is_empty() {
        return all;
    }
    all.into_iter()
        .filter(|t| names.iter().any(|n| n == &t.name || (n == "filesystem" && t.name == "files")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_names_are_unique() {
        let tools = builtin_tools();
        let mut names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        let len = names.len();
        names.dedup();
        assert_eq!(names.len(), len);
    }

    #[test]
    fn tools_for_filters_and_aliases() {
        let subset = tools_for(&["bash".into(), "filesystem".into()]);
        let names: Vec<&str> = subset.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["bash", "files"]);
        assert!(!tools_for(&[]).is_empty());
    }
}
