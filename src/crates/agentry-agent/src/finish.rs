//! The distinguished finish tool and the tool-usage guard.

use agentry_graph::{Message, ToolDefinition};
use serde_json::{json, Value};

/// Name of the distinguished tool that signals turn completion
pub const FINISH_TOOL: &str = "finish";

/// Definition of the finish tool surfaced to the model
pub fn finish_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: FINISH_TOOL.to_string(),
        description: "Signal that the current turn is complete. Set needsMoreInfo \
                      when the user must provide additional input before work can \
                      continue."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "needsMoreInfo": {
                    "type": "boolean",
                    "description": "True when the turn ends with a question back to the user"
                }
            },
            "additionalProperties": false
        }),
    }
}

/// Whether the finish arguments ask the user for more input
pub fn needs_more_info(args: &Value) -> bool {
    args.get("needsMoreInfo").and_then(Value::as_bool).unwrap_or(false)
}

/// Restriction message injected when the model terminates without calling
/// any tool
pub fn guard_message() -> Message {
    Message::system(
        "Do not end the turn with plain text. Use the available tools to act, \
         and call the 'finish' tool when the turn is complete.",
    )
}

/// The synthetic marker appended to a thread when its run is stopped
pub fn stop_marker(agent_name: &str) -> String {
    format!("Graph execution was stopped for agent {}", agent_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_definition_declares_needs_more_info() {
        let def = finish_tool_definition();
        assert_eq!(def.name, "finish");
        assert!(def.parameters["properties"]["needsMoreInfo"].is_object());
    }

    #[test]
    fn needs_more_info_defaults_false() {
        assert!(!needs_more_info(&json!({})));
        assert!(!needs_more_info(&json!({"needsMoreInfo": false})));
        assert!(needs_more_info(&json!({"needsMoreInfo": true})));
    }

    #[test]
    fn stop_marker_names_the_agent() {
        assert_eq!(
            stop_marker("Test Agent"),
            "Graph execution was stopped for agent Test Agent"
        );
    }
}
