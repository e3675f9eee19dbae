//! Declared entity types and actions that rules and requests are checked against.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use tollgate_state::Agent;

use super::PolicyIssue;

pub const ENTITY_AGENT: &str = "Agent";
pub const ENTITY_TRAJECTORY: &str = "Trajectory";
pub const ENTITY_MESSAGE: &str = "Message";
pub const ENTITY_TOOL: &str = "Tool";

/// Action evaluated for prompt content.
pub const ACTION_PROMPT: &str = "Prompt";

/// One declared action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDecl {
    /// Resource types the action applies to. Empty means any declared type.
    #[serde(default)]
    pub resource_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Schema document.
///
/// ```json
/// {
///   "namespace": "Banking",
///   "entity_types": ["Agent", "Trajectory", "Message"],
///   "actions": { "Transfer": { "resource_types": ["Trajectory"] } }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySchema {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub entity_types: Vec<String>,
    #[serde(default)]
    pub actions: BTreeMap<String, ActionDecl>,
}

/// Action name for a tool: spaces and dashes become underscores.
pub fn sanitize_action_name(name: &str) -> String {
    name.trim().replace([' ', '-'], "_")
}

impl PolicySchema {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entity_types: Vec::new(),
            actions: BTreeMap::new(),
        }
    }

    /// Schema covering everything an agent can do: one action per tool
    /// against `Trajectory`, plus `Prompt` against `Message`.
    pub fn for_agent(agent: &Agent) -> Self {
        let mut schema = Self::new(sanitize_action_name(&agent.name));
        schema.entity_types = [ENTITY_AGENT, ENTITY_TRAJECTORY, ENTITY_MESSAGE, ENTITY_TOOL]
            .iter()
            .map(|s| s.to_string())
            .collect();
        schema.actions.insert(
            ACTION_PROMPT.to_string(),
            ActionDecl {
                resource_types: vec![ENTITY_MESSAGE.to_string()],
                description: Some("Prompt or message content".to_string()),
            },
        );
        for tool in &agent.tools {
            let description = if tool.description.is_empty() {
                None
            } else {
                Some(tool.description.clone())
            };
            schema.actions.insert(
                sanitize_action_name(&tool.name),
                ActionDecl {
                    resource_types: vec![ENTITY_TRAJECTORY.to_string()],
                    description,
                },
            );
        }
        schema
    }

    /// Parse a schema document. Any failure is reported as a single issue.
    pub fn parse(text: &str) -> Result<Self, PolicyIssue> {
        let schema: Self = serde_json::from_str(text)
            .map_err(|e| PolicyIssue::schema(None, format!("invalid schema document: {e}")))?;
        for (name, decl) in &schema.actions {
            for rt in &decl.resource_types {
                if !schema.declares_entity(rt) {
                    return Err(PolicyIssue::schema(
                        None,
                        format!("action {name} references undeclared entity type {rt}"),
                    ));
                }
            }
        }
        Ok(schema)
    }

    pub fn to_json_pretty(&self) -> String {
        // Plain strings and maps always serialize.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn declares_entity(&self, entity_type: &str) -> bool {
        self.entity_types.iter().any(|e| e == entity_type)
    }

    pub fn declares_action(&self, action: &str) -> bool {
        self.actions.contains_key(action)
    }

    /// Check that `action` on `resource_type` is declared.
    pub fn check(&self, action: &str, resource_type: &str) -> Result<(), String> {
        let decl = self
            .actions
            .get(action)
            .ok_or_else(|| format!("action {action} is not declared in the schema"))?;
        if !self.declares_entity(resource_type) {
            return Err(format!(
                "entity type {resource_type} is not declared in the schema"
            ));
        }
        if !decl.resource_types.is_empty() && !decl.resource_types.iter().any(|r| r == resource_type)
        {
            return Err(format!(
                "action {action} does not apply to resource type {resource_type}"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_state::Tool;

    fn agent() -> Agent {
        Agent::new("a-1", "prov", "Bank Bot")
            .with_tool(Tool::new("Bash", "shell"))
            .with_tool(Tool::new("wire transfer", ""))
            .with_tool(Tool::new("get-balance", "read balance"))
    }

    #[test]
    fn sanitizes_tool_names() {
        assert_eq!(sanitize_action_name("wire transfer"), "wire_transfer");
        assert_eq!(sanitize_action_name("get-balance"), "get_balance");
        assert_eq!(sanitize_action_name("Bash"), "Bash");
    }

    #[test]
    fn schema_for_agent_declares_tools_and_prompt() {
        let schema = PolicySchema::for_agent(&agent());
        assert_eq!(schema.namespace, "Bank_Bot");
        assert!(schema.declares_action("Prompt"));
        assert!(schema.declares_action("wire_transfer"));
        assert!(schema.declares_action("get_balance"));
        assert!(schema.check("Bash", "Trajectory").is_ok());
        assert!(schema.check("Prompt", "Message").is_ok());
        assert!(schema.check("Prompt", "Trajectory").is_err());
        assert!(schema.check("Curl", "Trajectory").is_err());
    }

    #[test]
    fn generated_schema_parses_back() {
        let schema = PolicySchema::for_agent(&agent());
        let parsed = PolicySchema::parse(&schema.to_json_pretty()).unwrap();
        assert_eq!(parsed, schema);
    }

    #[test]
    fn parse_rejects_undeclared_resource_type() {
        let text = r#"{"entity_types": ["Agent"], "actions": {"Run": {"resource_types": ["Box"]}}}"#;
        let issue = PolicySchema::parse(text).unwrap_err();
        assert!(issue.message.contains("Box"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(PolicySchema::parse("not json").is_err());
    }
}
