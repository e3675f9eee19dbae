//! Maps one step onto the entities, action and context an engine sees.
//!
//! | content        | action                | resource                     |
//! |----------------|-----------------------|------------------------------|
//! | prompt         | `Prompt`              | `Message` `{trajectory}#{seq}` |
//! | tool request   | sanitised tool name   | `Trajectory`                 |
//! | tool response  | sanitised tool name   | `Trajectory`                 |
//!
//! Context always carries `stage`, `role` and `step_count`. Tool requests add
//! `parameters` / `parameters_json`; tool responses add `response` /
//! `response_json`. A fact that does not apply is left out of the map
//! rather than set to null, so `exists` / `absent` conditions see it.

use serde_json::{json, Map, Value};
use tollgate_state::{Agent, Content, Role, Stage, TrajectoryHeader};

use crate::policy::schema::{ACTION_PROMPT, ENTITY_AGENT, ENTITY_MESSAGE, ENTITY_TRAJECTORY};
use crate::policy::{sanitize_action_name, Entity, EvaluationRequest, PolicyBundle};

/// Build the request for the step that would get sequence number `seq`.
pub fn evaluation_request(
    agent: &Agent,
    header: &TrajectoryHeader,
    seq: u64,
    stage: Stage,
    role: Role,
    content: &Content,
    policy: &PolicyBundle,
) -> EvaluationRequest {
    let principal = Entity::new(ENTITY_AGENT, agent.id.as_str())
        .with_fact("name", json!(agent.name))
        .with_fact("provider_id", json!(agent.provider_id));

    let mut context = Map::new();
    context.insert("stage".to_string(), json!(stage.as_str()));
    context.insert("role".to_string(), json!(role.as_str()));
    context.insert("step_count".to_string(), json!(header.step_count));

    let (action, resource) = match content {
        Content::Prompt { text } => (
            ACTION_PROMPT.to_string(),
            Entity::new(ENTITY_MESSAGE, format!("{}#{}", header.id, seq))
                .with_fact("content", json!(text))
                .with_fact("role", json!(role.as_str())),
        ),
        Content::ToolRequest { tool_id, args } => {
            context.insert("parameters".to_string(), args.clone());
            context.insert("parameters_json".to_string(), Value::String(args.to_string()));
            (sanitize_action_name(tool_id), trajectory_entity(header))
        }
        Content::ToolResponse { tool_id, response } => {
            context.insert("response".to_string(), response.clone());
            context.insert(
                "response_json".to_string(),
                Value::String(response.to_string()),
            );
            (sanitize_action_name(tool_id), trajectory_entity(header))
        }
    };

    EvaluationRequest {
        principal,
        action,
        resource,
        context,
        policy: policy.clone(),
    }
}

fn trajectory_entity(header: &TrajectoryHeader) -> Entity {
    Entity::new(ENTITY_TRAJECTORY, header.id.as_str())
        .with_fact("agent_id", json!(header.agent_id))
        .with_fact("step_count", json!(header.step_count))
}
