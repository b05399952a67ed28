// Event names, shared-state key namespace and payload structures
// Agents publish their progress into SharedState under "<agent-name>.<field>";
// the coordinator sends the payloads below over the MessageBus.

use serde::{Deserialize, Serialize};

// Per-agent shared-state fields
pub const KEY_STATUS: &str = "status";
pub const KEY_TASK: &str = "task";
pub const KEY_RESULT: &str = "result";
pub const KEY_ERROR: &str = "error";
pub const KEY_PROGRESS: &str = "progress";

// Values written under KEY_STATUS
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

// Event name constants
pub const EVENT_RESOURCE_CONFLICT: &str = "resource:conflict";
pub const EVENT_RESOURCE_GRANTED: &str = "resource:granted";
pub const EVENT_RESOURCE_REVOKED: &str = "resource:revoked";
pub const EVENT_TASK_ASSIGNED: &str = "task:assigned";

/// Shared-state key for one field of an agent, e.g. `builder.status`
pub fn agent_key(agent_name: &str, field: &str) -> String {
    format!("{}.{}", agent_name, field)
}

/// Prefix matching every key an agent publishes
pub fn agent_prefix(agent_name: &str) -> String {
    format!("{}.", agent_name)
}

/// Namespace holding the coordinator's view of resource ownership
pub const RESOURCE_KEY_PREFIX: &str = "coordinator.resource.";

/// Shared-state key naming the current owner of a resource
pub fn resource_key(resource_id: &str) -> String {
    format!("{}{}", RESOURCE_KEY_PREFIX, resource_id)
}

/// Envelope written into a message payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    pub event: String,
    pub data: T,
}

/// Serialize an event into a message payload string
pub fn to_payload<T: Serialize>(event: &str, data: T) -> String {
    let envelope = EventEnvelope {
        event: event.to_string(),
        data,
    };
    serde_json::to_string(&envelope).unwrap_or_else(|e| {
        log::warn!("Failed to serialize {} payload: {}", event, e);
        String::new()
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConflictPayload {
    pub conflict_id: String,
    pub resource_id: String,
    pub holder_id: String,
    pub requester_id: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOwnershipPayload {
    pub resource_id: String,
    pub agent_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignedPayload {
    pub task_id: u64,
    pub agent_id: String,
    pub description: String,
}
