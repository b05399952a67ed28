// Message envelope exchanged between agents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    StatusUpdate,
    ErrorReport,
    ResourceRequest,
    ResourceRelease,
    ResourceConflict,
    Terminate,
    Sync,
    ContextShare,
    Broadcast,
    Heartbeat,
    Custom,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskRequest => "task_request",
            MessageType::TaskResponse => "task_response",
            MessageType::StatusUpdate => "status_update",
            MessageType::ErrorReport => "error_report",
            MessageType::ResourceRequest => "resource_request",
            MessageType::ResourceRelease => "resource_release",
            MessageType::ResourceConflict => "resource_conflict",
            MessageType::Terminate => "terminate",
            MessageType::Sync => "sync",
            MessageType::ContextShare => "context_share",
            MessageType::Broadcast => "broadcast",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Custom => "custom",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Acknowledged,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub id: String,
    pub message_type: MessageType,
    pub priority: MessagePriority,
    pub sender_id: String,
    /// Empty means broadcast
    pub receiver_id: String,
    pub payload: String,
    /// Id of the request this message answers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub expects_response: bool,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl AgentMessage {
    pub fn new(
        message_type: MessageType,
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type,
            priority: MessagePriority::Normal,
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            payload: String::new(),
            correlation_id: None,
            expects_response: false,
            status: DeliveryStatus::Pending,
            created_at: Utc::now(),
            delivered_at: None,
            acknowledged_at: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Build the reply to `request`: endpoints swapped, correlated to its id
    pub fn create_response(request: &AgentMessage, payload: impl Into<String>) -> Self {
        let message_type = match request.message_type {
            MessageType::TaskRequest => MessageType::TaskResponse,
            other => other,
        };

        let mut response = Self::new(
            message_type,
            request.receiver_id.clone(),
            request.sender_id.clone(),
        )
        .with_payload(payload)
        .with_priority(request.priority);
        response.correlation_id = Some(request.id.clone());
        response
    }

    pub fn status_update(sender_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self::new(MessageType::StatusUpdate, sender_id, "").with_payload(status)
    }

    pub fn error_report(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::new(MessageType::ErrorReport, sender_id, receiver_id)
            .with_payload(error)
            .with_priority(MessagePriority::High)
    }

    pub fn terminate(sender_id: impl Into<String>, receiver_id: impl Into<String>) -> Self {
        Self::new(MessageType::Terminate, sender_id, receiver_id)
            .with_priority(MessagePriority::Urgent)
    }

    pub fn heartbeat(sender_id: impl Into<String>) -> Self {
        Self::new(MessageType::Heartbeat, sender_id, "").with_priority(MessagePriority::Low)
    }

    pub fn is_broadcast(&self) -> bool {
        self.receiver_id.is_empty()
    }

    pub(crate) fn mark_delivered(&mut self) {
        self.status = DeliveryStatus::Delivered;
        self.delivered_at = Some(Utc::now());
    }

    /// Mark as handled. The sender is not notified.
    pub fn acknowledge(&mut self) {
        self.status = DeliveryStatus::Acknowledged;
        self.acknowledged_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self) {
        self.status = DeliveryStatus::Failed;
    }
}
