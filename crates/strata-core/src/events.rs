use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::{Change, Lineage};
use crate::ids::{EventId, Principal};
use crate::level::ContextKey;
use crate::version::ChangeType;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEventType {
    Created,
    Updated,
    Deleted,
    RolledBack,
    BatchUpdated,
}

impl ChangeEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::RolledBack => "rolled_back",
            Self::BatchUpdated => "batch_updated",
        }
    }
}

impl From<ChangeType> for ChangeEventType {
    fn from(ct: ChangeType) -> Self {
        match ct {
            ChangeType::Create => Self::Created,
            ChangeType::Update => Self::Updated,
            ChangeType::Delete => Self::Deleted,
            ChangeType::Rollback => Self::RolledBack,
        }
    }
}

impl std::fmt::Display for ChangeEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification fanned out to subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: ChangeEventType,
    pub key: ContextKey,
    pub lineage: Lineage,
    pub actor: Principal,
    /// User this event belongs to, for USER-scoped subscriptions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        event_type: ChangeEventType,
        key: ContextKey,
        lineage: Lineage,
        actor: Principal,
        data: serde_json::Value,
    ) -> Self {
        let user_id = Some(actor.as_str().to_string());
        Self {
            id: EventId::new(),
            event_type,
            key,
            lineage,
            actor,
            user_id,
            version: None,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Event for one committed write.
    pub fn from_change(change: &Change) -> Self {
        let data = match change.change_type {
            ChangeType::Delete => serde_json::json!({}),
            _ => serde_json::Value::Object(change.context.payload.clone()),
        };
        let mut event = Self::new(
            change.change_type.into(),
            change.context.key.clone(),
            change.lineage.clone(),
            change.author.clone(),
            data,
        );
        event.version = Some(change.context.version);
        event
    }
}
