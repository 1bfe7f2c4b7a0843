//! Scope-filtered fan-out of change events.
//!
//! Each subscription owns a bounded broadcast channel. A slow subscriber
//! loses its oldest events (its receiver reports `Lagged`); publishing never
//! waits on anyone.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use strata_core::{ChangeEvent, ChangeEventType, ContextError, Level, Result, SubscriptionId};

/// How much of the hierarchy a subscription watches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionScope {
    Global,
    User,
    Project,
    Branch,
    Task,
}

impl SubscriptionScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::User => "user",
            Self::Project => "project",
            Self::Branch => "branch",
            Self::Task => "task",
        }
    }

    /// Whether an event falls inside this scope rooted at `scope_id`.
    pub fn encloses(self, scope_id: &str, event: &ChangeEvent) -> bool {
        match self {
            Self::Global => true,
            Self::User => event.user_id.as_deref() == Some(scope_id),
            Self::Project => event.lineage.contains(Level::Project, scope_id),
            Self::Branch => event.lineage.contains(Level::Branch, scope_id),
            Self::Task => event.lineage.contains(Level::Task, scope_id),
        }
    }
}

impl fmt::Display for SubscriptionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionScope {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "user" => Ok(Self::User),
            "project" => Ok(Self::Project),
            "branch" => Ok(Self::Branch),
            "task" => Ok(Self::Task),
            other => Err(ContextError::Subscription(format!("unknown scope: {other}"))),
        }
    }
}

/// Optional narrowing applied after the scope check. Empty fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventFilter {
    pub event_types: HashSet<ChangeEventType>,
    pub levels: HashSet<Level>,
    pub actor: Option<String>,
}

impl EventFilter {
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && (self.levels.is_empty() || self.levels.contains(&event.key.level))
            && self.actor.as_deref().map_or(true, |a| a == event.actor.as_str())
    }
}

/// Handle returned by [`NotificationPublisher::subscribe`]. Dropping the
/// receiver ends the subscription on the next matching publish.
pub struct Subscription {
    pub id: SubscriptionId,
    pub scope: SubscriptionScope,
    pub scope_id: String,
    pub receiver: broadcast::Receiver<ChangeEvent>,
}

struct Slot {
    scope: SubscriptionScope,
    scope_id: String,
    filter: EventFilter,
    tx: broadcast::Sender<ChangeEvent>,
    created_at: DateTime<Utc>,
}

/// Summary of one live subscription.
#[derive(Clone, Debug, Serialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub scope: SubscriptionScope,
    pub scope_id: String,
    pub created_at: DateTime<Utc>,
}

pub struct NotificationPublisher {
    slots: DashMap<SubscriptionId, Slot>,
    buffer: usize,
}

impl NotificationPublisher {
    pub fn new(buffer: usize) -> Self {
        Self {
            slots: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Register a subscription. Non-global scopes need a non-empty `scope_id`;
    /// GLOBAL ignores it.
    pub fn subscribe(&self, scope: SubscriptionScope, scope_id: &str, filter: EventFilter) -> Result<Subscription> {
        let scope_id = match scope {
            SubscriptionScope::Global => String::new(),
            _ if scope_id.trim().is_empty() => {
                return Err(ContextError::Subscription(format!("{scope} scope requires a scope id")));
            }
            _ => scope_id.to_string(),
        };

        let id = SubscriptionId::new();
        let (tx, receiver) = broadcast::channel(self.buffer);
        self.slots.insert(
            id.clone(),
            Slot {
                scope,
                scope_id: scope_id.clone(),
                filter,
                tx,
                created_at: Utc::now(),
            },
        );
        debug!(subscription = %id, scope = %scope, scope_id, "subscribed");
        Ok(Subscription {
            id,
            scope,
            scope_id,
            receiver,
        })
    }

    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let removed = self.slots.remove(id).is_some();
        if removed {
            debug!(subscription = %id, "unsubscribed");
        }
        removed
    }

    /// Deliver `event` to every enclosing subscription. Returns how many
    /// subscriptions received it. Subscriptions whose receiver is gone are dropped.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for slot in self.slots.iter() {
            if !slot.scope.encloses(&slot.scope_id, event) || !slot.filter.matches(event) {
                continue;
            }
            match slot.tx.send(event.clone()) {
                Ok(_) => delivered += 1,
                Err(_) => closed.push(slot.key().clone()),
            }
        }
        for id in closed {
            self.slots.remove(&id);
            debug!(subscription = %id, "receiver closed, subscription removed");
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots.len()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.slots
            .iter()
            .map(|slot| SubscriptionInfo {
                id: slot.key().clone(),
                scope: slot.scope,
                scope_id: slot.scope_id.clone(),
                created_at: slot.created_at,
            })
            .collect()
    }

    /// Drop every subscription; receivers observe `Closed`.
    pub fn shutdown(&self) {
        let count = self.slots.len();
        self.slots.clear();
        info!(count, "notification publisher shut down");
    }
}
