use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::Principal;
use crate::level::{ContextKey, Level, GLOBAL_CONTEXT_ID};
use crate::version::ChangeType;

/// Opaque structured payload of a context.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// A stored context at one level of the hierarchy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub key: ContextKey,
    /// Id of the parent at the level immediately above. `None` only for GLOBAL.
    pub parent_id: Option<String>,
    pub payload: Payload,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Context {
    pub fn parent_key(&self) -> Option<ContextKey> {
        let level = self.key.level.parent()?;
        let id = self.parent_id.clone()?;
        Some(ContextKey::new(level, id))
    }
}

/// Ancestor ids of a context, GLOBAL implied.
///
/// Carried on change events so scope filtering never needs a store lookup,
/// and used as creation hints when ancestors are auto-created.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl Lineage {
    /// Id recorded for `level`. GLOBAL always resolves to the singleton id.
    pub fn id_at(&self, level: Level) -> Option<&str> {
        match level {
            Level::Global => Some(GLOBAL_CONTEXT_ID),
            Level::Project => self.project_id.as_deref(),
            Level::Branch => self.branch_id.as_deref(),
            Level::Task => self.task_id.as_deref(),
        }
    }

    pub fn set(&mut self, level: Level, id: impl Into<String>) {
        let id = Some(id.into());
        match level {
            Level::Global => {}
            Level::Project => self.project_id = id,
            Level::Branch => self.branch_id = id,
            Level::Task => self.task_id = id,
        }
    }

    /// Whether the context `(level, id)` is this lineage's context or one of its ancestors.
    pub fn contains(&self, level: Level, id: &str) -> bool {
        self.id_at(level) == Some(id)
    }

    /// The deepest key this lineage identifies.
    pub fn leaf_key(&self) -> ContextKey {
        for level in Level::ALL.iter().rev() {
            if let Some(id) = self.id_at(*level) {
                return ContextKey::new(*level, id);
            }
        }
        ContextKey::global()
    }

    /// Longest shared ancestor prefix of two lineages.
    pub fn common_prefix(&self, other: &Lineage) -> Lineage {
        let mut out = Lineage::default();
        for level in [Level::Project, Level::Branch, Level::Task] {
            match (self.id_at(level), other.id_at(level)) {
                (Some(a), Some(b)) if a == b => out.set(level, a),
                _ => break,
            }
        }
        out
    }
}

/// A conditional write against the context store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub key: ContextKey,
    pub payload: Payload,
    /// Version the caller last observed. `0` means the key must not exist yet.
    pub expected_version: u64,
    /// Ancestor ids. The immediate parent is required on create; ids further
    /// up are only consulted when a missing parent is auto-created.
    #[serde(default)]
    pub lineage: Lineage,
    #[serde(default)]
    pub auto_create_ancestors: bool,
    pub author: Principal,
    #[serde(default)]
    pub summary: Option<String>,
    pub change_type: ChangeType,
}

impl PutRequest {
    pub fn create(key: ContextKey, payload: Payload, author: Principal) -> Self {
        Self {
            key,
            payload,
            expected_version: 0,
            lineage: Lineage::default(),
            auto_create_ancestors: false,
            author,
            summary: None,
            change_type: ChangeType::Create,
        }
    }

    pub fn update(key: ContextKey, payload: Payload, expected_version: u64, author: Principal) -> Self {
        Self {
            key,
            payload,
            expected_version,
            lineage: Lineage::default(),
            auto_create_ancestors: false,
            author,
            summary: None,
            change_type: ChangeType::Update,
        }
    }

    /// Set the immediate parent id for a create.
    pub fn under(mut self, parent_id: impl Into<String>) -> Self {
        if let Some(parent) = self.key.level.parent() {
            self.lineage.set(parent, parent_id);
        }
        self
    }

    pub fn with_lineage(mut self, lineage: Lineage) -> Self {
        self.lineage = lineage;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn auto_create(mut self, enabled: bool) -> Self {
        self.auto_create_ancestors = enabled;
        self
    }

    /// Parent id this write would attach to on create.
    pub fn parent_id(&self) -> Option<&str> {
        self.key.level.parent().and_then(|p| self.lineage.id_at(p))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub key: ContextKey,
    #[serde(default)]
    pub cascade: bool,
    pub author: Principal,
}

impl DeleteRequest {
    pub fn new(key: ContextKey, author: Principal) -> Self {
        Self {
            key,
            cascade: false,
            author,
        }
    }

    pub fn cascade(mut self, cascade: bool) -> Self {
        self.cascade = cascade;
        self
    }
}

/// One committed effect of a write: the context as it now stands (or stood,
/// for deletes), where it sits in the hierarchy, and what happened to it.
#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    pub context: Context,
    pub lineage: Lineage,
    pub change_type: ChangeType,
    pub author: Principal,
}
