use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::Payload;
use crate::level::ContextKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    Rollback,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Rollback => write!(f, "rollback"),
        }
    }
}

impl std::str::FromStr for ChangeType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "rollback" => Ok(Self::Rollback),
            other => Err(format!("unknown change type: {other}")),
        }
    }
}

/// One entry of a context's append-only history.
///
/// `payload` is the full snapshot after the change (for deletes, the last
/// payload before removal); deltas between records come from [`ContextDiff`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub key: ContextKey,
    pub sequence: u64,
    /// Context version produced by this change.
    pub version: u64,
    pub change_type: ChangeType,
    pub payload: Payload,
    pub summary: Option<String>,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub is_milestone: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueChange {
    pub from: serde_json::Value,
    pub to: serde_json::Value,
}

/// Structural difference between two payload snapshots, by top-level key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextDiff {
    pub from_sequence: u64,
    pub to_sequence: u64,
    pub added: BTreeMap<String, serde_json::Value>,
    pub removed: BTreeMap<String, serde_json::Value>,
    pub changed: BTreeMap<String, ValueChange>,
}

impl ContextDiff {
    pub fn between(from_sequence: u64, from: &Payload, to_sequence: u64, to: &Payload) -> Self {
        let mut diff = Self {
            from_sequence,
            to_sequence,
            ..Default::default()
        };
        for (k, old) in from {
            match to.get(k) {
                None => {
                    diff.removed.insert(k.clone(), old.clone());
                }
                Some(new) if new != old => {
                    diff.changed.insert(
                        k.clone(),
                        ValueChange {
                            from: old.clone(),
                            to: new.clone(),
                        },
                    );
                }
                Some(_) => {}
            }
        }
        for (k, new) in to {
            if !from.contains_key(k) {
                diff.added.insert(k.clone(), new.clone());
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(v: serde_json::Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn diff_classifies_keys() {
        let from = payload(json!({"a": 1, "b": 2, "c": {"x": 1}}));
        let to = payload(json!({"a": 1, "b": 3, "d": true}));
        let diff = ContextDiff::between(1, &from, 2, &to);
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added["d"], json!(true));
        assert_eq!(diff.removed["c"], json!({"x": 1}));
        assert_eq!(diff.changed["b"].from, json!(2));
        assert_eq!(diff.changed["b"].to, json!(3));
        assert!(!diff.changed.contains_key("a"));
    }

    #[test]
    fn identical_snapshots_have_empty_diff() {
        let p = payload(json!({"a": [1, 2]}));
        assert!(ContextDiff::between(1, &p, 2, &p).is_empty());
    }

    #[test]
    fn change_type_roundtrips_through_str() {
        for ct in [ChangeType::Create, ChangeType::Update, ChangeType::Delete, ChangeType::Rollback] {
            assert_eq!(ct.to_string().parse::<ChangeType>().unwrap(), ct);
        }
        assert!("purge".parse::<ChangeType>().is_err());
    }
}
