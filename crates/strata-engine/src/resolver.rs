//! Inheritance resolution: composes a context's effective payload from the
//! GLOBAL → PROJECT → BRANCH → TASK chain above it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use strata_core::{Context, ContextError, ContextKey, Level, Payload, Result};

/// How a child payload is layered over its ancestors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// A child key replaces the parent's value wholesale.
    #[default]
    ShallowOverride,
    /// Nested objects are merged recursively; other values are replaced.
    DeepMerge,
}

type MergeFn = fn(&mut Payload, &Payload);

impl MergeStrategy {
    fn merge_fn(self) -> MergeFn {
        match self {
            Self::ShallowOverride => shallow_override,
            Self::DeepMerge => deep_merge,
        }
    }
}

fn shallow_override(base: &mut Payload, overlay: &Payload) {
    for (k, v) in overlay {
        base.insert(k.clone(), v.clone());
    }
}

fn deep_merge(base: &mut Payload, overlay: &Payload) {
    for (k, v) in overlay {
        match (base.get_mut(k), v) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => deep_merge(existing, incoming),
            _ => {
                base.insert(k.clone(), v.clone());
            }
        }
    }
}

/// One context that contributed to a view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub key: ContextKey,
    pub version: u64,
}

/// The effective payload of a context, with provenance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergedView {
    pub key: ContextKey,
    /// Version of the target context itself.
    pub version: u64,
    pub payload: Payload,
    /// Contributing contexts, GLOBAL first.
    pub chain: Vec<ChainLink>,
    /// Level each top-level key was taken from.
    pub origins: BTreeMap<String, Level>,
    pub inherited: bool,
}

impl MergedView {
    /// View of a single context with nothing inherited.
    pub fn own(ctx: &Context) -> Self {
        Self {
            key: ctx.key.clone(),
            version: ctx.version,
            payload: ctx.payload.clone(),
            chain: vec![ChainLink {
                key: ctx.key.clone(),
                version: ctx.version,
            }],
            origins: ctx.payload.keys().map(|k| (k.clone(), ctx.key.level)).collect(),
            inherited: false,
        }
    }
}

/// Stateless chain walker. Storage access is supplied per call, so the same
/// resolver serves cached and uncached reads.
#[derive(Clone, Copy, Debug, Default)]
pub struct Resolver {
    strategy: MergeStrategy,
}

impl Resolver {
    pub fn new(strategy: MergeStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> MergeStrategy {
        self.strategy
    }

    /// Ancestor chain of `key`, GLOBAL first and `key` last. `fetch` returns
    /// `None` for an absent context. A missing target is `NotFound`; a
    /// missing ancestor is `MissingAncestor`.
    pub fn chain<F>(&self, key: &ContextKey, mut fetch: F) -> Result<Vec<Context>>
    where
        F: FnMut(&ContextKey) -> Result<Option<Context>>,
    {
        let target = fetch(key)?.ok_or_else(|| ContextError::NotFound { key: key.clone() })?;
        let mut chain = vec![target];

        loop {
            let Some(current) = chain.last() else { break };
            let Some(parent_level) = current.key.level.parent() else { break };
            let parent_id = current.parent_id.clone();
            let Some(parent_key) = current.parent_key() else {
                return Err(ContextError::MissingAncestor {
                    level: parent_level,
                    id: parent_id,
                });
            };
            match fetch(&parent_key)? {
                Some(parent) => chain.push(parent),
                None => {
                    return Err(ContextError::MissingAncestor {
                        level: parent_level,
                        id: Some(parent_key.id),
                    })
                }
            }
        }

        chain.reverse();
        Ok(chain)
    }

    /// Merge an ancestor chain (GLOBAL first) into one view. Operates on copies.
    pub fn merge(&self, chain: &[Context]) -> Result<MergedView> {
        let Some(target) = chain.last() else {
            return Err(ContextError::validation(None, "cannot merge an empty chain"));
        };
        let merge = self.strategy.merge_fn();
        let mut payload = Payload::new();
        let mut origins = BTreeMap::new();
        for ctx in chain {
            merge(&mut payload, &ctx.payload);
            for k in ctx.payload.keys() {
                origins.insert(k.clone(), ctx.key.level);
            }
        }
        Ok(MergedView {
            key: target.key.clone(),
            version: target.version,
            payload,
            chain: chain
                .iter()
                .map(|c| ChainLink {
                    key: c.key.clone(),
                    version: c.version,
                })
                .collect(),
            origins,
            inherited: true,
        })
    }

    pub fn resolve<F>(&self, key: &ContextKey, fetch: F) -> Result<MergedView>
    where
        F: FnMut(&ContextKey) -> Result<Option<Context>>,
    {
        let chain = self.chain(key, fetch)?;
        self.merge(&chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;

    fn ctx(key: ContextKey, parent: Option<&str>, payload: Value) -> Context {
        let now = Utc::now();
        Context {
            key,
            parent_id: parent.map(String::from),
            payload: payload.as_object().cloned().unwrap(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn tree() -> HashMap<ContextKey, Context> {
        [
            ctx(ContextKey::global(), None, json!({"org": "Acme", "style": {"indent": 4, "tabs": false}})),
            ctx(ContextKey::project("p1"), Some("global"), json!({"name": "Proj1", "lang": "rust"})),
            ctx(ContextKey::branch("b1"), Some("p1"), json!({"name": "main", "style": {"indent": 2}})),
            ctx(ContextKey::task("t1"), Some("b1"), json!({"title": "Fix"})),
        ]
        .into_iter()
        .map(|c| (c.key.clone(), c))
        .collect()
    }

    fn from(tree: &HashMap<ContextKey, Context>) -> impl FnMut(&ContextKey) -> Result<Option<Context>> + '_ {
        move |k: &ContextKey| Ok(tree.get(k).cloned())
    }

    #[test]
    fn child_keys_override_parents() {
        let tree = tree();
        let view = Resolver::default().resolve(&ContextKey::task("t1"), from(&tree)).unwrap();
        assert_eq!(view.payload["org"], "Acme");
        assert_eq!(view.payload["name"], "main");
        assert_eq!(view.payload["lang"], "rust");
        assert_eq!(view.payload["title"], "Fix");
        assert_eq!(view.origins["name"], Level::Branch);
        assert_eq!(view.origins["org"], Level::Global);
        let levels: Vec<Level> = view.chain.iter().map(|l| l.key.level).collect();
        assert_eq!(levels, Level::ALL.to_vec());
    }

    #[test]
    fn shallow_override_replaces_nested_objects() {
        let tree = tree();
        let view = Resolver::default().resolve(&ContextKey::branch("b1"), from(&tree)).unwrap();
        assert_eq!(view.payload["style"], json!({"indent": 2}));
    }

    #[test]
    fn deep_merge_combines_nested_objects() {
        let tree = tree();
        let view = Resolver::new(MergeStrategy::DeepMerge)
            .resolve(&ContextKey::branch("b1"), from(&tree))
            .unwrap();
        assert_eq!(view.payload["style"], json!({"indent": 2, "tabs": false}));
    }

    #[test]
    fn resolution_stops_at_requested_level() {
        let tree = tree();
        let view = Resolver::default().resolve(&ContextKey::project("p1"), from(&tree)).unwrap();
        assert_eq!(view.chain.len(), 2);
        assert!(view.payload.get("title").is_none());
        assert_eq!(view.payload["name"], "Proj1");
    }

    #[test]
    fn missing_target_is_not_found() {
        let tree = tree();
        let err = Resolver::default().resolve(&ContextKey::task("t9"), from(&tree)).unwrap_err();
        assert!(matches!(err, ContextError::NotFound { .. }));
    }

    #[test]
    fn missing_ancestor_names_level() {
        let mut tree = tree();
        tree.remove(&ContextKey::project("p1"));
        let err = Resolver::default().resolve(&ContextKey::task("t1"), from(&tree)).unwrap_err();
        assert!(matches!(
            err,
            ContextError::MissingAncestor { level: Level::Project, id: Some(ref id) } if id == "p1"
        ));
    }

    #[test]
    fn resolve_is_idempotent_and_leaves_inputs_untouched() {
        let tree = tree();
        let before = tree.clone();
        let resolver = Resolver::default();
        let a = resolver.resolve(&ContextKey::task("t1"), from(&tree)).unwrap();
        let b = resolver.resolve(&ContextKey::task("t1"), from(&tree)).unwrap();
        assert_eq!(a, b);
        assert_eq!(tree, before);
    }

    #[test]
    fn own_view_has_no_inheritance() {
        let tree = tree();
        let view = MergedView::own(&tree[&ContextKey::task("t1")]);
        assert!(!view.inherited);
        assert_eq!(view.chain.len(), 1);
        assert!(view.payload.get("org").is_none());
    }
}
