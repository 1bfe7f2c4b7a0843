use std::sync::Arc;
use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use strata_core::{Context, ContextError, ContextKey, ContextStore, Level, Result};

/// Upper bound on contexts scanned per level.
const SCAN_LIMIT: usize = 100_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Exact,
    #[default]
    Contains,
    Prefix,
    Regex,
    /// Query characters appear in order, not necessarily adjacent.
    Fuzzy,
}

/// Query text prepared once per search.
struct Needle {
    raw: String,
    lower: String,
    regex: Option<Regex>,
}

type MatchFn = fn(&Needle, &str) -> Option<f64>;

impl MatchMode {
    fn matcher(self) -> MatchFn {
        match self {
            Self::Exact => match_exact,
            Self::Contains => match_contains,
            Self::Prefix => match_prefix,
            Self::Regex => match_regex,
            Self::Fuzzy => match_fuzzy,
        }
    }
}

fn match_exact(needle: &Needle, hay: &str) -> Option<f64> {
    (hay == needle.raw).then_some(1.0)
}

fn match_contains(needle: &Needle, hay: &str) -> Option<f64> {
    let hay = hay.to_lowercase();
    if hay == needle.lower {
        Some(1.0)
    } else if hay.contains(&needle.lower) {
        Some(0.5 + 0.4 * needle.lower.len() as f64 / hay.len() as f64)
    } else {
        None
    }
}

fn match_prefix(needle: &Needle, hay: &str) -> Option<f64> {
    let hay = hay.to_lowercase();
    hay.starts_with(&needle.lower)
        .then(|| 0.6 + 0.4 * needle.lower.len() as f64 / hay.len().max(1) as f64)
}

fn match_regex(needle: &Needle, hay: &str) -> Option<f64> {
    let m = needle.regex.as_ref()?.find(hay)?;
    Some(0.5 + 0.5 * m.as_str().len() as f64 / hay.len().max(1) as f64)
}

fn match_fuzzy(needle: &Needle, hay: &str) -> Option<f64> {
    let hay = hay.to_lowercase();
    let mut chars = hay.chars().enumerate();
    let mut first = None;
    let mut last = 0;
    for wanted in needle.lower.chars() {
        let (pos, _) = chars.find(|(_, c)| *c == wanted)?;
        first.get_or_insert(pos);
        last = pos;
    }
    let span = (last + 1 - first.unwrap_or(0)) as f64;
    Some(0.3 + 0.6 * needle.lower.chars().count() as f64 / span.max(1.0))
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub text: String,
    /// Levels to search; empty means all.
    pub levels: Vec<Level>,
    pub mode: MatchMode,
    /// Top-level payload keys to consider; empty means all.
    pub fields: Vec<String>,
    pub limit: Option<usize>,
    pub deadline_ms: Option<u64>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, mode: MatchMode) -> Self {
        Self {
            text: text.into(),
            mode,
            ..Default::default()
        }
    }

    pub fn at(mut self, level: Level) -> Self {
        self.levels.push(level);
        self
    }

    pub fn in_field(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub key: ContextKey,
    pub version: u64,
    pub matched_fields: Vec<String>,
    pub score: f64,
}

pub struct SearchEngine {
    store: Arc<dyn ContextStore>,
    default_limit: usize,
}

impl SearchEngine {
    pub fn new(store: Arc<dyn ContextStore>, default_limit: usize) -> Self {
        Self {
            store,
            default_limit: default_limit.max(1),
        }
    }

    /// Scan stored contexts and rank matches by score, then key.
    pub fn search(&self, query: &SearchQuery, deadline: Option<Instant>) -> Result<Vec<SearchHit>> {
        if query.text.is_empty() {
            return Err(ContextError::validation(None, "search text must not be empty"));
        }
        let regex = match query.mode {
            MatchMode::Regex => Some(
                Regex::new(&query.text)
                    .map_err(|e| ContextError::validation(None, format!("invalid regex: {e}")))?,
            ),
            _ => None,
        };
        let needle = Needle {
            raw: query.text.clone(),
            lower: query.text.to_lowercase(),
            regex,
        };
        let matcher = query.mode.matcher();
        let levels: &[Level] = if query.levels.is_empty() { &Level::ALL } else { &query.levels };

        let mut hits = Vec::new();
        let mut scanned = 0usize;
        for level in levels {
            for ctx in self.store.list(*level, SCAN_LIMIT)? {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    return Err(ContextError::DeadlineExceeded);
                }
                scanned += 1;
                if let Some(hit) = score_context(&ctx, &query.fields, &needle, matcher) {
                    hits.push(hit);
                }
            }
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.key.cmp(&b.key)));
        hits.truncate(query.limit.unwrap_or(self.default_limit));
        debug!(mode = ?query.mode, scanned, hits = hits.len(), "search finished");
        Ok(hits)
    }
}

fn score_context(ctx: &Context, fields: &[String], needle: &Needle, matcher: MatchFn) -> Option<SearchHit> {
    let mut matched_fields = Vec::new();
    let mut best: f64 = 0.0;
    for (field, value) in &ctx.payload {
        if !fields.is_empty() && !fields.iter().any(|f| f == field) {
            continue;
        }
        let mut field_best = matcher(needle, field);
        for text in string_leaves(value) {
            if let Some(score) = matcher(needle, text) {
                field_best = Some(field_best.map_or(score, |s| s.max(score)));
            }
        }
        if let Some(score) = field_best {
            matched_fields.push(field.clone());
            best = best.max(score);
        }
    }
    if matched_fields.is_empty() {
        return None;
    }
    // Small bonus per extra matching field.
    let score = best + 0.01 * (matched_fields.len() - 1) as f64;
    Some(SearchHit {
        key: ctx.key.clone(),
        version: ctx.version,
        matched_fields,
        score,
    })
}

/// String values directly in `value` or in an array of strings.
fn string_leaves(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}
