use serde::{Deserialize, Serialize};
use std::fmt;

/// Id of the single GLOBAL context.
pub const GLOBAL_CONTEXT_ID: &str = "global";

/// Context hierarchy level, in strict ancestor order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Global,
    Project,
    Branch,
    Task,
}

impl Level {
    pub const ALL: [Level; 4] = [Level::Global, Level::Project, Level::Branch, Level::Task];

    /// The level immediately above, if any.
    pub fn parent(self) -> Option<Level> {
        match self {
            Self::Global => None,
            Self::Project => Some(Self::Global),
            Self::Branch => Some(Self::Project),
            Self::Task => Some(Self::Branch),
        }
    }

    /// The level immediately below, if any.
    pub fn child(self) -> Option<Level> {
        match self {
            Self::Global => Some(Self::Project),
            Self::Project => Some(Self::Branch),
            Self::Branch => Some(Self::Task),
            Self::Task => None,
        }
    }

    /// Position in the chain, GLOBAL = 0.
    pub fn depth(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Project => "project",
            Self::Branch => "branch",
            Self::Task => "task",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Level {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "project" => Ok(Self::Project),
            "branch" => Ok(Self::Branch),
            "task" => Ok(Self::Task),
            other => Err(format!("unknown context level: {other}")),
        }
    }
}

/// Identity of a context: `(level, id)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextKey {
    pub level: Level,
    pub id: String,
}

impl ContextKey {
    pub fn new(level: Level, id: impl Into<String>) -> Self {
        Self {
            level,
            id: id.into(),
        }
    }

    pub fn global() -> Self {
        Self::new(Level::Global, GLOBAL_CONTEXT_ID)
    }

    pub fn project(id: impl Into<String>) -> Self {
        Self::new(Level::Project, id)
    }

    pub fn branch(id: impl Into<String>) -> Self {
        Self::new(Level::Branch, id)
    }

    pub fn task(id: impl Into<String>) -> Self {
        Self::new(Level::Task, id)
    }

    pub fn is_global(&self) -> bool {
        self.level == Level::Global
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.level, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(Level::Global < Level::Project);
        assert!(Level::Project < Level::Branch);
        assert!(Level::Branch < Level::Task);
    }

    #[test]
    fn parent_and_child_are_inverse() {
        for level in Level::ALL {
            if let Some(child) = level.child() {
                assert_eq!(child.parent(), Some(level));
            }
        }
        assert_eq!(Level::Global.parent(), None);
        assert_eq!(Level::Task.child(), None);
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("TASK".parse::<Level>().unwrap(), Level::Task);
        assert_eq!("Branch".parse::<Level>().unwrap(), Level::Branch);
        assert!("tenant".parse::<Level>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        assert_eq!(serde_json::to_string(&Level::Project).unwrap(), "\"project\"");
    }

    #[test]
    fn key_display() {
        assert_eq!(ContextKey::task("t1").to_string(), "task:t1");
        assert_eq!(ContextKey::global().to_string(), "global:global");
    }
}
