use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type NodeId = String;

pub const DEFAULT_RELATION_TYPE: &str = "prerequisite";
pub const COMPOUND_ID_SEPARATOR: char = '/';

/// Proficiency bucket edges shared by the classifier, the statistics
/// histogram, and path displays.
pub const LEARNING_THRESHOLD: f64 = 0.3;
pub const MASTERY_THRESHOLD: f64 = 0.7;

/// A concept in the learner's graph. The id is the canonical,
/// case-sensitive name; aliases compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeNode {
    pub id: NodeId,
    pub description: String,
    pub difficulty: i64,
    pub proficiency: f64,
    pub aliases: Vec<String>,
    pub metadata: Map<String, Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl KnowledgeNode {
    pub fn new(id: impl Into<NodeId>) -> Self {
        let now = current_unix_timestamp_millis();
        Self {
            id: id.into(),
            description: String::new(),
            difficulty: 1,
            proficiency: 0.0,
            aliases: Vec::new(),
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Case-insensitive match against the node's own id, then its aliases.
    pub fn matches_alias(&self, text: &str) -> bool {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return false;
        }
        if self.id.to_lowercase() == needle {
            return true;
        }
        self.aliases
            .iter()
            .any(|alias| alias.to_lowercase() == needle)
    }
}

/// Directed prerequisite relation: source must be learned before target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEdge {
    pub source: NodeId,
    pub target: NodeId,
    pub weight: f64,
    pub relation_type: String,
    pub metadata: Map<String, Value>,
}

impl KnowledgeEdge {
    pub fn prerequisite(source: impl Into<NodeId>, target: impl Into<NodeId>, weight: f64) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            weight: clamp_unit(weight),
            relation_type: DEFAULT_RELATION_TYPE.to_owned(),
            metadata: Map::new(),
        }
    }
}

/// A recorded exercise. Linked node ids are weak references: deleting or
/// merging a node does not rewrite them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub id: Option<i64>,
    pub content: String,
    pub linked_nodes: Vec<NodeId>,
    pub difficulty: i64,
    pub created_at: i64,
}

impl Problem {
    pub fn new(content: impl Into<String>, linked_nodes: Vec<NodeId>) -> Self {
        Self {
            id: None,
            content: content.into(),
            linked_nodes,
            difficulty: 1,
            created_at: current_unix_timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum Proficiency {
    Unlearned,
    Learning,
    Mastered,
}

impl Proficiency {
    /// Total mapping from a mastery scalar to the 3-level bucket.
    pub fn classify(proficiency: f64) -> Self {
        if proficiency < LEARNING_THRESHOLD {
            Self::Unlearned
        } else if proficiency < MASTERY_THRESHOLD {
            Self::Learning
        } else {
            Self::Mastered
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unlearned => "unlearned",
            Self::Learning => "learning",
            Self::Mastered => "mastered",
        }
    }
}

/// Clamp a scalar into [0, 1]. Out-of-range proficiency and edge weights
/// are accepted leniently rather than rejected; NaN collapses to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

/// Clamp a difficulty rating into the 1..=5 scale.
pub fn clamp_difficulty(value: i64) -> i64 {
    value.clamp(1, 5)
}

/// Split `"极限/limit/リミット"` into the canonical id (first segment) and
/// the remaining segments as aliases. Whitespace-only segments are dropped;
/// duplicates keep their first occurrence.
pub fn split_compound_id(text: &str) -> (String, Vec<String>) {
    let mut segments = text
        .split(COMPOUND_ID_SEPARATOR)
        .map(str::trim)
        .filter(|segment| !segment.is_empty());

    let Some(id) = segments.next() else {
        return (String::new(), Vec::new());
    };

    let mut aliases = Vec::new();
    for segment in segments {
        if segment != id && !aliases.iter().any(|existing| existing == segment) {
            aliases.push(segment.to_owned());
        }
    }

    (id.to_owned(), aliases)
}

pub fn current_unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
