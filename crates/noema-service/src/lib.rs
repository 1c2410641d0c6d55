//! Typed operation surface over the concept graph: node and dependency
//! authoring, path planning, similarity queries, and the consistency
//! operations (delete, merge, full reset). Each operation takes and
//! returns plain serde-serializable payloads so an agent layer can wrap
//! them without reaching into the stores.

mod consistency;
mod paths;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use noema_config::{ConfigError, NoemaConfig, ensure_workspace_config};
use noema_core::{
    KnowledgeEdge, KnowledgeNode, NodeId, Problem, Proficiency, clamp_difficulty, clamp_unit,
    current_unix_timestamp_millis, split_compound_id,
};
use noema_index::{
    BoundedIndex, HashEmbedder, IndexError, RankedMatch, SimilarityIndex, SqliteSimilarityIndex,
};
use noema_resolve::{ResolveError, ResolveOutcome, Resolver};
use noema_store::{
    GraphSnapshot, GraphStatistics, GraphStore, SnapshotEdge, SqliteGraphStore, StoreError,
};

pub use consistency::{DeleteReport, MergeReport, ResetReport};
pub use paths::{LearningPathView, PathStep};

/// Problem statements are clipped to this many characters on the way in.
pub const PROBLEM_CONTENT_MAX_CHARS: usize = 500;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Read-path result contract: a fuzzy miss is data, not an error. The
/// suggestions are the ranked sub-threshold candidates from the
/// similarity stage, in collaborator order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lookup<T> {
    Found(T),
    NotFound { suggestions: Vec<RankedMatch> },
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddNodeRequest {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_difficulty")]
    pub difficulty: i64,
    #[serde(default)]
    pub aliases: Vec<String>,
}

fn default_difficulty() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddNodeResponse {
    pub id: NodeId,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddDependencyResponse {
    pub prerequisite: NodeId,
    pub target: NodeId,
    pub weight: f64,
    pub created_prerequisite: bool,
    pub created_target: bool,
}

/// Full view of one concept, as returned by `query_node`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDetail {
    pub node: KnowledgeNode,
    pub level: Proficiency,
    pub prerequisites: Vec<NodeId>,
    pub dependents: Vec<NodeId>,
    pub problem_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarConcept {
    pub id: NodeId,
    pub score: f64,
    pub proficiency: f64,
    pub level: Proficiency,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProficiencyUpdate {
    pub id: NodeId,
    pub proficiency: f64,
    pub level: Proficiency,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkedPoint {
    pub id: NodeId,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddProblemResponse {
    pub problem_id: i64,
    pub points: Vec<LinkedPoint>,
}

/// Shape of the prerequisite graph: entry points, end points, and the
/// full edge list. An isolated concept is both a root and a leaf.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphStructure {
    pub roots: Vec<NodeId>,
    pub leaves: Vec<NodeId>,
    pub edges: Vec<SnapshotEdge>,
}

/// The service owns the graph store, the (timeout-bounded) similarity
/// index, and the identity resolver wired across both.
pub struct KnowledgeService {
    store: Arc<dyn GraphStore>,
    index: Arc<dyn SimilarityIndex>,
    resolver: Resolver,
    config: NoemaConfig,
}

impl KnowledgeService {
    pub fn new(
        store: Arc<dyn GraphStore>,
        index: Arc<dyn SimilarityIndex>,
        config: NoemaConfig,
    ) -> Self {
        let resolver = Resolver::new(
            Arc::clone(&store),
            Arc::clone(&index),
            config.resolver.clone(),
        );
        Self {
            store,
            index,
            resolver,
            config,
        }
    }

    /// Opens (or initializes) the `.noema/` workspace layout: config,
    /// graph database, and similarity index, with the index wrapped in
    /// the configured round-trip bound.
    pub fn open(workspace_root: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let workspace_root = workspace_root.as_ref();
        let config = ensure_workspace_config(workspace_root)?;

        let store: Arc<dyn GraphStore> = Arc::new(SqliteGraphStore::open(workspace_root)?);
        let embedder = Arc::new(HashEmbedder::new(config.index.embedding_dim));
        let raw_index = SqliteSimilarityIndex::open(workspace_root, embedder)?;
        let index: Arc<dyn SimilarityIndex> =
            Arc::new(BoundedIndex::new(Arc::new(raw_index), config.index.timeout_ms));

        Ok(Self::new(store, index, config))
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn config(&self) -> &NoemaConfig {
        &self.config
    }

    /// Create or overwrite a concept. `"A/B/C"` ids split into a
    /// canonical id plus aliases; re-adding an existing id overwrites
    /// its mutable fields (upsert, created_at preserved by the store).
    /// The index upsert is best-effort.
    pub async fn add_node(&self, request: AddNodeRequest) -> Result<AddNodeResponse, ServiceError> {
        let (id, mut aliases) = split_compound_id(&request.id);
        if id.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "node id must not be empty".into(),
            ));
        }

        for alias in &request.aliases {
            let alias = alias.trim();
            if !alias.is_empty() && alias != id && !aliases.iter().any(|a| a == alias) {
                aliases.push(alias.to_string());
            }
        }

        let description = if request.description.trim().is_empty() {
            id.clone()
        } else {
            request.description.trim().to_string()
        };

        let mut node = KnowledgeNode::new(id.clone());
        if let Some(existing) = self.store.get_node(&id)? {
            // Overwrite keeps the learner's progress.
            node.proficiency = existing.proficiency;
            node.metadata = existing.metadata;
        }
        node.description = description.clone();
        node.difficulty = clamp_difficulty(request.difficulty);
        node.aliases = aliases.clone();

        self.store.upsert_node(&node)?;
        self.sync_index_entry(&node).await;

        Ok(AddNodeResponse { id, aliases })
    }

    /// Record "prerequisite must be learned before target". Both ends
    /// go through resolve-or-create at the auto-link threshold, so a
    /// close-enough existing concept is linked instead of duplicated.
    pub async fn add_dependency(
        &self,
        prerequisite: &str,
        target: &str,
        weight: f64,
    ) -> Result<AddDependencyResponse, ServiceError> {
        let (prerequisite, created_prerequisite) =
            self.resolver.resolve_or_create(prerequisite).await?;
        let (target, created_target) = self.resolver.resolve_or_create(target).await?;

        if prerequisite == target {
            return Err(ServiceError::InvalidArgument(format!(
                "concept cannot depend on itself: {prerequisite}"
            )));
        }

        let edge = KnowledgeEdge::prerequisite(prerequisite.clone(), target.clone(), weight);
        self.store.upsert_edge(&edge)?;

        Ok(AddDependencyResponse {
            prerequisite,
            target,
            weight: edge.weight,
            created_prerequisite,
            created_target,
        })
    }

    /// Look a concept up by any reference (id, alias, or similar text)
    /// and return its full detail.
    pub async fn query_node(&self, keyword: &str) -> Result<Lookup<NodeDetail>, ServiceError> {
        let id = match self.resolver.resolve(keyword).await? {
            ResolveOutcome::Resolved { id, .. } => id,
            ResolveOutcome::Suggestions(suggestions) => {
                return Ok(Lookup::NotFound { suggestions });
            }
        };

        let Some(node) = self.store.get_node(&id)? else {
            return Ok(Lookup::NotFound {
                suggestions: Vec::new(),
            });
        };

        let prerequisites = self.store.get_prerequisites(&id)?;
        let dependents = self.store.get_dependents(&id)?;
        let problem_count = self.store.get_problems_for_node(&id)?.len();
        let level = Proficiency::classify(node.proficiency);

        Ok(Lookup::Found(NodeDetail {
            node,
            level,
            prerequisites,
            dependents,
            problem_count,
        }))
    }

    /// Ranked similarity search annotated with learner proficiency.
    /// Sub-threshold scores are data here, never an error; entries the
    /// store no longer knows about are dropped.
    pub async fn search_similar(
        &self,
        keyword: &str,
        top_k: u32,
    ) -> Result<Vec<SimilarConcept>, ServiceError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Ok(Vec::new());
        }

        let ranked = self.index.search(keyword, top_k).await?;
        let mut concepts = Vec::with_capacity(ranked.len());
        for candidate in ranked {
            if let Some(node) = self.store.get_node(&candidate.id)? {
                concepts.push(SimilarConcept {
                    id: node.id,
                    score: candidate.score,
                    proficiency: node.proficiency,
                    level: Proficiency::classify(node.proficiency),
                });
            }
        }
        Ok(concepts)
    }

    /// Set the mastery scalar for a concept. Out-of-range scores are
    /// clamped, not rejected. The reference resolves through exact and
    /// alias matching only: a merely-similar concept must never receive
    /// someone else's proficiency write. On a miss the ranked semantic
    /// candidates come back as suggestions for the caller to confirm.
    pub async fn update_proficiency(
        &self,
        reference: &str,
        score: f64,
    ) -> Result<Lookup<ProficiencyUpdate>, ServiceError> {
        let Some(id) = self.resolver.resolve_local(reference)? else {
            let suggestions = self.ranked_suggestions(reference).await?;
            return Ok(Lookup::NotFound { suggestions });
        };

        let Some(mut node) = self.store.get_node(&id)? else {
            return Ok(Lookup::NotFound {
                suggestions: Vec::new(),
            });
        };

        node.proficiency = clamp_unit(score);
        node.updated_at = current_unix_timestamp_millis();
        self.store.update_node(&node)?;

        Ok(Lookup::Found(ProficiencyUpdate {
            id: node.id,
            proficiency: node.proficiency,
            level: Proficiency::classify(node.proficiency),
        }))
    }

    /// Record an exercise against one or more knowledge points. Each
    /// point goes through resolve-or-create; the statement is clipped
    /// to [`PROBLEM_CONTENT_MAX_CHARS`]. Linked ids are weak references
    /// and survive later deletion of their nodes.
    pub async fn add_problem(
        &self,
        content: &str,
        knowledge_points: &[String],
    ) -> Result<AddProblemResponse, ServiceError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "problem content must not be empty".into(),
            ));
        }
        let content: String = content.chars().take(PROBLEM_CONTENT_MAX_CHARS).collect();

        let mut points = Vec::with_capacity(knowledge_points.len());
        for point in knowledge_points {
            if point.trim().is_empty() {
                continue;
            }
            let (id, created) = self.resolver.resolve_or_create(point).await?;
            if !points.iter().any(|p: &LinkedPoint| p.id == id) {
                points.push(LinkedPoint { id, created });
            }
        }

        let linked: Vec<NodeId> = points.iter().map(|p| p.id.clone()).collect();
        let problem = Problem::new(content, linked);
        let problem_id = self.store.add_problem(&problem)?;

        Ok(AddProblemResponse { problem_id, points })
    }

    pub fn get_statistics(&self) -> Result<GraphStatistics, ServiceError> {
        Ok(self.store.get_statistics()?)
    }

    /// Roots (no prerequisites), leaves (no dependents), and every
    /// edge, all in the store's stable id-ascending order.
    pub fn get_graph_structure(&self) -> Result<GraphStructure, ServiceError> {
        let nodes = self.store.get_all_nodes()?;
        let edges = self.store.get_all_edges()?;

        let with_prerequisites: HashSet<&str> =
            edges.iter().map(|edge| edge.target.as_str()).collect();
        let with_dependents: HashSet<&str> =
            edges.iter().map(|edge| edge.source.as_str()).collect();

        let roots = nodes
            .iter()
            .filter(|node| !with_prerequisites.contains(node.id.as_str()))
            .map(|node| node.id.clone())
            .collect();
        let leaves = nodes
            .iter()
            .filter(|node| !with_dependents.contains(node.id.as_str()))
            .map(|node| node.id.clone())
            .collect();
        let edges = edges
            .into_iter()
            .map(|edge| SnapshotEdge {
                source: edge.source,
                target: edge.target,
                weight: edge.weight,
            })
            .collect();

        Ok(GraphStructure {
            roots,
            leaves,
            edges,
        })
    }

    pub fn export_snapshot(&self) -> Result<GraphSnapshot, ServiceError> {
        Ok(self.store.export_snapshot()?)
    }

    /// Ranked candidates for a reference that failed local resolution,
    /// filtered to ids the store still knows about.
    async fn ranked_suggestions(&self, reference: &str) -> Result<Vec<RankedMatch>, ServiceError> {
        let ranked = self
            .index
            .search(reference, self.config.resolver.suggestion_limit)
            .await?;

        let mut live = Vec::with_capacity(ranked.len());
        for candidate in ranked {
            if self.store.node_exists(&candidate.id)? {
                live.push(candidate);
            }
        }
        Ok(live)
    }

    /// Best-effort index sync for a node write. A failure is logged and
    /// swallowed; the graph write already committed and the index entry
    /// can be repaired by the next write.
    async fn sync_index_entry(&self, node: &KnowledgeNode) {
        if let Err(err) = self
            .index
            .upsert(&node.id, &node.description, &node.metadata)
            .await
        {
            tracing::warn!(node = %node.id, error = %err, "index sync failed");
        }
    }

    /// Best-effort index removal, same contract as [`sync_index_entry`].
    async fn drop_index_entry(&self, id: &str) {
        if let Err(err) = self.index.delete(id).await {
            tracing::warn!(node = %id, error = %err, "index removal failed");
        }
    }
}
