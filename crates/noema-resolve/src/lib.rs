use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use noema_config::ResolverConfig;
use noema_core::{KnowledgeNode, NodeId, split_compound_id};
use noema_index::{IndexError, RankedMatch, SimilarityIndex};
use noema_store::{GraphStore, StoreError};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("node reference must not be empty")]
    EmptyReference,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Which stage of the cascade produced the match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Alias,
    Semantic,
}

/// Result of a read-only resolution. A miss is not an error: it
/// carries the ranked sub-threshold candidates so callers can show
/// them as suggestions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResolveOutcome {
    Resolved { id: NodeId, kind: MatchKind },
    Suggestions(Vec<RankedMatch>),
}

/// Maps a free-form node reference onto a canonical node id.
///
/// The cascade runs exact id, then case-insensitive alias, then
/// similarity search, first hit wins. Similarity acceptance is
/// threshold-gated: `suggest_threshold` on the read path,
/// `auto_link_threshold` on the authoring path. `resolve` never
/// writes anything; `resolve_or_create` is the single entry point
/// with a side effect.
pub struct Resolver {
    store: Arc<dyn GraphStore>,
    index: Arc<dyn SimilarityIndex>,
    config: ResolverConfig,
}

impl Resolver {
    pub fn new(
        store: Arc<dyn GraphStore>,
        index: Arc<dyn SimilarityIndex>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            store,
            index,
            config,
        }
    }

    /// Exact and alias stages only. This is the whole resolution
    /// surface available to destructive operations: a fuzzy match
    /// feeding a delete or merge is not acceptable.
    pub fn resolve_local(&self, reference: &str) -> Result<Option<NodeId>, ResolveError> {
        let reference = non_empty(reference)?;
        Ok(self.local_match(reference)?.map(|(id, _)| id))
    }

    /// Full read-only cascade at the suggest threshold. Candidates
    /// whose node no longer exists in the store are dropped rather
    /// than surfaced; the index may lag behind deletions.
    pub async fn resolve(&self, reference: &str) -> Result<ResolveOutcome, ResolveError> {
        let reference = non_empty(reference)?;

        if let Some((id, kind)) = self.local_match(reference)? {
            return Ok(ResolveOutcome::Resolved { id, kind });
        }

        let candidates = self.live_candidates(reference).await?;
        if let Some(top) = candidates.first() {
            if top.score >= self.config.suggest_threshold {
                return Ok(ResolveOutcome::Resolved {
                    id: top.id.clone(),
                    kind: MatchKind::Semantic,
                });
            }
        }

        Ok(ResolveOutcome::Suggestions(candidates))
    }

    /// Authoring cascade at the auto-link threshold; a miss creates a
    /// node from the trimmed reference. Compound references like
    /// `"A/B/C"` become id `A` with aliases `B` and `C`. Returns the
    /// canonical id and whether a node was created. The index upsert
    /// for a new node is best-effort: a failed sync logs a warning and
    /// does not undo the node write.
    pub async fn resolve_or_create(
        &self,
        reference: &str,
    ) -> Result<(NodeId, bool), ResolveError> {
        let reference = non_empty(reference)?;

        let (primary, aliases) = split_compound_id(reference);
        if primary.is_empty() {
            return Err(ResolveError::EmptyReference);
        }

        if let Some((id, _)) = self.local_match(&primary)? {
            return Ok((id, false));
        }

        let candidates = self.live_candidates(&primary).await?;
        if let Some(top) = candidates.first() {
            if top.score >= self.config.auto_link_threshold {
                return Ok((top.id.clone(), false));
            }
        }

        let mut node = KnowledgeNode::new(primary.clone());
        node.description = primary.clone();
        node.aliases = aliases;
        self.store.upsert_node(&node)?;

        if let Err(err) = self
            .index
            .upsert(&node.id, &node.description, &node.metadata)
            .await
        {
            tracing::warn!(node = %node.id, error = %err, "index sync failed for new node");
        }

        Ok((primary, true))
    }

    fn local_match(&self, reference: &str) -> Result<Option<(NodeId, MatchKind)>, ResolveError> {
        if self.store.get_node(reference)?.is_some() {
            return Ok(Some((reference.to_string(), MatchKind::Exact)));
        }
        if let Some(id) = self.store.find_by_alias(reference)? {
            return Ok(Some((id, MatchKind::Alias)));
        }
        Ok(None)
    }

    /// Ranked candidates filtered to ids the store still knows about.
    /// Collaborator order is preserved, never re-sorted.
    async fn live_candidates(&self, reference: &str) -> Result<Vec<RankedMatch>, ResolveError> {
        let ranked = self
            .index
            .search(reference, self.config.suggestion_limit)
            .await?;

        let mut live = Vec::with_capacity(ranked.len());
        for candidate in ranked {
            if self.store.node_exists(&candidate.id)? {
                live.push(candidate);
            }
        }
        Ok(live)
    }
}

fn non_empty(reference: &str) -> Result<&str, ResolveError> {
    let trimmed = reference.trim();
    if trimmed.is_empty() {
        return Err(ResolveError::EmptyReference);
    }
    Ok(trimmed)
}
