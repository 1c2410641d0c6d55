//! Destructive graph maintenance: delete, merge, and the full reset.
//!
//! These operations resolve their arguments through the exact and alias
//! stages only. Fuzzy matching never feeds a delete or a merge.

use serde::Serialize;

use noema_core::{KnowledgeEdge, NodeId, current_unix_timestamp_millis};

use crate::{KnowledgeService, Lookup, ServiceError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteReport {
    pub id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeReport {
    pub merged_into: NodeId,
    pub removed: NodeId,
    pub rewired_edges: usize,
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResetReport {
    pub nodes_removed: usize,
}

impl KnowledgeService {
    /// Remove a concept and every edge touching it. Problem rows keep
    /// their (now dangling) references. An unknown reference is a
    /// NotFound status, not an error.
    pub async fn delete_node(&self, reference: &str) -> Result<Lookup<DeleteReport>, ServiceError> {
        let Some(id) = self.resolver.resolve_local(reference)? else {
            return Ok(Lookup::NotFound {
                suggestions: Vec::new(),
            });
        };

        self.drop_index_entry(&id).await;
        self.store.delete_node(&id)?;

        Ok(Lookup::Found(DeleteReport { id }))
    }

    /// Fold `source` into `target`: every edge incident to source is
    /// rewritten onto target (direct source-target edges are dropped,
    /// key collisions overwrite), target inherits source's aliases plus
    /// the source id itself, and source's metadata entries land on top
    /// of target's. Then source is removed from the index and the graph.
    pub async fn merge_nodes(
        &self,
        source: &str,
        target: &str,
    ) -> Result<MergeReport, ServiceError> {
        let source_id = self
            .resolver
            .resolve_local(source)?
            .ok_or_else(|| ServiceError::NotFound(format!("merge source: {source}")))?;
        let target_id = self
            .resolver
            .resolve_local(target)?
            .ok_or_else(|| ServiceError::NotFound(format!("merge target: {target}")))?;

        if source_id == target_id {
            return Err(ServiceError::InvalidArgument(format!(
                "cannot merge a concept into itself: {source_id}"
            )));
        }

        let source_node = self
            .store
            .get_node(&source_id)?
            .ok_or_else(|| ServiceError::NotFound(format!("merge source: {source_id}")))?;
        let mut target_node = self
            .store
            .get_node(&target_id)?
            .ok_or_else(|| ServiceError::NotFound(format!("merge target: {target_id}")))?;

        let mut rewired = 0usize;
        for edge in self.store.get_all_edges()? {
            let touches_source = edge.source == source_id || edge.target == source_id;
            if !touches_source {
                continue;
            }

            let new_source = if edge.source == source_id {
                target_id.clone()
            } else {
                edge.source.clone()
            };
            let new_target = if edge.target == source_id {
                target_id.clone()
            } else {
                edge.target.clone()
            };
            if new_source == new_target {
                // A direct source-target edge collapses; dropping it is
                // the point of the merge.
                continue;
            }

            let mut rewritten = KnowledgeEdge::prerequisite(new_source, new_target, edge.weight);
            rewritten.relation_type = edge.relation_type;
            rewritten.metadata = edge.metadata;
            self.store.upsert_edge(&rewritten)?;
            rewired += 1;
        }

        for alias in source_node
            .aliases
            .iter()
            .chain(std::iter::once(&source_node.id))
        {
            if alias != &target_node.id && !target_node.aliases.iter().any(|a| a == alias) {
                target_node.aliases.push(alias.clone());
            }
        }

        // Source entries win on key collision.
        for (key, value) in source_node.metadata {
            target_node.metadata.insert(key, value);
        }

        target_node.updated_at = current_unix_timestamp_millis();
        self.store.update_node(&target_node)?;
        self.sync_index_entry(&target_node).await;

        self.drop_index_entry(&source_id).await;
        self.store.delete_node(&source_id)?;

        Ok(MergeReport {
            merged_into: target_id,
            removed: source_id,
            rewired_edges: rewired,
            aliases: target_node.aliases,
        })
    }

    /// Tear the whole graph down, one node at a time (index entry, then
    /// node with its edges). Requires an explicit confirmation flag. A
    /// storage failure mid-loop leaves the already-removed nodes gone;
    /// the operation is restartable. Problem rows are kept.
    pub async fn init_database(&self, confirm: bool) -> Result<ResetReport, ServiceError> {
        if !confirm {
            return Err(ServiceError::InvalidArgument(
                "reset requires confirm = true".into(),
            ));
        }

        let nodes = self.store.get_all_nodes()?;
        let mut removed = 0usize;
        for node in nodes {
            self.drop_index_entry(&node.id).await;
            self.store.delete_node(&node.id)?;
            removed += 1;
        }

        tracing::info!(nodes_removed = removed, "graph reset complete");
        Ok(ResetReport {
            nodes_removed: removed,
        })
    }
}
