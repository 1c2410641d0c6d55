//! Learning-path planning over the prerequisite graph.

use serde::Serialize;

use noema_core::{NodeId, Proficiency};
use noema_graph_algo::PrerequisiteGraph;
use noema_resolve::ResolveOutcome;

use crate::{KnowledgeService, Lookup, ServiceError};

/// One step in a study order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathStep {
    pub id: NodeId,
    pub proficiency: f64,
    pub difficulty: i64,
    pub level: Proficiency,
}

/// Ordered study plan ending at the target. `degraded` means a
/// prerequisite cycle forced an alphabetical fallback; the steps are
/// still the right set, but their order carries no dependency
/// guarantee.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningPathView {
    pub target: NodeId,
    pub steps: Vec<PathStep>,
    pub degraded: bool,
}

impl KnowledgeService {
    /// Every transitive prerequisite of the target in dependency order,
    /// target last. An isolated concept yields a single-step path.
    pub async fn get_learning_path(
        &self,
        target: &str,
    ) -> Result<Lookup<LearningPathView>, ServiceError> {
        let id = match self.resolver.resolve(target).await? {
            ResolveOutcome::Resolved { id, .. } => id,
            ResolveOutcome::Suggestions(suggestions) => {
                return Ok(Lookup::NotFound { suggestions });
            }
        };

        let view = self.plan_path(&id)?;
        Ok(Lookup::Found(view))
    }

    /// The learning path filtered down to what still needs work:
    /// prerequisites with proficiency strictly below `threshold`. The
    /// target itself is always kept as the final step.
    pub async fn get_unlearned_prerequisites(
        &self,
        target: &str,
        threshold: f64,
    ) -> Result<Lookup<LearningPathView>, ServiceError> {
        let id = match self.resolver.resolve(target).await? {
            ResolveOutcome::Resolved { id, .. } => id,
            ResolveOutcome::Suggestions(suggestions) => {
                return Ok(Lookup::NotFound { suggestions });
            }
        };

        let mut view = self.plan_path(&id)?;
        view.steps
            .retain(|step| step.id == id || step.proficiency < threshold);
        Ok(Lookup::Found(view))
    }

    fn plan_path(&self, id: &str) -> Result<LearningPathView, ServiceError> {
        let edges = self.store.get_all_edges()?;
        let graph = PrerequisiteGraph::from_edges(
            edges.into_iter().map(|edge| (edge.source, edge.target)),
        );

        // A node with no edges at all is absent from the edge-built
        // graph; it still has the trivial path.
        let (order, degraded) = match graph.learning_path(id) {
            Some(path) => (path.order, path.degraded),
            None => (vec![id.to_string()], false),
        };

        let mut steps = Vec::with_capacity(order.len());
        for step_id in order {
            // Edge endpoints are resolver-created, so the node row
            // should exist; a missing row degrades to defaults rather
            // than failing the plan.
            let (proficiency, difficulty) = match self.store.get_node(&step_id)? {
                Some(node) => (node.proficiency, node.difficulty),
                None => (0.0, 1),
            };
            steps.push(PathStep {
                id: step_id,
                proficiency,
                difficulty,
                level: Proficiency::classify(proficiency),
            });
        }

        Ok(LearningPathView {
            target: id.to_string(),
            steps,
            degraded,
        })
    }
}
