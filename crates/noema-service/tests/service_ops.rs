use std::sync::Arc;

use async_trait::async_trait;
use tempfile::{TempDir, tempdir};

use noema_config::NoemaConfig;
use noema_core::Proficiency;
use noema_index::{IndexError, RankedMatch, SimilarityIndex};
use noema_service::{
    AddNodeRequest, KnowledgeService, Lookup, PROBLEM_CONTENT_MAX_CHARS, ServiceError,
};
use noema_store::{GraphStore, SqliteGraphStore};

fn service() -> (TempDir, KnowledgeService) {
    let temp = tempdir().expect("tempdir");
    let service = KnowledgeService::open(temp.path()).expect("open service");
    (temp, service)
}

async fn add(service: &KnowledgeService, id: &str) -> String {
    service
        .add_node(AddNodeRequest {
            id: id.to_string(),
            description: String::new(),
            difficulty: 1,
            aliases: Vec::new(),
        })
        .await
        .expect("add node")
        .id
}

#[tokio::test]
async fn adding_twice_keeps_one_node_and_overwrites_fields() {
    let (_temp, service) = service();

    service
        .add_node(AddNodeRequest {
            id: "limit".into(),
            description: "first description".into(),
            difficulty: 2,
            aliases: vec!["极限".into()],
        })
        .await
        .expect("first add");

    service
        .update_proficiency("limit", 0.5)
        .await
        .expect("update")
        .found()
        .expect("found");

    let response = service
        .add_node(AddNodeRequest {
            id: "limit".into(),
            description: "second description".into(),
            difficulty: 9,
            aliases: vec!["lim".into()],
        })
        .await
        .expect("second add");
    assert_eq!(response.id, "limit");

    let stats = service.get_statistics().expect("stats");
    assert_eq!(stats.node_count, 1);

    let node = service
        .store()
        .get_node("limit")
        .expect("get")
        .expect("present");
    assert_eq!(node.description, "second description");
    assert_eq!(node.difficulty, 5);
    assert_eq!(node.aliases, vec!["lim"]);
    // Re-adding a concept does not wipe the learner's progress.
    assert_eq!(node.proficiency, 0.5);
}

#[tokio::test]
async fn compound_id_splits_into_canonical_id_and_aliases() {
    let (_temp, service) = service();

    let response = service
        .add_node(AddNodeRequest {
            id: "极限/limit/リミット".into(),
            description: String::new(),
            difficulty: 1,
            aliases: vec!["lim".into()],
        })
        .await
        .expect("add");

    assert_eq!(response.id, "极限");
    assert_eq!(response.aliases, vec!["limit", "リミット", "lim"]);

    let detail = service
        .query_node("LIMIT")
        .await
        .expect("query")
        .found()
        .expect("alias lookup hits");
    assert_eq!(detail.node.id, "极限");
}

#[tokio::test]
async fn dependency_resolves_aliases_and_rejects_self_loops() {
    let (_temp, service) = service();
    service
        .add_node(AddNodeRequest {
            id: "极限/limit".into(),
            description: "limit of a function".into(),
            difficulty: 3,
            aliases: Vec::new(),
        })
        .await
        .expect("add limit");
    service
        .add_node(AddNodeRequest {
            id: "导数/derivative".into(),
            description: "derivative as a rate of change".into(),
            difficulty: 3,
            aliases: Vec::new(),
        })
        .await
        .expect("add derivative");

    let response = service
        .add_dependency("limit", "derivative", 1.5)
        .await
        .expect("add dependency");
    assert_eq!(response.prerequisite, "极限");
    assert_eq!(response.target, "导数");
    assert_eq!(response.weight, 1.0);
    assert!(!response.created_prerequisite);
    assert!(!response.created_target);

    let err = service
        .add_dependency("limit", "极限", 0.5)
        .await
        .expect_err("self dependency");
    assert!(matches!(err, ServiceError::InvalidArgument(_)));
}

#[tokio::test]
async fn dependency_creates_missing_endpoints() {
    let (_temp, service) = service();

    let response = service
        .add_dependency("algebra", "calculus", 0.9)
        .await
        .expect("add dependency");
    assert!(response.created_prerequisite);
    assert!(response.created_target);
    assert!(service.store().node_exists("algebra").expect("exists"));
    assert!(service.store().node_exists("calculus").expect("exists"));
}

#[tokio::test]
async fn learning_path_orders_a_chain_and_ends_with_the_target() {
    let (_temp, service) = service();
    for pair in [
        ("arithmetic", "algebra"),
        ("algebra", "limits"),
        ("limits", "derivatives"),
    ] {
        service
            .add_dependency(pair.0, pair.1, 1.0)
            .await
            .expect("add dependency");
    }

    let view = service
        .get_learning_path("derivatives")
        .await
        .expect("path")
        .found()
        .expect("target known");

    let order: Vec<&str> = view.steps.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(order, vec!["arithmetic", "algebra", "limits", "derivatives"]);
    assert!(!view.degraded);
}

#[tokio::test]
async fn isolated_concept_has_a_single_step_path() {
    let (_temp, service) = service();
    add(&service, "topology").await;

    let view = service
        .get_learning_path("topology")
        .await
        .expect("path")
        .found()
        .expect("found");
    assert_eq!(view.steps.len(), 1);
    assert_eq!(view.steps[0].id, "topology");
    assert!(!view.degraded);
}

#[tokio::test]
async fn cycle_degrades_the_path_instead_of_failing() {
    let (_temp, service) = service();
    service
        .add_dependency("alpha", "beta", 1.0)
        .await
        .expect("alpha -> beta");
    service
        .add_dependency("beta", "alpha", 1.0)
        .await
        .expect("beta -> alpha");
    service
        .add_dependency("beta", "goal", 1.0)
        .await
        .expect("beta -> goal");

    let view = service
        .get_learning_path("goal")
        .await
        .expect("path")
        .found()
        .expect("found");
    assert!(view.degraded);
    let order: Vec<&str> = view.steps.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(order, vec!["alpha", "beta", "goal"]);
}

#[tokio::test]
async fn unknown_target_returns_suggestions_not_an_error() {
    let (_temp, service) = service();
    add(&service, "limit").await;

    let lookup = service
        .get_learning_path("quantum chromodynamics banana")
        .await
        .expect("lookup");
    assert!(matches!(lookup, Lookup::NotFound { .. }));
}

#[tokio::test]
async fn unlearned_filter_drops_mastered_steps_but_keeps_the_target() {
    let (_temp, service) = service();
    for pair in [("algebra", "limits"), ("limits", "derivatives")] {
        service
            .add_dependency(pair.0, pair.1, 1.0)
            .await
            .expect("add dependency");
    }
    service
        .update_proficiency("algebra", 0.9)
        .await
        .expect("update")
        .found()
        .expect("found");
    service
        .update_proficiency("derivatives", 0.95)
        .await
        .expect("update")
        .found()
        .expect("found");

    let view = service
        .get_unlearned_prerequisites("derivatives", 0.7)
        .await
        .expect("plan")
        .found()
        .expect("found");

    let order: Vec<&str> = view.steps.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(order, vec!["limits", "derivatives"]);
    assert_eq!(view.steps[0].level, Proficiency::Unlearned);
}

#[tokio::test]
async fn search_similar_annotates_matches_with_proficiency() {
    let (_temp, service) = service();
    service
        .add_node(AddNodeRequest {
            id: "limit".into(),
            description: "limit of a function at a point".into(),
            difficulty: 2,
            aliases: Vec::new(),
        })
        .await
        .expect("add");
    service
        .update_proficiency("limit", 0.8)
        .await
        .expect("update")
        .found()
        .expect("found");

    let matches = service
        .search_similar("limit of a function", 5)
        .await
        .expect("search");
    assert!(!matches.is_empty());
    assert_eq!(matches[0].id, "limit");
    assert_eq!(matches[0].proficiency, 0.8);
    assert_eq!(matches[0].level, Proficiency::Mastered);

    let empty = service.search_similar("   ", 5).await.expect("search");
    assert!(empty.is_empty());
}

#[tokio::test]
async fn update_proficiency_clamps_and_misses_return_suggestions() {
    let (_temp, service) = service();
    add(&service, "limit").await;

    let update = service
        .update_proficiency("limit", 3.2)
        .await
        .expect("update")
        .found()
        .expect("found");
    assert_eq!(update.proficiency, 1.0);
    assert_eq!(update.level, Proficiency::Mastered);

    let miss = service
        .update_proficiency("quantum chromodynamics banana", 0.4)
        .await
        .expect("lookup");
    assert!(matches!(miss, Lookup::NotFound { .. }));
}

/// Always returns one near-perfect candidate, whatever the query.
struct OverconfidentIndex;

#[async_trait]
impl SimilarityIndex for OverconfidentIndex {
    async fn search(&self, _query: &str, _top_k: u32) -> Result<Vec<RankedMatch>, IndexError> {
        Ok(vec![RankedMatch {
            id: "limit".to_string(),
            score: 0.99,
        }])
    }

    async fn upsert(
        &self,
        _id: &str,
        _text: &str,
        _metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), IndexError> {
        Ok(())
    }

    async fn delete(&self, _id: &str) -> Result<(), IndexError> {
        Ok(())
    }
}

#[tokio::test]
async fn proficiency_writes_never_follow_a_semantic_match() {
    let temp = tempdir().expect("tempdir");
    let store = Arc::new(SqliteGraphStore::open(temp.path()).expect("open store"));
    let store_handle: Arc<dyn GraphStore> = store.clone();
    let service = KnowledgeService::new(
        store_handle,
        Arc::new(OverconfidentIndex),
        NoemaConfig::default(),
    );
    add(&service, "limit").await;

    let miss = service
        .update_proficiency("something else entirely", 0.9)
        .await
        .expect("lookup");
    match miss {
        Lookup::NotFound { suggestions } => {
            assert_eq!(suggestions.len(), 1);
            assert_eq!(suggestions[0].id, "limit");
        }
        Lookup::Found(update) => panic!("semantic match received the write: {update:?}"),
    }

    let node = store.get_node("limit").expect("get").expect("present");
    assert_eq!(node.proficiency, 0.0);

    // Exact and alias references still land.
    let update = service
        .update_proficiency("limit", 0.5)
        .await
        .expect("update")
        .found()
        .expect("found");
    assert_eq!(update.proficiency, 0.5);
}

#[tokio::test]
async fn problems_are_clipped_linked_and_survive_node_deletion() {
    let (_temp, service) = service();
    add(&service, "limit").await;

    let long_content = "x".repeat(PROBLEM_CONTENT_MAX_CHARS + 100);
    let response = service
        .add_problem(&long_content, &["limit".to_string(), "series".to_string()])
        .await
        .expect("add problem");

    assert_eq!(response.points.len(), 2);
    assert!(!response.points[0].created);
    assert_eq!(response.points[1].id, "series");
    assert!(response.points[1].created);

    let problems = service
        .store()
        .get_problems_for_node("limit")
        .expect("problems");
    assert_eq!(problems.len(), 1);
    assert_eq!(problems[0].content.chars().count(), PROBLEM_CONTENT_MAX_CHARS);

    // Linked ids are weak references: deleting the node leaves the
    // problem row (and its dangling link) in place.
    service
        .delete_node("limit")
        .await
        .expect("delete")
        .found()
        .expect("deleted");
    let stats = service.get_statistics().expect("stats");
    assert_eq!(stats.problem_count, 1);
}

#[tokio::test]
async fn delete_removes_edges_and_absent_nodes_are_a_status() {
    let (_temp, service) = service();
    service
        .add_dependency("limits", "derivatives", 1.0)
        .await
        .expect("add dependency");

    let report = service
        .delete_node("limits")
        .await
        .expect("delete")
        .found()
        .expect("deleted");
    assert_eq!(report.id, "limits");

    let stats = service.get_statistics().expect("stats");
    assert_eq!(stats.node_count, 1);
    assert_eq!(stats.edge_count, 0);

    let missing = service.delete_node("limits").await.expect("delete again");
    assert!(matches!(missing, Lookup::NotFound { .. }));
}

#[tokio::test]
async fn merge_rewires_edges_and_folds_identity() {
    let (_temp, service) = service();
    for pair in [
        ("basics", "lim"),
        ("lim", "derivatives"),
        ("lim", "limit"),
    ] {
        service
            .add_dependency(pair.0, pair.1, 1.0)
            .await
            .expect("add dependency");
    }

    for (id, key, value) in [
        ("lim", "origin", "textbook A"),
        ("limit", "origin", "textbook B"),
        ("limit", "chapter", "3"),
    ] {
        let mut node = service
            .store()
            .get_node(id)
            .expect("get")
            .expect("present");
        node.metadata
            .insert(key.to_string(), serde_json::Value::String(value.into()));
        service.store().update_node(&node).expect("update");
    }

    let report = service
        .merge_nodes("lim", "limit")
        .await
        .expect("merge");
    assert_eq!(report.merged_into, "limit");
    assert_eq!(report.removed, "lim");
    // basics -> lim and lim -> derivatives are rewired; the direct
    // lim -> limit edge is dropped.
    assert_eq!(report.rewired_edges, 2);
    assert!(report.aliases.contains(&"lim".to_string()));

    assert!(!service.store().node_exists("lim").expect("exists"));
    assert_eq!(
        service.store().get_prerequisites("limit").expect("prereqs"),
        vec!["basics".to_string()]
    );
    assert_eq!(
        service.store().get_dependents("limit").expect("dependents"),
        vec!["derivatives".to_string()]
    );

    // The old name still resolves, through the inherited alias.
    let detail = service
        .query_node("lim")
        .await
        .expect("query")
        .found()
        .expect("found");
    assert_eq!(detail.node.id, "limit");

    // Metadata folds with the merged-in node's entries on top.
    assert_eq!(
        detail.node.metadata.get("origin"),
        Some(&serde_json::Value::String("textbook A".into()))
    );
    assert_eq!(
        detail.node.metadata.get("chapter"),
        Some(&serde_json::Value::String("3".into()))
    );
}

#[tokio::test]
async fn merge_rejects_self_and_unknown_endpoints() {
    let (_temp, service) = service();
    add(&service, "limit").await;

    let err = service
        .merge_nodes("limit", "limit")
        .await
        .expect_err("self merge");
    assert!(matches!(err, ServiceError::InvalidArgument(_)));

    let err = service
        .merge_nodes("ghost", "limit")
        .await
        .expect_err("unknown source");
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn reset_requires_confirmation_and_keeps_problem_rows() {
    let (_temp, service) = service();
    service
        .add_dependency("limits", "derivatives", 1.0)
        .await
        .expect("add dependency");
    service
        .add_problem("compute the limit", &["limits".to_string()])
        .await
        .expect("add problem");

    let err = service
        .init_database(false)
        .await
        .expect_err("unconfirmed reset");
    assert!(matches!(err, ServiceError::InvalidArgument(_)));

    let report = service.init_database(true).await.expect("reset");
    assert_eq!(report.nodes_removed, 2);

    let stats = service.get_statistics().expect("stats");
    assert_eq!(stats.node_count, 0);
    assert_eq!(stats.edge_count, 0);
    assert_eq!(stats.problem_count, 1);
}

#[tokio::test]
async fn graph_structure_reports_roots_leaves_and_edges() {
    let (_temp, service) = service();
    for pair in [("arithmetic", "algebra"), ("algebra", "calculus")] {
        service
            .add_dependency(pair.0, pair.1, 1.0)
            .await
            .expect("add dependency");
    }
    add(&service, "topology").await;

    let structure = service.get_graph_structure().expect("structure");
    assert_eq!(structure.roots, vec!["arithmetic", "topology"]);
    assert_eq!(structure.leaves, vec!["calculus", "topology"]);
    assert_eq!(structure.edges.len(), 2);
    assert_eq!(structure.edges[0].source, "algebra");
    assert_eq!(structure.edges[0].target, "calculus");
}

#[tokio::test]
async fn snapshot_reflects_the_graph_structure() {
    let (_temp, service) = service();
    service
        .add_dependency("limits", "derivatives", 0.8)
        .await
        .expect("add dependency");

    let snapshot = service.export_snapshot().expect("snapshot");
    assert_eq!(snapshot.nodes.len(), 2);
    assert_eq!(snapshot.edges.len(), 1);
    assert_eq!(snapshot.edges[0].source, "limits");
    assert_eq!(snapshot.edges[0].target, "derivatives");
    assert_eq!(snapshot.statistics.node_count, 2);
}

#[tokio::test]
async fn end_to_end_flow_in_mixed_scripts() {
    let (_temp, service) = service();

    service
        .add_node(AddNodeRequest {
            id: "极限/limit".into(),
            description: "limit of a function".into(),
            difficulty: 3,
            aliases: Vec::new(),
        })
        .await
        .expect("add 极限");
    service
        .add_node(AddNodeRequest {
            id: "导数/derivative".into(),
            description: "instantaneous rate of change".into(),
            difficulty: 4,
            aliases: Vec::new(),
        })
        .await
        .expect("add 导数");
    service
        .add_dependency("limit", "derivative", 1.0)
        .await
        .expect("link");
    service
        .update_proficiency("极限", 0.4)
        .await
        .expect("update")
        .found()
        .expect("found");

    let view = service
        .get_learning_path("derivative")
        .await
        .expect("path")
        .found()
        .expect("found");
    let order: Vec<&str> = view.steps.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(order, vec!["极限", "导数"]);
    assert_eq!(view.steps[0].level, Proficiency::Learning);
    assert_eq!(view.steps[1].level, Proficiency::Unlearned);

    // Both are still below mastery, so neither drops out of the plan.
    let unlearned = service
        .get_unlearned_prerequisites("导数", 0.7)
        .await
        .expect("plan")
        .found()
        .expect("found");
    assert_eq!(unlearned.steps.len(), 2);
}
