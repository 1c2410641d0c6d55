use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use noema_core::{
    KnowledgeEdge, KnowledgeNode, NodeId, Problem, Proficiency, clamp_difficulty, clamp_unit,
    current_unix_timestamp_millis,
};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const GRAPH_DB_FILE_NAME: &str = "graph.sqlite";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("node id must not be empty")]
    EmptyNodeId,
    #[error("self-loop edge rejected: {0}")]
    SelfLoopEdge(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ProficiencyHistogram {
    pub unlearned: i64,
    pub learning: i64,
    pub mastered: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphStatistics {
    pub node_count: i64,
    pub edge_count: i64,
    pub problem_count: i64,
    pub proficiency_histogram: ProficiencyHistogram,
}

/// Node payload in an exported snapshot. Timestamps are deliberately
/// excluded so two snapshots of the same graph compare structurally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: NodeId,
    pub description: String,
    pub difficulty: i64,
    pub proficiency: f64,
    pub aliases: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEdge {
    pub source: NodeId,
    pub target: NodeId,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<SnapshotNode>,
    pub edges: Vec<SnapshotEdge>,
    pub statistics: GraphStatistics,
}

pub trait GraphStore: Send + Sync {
    /// Upsert by id: a second call with the same id overwrites every
    /// mutable field and bumps updated_at; created_at is preserved.
    fn upsert_node(&self, node: &KnowledgeNode) -> Result<NodeId, StoreError>;
    fn get_node(&self, id: &str) -> Result<Option<KnowledgeNode>, StoreError>;
    /// Returns false (no-op) when the id does not exist.
    fn update_node(&self, node: &KnowledgeNode) -> Result<bool, StoreError>;
    /// Removes every incident edge, then the node, in one transaction.
    /// Returns false when the node was absent. Problem rows keep their
    /// (now dangling) weak references.
    fn delete_node(&self, id: &str) -> Result<bool, StoreError>;
    /// Upsert by (source, target): re-adding overwrites, last write wins.
    /// Endpoints are not referentially validated here; the resolver layer
    /// guarantees they exist on authoring paths.
    fn upsert_edge(&self, edge: &KnowledgeEdge) -> Result<(), StoreError>;
    fn get_prerequisites(&self, id: &str) -> Result<Vec<NodeId>, StoreError>;
    fn get_dependents(&self, id: &str) -> Result<Vec<NodeId>, StoreError>;
    fn get_all_nodes(&self) -> Result<Vec<KnowledgeNode>, StoreError>;
    fn get_all_edges(&self) -> Result<Vec<KnowledgeEdge>, StoreError>;
    fn node_exists(&self, id: &str) -> Result<bool, StoreError>;
    /// Case-insensitive match, each node's own id before its aliases,
    /// first hit in id-ascending order wins.
    fn find_by_alias(&self, text: &str) -> Result<Option<NodeId>, StoreError>;
    fn add_problem(&self, problem: &Problem) -> Result<i64, StoreError>;
    fn get_problems_for_node(&self, id: &str) -> Result<Vec<Problem>, StoreError>;
    fn get_statistics(&self) -> Result<GraphStatistics, StoreError>;
    fn export_snapshot(&self) -> Result<GraphSnapshot, StoreError>;
}

pub struct SqliteGraphStore {
    sqlite_path: PathBuf,
}

impl SqliteGraphStore {
    pub fn open(workspace_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let noema_dir = noema_config::noema_dir(workspace_root);
        let sqlite_path = noema_dir.join(GRAPH_DB_FILE_NAME);

        fs::create_dir_all(&noema_dir)?;

        let conn = Connection::open(&sqlite_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        run_migrations(&conn)?;
        drop(conn);

        Ok(Self { sqlite_path })
    }

    pub fn sqlite_path(&self) -> &Path {
        &self.sqlite_path
    }

    fn connection(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.sqlite_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            description TEXT NOT NULL DEFAULT '',
            difficulty INTEGER NOT NULL DEFAULT 1,
            proficiency REAL NOT NULL DEFAULT 0.0,
            aliases TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS edges (
            source TEXT NOT NULL,
            target TEXT NOT NULL,
            weight REAL NOT NULL DEFAULT 1.0,
            relation_type TEXT NOT NULL DEFAULT 'prerequisite',
            metadata TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (source, target)
        );

        CREATE TABLE IF NOT EXISTS problems (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content TEXT NOT NULL,
            linked_nodes TEXT NOT NULL DEFAULT '[]',
            difficulty INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source);
        CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target);
        "#,
    )?;

    Ok(())
}

type NodeRow = (String, String, i64, f64, String, String, i64, i64);

fn decode_node(row: NodeRow) -> Result<KnowledgeNode, StoreError> {
    let (id, description, difficulty, proficiency, aliases, metadata, created_at, updated_at) =
        row;
    Ok(KnowledgeNode {
        id,
        description,
        difficulty,
        proficiency,
        aliases: serde_json::from_str(&aliases)?,
        metadata: serde_json::from_str(&metadata)?,
        created_at,
        updated_at,
    })
}

fn decode_edge(row: (String, String, f64, String, String)) -> Result<KnowledgeEdge, StoreError> {
    let (source, target, weight, relation_type, metadata) = row;
    Ok(KnowledgeEdge {
        source,
        target,
        weight,
        relation_type,
        metadata: serde_json::from_str(&metadata)?,
    })
}

impl GraphStore for SqliteGraphStore {
    fn upsert_node(&self, node: &KnowledgeNode) -> Result<NodeId, StoreError> {
        if node.id.trim().is_empty() {
            return Err(StoreError::EmptyNodeId);
        }

        let conn = self.connection()?;
        let now = current_unix_timestamp_millis();
        conn.execute(
            r#"
            INSERT INTO nodes (
                id, description, difficulty, proficiency, aliases, metadata, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(id) DO UPDATE SET
                description = excluded.description,
                difficulty = excluded.difficulty,
                proficiency = excluded.proficiency,
                aliases = excluded.aliases,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            "#,
            params![
                node.id,
                node.description,
                clamp_difficulty(node.difficulty),
                clamp_unit(node.proficiency),
                serde_json::to_string(&node.aliases)?,
                serde_json::to_string(&node.metadata)?,
                now,
            ],
        )?;

        Ok(node.id.clone())
    }

    fn get_node(&self, id: &str) -> Result<Option<KnowledgeNode>, StoreError> {
        let conn = self.connection()?;
        let row = conn
            .query_row(
                r#"
                SELECT id, description, difficulty, proficiency, aliases, metadata,
                       created_at, updated_at
                FROM nodes
                WHERE id = ?1
                "#,
                params![id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .optional()?;

        row.map(decode_node).transpose()
    }

    fn update_node(&self, node: &KnowledgeNode) -> Result<bool, StoreError> {
        let conn = self.connection()?;
        let changed = conn.execute(
            r#"
            UPDATE nodes SET
                description = ?1,
                difficulty = ?2,
                proficiency = ?3,
                aliases = ?4,
                metadata = ?5,
                updated_at = ?6
            WHERE id = ?7
            "#,
            params![
                node.description,
                clamp_difficulty(node.difficulty),
                clamp_unit(node.proficiency),
                serde_json::to_string(&node.aliases)?,
                serde_json::to_string(&node.metadata)?,
                current_unix_timestamp_millis(),
                node.id,
            ],
        )?;

        Ok(changed > 0)
    }

    fn delete_node(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM edges WHERE source = ?1 OR target = ?1",
            params![id],
        )?;
        let removed = tx.execute("DELETE FROM nodes WHERE id = ?1", params![id])?;
        tx.commit()?;

        Ok(removed > 0)
    }

    fn upsert_edge(&self, edge: &KnowledgeEdge) -> Result<(), StoreError> {
        if edge.source == edge.target {
            return Err(StoreError::SelfLoopEdge(edge.source.clone()));
        }

        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO edges (source, target, weight, relation_type, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(source, target) DO UPDATE SET
                weight = excluded.weight,
                relation_type = excluded.relation_type,
                metadata = excluded.metadata
            "#,
            params![
                edge.source,
                edge.target,
                clamp_unit(edge.weight),
                edge.relation_type,
                serde_json::to_string(&edge.metadata)?,
            ],
        )?;

        Ok(())
    }

    fn get_prerequisites(&self, id: &str) -> Result<Vec<NodeId>, StoreError> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT source FROM edges WHERE target = ?1 ORDER BY source ASC")?;
        let rows = stmt.query_map(params![id], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn get_dependents(&self, id: &str) -> Result<Vec<NodeId>, StoreError> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT target FROM edges WHERE source = ?1 ORDER BY target ASC")?;
        let rows = stmt.query_map(params![id], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn get_all_nodes(&self) -> Result<Vec<KnowledgeNode>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, description, difficulty, proficiency, aliases, metadata,
                   created_at, updated_at
            FROM nodes
            ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
            ))
        })?;

        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(decode_node(row?)?);
        }
        Ok(nodes)
    }

    fn get_all_edges(&self) -> Result<Vec<KnowledgeEdge>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT source, target, weight, relation_type, metadata
            FROM edges
            ORDER BY source ASC, target ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })?;

        let mut edges = Vec::new();
        for row in rows {
            edges.push(decode_edge(row?)?);
        }
        Ok(edges)
    }

    fn node_exists(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.connection()?;
        let found = conn
            .query_row("SELECT 1 FROM nodes WHERE id = ?1", params![id], |row| {
                row.get::<_, i64>(0)
            })
            .optional()?;
        Ok(found.is_some())
    }

    fn find_by_alias(&self, text: &str) -> Result<Option<NodeId>, StoreError> {
        let needle = text.trim();
        if needle.is_empty() {
            return Ok(None);
        }

        for node in self.get_all_nodes()? {
            if node.matches_alias(needle) {
                return Ok(Some(node.id));
            }
        }
        Ok(None)
    }

    fn add_problem(&self, problem: &Problem) -> Result<i64, StoreError> {
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO problems (content, linked_nodes, difficulty, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                problem.content,
                serde_json::to_string(&problem.linked_nodes)?,
                clamp_difficulty(problem.difficulty),
                problem.created_at,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    fn get_problems_for_node(&self, id: &str) -> Result<Vec<Problem>, StoreError> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, content, linked_nodes, difficulty, created_at
            FROM problems
            ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut problems = Vec::new();
        for row in rows {
            let (problem_id, content, linked_nodes, difficulty, created_at) = row?;
            let linked_nodes: Vec<NodeId> = serde_json::from_str(&linked_nodes)?;
            if linked_nodes.iter().any(|linked| linked == id) {
                problems.push(Problem {
                    id: Some(problem_id),
                    content,
                    linked_nodes,
                    difficulty,
                    created_at,
                });
            }
        }
        Ok(problems)
    }

    fn get_statistics(&self) -> Result<GraphStatistics, StoreError> {
        let conn = self.connection()?;
        let node_count = conn.query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get(0))?;
        let edge_count = conn.query_row("SELECT COUNT(*) FROM edges", [], |row| row.get(0))?;
        let problem_count =
            conn.query_row("SELECT COUNT(*) FROM problems", [], |row| row.get(0))?;

        let mut histogram = ProficiencyHistogram::default();
        let mut stmt = conn.prepare("SELECT proficiency FROM nodes")?;
        let rows = stmt.query_map([], |row| row.get::<_, f64>(0))?;
        for row in rows {
            match Proficiency::classify(row?) {
                Proficiency::Unlearned => histogram.unlearned += 1,
                Proficiency::Learning => histogram.learning += 1,
                Proficiency::Mastered => histogram.mastered += 1,
            }
        }

        Ok(GraphStatistics {
            node_count,
            edge_count,
            problem_count,
            proficiency_histogram: histogram,
        })
    }

    fn export_snapshot(&self) -> Result<GraphSnapshot, StoreError> {
        let nodes = self
            .get_all_nodes()?
            .into_iter()
            .map(|node| SnapshotNode {
                id: node.id,
                description: node.description,
                difficulty: node.difficulty,
                proficiency: node.proficiency,
                aliases: node.aliases,
                metadata: node.metadata,
            })
            .collect();

        let edges = self
            .get_all_edges()?
            .into_iter()
            .map(|edge| SnapshotEdge {
                source: edge.source,
                target: edge.target,
                weight: edge.weight,
            })
            .collect();

        Ok(GraphSnapshot {
            nodes,
            edges,
            statistics: self.get_statistics()?,
        })
    }
}
