use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const INDEX_DB_FILE_NAME: &str = "index.sqlite";
pub const MAX_TOP_K: u32 = 100;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("similarity index call timed out after {0} ms")]
    Timeout(u64),
    #[error("index backend error: {0}")]
    Backend(String),
}

/// One ranked candidate from the similarity collaborator, best first.
/// Scores live in [0, 1] and stay f64 end to end so comparison against
/// a configured threshold is exact at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedMatch {
    pub id: String,
    pub score: f64,
}

/// The external similarity-search and index-sync collaborator. Consumed
/// as a black-box ranked-results service: callers never re-sort what it
/// returns. Every call is independent and idempotent, so a retry after a
/// failure is always safe.
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    async fn search(&self, query: &str, top_k: u32) -> Result<Vec<RankedMatch>, IndexError>;
    async fn upsert(
        &self,
        id: &str,
        text: &str,
        metadata: &Map<String, Value>,
    ) -> Result<(), IndexError>;
    async fn delete(&self, id: &str) -> Result<(), IndexError>;
}

/// Turns text into a fixed-dimension vector. The embedding computation
/// itself is an external concern; this trait is the seam it plugs into.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
    fn dim(&self) -> usize;
}

/// Deterministic local embedder: character trigrams hashed into a fixed
/// number of buckets, L2-normalized. No model download, no network; two
/// equal inputs always embed identically, and lexically close inputs
/// land close in cosine space.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(16) }
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut buckets = vec![0.0f32; self.dim];
        let normalized: Vec<char> = format!(" {} ", text.trim().to_lowercase())
            .chars()
            .collect();

        if normalized.len() < 3 {
            return buckets;
        }

        for window in normalized.windows(3) {
            let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
            for ch in window {
                hash ^= *ch as u64;
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
            buckets[(hash % self.dim as u64) as usize] += 1.0;
        }

        let norm = buckets.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut buckets {
                *value /= norm;
            }
        }
        buckets
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Brute-force cosine backend over a dedicated sqlite file. Fine for a
/// personal concept graph; swap the trait implementation for a real ANN
/// service when the corpus outgrows it.
pub struct SqliteSimilarityIndex {
    sqlite_path: PathBuf,
    embedder: Arc<dyn Embedder>,
}

impl SqliteSimilarityIndex {
    pub fn open(
        workspace_root: impl AsRef<Path>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, IndexError> {
        let noema_dir = noema_config::noema_dir(workspace_root);
        let sqlite_path = noema_dir.join(INDEX_DB_FILE_NAME);

        fs::create_dir_all(&noema_dir)?;

        let conn = Connection::open(&sqlite_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        drop(conn);

        Ok(Self {
            sqlite_path,
            embedder,
        })
    }

    fn connection(&self) -> Result<Connection, IndexError> {
        let conn = Connection::open(&self.sqlite_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }
}

#[async_trait]
impl SimilarityIndex for SqliteSimilarityIndex {
    async fn search(&self, query: &str, top_k: u32) -> Result<Vec<RankedMatch>, IndexError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let top_k = top_k.clamp(1, MAX_TOP_K) as usize;
        let query_embedding = self.embedder.embed(query);

        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT id, embedding FROM embeddings")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut matches = Vec::new();
        for row in rows {
            let (id, embedding_json) = row?;
            let embedding: Vec<f32> = serde_json::from_str(&embedding_json)?;
            let score = cosine_similarity(&query_embedding, &embedding).clamp(0.0, 1.0);
            matches.push(RankedMatch { id, score });
        }

        matches.sort_by(|left, right| {
            right
                .score
                .partial_cmp(&left.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| left.id.cmp(&right.id))
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn upsert(
        &self,
        id: &str,
        text: &str,
        metadata: &Map<String, Value>,
    ) -> Result<(), IndexError> {
        let embedding = self.embedder.embed(text);
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO embeddings (id, content, metadata, embedding, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                metadata = excluded.metadata,
                embedding = excluded.embedding,
                updated_at = excluded.updated_at
            "#,
            params![
                id,
                text,
                serde_json::to_string(metadata)?,
                serde_json::to_string(&embedding)?,
                current_unix_timestamp_millis(),
            ],
        )?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), IndexError> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM embeddings WHERE id = ?1", params![id])?;
        Ok(())
    }
}

/// Enforces a bounded round-trip on every index call. The raw collaborator
/// has no timeout of its own, and unbounded blocking on it is the primary
/// availability risk; expiry surfaces as a distinct failure kind.
pub struct BoundedIndex {
    inner: Arc<dyn SimilarityIndex>,
    timeout_ms: u64,
}

impl BoundedIndex {
    pub fn new(inner: Arc<dyn SimilarityIndex>, timeout_ms: u64) -> Self {
        Self {
            inner,
            timeout_ms: timeout_ms.max(1),
        }
    }

    fn deadline(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[async_trait]
impl SimilarityIndex for BoundedIndex {
    async fn search(&self, query: &str, top_k: u32) -> Result<Vec<RankedMatch>, IndexError> {
        match tokio::time::timeout(self.deadline(), self.inner.search(query, top_k)).await {
            Ok(result) => result,
            Err(_) => Err(IndexError::Timeout(self.timeout_ms)),
        }
    }

    async fn upsert(
        &self,
        id: &str,
        text: &str,
        metadata: &Map<String, Value>,
    ) -> Result<(), IndexError> {
        match tokio::time::timeout(self.deadline(), self.inner.upsert(id, text, metadata)).await {
            Ok(result) => result,
            Err(_) => Err(IndexError::Timeout(self.timeout_ms)),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), IndexError> {
        match tokio::time::timeout(self.deadline(), self.inner.delete(id)).await {
            Ok(result) => result,
            Err(_) => Err(IndexError::Timeout(self.timeout_ms)),
        }
    }
}

fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.is_empty() || left.len() != right.len() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut left_norm = 0.0f64;
    let mut right_norm = 0.0f64;
    for (a, b) in left.iter().zip(right) {
        dot += f64::from(*a) * f64::from(*b);
        left_norm += f64::from(*a) * f64::from(*a);
        right_norm += f64::from(*b) * f64::from(*b);
    }

    if left_norm <= 0.0 || right_norm <= 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

fn current_unix_timestamp_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
