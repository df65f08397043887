use super::SearchResult;
use crate::error::Result;
use rusqlite::{params, Connection};
use serde_json::Value as JsonValue;
use std::path::Path;

pub type Embedding = Vec<f32>;

/// Single-connection, WAL-mode vector store. Rows carry an optional
/// `platform` tag so the retriever can pre-filter exemplars to a
/// device's platform before ranking, rather than scoring the whole table.
pub struct SqliteVectorStore {
    conn: Connection,
}

impl SqliteVectorStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS vectors (
                id TEXT PRIMARY KEY,
                platform TEXT,
                embedding TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_vectors_platform ON vectors(platform)",
            [],
        )?;
        Ok(())
    }

    pub fn insert(
        &mut self,
        id: &str,
        platform: Option<&str>,
        embedding: &Embedding,
        metadata: &JsonValue,
    ) -> Result<()> {
        let embedding_json = serde_json::to_string(embedding)?;
        let metadata_json = serde_json::to_string(metadata)?;
        let timestamp = chrono::Utc::now().timestamp();

        self.conn.execute(
            "INSERT OR REPLACE INTO vectors (id, platform, embedding, metadata, created_at) VALUES (?, ?, ?, ?, ?)",
            params![id, platform, embedding_json, metadata_json, timestamp],
        )?;

        Ok(())
    }

    /// Brute-force cosine similarity search, optionally restricted to one
    /// platform. Embeddings are expected L2-normalized so cosine similarity
    /// reduces to a dot product.
    pub fn search(
        &self,
        query_embedding: &Embedding,
        platform: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let mut results: Vec<SearchResult> = Vec::new();

        let mut collect = |id: String, embedding_json: String, metadata_json: String| -> Result<()> {
            let embedding: Embedding = serde_json::from_str(&embedding_json)?;
            let score = cosine_similarity(query_embedding, &embedding);
            let metadata: JsonValue = serde_json::from_str(&metadata_json)?;
            results.push(SearchResult { id, score, metadata });
            Ok(())
        };

        if let Some(platform) = platform {
            let mut stmt = self
                .conn
                .prepare("SELECT id, embedding, metadata FROM vectors WHERE platform = ?")?;
            let rows = stmt.query_map(params![platform], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?;
            for row in rows {
                let (id, embedding_json, metadata_json) = row?;
                collect(id, embedding_json, metadata_json)?;
            }
        } else {
            let mut stmt = self.conn.prepare("SELECT id, embedding, metadata FROM vectors")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })?;
            for row in rows {
                let (id, embedding_json, metadata_json) = row?;
                collect(id, embedding_json, metadata_json)?;
            }
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);

        Ok(results)
    }

    /// Fetches the embedding and metadata for an exact exemplar id, used by
    /// the inference engine's exact-match tier to skip scoring
    /// entirely when a prior identical config snippet is on file.
    pub fn get(&self, id: &str) -> Result<Option<(Embedding, JsonValue)>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT embedding, metadata FROM vectors WHERE id = ?",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| if e == rusqlite::Error::QueryReturnedNoRows { Ok(None) } else { Err(e) })?;

        match row {
            Some((embedding_json, metadata_json)) => {
                let embedding: Embedding = serde_json::from_str(&embedding_json)?;
                let metadata: JsonValue = serde_json::from_str(&metadata_json)?;
                Ok(Some((embedding, metadata)))
            }
            None => Ok(None),
        }
    }

    pub fn delete(&mut self, id: &str) -> Result<()> {
        self.conn.execute("DELETE FROM vectors WHERE id = ?", params![id])?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM vectors", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.conn.execute("DELETE FROM vectors", [])?;
        Ok(())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "embeddings must share dimensionality");
    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot_product
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cosine_similarity_identical_and_orthogonal() {
        let a = vec![0.5, 0.5, 0.5, 0.5];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.01);

        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 0.01);
    }

    #[test]
    fn insert_and_search_orders_by_score() {
        let mut store = SqliteVectorStore::new_in_memory().unwrap();

        let emb1 = vec![1.0, 0.0, 0.0, 0.0];
        let emb2 = vec![0.8, 0.6, 0.0, 0.0];
        let emb3 = vec![0.5, 0.5, 0.5, 0.5];

        store.insert("1", None, &emb1, &json!({"name": "a"})).unwrap();
        store.insert("2", None, &emb2, &json!({"name": "b"})).unwrap();
        store.insert("3", None, &emb3, &json!({"name": "c"})).unwrap();

        let query = vec![0.5, 0.5, 0.5, 0.5];
        let results = store.search(&query, None, 2).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "3");
        assert!(results[0].score > results[1].score);
    }

    #[test]
    fn search_filters_by_platform() {
        let mut store = SqliteVectorStore::new_in_memory().unwrap();
        store.insert("ios-1", Some("IOS-XE"), &vec![1.0, 0.0], &json!({})).unwrap();
        store.insert("nxos-1", Some("NX-OS"), &vec![1.0, 0.0], &json!({})).unwrap();

        let results = store.search(&vec![1.0, 0.0], Some("IOS-XE"), 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "ios-1");
    }

    #[test]
    fn get_returns_none_for_missing_id() {
        let store = SqliteVectorStore::new_in_memory().unwrap();
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn count_delete_clear() {
        let mut store = SqliteVectorStore::new_in_memory().unwrap();
        store.insert("1", None, &vec![0.1], &json!({})).unwrap();
        store.insert("2", None, &vec![0.2], &json!({})).unwrap();
        assert_eq!(store.count().unwrap(), 2);

        store.delete("1").unwrap();
        assert_eq!(store.count().unwrap(), 1);

        store.clear().unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let mut store = SqliteVectorStore::new_in_memory().unwrap();
        store.insert("1", None, &vec![0.1], &json!({"version": 1})).unwrap();
        store.insert("1", None, &vec![0.2], &json!({"version": 2})).unwrap();
        assert_eq!(store.count().unwrap(), 1);

        let (_, metadata) = store.get("1").unwrap().unwrap();
        assert_eq!(metadata["version"], 2);
    }
}
