//! SQLite-backed vector storage for labeled exemplars. No
//! vector database dependency is introduced: brute-force cosine similarity
//! over a few thousand exemplars is well within the per-request budget.

pub mod sqlite;

pub use sqlite::SqliteVectorStore;

use serde_json::Value as JsonValue;

/// One exemplar match with its similarity score and stored metadata.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub id: String,
    pub score: f32,
    pub metadata: JsonValue,
}
