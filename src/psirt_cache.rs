//! Persistent PSIRT label cache.
//! Keyed by (advisory_id, platform). The caching *policy* - which results
//! are allowed to land here - lives in `inference.rs`; this module only
//! enforces that `source = heuristic` or `confidence < 0.75` can never be
//! written, as a second line of defense.

use crate::error::Result;
use crate::models::{ConfidenceSource, Platform, PsirtCacheEntry};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;

const MIN_CACHEABLE_CONFIDENCE: f32 = 0.75;

pub struct PsirtCache {
    conn: Mutex<Connection>,
}

impl PsirtCache {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = crate::store::connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = crate::store::connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS psirt_cache (
                advisory_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                labels_json TEXT NOT NULL,
                confidence REAL NOT NULL,
                confidence_source TEXT NOT NULL,
                needs_review INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                PRIMARY KEY (advisory_id, platform)
            )",
            [],
        )?;
        Ok(())
    }

    pub fn get(&self, advisory_id: &str, platform: Platform) -> Result<Option<PsirtCacheEntry>> {
        let conn = self.conn.lock().expect("psirt cache lock poisoned");
        let row: Option<(String, f32, String, i64, String)> = conn
            .query_row(
                "SELECT labels_json, confidence, confidence_source, needs_review, timestamp
                 FROM psirt_cache WHERE advisory_id = ?1 AND platform = ?2",
                params![advisory_id, platform.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;

        let Some((labels_json, confidence, source_s, needs_review, timestamp_s)) = row else {
            return Ok(None);
        };

        let labels: BTreeSet<String> = serde_json::from_str(&labels_json)?;
        let confidence_source = parse_source(&source_s);
        let timestamp = DateTime::parse_from_rfc3339(&timestamp_s)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(Some(PsirtCacheEntry {
            advisory_id: advisory_id.to_string(),
            platform,
            labels,
            confidence,
            confidence_source,
            needs_review: needs_review != 0,
            timestamp,
        }))
    }

    /// Writes an entry only if it satisfies the caching policy. Any other
    /// entry is silently skipped - callers that need to know why should
    /// check `inference::is_cacheable` themselves before calling.
    pub fn put_if_eligible(&self, entry: &PsirtCacheEntry) -> Result<bool> {
        if entry.confidence_source != ConfidenceSource::Model || entry.confidence < MIN_CACHEABLE_CONFIDENCE {
            return Ok(false);
        }
        let conn = self.conn.lock().expect("psirt cache lock poisoned");
        conn.execute(
            "INSERT INTO psirt_cache (advisory_id, platform, labels_json, confidence, confidence_source, needs_review, timestamp)
             VALUES (?1,?2,?3,?4,?5,?6,?7)
             ON CONFLICT(advisory_id, platform) DO UPDATE SET
                labels_json = excluded.labels_json,
                confidence = excluded.confidence,
                confidence_source = excluded.confidence_source,
                needs_review = excluded.needs_review,
                timestamp = excluded.timestamp",
            params![
                entry.advisory_id,
                entry.platform.as_str(),
                serde_json::to_string(&entry.labels)?,
                entry.confidence,
                source_str(entry.confidence_source),
                entry.needs_review as i64,
                entry.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(true)
    }

    /// Invalidates cache entries whose labels may have changed after an
    /// offline-update import. A conservative invalidation by
    /// label: any cached entry that references one of the given labels is
    /// dropped so the next `analyze` call re-derives it.
    pub fn invalidate_by_labels(&self, labels: &BTreeSet<String>) -> Result<usize> {
        if labels.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().expect("psirt cache lock poisoned");
        let mut stmt = conn.prepare("SELECT advisory_id, platform, labels_json FROM psirt_cache")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut to_delete = Vec::new();
        for row in rows {
            let (advisory_id, platform, labels_json) = row?;
            let entry_labels: BTreeSet<String> = serde_json::from_str(&labels_json).unwrap_or_default();
            if !entry_labels.is_disjoint(labels) {
                to_delete.push((advisory_id, platform));
            }
        }
        for (advisory_id, platform) in &to_delete {
            conn.execute(
                "DELETE FROM psirt_cache WHERE advisory_id = ?1 AND platform = ?2",
                params![advisory_id, platform],
            )?;
        }
        Ok(to_delete.len())
    }

    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().expect("psirt cache lock poisoned");
        conn.execute("DELETE FROM psirt_cache", [])?;
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let conn = self.conn.lock().expect("psirt cache lock poisoned");
        let entries: i64 = conn.query_row("SELECT COUNT(*) FROM psirt_cache", [], |r| r.get(0))?;
        let needs_review: i64 =
            conn.query_row("SELECT COUNT(*) FROM psirt_cache WHERE needs_review = 1", [], |r| r.get(0))?;
        Ok(CacheStats { entries: entries as usize, needs_review: needs_review as usize })
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub needs_review: usize,
}

fn source_str(source: ConfidenceSource) -> &'static str {
    match source {
        ConfidenceSource::Model => "model",
        ConfidenceSource::Heuristic => "heuristic",
        ConfidenceSource::Exact => "exact",
        ConfidenceSource::Cache => "cache",
    }
}

fn parse_source(s: &str) -> ConfidenceSource {
    match s {
        "model" => ConfidenceSource::Model,
        "exact" => ConfidenceSource::Exact,
        "cache" => ConfidenceSource::Cache,
        _ => ConfidenceSource::Heuristic,
    }
}
