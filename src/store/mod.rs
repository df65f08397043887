//! Persistent vulnerability catalog: a single on-disk SQLite
//! database with indexes on platform, (platform, major, minor, patch) via
//! `VersionIndex`, label via `LabelIndex`, and hardware_model. Every access
//! goes through `connection::with_transaction`.

pub mod connection;

use crate::error::{Error, Result};
use crate::models::{LabelsSource, Platform, VulnKind, Vulnerability};
use crate::version;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeSet;
use std::path::Path;

pub struct VulnerabilityStore {
    conn: Connection,
}

impl VulnerabilityStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vulnerabilities (
                identifier TEXT NOT NULL,
                kind TEXT NOT NULL,
                platform TEXT NOT NULL,
                severity INTEGER NOT NULL,
                headline TEXT NOT NULL,
                summary TEXT NOT NULL,
                url TEXT,
                status TEXT NOT NULL,
                hardware_model TEXT,
                affected_versions_raw TEXT NOT NULL,
                version_pattern_json TEXT NOT NULL,
                fixed_version TEXT,
                labels_source TEXT NOT NULL,
                last_modified TEXT NOT NULL,
                PRIMARY KEY (kind, identifier)
            );
            CREATE INDEX IF NOT EXISTS idx_vuln_platform ON vulnerabilities(platform);
            CREATE INDEX IF NOT EXISTS idx_vuln_hardware ON vulnerabilities(hardware_model);

            CREATE TABLE IF NOT EXISTS label_index (
                kind TEXT NOT NULL,
                identifier TEXT NOT NULL,
                label TEXT NOT NULL,
                PRIMARY KEY (kind, identifier, label)
            );
            CREATE INDEX IF NOT EXISTS idx_label_index_label ON label_index(label);

            CREATE TABLE IF NOT EXISTS version_index (
                kind TEXT NOT NULL,
                identifier TEXT NOT NULL,
                major INTEGER NOT NULL,
                minor INTEGER NOT NULL,
                patch INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_version_index_mmp ON version_index(major, minor, patch);
            CREATE INDEX IF NOT EXISTS idx_version_index_id ON version_index(kind, identifier);
            ",
        )?;
        Ok(())
    }

    /// Upsert: key = (kind, identifier). Replaces all fields and rebuilds
    /// `LabelIndex`/`VersionIndex` rows for that vulnerability atomically.
    pub fn upsert(&mut self, vuln: &Vulnerability) -> Result<()> {
        connection::with_transaction(&mut self.conn, |tx| upsert_tx(tx, vuln))
    }

    pub fn upsert_batch(&mut self, vulns: &[Vulnerability]) -> Result<()> {
        connection::with_transaction(&mut self.conn, |tx| {
            for v in vulns {
                upsert_tx(tx, v)?;
            }
            Ok(())
        })
    }

    pub fn get(&self, kind: VulnKind, identifier: &str) -> Result<Option<Vulnerability>> {
        connection::retry_on_lock(|| get_row(&self.conn, kind, identifier))
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM vulnerabilities", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// Coarse pre-filter: candidates whose
    /// `VersionIndex` rows intersect the device's (major, minor, patch).
    /// Patterns with an unbounded dimension (`Wildcard` and the open-ended
    /// trains) have no rows here at all; `candidates_with_open_pattern`
    /// covers those instead.
    pub fn candidates_by_version_point(
        &self,
        platform: Platform,
        major: u32,
        minor: u32,
        patch: u32,
    ) -> Result<Vec<Vulnerability>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT v.kind, v.identifier FROM vulnerabilities v
             JOIN version_index vi ON vi.kind = v.kind AND vi.identifier = v.identifier
             WHERE v.platform = ?1 AND (
                vi.major = ?2 AND vi.minor = ?3 AND vi.patch = ?4
             )",
        )?;
        let rows = stmt.query_map(params![platform.as_str(), major, minor, patch], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (kind_s, identifier) = row?;
            let kind = parse_kind(&kind_s)?;
            if let Some(v) = get_row(&self.conn, kind, &identifier)? {
                out.push(v);
            }
        }
        Ok(out)
    }

    /// Every vulnerability for a platform whose pattern has no finite
    /// (major,minor,patch) enumeration - `OpenLater`/`OpenEarlier` (unbounded
    /// patch), `MinorWildcard`/`MajorWildcard` (unbounded minor or both), and
    /// `Wildcard` (fixed major.minor, but patch ranges over all of u32) - so
    /// the scanner always re-evaluates them precisely regardless of the
    /// device's exact triple instead of relying on `VersionIndex` rows.
    pub fn candidates_with_open_pattern(&self, platform: Platform) -> Result<Vec<Vulnerability>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, identifier FROM vulnerabilities WHERE platform = ?1 AND version_pattern_json LIKE '%OpenLater%'
                OR (platform = ?1 AND version_pattern_json LIKE '%MinorWildcard%')
                OR (platform = ?1 AND version_pattern_json LIKE '%MajorWildcard%')
                OR (platform = ?1 AND version_pattern_json LIKE '%OpenEarlier%')
                OR (platform = ?1 AND version_pattern_json LIKE '%\"kind\":\"Wildcard\"%')",
        )?;
        let rows = stmt.query_map(params![platform.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (kind_s, identifier) = row?;
            let kind = parse_kind(&kind_s)?;
            if let Some(v) = get_row(&self.conn, kind, &identifier)? {
                out.push(v);
            }
        }
        Ok(out)
    }

    pub fn labels_for(&self, kind: VulnKind, identifier: &str) -> Result<BTreeSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT label FROM label_index WHERE kind = ?1 AND identifier = ?2")?;
        let rows = stmt.query_map(params![kind_str(kind), identifier], |row| row.get::<_, String>(0))?;
        let mut labels = BTreeSet::new();
        for r in rows {
            labels.insert(r?);
        }
        Ok(labels)
    }

    pub fn delete(&mut self, kind: VulnKind, identifier: &str) -> Result<()> {
        connection::with_transaction(&mut self.conn, |tx| {
            tx.execute(
                "DELETE FROM vulnerabilities WHERE kind = ?1 AND identifier = ?2",
                params![kind_str(kind), identifier],
            )?;
            tx.execute(
                "DELETE FROM label_index WHERE kind = ?1 AND identifier = ?2",
                params![kind_str(kind), identifier],
            )?;
            tx.execute(
                "DELETE FROM version_index WHERE kind = ?1 AND identifier = ?2",
                params![kind_str(kind), identifier],
            )?;
            Ok(())
        })
    }
}

fn kind_str(kind: VulnKind) -> &'static str {
    match kind {
        VulnKind::Psirt => "psirt",
        VulnKind::Bug => "bug",
    }
}

fn parse_kind(s: &str) -> Result<VulnKind> {
    match s {
        "psirt" => Ok(VulnKind::Psirt),
        "bug" => Ok(VulnKind::Bug),
        other => Err(Error::Internal(format!("corrupt kind column: {other}"))),
    }
}

fn upsert_tx(tx: &Transaction, vuln: &Vulnerability) -> rusqlite::Result<()> {
    let kind = kind_str(vuln.kind);
    tx.execute(
        "INSERT INTO vulnerabilities (
            identifier, kind, platform, severity, headline, summary, url, status,
            hardware_model, affected_versions_raw, version_pattern_json, fixed_version,
            labels_source, last_modified
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)
        ON CONFLICT(kind, identifier) DO UPDATE SET
            platform = excluded.platform,
            severity = excluded.severity,
            headline = excluded.headline,
            summary = excluded.summary,
            url = excluded.url,
            status = excluded.status,
            hardware_model = excluded.hardware_model,
            affected_versions_raw = excluded.affected_versions_raw,
            version_pattern_json = excluded.version_pattern_json,
            fixed_version = excluded.fixed_version,
            labels_source = excluded.labels_source,
            last_modified = excluded.last_modified",
        params![
            vuln.identifier,
            kind,
            vuln.platform.as_str(),
            vuln.severity,
            vuln.headline,
            vuln.summary,
            vuln.url,
            vuln.status,
            vuln.hardware_model,
            vuln.affected_versions_raw,
            serde_json::to_string(&vuln.version_pattern).unwrap_or_default(),
            vuln.fixed_version,
            labels_source_str(vuln.labels_source),
            vuln.last_modified.to_rfc3339(),
        ],
    )?;

    tx.execute(
        "DELETE FROM label_index WHERE kind = ?1 AND identifier = ?2",
        params![kind, vuln.identifier],
    )?;
    for label in &vuln.labels {
        tx.execute(
            "INSERT OR IGNORE INTO label_index (kind, identifier, label) VALUES (?1, ?2, ?3)",
            params![kind, vuln.identifier, label],
        )?;
    }

    tx.execute(
        "DELETE FROM version_index WHERE kind = ?1 AND identifier = ?2",
        params![kind, vuln.identifier],
    )?;
    for (major, minor, patch) in expand_version_index(&vuln.version_pattern) {
        tx.execute(
            "INSERT INTO version_index (kind, identifier, major, minor, patch) VALUES (?1,?2,?3,?4,?5)",
            params![kind, vuln.identifier, major, minor, patch],
        )?;
    }

    Ok(())
}

fn labels_source_str(source: LabelsSource) -> &'static str {
    match source {
        LabelsSource::Frontier => "frontier",
        LabelsSource::Model => "model",
        LabelsSource::Manual => "manual",
        LabelsSource::Heuristic => "heuristic",
    }
}

/// Pre-computes the concrete (major, minor, patch) rows a pattern covers,
/// used as the coarse pre-filter ahead of precise `is_affected` evaluation.
/// Only `Explicit` enumerates to a finite set of rows; every other pattern's
/// patch (and, for some, minor/major) dimension is unbounded and is instead
/// picked up by `candidates_with_open_pattern`, so they return no rows here.
fn expand_version_index(pattern: &version::Pattern) -> Vec<(u32, u32, u32)> {
    match pattern {
        version::Pattern::Explicit { versions } => {
            versions.iter().map(|v| (v.major, v.minor, v.patch)).collect()
        }
        version::Pattern::Wildcard { .. }
        | version::Pattern::MajorWildcard { .. }
        | version::Pattern::OpenLater { .. }
        | version::Pattern::OpenEarlier { .. }
        | version::Pattern::MinorWildcard { .. } => Vec::new(),
    }
}

fn get_row(conn: &Connection, kind: VulnKind, identifier: &str) -> rusqlite::Result<Option<Vulnerability>> {
    let row = conn
        .query_row(
            "SELECT identifier, kind, platform, severity, headline, summary, url, status,
                    hardware_model, affected_versions_raw, version_pattern_json, fixed_version,
                    labels_source, last_modified
             FROM vulnerabilities WHERE kind = ?1 AND identifier = ?2",
            params![kind_str(kind), identifier],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u8>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, Option<String>>(11)?,
                    row.get::<_, String>(12)?,
                    row.get::<_, String>(13)?,
                ))
            },
        )
        .optional()?;

    let row = match row {
        Some(r) => r,
        None => return Ok(None),
    };

    let (
        identifier, kind_s, platform_s, severity, headline, summary, url, status,
        hardware_model, affected_versions_raw, pattern_json, fixed_version, labels_source_s, last_modified_s,
    ) = row;

    let platform = Platform::parse(&platform_s).ok_or(rusqlite::Error::InvalidColumnType(
        2,
        "platform".into(),
        rusqlite::types::Type::Text,
    ))?;
    let version_pattern: version::Pattern = serde_json::from_str(&pattern_json)
        .map_err(|_| rusqlite::Error::InvalidColumnType(10, "version_pattern_json".into(), rusqlite::types::Type::Text))?;
    let labels_source = match labels_source_s.as_str() {
        "frontier" => LabelsSource::Frontier,
        "model" => LabelsSource::Model,
        "manual" => LabelsSource::Manual,
        _ => LabelsSource::Heuristic,
    };
    let last_modified = chrono::DateTime::parse_from_rfc3339(&last_modified_s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now());

    let mut labels_stmt = conn.prepare("SELECT label FROM label_index WHERE kind = ?1 AND identifier = ?2")?;
    let labels = labels_stmt
        .query_map(params![kind_s, identifier], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<BTreeSet<String>>>()?;

    Ok(Some(Vulnerability {
        identifier,
        kind: parse_kind(&kind_s).unwrap_or(kind),
        platform,
        severity,
        headline,
        summary,
        url,
        status,
        hardware_model,
        affected_versions_raw,
        version_pattern,
        fixed_version,
        labels,
        labels_source,
        last_modified,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VulnKind;
    use crate::version;
    use std::collections::BTreeSet;

    fn sample(identifier: &str, raw: &str, hardware: Option<&str>, labels: &[&str]) -> Vulnerability {
        Vulnerability {
            identifier: identifier.to_string(),
            kind: VulnKind::Bug,
            platform: Platform::IosXe,
            severity: 2,
            headline: "test bug".into(),
            summary: "summary".into(),
            url: None,
            status: "open".into(),
            hardware_model: hardware.map(|s| s.to_string()),
            affected_versions_raw: raw.to_string(),
            version_pattern: version::classify(raw).unwrap(),
            fixed_version: None,
            labels: labels.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            labels_source: LabelsSource::Manual,
            last_modified: chrono::Utc::now(),
        }
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let mut store = VulnerabilityStore::open_in_memory().unwrap();
        let v = sample("CSCab1234", "17.10.1 17.12.4", None, &["MGMT_SSH_HTTP"]);
        store.upsert(&v).unwrap();
        let fetched = store.get(VulnKind::Bug, "CSCab1234").unwrap().unwrap();
        assert_eq!(fetched.identifier, "CSCab1234");
        assert_eq!(fetched.labels.len(), 1);
    }

    #[test]
    fn upsert_replaces_fields_and_rebuilds_indexes() {
        let mut store = VulnerabilityStore::open_in_memory().unwrap();
        let mut v = sample("CSCab1234", "17.10.x", None, &["A"]);
        store.upsert(&v).unwrap();
        v.labels = ["B"].iter().map(|s| s.to_string()).collect();
        v.severity = 1;
        store.upsert(&v).unwrap();

        let fetched = store.get(VulnKind::Bug, "CSCab1234").unwrap().unwrap();
        assert_eq!(fetched.severity, 1);
        assert!(fetched.labels.contains("B"));
        assert!(!fetched.labels.contains("A"));
    }

    #[test]
    fn version_index_point_lookup_finds_explicit_and_wildcard() {
        let mut store = VulnerabilityStore::open_in_memory().unwrap();
        store.upsert(&sample("CSCexplicit", "17.10.1 17.12.4", None, &[])).unwrap();
        store.upsert(&sample("CScwildcard", "17.10.x", None, &[])).unwrap();
        store.upsert(&sample("CScother", "17.11.x", None, &[])).unwrap();

        // Mirrors how the scanner combines the two candidate sources: the
        // point lookup alone misses `Wildcard` rows, since their patch
        // dimension is unbounded and they carry no `VersionIndex` rows at all.
        let mut candidates = store.candidates_by_version_point(Platform::IosXe, 17, 10, 1).unwrap();
        candidates.extend(store.candidates_with_open_pattern(Platform::IosXe).unwrap());
        let ids: BTreeSet<_> = candidates.iter().map(|v| v.identifier.clone()).collect();
        assert!(ids.contains("CSCexplicit"));
        assert!(ids.contains("CScwildcard"));
        assert!(!ids.contains("CScother"));
    }

    #[test]
    fn wildcard_candidate_surfaces_for_any_patch_via_open_pattern_path() {
        let mut store = VulnerabilityStore::open_in_memory().unwrap();
        store.upsert(&sample("CScwildcard", "17.10.x", None, &[])).unwrap();

        // Patch=1 has no VersionIndex row for a Wildcard pattern at all; it
        // must still surface through the open-pattern path, not the point lookup.
        assert!(store.candidates_by_version_point(Platform::IosXe, 17, 10, 1).unwrap().is_empty());
        let open = store.candidates_with_open_pattern(Platform::IosXe).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].identifier, "CScwildcard");
    }

    #[test]
    fn open_pattern_candidates_returned_regardless_of_point() {
        let mut store = VulnerabilityStore::open_in_memory().unwrap();
        store.upsert(&sample("CScopen", "17.10 and later", None, &[])).unwrap();
        let open = store.candidates_with_open_pattern(Platform::IosXe).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].identifier, "CScopen");
    }

    #[test]
    fn delete_removes_all_index_rows() {
        let mut store = VulnerabilityStore::open_in_memory().unwrap();
        store.upsert(&sample("CSCdel", "17.10.x", None, &["A"])).unwrap();
        store.delete(VulnKind::Bug, "CSCdel").unwrap();
        assert!(store.get(VulnKind::Bug, "CSCdel").unwrap().is_none());
        assert!(store.labels_for(VulnKind::Bug, "CSCdel").unwrap().is_empty());
    }
}
