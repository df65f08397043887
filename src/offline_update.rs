//! Offline update channel. Validates and imports a signed archive (a
//! manifest plus a JSON-lines vulnerability file), streaming upserts through
//! the store's transaction helper, then invalidating affected PSIRT cache
//! entries. Data records carry no exemplar fields, so an import never
//! touches the vector corpus; that's only ever (re)loaded at startup from
//! the separate exemplar corpus file.

use crate::error::{Error, Result};
use crate::models::{LabelsSource, Platform, VulnKind, Vulnerability};
use crate::psirt_cache::PsirtCache;
use crate::store::VulnerabilityStore;
use crate::version;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::io::Read;

#[derive(Debug, serde::Deserialize)]
pub struct Manifest {
    pub file: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub pipeline_version: Option<String>,
}

/// On-disk shape of one line in the data file.
#[derive(Debug, serde::Deserialize)]
struct DataRecord {
    identifier: String,
    kind: String,
    platform: String,
    severity: u8,
    headline: String,
    summary: String,
    #[serde(default)]
    status: String,
    affected_versions: String,
    #[serde(default)]
    fixed_version: Option<String>,
    #[serde(default)]
    hardware_model: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub pipeline_version: Option<String>,
    pub cache_entries_invalidated: usize,
}

const BATCH_SIZE: usize = 500;

/// Reads an archive from `bytes`, validates it, and imports its contents.
/// On any validation failure the store and cache are left untouched: a hash
/// mismatch causes zero changes.
pub fn import_archive(
    bytes: &[u8],
    store: &mut VulnerabilityStore,
    cache: &PsirtCache,
) -> Result<ImportReport> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;

    let manifest: Manifest = {
        let mut file = archive
            .by_name("manifest.json")
            .map_err(|_| Error::Corrupt("archive missing manifest.json".into()))?;
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        serde_json::from_str(&text).map_err(|e| Error::Corrupt(format!("manifest.json is not valid: {e}")))?
    };

    let data_bytes = {
        let mut file = archive
            .by_name(&manifest.file)
            .map_err(|_| Error::Corrupt(format!("manifest references missing data file '{}'", manifest.file)))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        buf
    };

    if let Some(expected) = &manifest.sha256 {
        let actual = hex::encode(Sha256::digest(&data_bytes));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(Error::Corrupt(format!(
                "data file sha256 mismatch: manifest says {expected}, computed {actual}"
            )));
        }
    } else {
        tracing::warn!(file = %manifest.file, "offline update manifest has no sha256; skipping integrity check");
    }

    let text = String::from_utf8(data_bytes).map_err(|e| Error::Corrupt(format!("data file is not valid UTF-8: {e}")))?;
    let records = parse_records(&text)?;

    let mut all_labels = BTreeSet::new();
    let mut imported = 0;
    for batch in records.chunks(BATCH_SIZE) {
        let vulns: Result<Vec<Vulnerability>> = batch.iter().map(to_vulnerability).collect();
        let vulns = vulns?;
        for v in &vulns {
            all_labels.extend(v.labels.iter().cloned());
        }
        store.upsert_batch(&vulns)?;
        imported += vulns.len();
    }

    let cache_entries_invalidated = cache.invalidate_by_labels(&all_labels)?;

    Ok(ImportReport {
        imported,
        pipeline_version: manifest.pipeline_version,
        cache_entries_invalidated,
    })
}

/// Validates an archive without importing it (the `/system/update/validate`
/// admin endpoint). Performs every check `import_archive` does up through
/// hash verification and record parsing, but makes no store/cache writes.
pub fn validate_archive(bytes: &[u8]) -> Result<Manifest> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))?;

    let manifest: Manifest = {
        let mut file = archive
            .by_name("manifest.json")
            .map_err(|_| Error::Corrupt("archive missing manifest.json".into()))?;
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        serde_json::from_str(&text).map_err(|e| Error::Corrupt(format!("manifest.json is not valid: {e}")))?
    };

    let data_bytes = {
        let mut file = archive
            .by_name(&manifest.file)
            .map_err(|_| Error::Corrupt(format!("manifest references missing data file '{}'", manifest.file)))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        buf
    };

    if let Some(expected) = &manifest.sha256 {
        let actual = hex::encode(Sha256::digest(&data_bytes));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(Error::Corrupt(format!(
                "data file sha256 mismatch: manifest says {expected}, computed {actual}"
            )));
        }
    }

    let text = String::from_utf8(data_bytes).map_err(|e| Error::Corrupt(format!("data file is not valid UTF-8: {e}")))?;
    parse_records(&text)?;

    Ok(manifest)
}

fn parse_records(text: &str) -> Result<Vec<DataRecord>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(|e| Error::Corrupt(format!("invalid data record: {e}"))))
        .collect()
}

fn to_vulnerability(record: &DataRecord) -> Result<Vulnerability> {
    let platform = Platform::parse(&record.platform)
        .ok_or_else(|| Error::Corrupt(format!("unknown platform in data record: {}", record.platform)))?;
    let kind = match record.kind.as_str() {
        "psirt" => VulnKind::Psirt,
        "bug" => VulnKind::Bug,
        other => return Err(Error::Corrupt(format!("unknown vulnerability kind: {other}"))),
    };
    let version_pattern = version::classify(&record.affected_versions)
        .map_err(|e| Error::Corrupt(format!("invalid affected_versions '{}': {e}", record.affected_versions)))?;

    Ok(Vulnerability {
        identifier: record.identifier.clone(),
        kind,
        platform,
        severity: record.severity,
        headline: record.headline.clone(),
        summary: record.summary.clone(),
        url: record.url.clone(),
        status: if record.status.is_empty() { "open".to_string() } else { record.status.clone() },
        hardware_model: record.hardware_model.clone(),
        affected_versions_raw: record.affected_versions.clone(),
        version_pattern,
        fixed_version: record.fixed_version.clone(),
        labels: record.labels.iter().cloned().collect(),
        labels_source: LabelsSource::Manual,
        last_modified: chrono::Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_archive(manifest_json: &str, data_file_name: &str, data_contents: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let options = zip::write::FileOptions::default();
            writer.start_file("manifest.json", options).unwrap();
            writer.write_all(manifest_json.as_bytes()).unwrap();
            writer.start_file(data_file_name, options).unwrap();
            writer.write_all(data_contents).unwrap();
            writer.finish().unwrap();
        }
        buf
    }

    fn sample_data_line() -> String {
        serde_json::json!({
            "identifier": "CSCab1234",
            "kind": "bug",
            "platform": "IOS-XE",
            "severity": 2,
            "headline": "test bug",
            "summary": "summary text",
            "status": "open",
            "affected_versions": "17.10.x",
            "labels": ["MGMT_SSH_HTTP"],
        })
        .to_string()
    }

    #[test]
    fn successful_import_with_matching_hash_lands_records() {
        let data = sample_data_line();
        let hash = hex::encode(Sha256::digest(data.as_bytes()));
        let manifest = serde_json::json!({"file": "data.jsonl", "sha256": hash}).to_string();
        let archive = build_archive(&manifest, "data.jsonl", data.as_bytes());

        let mut store = VulnerabilityStore::open_in_memory().unwrap();
        let cache = PsirtCache::open_in_memory().unwrap();
        let report = import_archive(&archive, &mut store, &cache).unwrap();

        assert_eq!(report.imported, 1);
        assert!(store.get(VulnKind::Bug, "CSCab1234").unwrap().is_some());
    }

    #[test]
    fn hash_mismatch_causes_zero_changes() {
        let data = sample_data_line();
        let manifest = serde_json::json!({"file": "data.jsonl", "sha256": "0".repeat(64)}).to_string();
        let archive = build_archive(&manifest, "data.jsonl", data.as_bytes());

        let mut store = VulnerabilityStore::open_in_memory().unwrap();
        let cache = PsirtCache::open_in_memory().unwrap();
        let before = store.count().unwrap();
        let result = import_archive(&archive, &mut store, &cache);

        assert!(result.is_err());
        assert_eq!(store.count().unwrap(), before);
    }

    #[test]
    fn missing_sha256_is_allowed_and_logged() {
        let data = sample_data_line();
        let manifest = serde_json::json!({"file": "data.jsonl"}).to_string();
        let archive = build_archive(&manifest, "data.jsonl", data.as_bytes());

        let mut store = VulnerabilityStore::open_in_memory().unwrap();
        let cache = PsirtCache::open_in_memory().unwrap();
        let report = import_archive(&archive, &mut store, &cache).unwrap();
        assert_eq!(report.imported, 1);
    }

    #[test]
    fn missing_data_file_referenced_by_manifest_is_corrupt() {
        let manifest = serde_json::json!({"file": "nonexistent.jsonl"}).to_string();
        let archive = build_archive(&manifest, "data.jsonl", sample_data_line().as_bytes());

        let mut store = VulnerabilityStore::open_in_memory().unwrap();
        let cache = PsirtCache::open_in_memory().unwrap();
        assert!(import_archive(&archive, &mut store, &cache).is_err());
    }

    #[test]
    fn reimporting_same_archive_is_idempotent() {
        let data = sample_data_line();
        let hash = hex::encode(Sha256::digest(data.as_bytes()));
        let manifest = serde_json::json!({"file": "data.jsonl", "sha256": hash}).to_string();
        let archive = build_archive(&manifest, "data.jsonl", data.as_bytes());

        let mut store = VulnerabilityStore::open_in_memory().unwrap();
        let cache = PsirtCache::open_in_memory().unwrap();
        import_archive(&archive, &mut store, &cache).unwrap();
        let count_after_first = store.count().unwrap();
        import_archive(&archive, &mut store, &cache).unwrap();
        assert_eq!(store.count().unwrap(), count_after_first);
    }
}
