//! Cross-module coverage of the offline update channel: an import must land
//! atomically in the vulnerability store, invalidate the right PSIRT cache
//! entries, and the newly imported record must be immediately visible to
//! the scan pipeline.

use chrono::Utc;
use cisco_vuln_scanner::inventory::DeviceStore;
use cisco_vuln_scanner::models::{ConfidenceSource, Platform, PsirtCacheEntry, VulnKind};
use cisco_vuln_scanner::offline_update::import_archive;
use cisco_vuln_scanner::psirt_cache::PsirtCache;
use cisco_vuln_scanner::scanner::{ScanRequest, Scanner};
use cisco_vuln_scanner::store::VulnerabilityStore;
use sha2::{Digest, Sha256};
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

fn cached_entry() -> PsirtCacheEntry {
    PsirtCacheEntry {
        advisory_id: "cisco-sa-snmp-dos".to_string(),
        platform: Platform::IosXe,
        labels: ["MGMT_SNMP".to_string()].into_iter().collect(),
        confidence: 0.9,
        confidence_source: ConfidenceSource::Model,
        needs_review: false,
        timestamp: Utc::now(),
    }
}

#[test]
fn import_invalidates_cache_and_is_immediately_scannable() {
    let mut store = VulnerabilityStore::open_in_memory().unwrap();
    let cache = PsirtCache::open_in_memory().unwrap();
    assert!(cache.put_if_eligible(&cached_entry()).unwrap());

    let data_line = serde_json::json!({
        "identifier": "cisco-sa-snmp-dos",
        "kind": "psirt",
        "platform": "IOS-XE",
        "severity": 1,
        "headline": "SNMP denial of service",
        "summary": "crafted SNMP packet causes a reload",
        "status": "open",
        "affected_versions": "17.9.1-17.9.4",
        "labels": ["MGMT_SNMP"],
    })
    .to_string();
    let hash = hex::encode(Sha256::digest(data_line.as_bytes()));
    let manifest = serde_json::json!({"file": "data.jsonl", "sha256": hash, "pipeline_version": "2026.07.1"}).to_string();
    let archive = build_archive(&manifest, "data.jsonl", data_line.as_bytes());

    let report = import_archive(&archive, &mut store, &cache).unwrap();
    assert_eq!(report.imported, 1);
    assert_eq!(report.cache_entries_invalidated, 1, "stale cache entry for the same label must be dropped");
    assert!(cache.get("cisco-sa-snmp-dos", Platform::IosXe).unwrap().is_none());

    let scanner = Scanner::new(&store);
    let result = scanner.scan(Platform::IosXe, "17.9.2", &ScanRequest::default()).unwrap();
    assert!(result.critical_high.iter().any(|v| v.identifier == "cisco-sa-snmp-dos"));
}

#[test]
fn hash_mismatch_leaves_store_and_cache_untouched() {
    let mut store = VulnerabilityStore::open_in_memory().unwrap();
    let cache = PsirtCache::open_in_memory().unwrap();
    assert!(cache.put_if_eligible(&cached_entry()).unwrap());
    let count_before = store.count().unwrap();
    let cache_stats_before = cache.stats().unwrap().entries;

    let data_line = serde_json::json!({
        "identifier": "cisco-sa-snmp-dos",
        "kind": "psirt",
        "platform": "IOS-XE",
        "severity": 1,
        "headline": "SNMP denial of service",
        "summary": "crafted SNMP packet causes a reload",
        "affected_versions": "17.9.1-17.9.4",
        "labels": ["MGMT_SNMP"],
    })
    .to_string();
    let manifest = serde_json::json!({"file": "data.jsonl", "sha256": "f".repeat(64)}).to_string();
    let archive = build_archive(&manifest, "data.jsonl", data_line.as_bytes());

    assert!(import_archive(&archive, &mut store, &cache).is_err());
    assert_eq!(store.count().unwrap(), count_before);
    assert_eq!(cache.stats().unwrap().entries, cache_stats_before);
}

#[test]
fn device_store_and_vulnerability_store_share_a_database_file_safely() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("shared.db");

    let store = VulnerabilityStore::open(&db_path).unwrap();
    let devices = DeviceStore::open(&db_path).unwrap();
    assert_eq!(store.count().unwrap(), 0);
    assert_eq!(devices.list_devices().unwrap().len(), 0);

    let device = cisco_vuln_scanner::models::Device::new_pending("dev-1".into(), "10.0.0.1".into());
    devices.put_device(&device).unwrap();
    assert_eq!(devices.get_device("dev-1").unwrap().unwrap().host, "10.0.0.1");
    assert!(store.get(VulnKind::Psirt, "nonexistent").unwrap().is_none());
}
