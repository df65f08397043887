//! Device inventory and scan coordinator. Owns device records
//! and their last two scan results, runs single-device and bulk scans via
//! the scanner, and derives before/after and version-to-version
//! comparisons. Bulk dispatch uses a bounded `rayon` pool so a large fleet
//! scan never oversubscribes the store's connection.

use crate::device_verifier::{self, DeviceCredentials, DeviceVerifier};
use crate::error::{Error, Result};
use crate::models::{Device, DeviceStatus, Platform, ScanResult, Vulnerability};
use crate::scanner::{ScanRequest, Scanner};
use crate::store::VulnerabilityStore;
use chrono::Utc;
use rayon::prelude::*;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

const MAX_BULK_CONCURRENCY: usize = 8;

pub struct DeviceStore {
    conn: Mutex<Connection>,
}

impl DeviceStore {
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
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS devices (id TEXT PRIMARY KEY, data TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS scans (scan_id TEXT PRIMARY KEY, device_id TEXT NOT NULL, data TEXT NOT NULL);
             CREATE INDEX IF NOT EXISTS idx_scans_device ON scans(device_id);",
        )?;
        Ok(())
    }

    pub fn put_device(&self, device: &Device) -> Result<()> {
        let conn = self.conn.lock().expect("device store lock poisoned");
        conn.execute(
            "INSERT INTO devices (id, data) VALUES (?1, ?2) ON CONFLICT(id) DO UPDATE SET data = excluded.data",
            params![device.id, serde_json::to_string(device)?],
        )?;
        Ok(())
    }

    pub fn get_device(&self, id: &str) -> Result<Option<Device>> {
        let conn = self.conn.lock().expect("device store lock poisoned");
        let data: Option<String> =
            conn.query_row("SELECT data FROM devices WHERE id = ?1", params![id], |r| r.get(0)).optional()?;
        Ok(data.map(|d| serde_json::from_str(&d)).transpose()?)
    }

    pub fn list_devices(&self) -> Result<Vec<Device>> {
        let conn = self.conn.lock().expect("device store lock poisoned");
        let mut stmt = conn.prepare("SELECT data FROM devices")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut devices = Vec::new();
        for row in rows {
            devices.push(serde_json::from_str(&row?)?);
        }
        Ok(devices)
    }

    pub fn delete_device(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("device store lock poisoned");
        conn.execute("DELETE FROM devices WHERE id = ?1", params![id])?;
        conn.execute("DELETE FROM scans WHERE device_id = ?1", params![id])?;
        Ok(())
    }

    pub fn put_scan(&self, device_id: &str, scan: &ScanResult) -> Result<()> {
        let conn = self.conn.lock().expect("device store lock poisoned");
        conn.execute(
            "INSERT INTO scans (scan_id, device_id, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(scan_id) DO UPDATE SET data = excluded.data",
            params![scan.scan_id, device_id, serde_json::to_string(scan)?],
        )?;
        Ok(())
    }

    pub fn get_scan(&self, scan_id: &str) -> Result<Option<ScanResult>> {
        let conn = self.conn.lock().expect("device store lock poisoned");
        let data: Option<String> =
            conn.query_row("SELECT data FROM scans WHERE scan_id = ?1", params![scan_id], |r| r.get(0)).optional()?;
        Ok(data.map(|d| serde_json::from_str(&d)).transpose()?)
    }
}

/// Severity-bucketed diff between two scans. "fixed" only in `previous`,
/// "new" only in `current`, "unchanged" in both, each keyed by the
/// vulnerability's identifier.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScanComparison {
    pub fixed: Vec<Vulnerability>,
    pub new: Vec<Vulnerability>,
    pub unchanged: Vec<Vulnerability>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionComparison {
    pub comparison: ScanComparison,
    pub risk_score: i64,
    pub recommendation: RiskLevel,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct BulkScanOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Result of a single discovery attempt against a registered device. A
/// failed attempt still returns `Ok` with `success: false`, since the
/// updated failure count and status on `device` are themselves the useful
/// result, not an exceptional condition.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DiscoverOutcome {
    pub device: Device,
    pub success: bool,
    pub error: Option<String>,
    pub next_retry_secs: Option<u64>,
}

/// External inventory collaborator. The wire format
/// of the remote system is out of scope; only that imported devices land in
/// inventory with status `pending`.
#[derive(Debug, Clone)]
pub struct ImportedDevice {
    pub id: String,
    pub host: String,
}

#[async_trait::async_trait]
pub trait IseInventorySource: Send + Sync {
    async fn fetch_devices(&self) -> Result<Vec<ImportedDevice>>;
}

pub struct IseHttpSource {
    client: reqwest::Client,
    endpoint: String,
}

impl IseHttpSource {
    pub fn new(client: reqwest::Client, endpoint: String) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait::async_trait]
impl IseInventorySource for IseHttpSource {
    async fn fetch_devices(&self) -> Result<Vec<ImportedDevice>> {
        #[derive(serde::Deserialize)]
        struct RemoteDevice {
            id: String,
            host: String,
        }
        let response = self.client.get(&self.endpoint).send().await?;
        let devices: Vec<RemoteDevice> = response.json().await?;
        Ok(devices.into_iter().map(|d| ImportedDevice { id: d.id, host: d.host }).collect())
    }
}

pub struct InventoryCoordinator<'s> {
    devices: &'s DeviceStore,
    vulns: &'s VulnerabilityStore,
}

impl<'s> InventoryCoordinator<'s> {
    pub fn new(devices: &'s DeviceStore, vulns: &'s VulnerabilityStore) -> Self {
        Self { devices, vulns }
    }

    /// Runs a scan against a registered device's known platform/version/
    /// hardware/features and rotates current -> previous.
    pub fn scan_device(&self, device_id: &str, req: &ScanRequest) -> Result<ScanResult> {
        let mut device = self.devices.get_device(device_id)?.ok_or_else(|| Error::NotFound(format!("device {device_id}")))?;
        let platform = device.platform.ok_or_else(|| Error::BadInput("device has no known platform yet".into()))?;
        let version = device.version.clone().ok_or_else(|| Error::BadInput("device has no known version yet".into()))?;

        let scanner = Scanner::new(self.vulns);
        let mut merged = req.clone();
        if merged.hardware.is_none() {
            merged.hardware = device.hardware_model.clone();
        }
        if merged.features.is_none() {
            merged.features = device.features.clone();
        }

        let mut result = scanner.scan(platform, &version, &merged)?;
        result.device_id = Some(device_id.to_string());

        self.devices.put_scan(device_id, &result)?;
        device.record_scan(result.scan_id.clone());
        self.devices.put_device(&device)?;

        Ok(result)
    }

    /// Runs `DeviceVerifier::verify` against a registered device and
    /// records the outcome: on success the device's platform/version/
    /// hardware/features move from unknown to `Discovered`, consecutive
    /// failures reset, and `last_discovered_at` is stamped. On failure the
    /// failure counter increments and the device's status follows the
    /// verifier's retry schedule (`Failed` while retries remain, `Stale`
    /// once `device_verifier::FAILURES_BEFORE_STALE` is reached).
    pub fn discover_device(
        &self,
        device_id: &str,
        port: u16,
        platform_hint: Platform,
        creds: &DeviceCredentials,
        verifier: &DeviceVerifier,
    ) -> Result<DiscoverOutcome> {
        let mut device = self.devices.get_device(device_id)?.ok_or_else(|| Error::NotFound(format!("device {device_id}")))?;

        match verifier.verify(&device.host, port, platform_hint, creds) {
            Ok(outcome) => {
                device.platform = Some(outcome.platform);
                device.version = Some(outcome.version);
                device.hardware_model = outcome.hardware_model;
                device.features = Some(outcome.feature_snapshot.features_present);
                device.status = DeviceStatus::Discovered;
                device.last_discovered_at = Some(Utc::now());
                device.consecutive_failures = 0;
                self.devices.put_device(&device)?;
                Ok(DiscoverOutcome { device, success: true, error: None, next_retry_secs: None })
            }
            Err(e) => {
                device.consecutive_failures += 1;
                device.status = if device_verifier::is_stale(device.consecutive_failures) {
                    DeviceStatus::Stale
                } else {
                    DeviceStatus::Failed
                };
                let next_retry_secs = device_verifier::next_retry_delay(device.consecutive_failures).map(|d| d.as_secs());
                self.devices.put_device(&device)?;
                Ok(DiscoverOutcome { device, success: false, error: Some(e.to_string()), next_retry_secs })
            }
        }
    }

    /// Diffs a device's current scan against its previous one.
    pub fn compare_current_to_previous(&self, device_id: &str) -> Result<ScanComparison> {
        let device = self.devices.get_device(device_id)?.ok_or_else(|| Error::NotFound(format!("device {device_id}")))?;
        let current_id = device.last_scan_id.ok_or_else(|| Error::BadInput("device has no scan history yet".into()))?;
        let previous_id = device
            .previous_scan_id
            .ok_or_else(|| Error::BadInput("device has only one scan on record; nothing to compare against".into()))?;

        let current = self.devices.get_scan(&current_id)?.ok_or_else(|| Error::NotFound(format!("scan {current_id}")))?;
        let previous = self.devices.get_scan(&previous_id)?.ok_or_else(|| Error::NotFound(format!("scan {previous_id}")))?;

        Ok(diff_scans(&previous, &current))
    }

    /// Runs two synthetic scans at different versions with the same
    /// platform/hardware/features and computes a fix/new-risk recommendation.
    pub fn compare_versions(
        &self,
        platform: Platform,
        version_a: &str,
        version_b: &str,
        hardware: Option<String>,
        features: Option<std::collections::BTreeSet<String>>,
    ) -> Result<VersionComparison> {
        let scanner = Scanner::new(self.vulns);
        let req = ScanRequest { hardware, features, ..Default::default() };
        let scan_a = scanner.scan(platform, version_a, &req)?;
        let scan_b = scanner.scan(platform, version_b, &req)?;

        let comparison = diff_scans(&scan_a, &scan_b);
        let critical_fixed = comparison.fixed.iter().filter(|v| v.severity == 1).count() as i64;
        let high_fixed = comparison.fixed.iter().filter(|v| v.severity == 2).count() as i64;
        let critical_new = comparison.new.iter().filter(|v| v.severity == 1).count() as i64;
        let high_new = comparison.new.iter().filter(|v| v.severity == 2).count() as i64;

        let risk_score = critical_fixed * 15 + high_fixed * 8 - (critical_new * 15 + high_new * 8);
        let recommendation = if risk_score > 20 {
            RiskLevel::Low
        } else if risk_score < 0 {
            RiskLevel::High
        } else {
            RiskLevel::Medium
        };

        Ok(VersionComparison { comparison, risk_score, recommendation })
    }

    /// Scans every device in `device_ids` concurrently with a bounded pool;
    /// individual failures don't abort the batch.
    pub fn bulk_scan(&self, device_ids: &[String], req: &ScanRequest) -> BulkScanOutcome {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(MAX_BULK_CONCURRENCY.min(device_ids.len().max(1)))
            .build()
            .expect("bulk scan pool");

        let results: Vec<(String, Result<ScanResult>)> = pool.install(|| {
            device_ids.par_iter().map(|id| (id.clone(), self.scan_device(id, req))).collect()
        });

        let mut outcome = BulkScanOutcome { succeeded: Vec::new(), failed: Vec::new() };
        for (id, result) in results {
            match result {
                Ok(_) => outcome.succeeded.push(id),
                Err(e) => outcome.failed.push((id, e.to_string())),
            }
        }
        outcome
    }

    /// Imports devices from an external source; every imported device lands
    /// in inventory with `status = pending`, never overwriting
    /// an existing device's discovered state.
    pub async fn sync_from_ise(&self, source: &dyn IseInventorySource) -> Result<usize> {
        let imported = source.fetch_devices().await?;
        let mut added = 0;
        for device in imported {
            if self.devices.get_device(&device.id)?.is_none() {
                self.devices.put_device(&Device::new_pending(device.id, device.host))?;
                added += 1;
            }
        }
        Ok(added)
    }
}

fn diff_scans(previous: &ScanResult, current: &ScanResult) -> ScanComparison {
    let prev_by_id: BTreeMap<&str, &Vulnerability> =
        previous.critical_high.iter().chain(previous.medium_low.iter()).map(|v| (v.identifier.as_str(), v)).collect();
    let curr_by_id: BTreeMap<&str, &Vulnerability> =
        current.critical_high.iter().chain(current.medium_low.iter()).map(|v| (v.identifier.as_str(), v)).collect();

    let mut fixed = Vec::new();
    let mut unchanged = Vec::new();
    for (id, v) in &prev_by_id {
        if curr_by_id.contains_key(id) {
            unchanged.push((*v).clone());
        } else {
            fixed.push((*v).clone());
        }
    }
    let new: Vec<Vulnerability> =
        curr_by_id.iter().filter(|(id, _)| !prev_by_id.contains_key(*id)).map(|(_, v)| (*v).clone()).collect();

    ScanComparison { fixed, new, unchanged }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LabelsSource, Platform, VulnKind};
    use crate::version;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn vuln(id: &str, raw: &str, severity: u8) -> Vulnerability {
        Vulnerability {
            identifier: id.to_string(),
            kind: VulnKind::Bug,
            platform: Platform::IosXe,
            severity,
            headline: "h".into(),
            summary: "s".into(),
            url: None,
            status: "open".into(),
            hardware_model: None,
            affected_versions_raw: raw.to_string(),
            version_pattern: version::classify(raw).unwrap(),
            fixed_version: None,
            labels: BTreeSet::new(),
            labels_source: LabelsSource::Manual,
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn scan_device_rotates_current_to_previous() {
        let devices = DeviceStore::open_in_memory().unwrap();
        let mut vulns = VulnerabilityStore::open_in_memory().unwrap();
        vulns.upsert(&vuln("bug1", "17.10.x", 1)).unwrap();

        let mut device = Device::new_pending("d1".into(), "10.0.0.1".into());
        device.platform = Some(Platform::IosXe);
        device.version = Some("17.10.1".into());
        devices.put_device(&device).unwrap();

        let coordinator = InventoryCoordinator::new(&devices, &vulns);
        let first = coordinator.scan_device("d1", &ScanRequest::default()).unwrap();
        let second = coordinator.scan_device("d1", &ScanRequest::default()).unwrap();

        let stored = devices.get_device("d1").unwrap().unwrap();
        assert_eq!(stored.last_scan_id, Some(second.scan_id));
        assert_eq!(stored.previous_scan_id, Some(first.scan_id));
    }

    #[test]
    fn compare_versions_recommends_low_when_fixes_outweigh_new_risks() {
        let devices = DeviceStore::open_in_memory().unwrap();
        let mut vulns = VulnerabilityStore::open_in_memory().unwrap();
        vulns.upsert(&vuln("only-in-old", "17.10.x", 1)).unwrap();

        let coordinator = InventoryCoordinator::new(&devices, &vulns);
        let result = coordinator.compare_versions(Platform::IosXe, "17.10.1", "17.12.1", None, None).unwrap();
        assert_eq!(result.recommendation, RiskLevel::Low);
        assert!(result.risk_score > 20);
        assert_eq!(result.comparison.fixed.len(), 1);
    }

    #[test]
    fn compare_versions_recommends_high_when_new_risks_dominate() {
        let devices = DeviceStore::open_in_memory().unwrap();
        let mut vulns = VulnerabilityStore::open_in_memory().unwrap();
        vulns.upsert(&vuln("only-in-new", "17.12.x", 1)).unwrap();

        let coordinator = InventoryCoordinator::new(&devices, &vulns);
        let result = coordinator.compare_versions(Platform::IosXe, "17.10.1", "17.12.1", None, None).unwrap();
        assert_eq!(result.recommendation, RiskLevel::High);
        assert!(result.risk_score < 0);
    }

    #[test]
    fn bulk_scan_aggregates_success_and_failure() {
        let devices = DeviceStore::open_in_memory().unwrap();
        let vulns = VulnerabilityStore::open_in_memory().unwrap();

        let mut ok_device = Device::new_pending("ok".into(), "10.0.0.1".into());
        ok_device.platform = Some(Platform::IosXe);
        ok_device.version = Some("17.10.1".into());
        devices.put_device(&ok_device).unwrap();
        devices.put_device(&Device::new_pending("missing-version".into(), "10.0.0.2".into())).unwrap();

        let coordinator = InventoryCoordinator::new(&devices, &vulns);
        let outcome =
            coordinator.bulk_scan(&["ok".to_string(), "missing-version".to_string()], &ScanRequest::default());
        assert_eq!(outcome.succeeded, vec!["ok".to_string()]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "missing-version");
    }

    #[test]
    fn discover_device_records_failure_and_increments_counter() {
        let devices = DeviceStore::open_in_memory().unwrap();
        let vulns = VulnerabilityStore::open_in_memory().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let entry = r#"{"MGMT_SSH_HTTP": {"human_definition":"d","domain":"mgmt","config_regex":["^ip ssh"]}}"#;
        for platform in Platform::all() {
            std::fs::write(dir.path().join(format!("{}.json", platform.as_str())), entry).unwrap();
        }
        let taxonomy = crate::taxonomy::TaxonomyStore::load_from_dir(dir.path()).unwrap();
        let extractor = crate::feature_extractor::FeatureExtractor::new(&taxonomy);
        let verifier = DeviceVerifier::new(
            extractor,
            std::time::Duration::from_millis(200),
            std::time::Duration::from_millis(200),
        );

        devices.put_device(&Device::new_pending("d1".into(), "127.0.0.1".into())).unwrap();
        let coordinator = InventoryCoordinator::new(&devices, &vulns);
        let creds = DeviceCredentials { username: "u".into(), password: "p".into() };

        // Port 1 has no listener on a test host, so the TCP connect fails
        // fast with "connection refused" instead of waiting out the timeout.
        let outcome = coordinator.discover_device("d1", 1, Platform::IosXe, &creds, &verifier).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.device.consecutive_failures, 1);
        assert_eq!(outcome.device.status, DeviceStatus::Failed);

        let stored = devices.get_device("d1").unwrap().unwrap();
        assert_eq!(stored.consecutive_failures, 1);
    }

    struct StubIse {
        devices: Vec<ImportedDevice>,
    }

    #[async_trait::async_trait]
    impl IseInventorySource for StubIse {
        async fn fetch_devices(&self) -> Result<Vec<ImportedDevice>> {
            Ok(self.devices.clone())
        }
    }

    #[tokio::test]
    async fn sync_from_ise_adds_new_devices_as_pending() {
        let devices = DeviceStore::open_in_memory().unwrap();
        let vulns = VulnerabilityStore::open_in_memory().unwrap();
        let coordinator = InventoryCoordinator::new(&devices, &vulns);

        let source = StubIse { devices: vec![ImportedDevice { id: "new1".into(), host: "10.0.0.9".into() }] };
        let added = coordinator.sync_from_ise(&source).await.unwrap();
        assert_eq!(added, 1);
        let stored = devices.get_device("new1").unwrap().unwrap();
        assert_eq!(stored.status, DeviceStatus::Pending);
    }
}
