//! Shared domain types. These are the records that flow between
//! the store, scanner, inference engine, and HTTP layer; kept in one module
//! since almost every other module needs several of them at once.

use crate::version::Pattern as VersionPattern;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    #[serde(rename = "IOS-XE")]
    IosXe,
    #[serde(rename = "IOS-XR")]
    IosXr,
    #[serde(rename = "ASA")]
    Asa,
    #[serde(rename = "FTD")]
    Ftd,
    #[serde(rename = "NX-OS")]
    NxOs,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::IosXe => "IOS-XE",
            Platform::IosXr => "IOS-XR",
            Platform::Asa => "ASA",
            Platform::Ftd => "FTD",
            Platform::NxOs => "NX-OS",
        }
    }

    pub fn parse(s: &str) -> Option<Platform> {
        match s {
            "IOS-XE" => Some(Platform::IosXe),
            "IOS-XR" => Some(Platform::IosXr),
            "ASA" => Some(Platform::Asa),
            "FTD" => Some(Platform::Ftd),
            "NX-OS" => Some(Platform::NxOs),
            _ => None,
        }
    }

    pub fn all() -> &'static [Platform] {
        &[Platform::IosXe, Platform::IosXr, Platform::Asa, Platform::Ftd, Platform::NxOs]
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VulnKind {
    Psirt,
    Bug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelsSource {
    Frontier,
    Model,
    Manual,
    Heuristic,
}

/// A PSIRT advisory or bug record. `version_pattern`
/// is the classified shape of `affected_versions_raw`; `min`/`max`/`explicit`
/// are the operands `version::is_affected` needs for that shape, cached at
/// ingest time so the scanner never re-classifies on the read path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vulnerability {
    pub identifier: String,
    pub kind: VulnKind,
    pub platform: Platform,
    /// 1-6, lower is worse.
    pub severity: u8,
    pub headline: String,
    pub summary: String,
    pub url: Option<String>,
    pub status: String,
    pub hardware_model: Option<String>,
    pub affected_versions_raw: String,
    pub version_pattern: VersionPattern,
    pub fixed_version: Option<String>,
    pub labels: BTreeSet<String>,
    pub labels_source: LabelsSource,
    pub last_modified: DateTime<Utc>,
}

impl Vulnerability {
    pub fn is_critical_high(&self) -> bool {
        self.severity <= 2
    }
}

/// Sanitized description of which taxonomy labels a device's configuration
/// exercises. Deliberately carries no IPs,
/// hostnames, credentials, config fragments, or command output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub snapshot_id: String,
    pub platform: Platform,
    pub hardware_model: Option<String>,
    pub features_present: BTreeSet<String>,
    pub feature_count: usize,
    pub total_checked: usize,
    pub extracted_at: DateTime<Utc>,
    pub extractor_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Pending,
    Discovered,
    Failed,
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub host: String,
    pub platform: Option<Platform>,
    pub version: Option<String>,
    pub hardware_model: Option<String>,
    pub features: Option<BTreeSet<String>>,
    pub status: DeviceStatus,
    pub last_discovered_at: Option<DateTime<Utc>>,
    pub last_scan_id: Option<String>,
    pub previous_scan_id: Option<String>,
    /// Consecutive discovery failures; three trips `status` to `Stale`.
    pub consecutive_failures: u32,
}

impl Device {
    pub fn new_pending(id: String, host: String) -> Self {
        Device {
            id,
            host,
            platform: None,
            version: None,
            hardware_model: None,
            features: None,
            status: DeviceStatus::Pending,
            last_discovered_at: None,
            last_scan_id: None,
            previous_scan_id: None,
            consecutive_failures: 0,
        }
    }

    /// Rotates the scan-id slots.
    pub fn record_scan(&mut self, scan_id: String) {
        self.previous_scan_id = self.last_scan_id.take();
        self.last_scan_id = Some(scan_id);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub scan_id: String,
    pub device_id: Option<String>,
    pub platform: Platform,
    pub version: String,
    pub hardware_model: Option<String>,
    pub features: Option<BTreeSet<String>>,
    pub total_checked: usize,
    pub version_matches: usize,
    pub hardware_filtered: usize,
    pub final_matches: usize,
    pub critical_high: Vec<Vulnerability>,
    pub medium_low: Vec<Vulnerability>,
    pub filtered_out_sample: Vec<String>,
    pub query_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceSource {
    Model,
    Heuristic,
    Exact,
    Cache,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PsirtCacheEntry {
    pub advisory_id: String,
    pub platform: Platform,
    pub labels: BTreeSet<String>,
    pub confidence: f32,
    pub confidence_source: ConfidenceSource,
    pub needs_review: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledExemplar {
    pub id: String,
    pub platform: Platform,
    pub summary: String,
    pub labels: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: String,
    pub summary: String,
    pub platform: Platform,
    pub advisory_id: Option<String>,
    pub labels: BTreeSet<String>,
    pub confidence: f32,
    pub confidence_source: ConfidenceSource,
    pub needs_review: bool,
    pub config_regex: Vec<String>,
    pub show_commands: Vec<String>,
    pub timestamp: DateTime<Utc>,
}
