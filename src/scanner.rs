//! Four-tier scan filter: platform -> version -> hardware ->
//! feature. Each stage's counters are returned for observability, plus a
//! bounded sample of what the feature stage filtered out.

use crate::error::{Error, Result};
use crate::hardware;
use crate::models::{Platform, ScanResult, Vulnerability};
use crate::store::VulnerabilityStore;
use crate::version;
use chrono::Utc;
use std::collections::BTreeSet;
use std::time::Instant;
use uuid::Uuid;

const FILTERED_SAMPLE_SIZE: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub hardware: Option<String>,
    pub features: Option<BTreeSet<String>>,
    pub severity_filter: Option<Vec<u8>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub struct Scanner<'s> {
    store: &'s VulnerabilityStore,
}

impl<'s> Scanner<'s> {
    pub fn new(store: &'s VulnerabilityStore) -> Self {
        Self { store }
    }

    pub fn scan(&self, platform: Platform, device_version: &str, req: &ScanRequest) -> Result<ScanResult> {
        let started = Instant::now();
        let d = version::normalize(device_version)?;

        // Stage 2: coarse VersionIndex pre-filter, then precise re-check.
        let mut candidates = self.store.candidates_by_version_point(platform, d.major, d.minor, d.patch)?;
        candidates.extend(self.store.candidates_with_open_pattern(platform)?);
        dedupe_by_identifier(&mut candidates);
        let total_checked = candidates.len();

        let version_matches: Vec<Vulnerability> = candidates
            .into_iter()
            .filter(|v| {
                version::is_affected(device_version, &v.version_pattern, v.fixed_version.as_deref())
                    .map(|d| d.affected)
                    .unwrap_or(false)
            })
            .collect();
        let version_matches_count = version_matches.len();

        // Stage 3: hardware.
        let hardware_stage: Vec<Vulnerability> = version_matches
            .into_iter()
            .filter(|v| match (&req.hardware, &v.hardware_model) {
                (Some(requested), Some(stored)) => stored == requested,
                (Some(_), None) => true,
                (None, None) => true,
                (None, Some(_)) => false,
            })
            .collect();
        let hardware_filtered = version_matches_count.saturating_sub(hardware_stage.len());

        // Stage 4: features.
        let mut filtered_out_sample = Vec::new();
        let final_matches: Vec<Vulnerability> = match &req.features {
            None => hardware_stage,
            Some(features) => hardware_stage
                .into_iter()
                .filter(|v| {
                    let keep = v.labels.is_empty() || !v.labels.is_disjoint(features);
                    if !keep && filtered_out_sample.len() < FILTERED_SAMPLE_SIZE {
                        filtered_out_sample.push(v.identifier.clone());
                    }
                    keep
                })
                .collect(),
        };

        let mut matches = final_matches;
        if let Some(severities) = &req.severity_filter {
            matches.retain(|v| severities.contains(&v.severity));
        }

        let mut critical_high: Vec<Vulnerability> =
            matches.iter().filter(|v| v.is_critical_high()).cloned().collect();
        critical_high.sort_by(|a, b| a.severity.cmp(&b.severity).then_with(|| a.identifier.cmp(&b.identifier)));

        let mut medium_low: Vec<Vulnerability> =
            matches.iter().filter(|v| !v.is_critical_high()).cloned().collect();
        medium_low.sort_by(|a, b| a.severity.cmp(&b.severity).then_with(|| a.identifier.cmp(&b.identifier)));

        let offset = req.offset.unwrap_or(0);
        let medium_low = if let Some(limit) = req.limit {
            medium_low.into_iter().skip(offset).take(limit).collect()
        } else {
            medium_low.into_iter().skip(offset).collect()
        };

        Ok(ScanResult {
            scan_id: Uuid::new_v4().to_string(),
            device_id: None,
            platform,
            version: device_version.to_string(),
            hardware_model: req.hardware.clone(),
            features: req.features.clone(),
            total_checked,
            version_matches: version_matches_count,
            hardware_filtered,
            final_matches: critical_high.len() + medium_low.len(),
            critical_high,
            medium_low,
            filtered_out_sample,
            query_time_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        })
    }
}

fn dedupe_by_identifier(vulns: &mut Vec<Vulnerability>) {
    let mut seen = BTreeSet::new();
    vulns.retain(|v| seen.insert(v.identifier.clone()));
}

/// Validates a requested platform string against the allowed set. The HTTP
/// layer calls this before constructing a `ScanRequest`.
pub fn validate_platform(raw: &str) -> Result<Platform> {
    Platform::parse(raw).ok_or_else(|| Error::BadInput(format!("unknown platform: {raw}")))
}

/// Resolves a free-text hardware mention (e.g. from a request body) to a
/// normalized family tag, reusing the same classifier used at ingest/
/// discovery time so scan requests and stored records speak the same
/// vocabulary.
pub fn normalize_hardware(raw: &str) -> Option<String> {
    hardware::classify(raw).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LabelsSource, VulnKind};
    use std::collections::BTreeSet as Set;

    fn vuln(id: &str, raw: &str, hw: Option<&str>, labels: &[&str], severity: u8) -> Vulnerability {
        Vulnerability {
            identifier: id.to_string(),
            kind: VulnKind::Bug,
            platform: Platform::IosXe,
            severity,
            headline: "h".into(),
            summary: "s".into(),
            url: None,
            status: "open".into(),
            hardware_model: hw.map(|s| s.to_string()),
            affected_versions_raw: raw.to_string(),
            version_pattern: version::classify(raw).unwrap(),
            fixed_version: None,
            labels: labels.iter().map(|s| s.to_string()).collect::<Set<_>>(),
            labels_source: LabelsSource::Manual,
            last_modified: Utc::now(),
        }
    }

    fn seeded_store() -> VulnerabilityStore {
        let mut store = VulnerabilityStore::open_in_memory().unwrap();
        store.upsert(&vuln("explicit1", "17.10.1 17.12.4", None, &[], 2)).unwrap();
        store.upsert(&vuln("wildcard1", "17.10.x", None, &[], 1)).unwrap();
        store.upsert(&vuln("other-minor", "17.11.x", None, &[], 3)).unwrap();
        store
    }

    #[test]
    fn scenario_explicit_and_wildcard_match_excludes_other_minor() {
        let store = seeded_store();
        let scanner = Scanner::new(&store);
        let result = scanner.scan(Platform::IosXe, "17.10.1", &ScanRequest::default()).unwrap();
        let ids: Set<_> = result
            .critical_high
            .iter()
            .chain(result.medium_low.iter())
            .map(|v| v.identifier.clone())
            .collect();
        assert!(ids.contains("explicit1"));
        assert!(ids.contains("wildcard1"));
        assert!(!ids.contains("other-minor"));
    }

    #[test]
    fn hardware_none_excludes_hardware_specific_bugs() {
        let mut store = VulnerabilityStore::open_in_memory().unwrap();
        store.upsert(&vuln("generic", "17.10.x", None, &[], 2)).unwrap();
        store.upsert(&vuln("cat9300-only", "17.10.x", Some("Cat9300"), &[], 2)).unwrap();

        let scanner = Scanner::new(&store);
        let result = scanner.scan(Platform::IosXe, "17.10.1", &ScanRequest::default()).unwrap();
        let ids: Set<_> = result.critical_high.iter().map(|v| v.identifier.clone()).collect();
        assert!(ids.contains("generic"));
        assert!(!ids.contains("cat9300-only"));
    }

    #[test]
    fn hardware_request_excludes_mismatched_family_but_keeps_generic() {
        let mut store = VulnerabilityStore::open_in_memory().unwrap();
        store.upsert(&vuln("generic", "17.10.x", None, &[], 2)).unwrap();
        store.upsert(&vuln("cat9300-only", "17.10.x", Some("Cat9300"), &[], 2)).unwrap();
        store.upsert(&vuln("cat9200-only", "17.10.x", Some("Cat9200"), &[], 2)).unwrap();

        let scanner = Scanner::new(&store);
        let req = ScanRequest { hardware: Some("Cat9200".to_string()), ..Default::default() };
        let result = scanner.scan(Platform::IosXe, "17.10.1", &req).unwrap();
        let ids: Set<_> = result.critical_high.iter().map(|v| v.identifier.clone()).collect();
        assert!(ids.contains("generic"));
        assert!(ids.contains("cat9200-only"));
        assert!(!ids.contains("cat9300-only"));
    }

    #[test]
    fn feature_filter_keeps_empty_label_bugs_and_intersecting_ones() {
        let mut store = VulnerabilityStore::open_in_memory().unwrap();
        store.upsert(&vuln("no-labels", "17.10.x", None, &[], 2)).unwrap();
        store.upsert(&vuln("matching", "17.10.x", None, &["MGMT_SSH_HTTP"], 2)).unwrap();
        store.upsert(&vuln("disjoint", "17.10.x", None, &["SEC_CoPP"], 2)).unwrap();

        let scanner = Scanner::new(&store);
        let mut features = Set::new();
        features.insert("MGMT_SSH_HTTP".to_string());
        let req = ScanRequest { features: Some(features), ..Default::default() };
        let result = scanner.scan(Platform::IosXe, "17.10.1", &req).unwrap();
        let ids: Set<_> = result.critical_high.iter().map(|v| v.identifier.clone()).collect();
        assert!(ids.contains("no-labels"));
        assert!(ids.contains("matching"));
        assert!(!ids.contains("disjoint"));
        assert_eq!(result.filtered_out_sample, vec!["disjoint".to_string()]);
    }

    #[test]
    fn severity_grouping_splits_critical_high_from_medium_low() {
        let mut store = VulnerabilityStore::open_in_memory().unwrap();
        store.upsert(&vuln("crit", "17.10.x", None, &[], 1)).unwrap();
        store.upsert(&vuln("med", "17.10.x", None, &[], 4)).unwrap();

        let scanner = Scanner::new(&store);
        let result = scanner.scan(Platform::IosXe, "17.10.1", &ScanRequest::default()).unwrap();
        assert_eq!(result.critical_high.len(), 1);
        assert_eq!(result.medium_low.len(), 1);
        assert_eq!(result.critical_high[0].identifier, "crit");
    }

    #[test]
    fn validate_platform_rejects_unknown() {
        assert!(validate_platform("IOS-XE").is_ok());
        assert!(validate_platform("BOGUS").is_err());
    }
}
