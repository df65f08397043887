//! Converts a device config/`show` text into a sanitized `FeatureSnapshot`.
//! Each taxonomy label's `config_regex` patterns are tested in
//! multiline mode; the snapshot records only which labels matched, never the
//! text that matched.

use crate::hardware;
use crate::models::{FeatureSnapshot, Platform};
use crate::taxonomy::TaxonomyStore;
use chrono::Utc;
use regex::RegexBuilder;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use uuid::Uuid;

pub const EXTRACTOR_VERSION: &str = "1.0.0";

/// Per-label compiled regex sets, cached so repeated extractions on the
/// same taxonomy (the common case - one load at startup) don't recompile.
pub struct FeatureExtractor<'t> {
    taxonomy: &'t TaxonomyStore,
    compiled_cache: Mutex<HashMap<(Platform, String), Vec<regex::Regex>>>,
}

impl<'t> FeatureExtractor<'t> {
    pub fn new(taxonomy: &'t TaxonomyStore) -> Self {
        Self { taxonomy, compiled_cache: Mutex::new(HashMap::new()) }
    }

    pub fn extract(&self, config_text: &str, platform: Platform, hardware_hint: Option<&str>) -> FeatureSnapshot {
        let labels = self.taxonomy.labels_for(platform);
        let total_checked = labels.len();
        let mut features_present = BTreeSet::new();

        for label in &labels {
            if self.label_matches(platform, label, config_text) {
                features_present.insert((*label).to_string());
            }
        }

        let hardware_model = hardware_hint
            .and_then(hardware::classify)
            .map(|s| s.to_string())
            .or_else(|| hardware::classify(config_text).map(|s| s.to_string()));

        FeatureSnapshot {
            snapshot_id: Uuid::new_v4().to_string(),
            platform,
            hardware_model,
            feature_count: features_present.len(),
            features_present,
            total_checked,
            extracted_at: Utc::now(),
            extractor_version: EXTRACTOR_VERSION.to_string(),
        }
    }

    fn label_matches(&self, platform: Platform, label: &str, text: &str) -> bool {
        let entry = match self.taxonomy.lookup(platform, label) {
            Some(e) => e,
            None => return false,
        };

        let key = (platform, label.to_string());
        let mut cache = self.compiled_cache.lock().expect("cache lock poisoned");
        let compiled = cache.entry(key).or_insert_with(|| {
            entry
                .config_regex
                .iter()
                .filter_map(|p| RegexBuilder::new(p).multi_line(true).build().ok())
                .collect()
        });

        compiled.iter().any(|re| re.is_match(text))
    }
}
