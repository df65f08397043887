//! Platform-scoped label taxonomy. Loaded once at startup from
//! one JSON file per platform; the map is immutable afterward - a taxonomy
//! change requires a process restart, not a reload endpoint.

use crate::error::{Error, Result};
use crate::models::Platform;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyEntry {
    pub human_definition: String,
    #[serde(default)]
    pub anti_definition: String,
    pub domain: String,
    pub config_regex: Vec<String>,
    #[serde(default)]
    pub show_commands: Vec<String>,
}

/// Raw on-disk shape of `<corpus>/taxonomy/<platform>.json`: a map of label
/// id to its entry.
type TaxonomyFile = HashMap<String, TaxonomyEntry>;

pub struct TaxonomyStore {
    platforms: HashMap<Platform, TaxonomyFile>,
}

impl TaxonomyStore {
    /// Loads `<dir>/<platform>.json` for every platform in `Platform::all()`.
    /// A load failure for any platform is fatal: immutable startup
    /// configuration that can't parse should stop the service, not run
    /// with a gap in the catalog.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut platforms = HashMap::new();
        for platform in Platform::all() {
            let path = dir.join(format!("{}.json", platform.as_str()));
            let text = std::fs::read_to_string(&path).map_err(|e| {
                Error::Internal(format!("taxonomy load failed for {platform}: {e} ({})", path.display()))
            })?;
            let file: TaxonomyFile = serde_json::from_str(&text).map_err(|e| {
                Error::Internal(format!("taxonomy parse failed for {platform}: {e}"))
            })?;
            Self::validate(*platform, &file)?;
            platforms.insert(*platform, file);
        }
        Ok(Self { platforms })
    }

    /// Enforces the authoring contract on `config_regex` patterns: each must
    /// compile, since a pattern that can't compile is a taxonomy bug the
    /// service should refuse to start with rather than silently skip.
    fn validate(platform: Platform, file: &TaxonomyFile) -> Result<()> {
        for (label, entry) in file {
            if entry.config_regex.is_empty() {
                return Err(Error::Internal(format!(
                    "taxonomy label {platform}/{label} has no config_regex patterns"
                )));
            }
            for pattern in &entry.config_regex {
                regex::RegexBuilder::new(pattern)
                    .multi_line(true)
                    .build()
                    .map_err(|e| {
                        Error::Internal(format!(
                            "taxonomy label {platform}/{label} has invalid regex '{pattern}': {e}"
                        ))
                    })?;
            }
        }
        Ok(())
    }

    pub fn lookup(&self, platform: Platform, label: &str) -> Option<&TaxonomyEntry> {
        self.platforms.get(&platform)?.get(label)
    }

    pub fn labels_for(&self, platform: Platform) -> Vec<&str> {
        match self.platforms.get(&platform) {
            Some(file) => file.keys().map(|s| s.as_str()).collect(),
            None => Vec::new(),
        }
    }

    pub fn all_platforms(&self) -> Vec<Platform> {
        self.platforms.keys().copied().collect()
    }

    pub fn entries_for(&self, platform: Platform) -> Option<&TaxonomyFile> {
        self.platforms.get(&platform)
    }
}
