//! Short-lived cache of `Analysis` results keyed by analysis id, used by
//! `GET /results/{analysis_id}` and by `/verify-device`/`/verify-snapshot`
//! for follow-on verification calls against a prior analysis.

use crate::models::Analysis;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct AnalysisStore {
    entries: Mutex<HashMap<String, (Analysis, Instant)>>,
}

impl AnalysisStore {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, analysis: Analysis) {
        let mut entries = self.entries.lock().expect("analysis store lock poisoned");
        entries.insert(analysis.id.clone(), (analysis, Instant::now()));
    }

    pub fn get(&self, id: &str) -> Option<Analysis> {
        let mut entries = self.entries.lock().expect("analysis store lock poisoned");
        match entries.get(id) {
            Some((_, inserted_at)) if inserted_at.elapsed() > TTL => {
                entries.remove(id);
                None
            }
            Some((analysis, _)) => Some(analysis.clone()),
            None => None,
        }
    }

    /// Drops every entry past its TTL. Cheap enough to call opportunistically
    /// (e.g. on a cache-stats request) rather than running a background timer.
    pub fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.lock().expect("analysis store lock poisoned");
        let before = entries.len();
        entries.retain(|_, (_, inserted_at)| inserted_at.elapsed() <= TTL);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("analysis store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AnalysisStore {
    fn default() -> Self {
        Self::new()
    }
}
