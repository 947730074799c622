use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::transition::StateTransition;

/// Window into a driver's history. `before_version` makes paging
/// restartable: pass the version of the last entry already seen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryPage {
    pub limit: usize,
    pub before_version: Option<u64>,
}

impl HistoryPage {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            before_version: None,
        }
    }

    pub fn before(limit: usize, version: u64) -> Self {
        Self {
            limit,
            before_version: Some(version),
        }
    }
}

/// Append-only per-driver transition log.
///
/// Entries for a driver are appended under that driver's commit, so they
/// arrive in version order and the stored vector is already ascending.
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: DashMap<Uuid, Vec<StateTransition>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, transition: StateTransition) {
        self.entries
            .entry(transition.driver_id)
            .or_default()
            .push(transition);
    }

    pub fn history(&self, driver_id: Uuid, page: &HistoryPage) -> Vec<StateTransition> {
        let Some(entries) = self.entries.get(&driver_id) else {
            return Vec::new();
        };

        entries
            .iter()
            .rev()
            .filter(|entry| match page.before_version {
                Some(version) => entry.version < version,
                None => true,
            })
            .take(page.limit)
            .cloned()
            .collect()
    }

    pub fn entry_count(&self, driver_id: Uuid) -> usize {
        self.entries
            .get(&driver_id)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }
}
