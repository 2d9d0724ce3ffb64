//! In-memory deployment status store

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::deploy::fsm::{DeploymentFsm, DeploymentState, Transition};
use crate::errors::DeployerError;
use crate::models::deployment::{DeploymentLog, DeploymentStatus};

/// Status records keyed by deployment id.
///
/// State is process-local; a restart loses every record.
#[derive(Debug, Default)]
pub struct StatusStore {
    entries: RwLock<HashMap<String, DeploymentStatus>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new status. Returns false if the id is already taken.
    pub fn insert(&self, status: DeploymentStatus) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&status.id) {
            return false;
        }
        entries.insert(status.id.clone(), status);
        true
    }

    /// Get a copy of a status
    pub fn get(&self, id: &str) -> Option<DeploymentStatus> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(id)
    }

    pub fn state(&self, id: &str) -> Option<DeploymentState> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(id).map(|s| s.state)
    }

    /// Mutate a status in place
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut DeploymentStatus) -> R) -> Option<R> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.get_mut(id).map(|status| {
            let result = f(status);
            status.updated_at = Utc::now();
            result
        })
    }

    /// Move a deployment through the lifecycle FSM
    pub fn transition(
        &self,
        id: &str,
        transition: Transition,
    ) -> Result<DeploymentState, DeployerError> {
        self.transition_with(id, transition, |_| {})
    }

    /// Apply a transition and, only if it is accepted, `f` under the same lock
    pub fn transition_with(
        &self,
        id: &str,
        transition: Transition,
        f: impl FnOnce(&mut DeploymentStatus),
    ) -> Result<DeploymentState, DeployerError> {
        self.update(id, |status| {
            let mut fsm = DeploymentFsm::resume(status.state, status.error.clone());
            fsm.process(transition)?;
            status.state = fsm.state();
            status.error = fsm.error().map(str::to_string);
            f(status);
            Ok(status.state)
        })
        .unwrap_or_else(|| Err(DeployerError::NotFound(format!("deployment {}", id))))
    }

    /// Append a log entry, truncating to the most recent entries
    pub fn append_log(&self, id: &str, log: DeploymentLog) -> bool {
        self.update(id, |status| status.push_log(log)).is_some()
    }

    /// Raise progress; lower values are ignored. Returns the resulting progress.
    pub fn set_progress(&self, id: &str, progress: u8) -> Option<u8> {
        self.update(id, |status| {
            status.progress = status.progress.max(progress.min(100));
            status.progress
        })
    }

    /// All statuses, newest first
    pub fn list(&self) -> Vec<DeploymentStatus> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut statuses: Vec<_> = entries.values().cloned().collect();
        statuses.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        statuses
    }

    pub fn remove(&self, id: &str) -> Option<DeploymentStatus> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(id)
    }

    /// Remove finished deployments whose earliest log predates `cutoff`.
    ///
    /// Deployments still in flight are kept. Returns the removed ids.
    pub fn remove_older_than(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<String> = entries
            .values()
            .filter(|s| s.state.is_terminal() && s.earliest_activity() < cutoff)
            .map(|s| s.id.clone())
            .collect();

        for id in &expired {
            entries.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
