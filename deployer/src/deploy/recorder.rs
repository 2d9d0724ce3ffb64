//! Writes status changes to the store and mirrors them as events

use std::sync::Arc;

use tracing::debug;

use crate::deploy::events::{DeploymentEvent, EventNotifier};
use crate::deploy::store::StatusStore;
use crate::models::deployment::{DeploymentLog, LogSource};

/// Log and progress writer shared by the pipeline and the process executor
#[derive(Debug, Clone)]
pub struct Recorder {
    store: Arc<StatusStore>,
    notifier: EventNotifier,
}

impl Recorder {
    pub fn new(store: Arc<StatusStore>, notifier: EventNotifier) -> Self {
        Self { store, notifier }
    }

    pub fn store(&self) -> &Arc<StatusStore> {
        &self.store
    }

    pub fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    /// Append a log entry and emit `deployment:log`
    pub fn log(&self, deployment_id: &str, log: DeploymentLog) {
        if self.store.append_log(deployment_id, log.clone()) {
            self.notifier.emit(DeploymentEvent::Log {
                deployment_id: deployment_id.to_string(),
                log,
            });
        } else {
            debug!(deployment_id, "Dropping log for unknown deployment");
        }
    }

    pub fn info(&self, deployment_id: &str, source: LogSource, message: impl Into<String>) {
        self.log(deployment_id, DeploymentLog::info(source, message));
    }

    pub fn warn(&self, deployment_id: &str, source: LogSource, message: impl Into<String>) {
        self.log(deployment_id, DeploymentLog::warn(source, message));
    }

    pub fn error(&self, deployment_id: &str, source: LogSource, message: impl Into<String>) {
        self.log(deployment_id, DeploymentLog::error(source, message));
    }

    /// Advance progress and emit `deployment:progress`
    pub fn progress(&self, deployment_id: &str, progress: u8, stage: &str) {
        if let Some(progress) = self.store.set_progress(deployment_id, progress) {
            self.notifier.emit(DeploymentEvent::Progress {
                deployment_id: deployment_id.to_string(),
                progress,
                stage: stage.to_string(),
            });
        }
    }
}
