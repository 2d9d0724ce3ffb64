//! Deployment lifecycle events

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::models::deployment::{DeploymentLog, DeploymentMetrics};

/// Event broadcast to subscribers as a deployment advances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum DeploymentEvent {
    #[serde(rename = "deployment:created")]
    Created {
        deployment_id: String,
        project_id: String,
    },

    #[serde(rename = "deployment:progress")]
    Progress {
        deployment_id: String,
        progress: u8,
        stage: String,
    },

    #[serde(rename = "deployment:log")]
    Log {
        deployment_id: String,
        log: DeploymentLog,
    },

    #[serde(rename = "deployment:completed")]
    Completed {
        deployment_id: String,
        url: String,
        preview_url: String,
        metrics: DeploymentMetrics,
    },

    #[serde(rename = "deployment:failed")]
    Failed {
        deployment_id: String,
        error: String,
    },

    #[serde(rename = "deployment:cancelled")]
    Cancelled { deployment_id: String },
}

impl DeploymentEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            DeploymentEvent::Created { .. } => "deployment:created",
            DeploymentEvent::Progress { .. } => "deployment:progress",
            DeploymentEvent::Log { .. } => "deployment:log",
            DeploymentEvent::Completed { .. } => "deployment:completed",
            DeploymentEvent::Failed { .. } => "deployment:failed",
            DeploymentEvent::Cancelled { .. } => "deployment:cancelled",
        }
    }

    pub fn deployment_id(&self) -> &str {
        match self {
            DeploymentEvent::Created { deployment_id, .. }
            | DeploymentEvent::Progress { deployment_id, .. }
            | DeploymentEvent::Log { deployment_id, .. }
            | DeploymentEvent::Completed { deployment_id, .. }
            | DeploymentEvent::Failed { deployment_id, .. }
            | DeploymentEvent::Cancelled { deployment_id } => deployment_id,
        }
    }
}

/// Fan-out of deployment events to any number of subscribers.
///
/// Events are not persisted: a subscriber only sees events emitted after it
/// subscribed, and a subscriber that falls more than `capacity` events behind
/// skips the oldest ones.
#[derive(Debug, Clone)]
pub struct EventNotifier {
    tx: broadcast::Sender<DeploymentEvent>,
}

impl EventNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Emit an event; dropped silently when nobody listens
    pub fn emit(&self, event: DeploymentEvent) {
        trace!(event = event.name(), deployment_id = event.deployment_id(), "emit");
        let _ = self.tx.send(event);
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}
