//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::deploy::edge::LocalEdge;
use crate::deploy::pipeline::PipelineRunner;
use crate::errors::DeployerError;
use crate::storage::layout::StorageLayout;

/// Main application state
pub struct AppState {
    /// Storage layout
    pub layout: StorageLayout,

    /// Deployment pipeline
    pub runner: PipelineRunner,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<Self, DeployerError> {
        info!("Initializing application state...");

        options.layout.setup().await?;

        let edge = Arc::new(LocalEdge::new(
            options.layout.artifacts_dir(),
            options.edge_domain.clone(),
        ));
        let runner = PipelineRunner::new(options.pipeline.clone(), edge);

        Ok(Self {
            layout: options.layout.clone(),
            runner,
        })
    }

    /// Cancel every deployment still in flight
    pub async fn shutdown(&self) -> Result<(), DeployerError> {
        info!("Shutting down application state...");

        let in_flight: Vec<String> = self
            .runner
            .list()
            .into_iter()
            .filter(|s| !s.state.is_terminal())
            .map(|s| s.id)
            .collect();

        for id in &in_flight {
            self.runner.cancel(id);
        }
        if !in_flight.is_empty() {
            info!("Cancelled {} in-flight deployments", in_flight.len());
        }
        Ok(())
    }
}
